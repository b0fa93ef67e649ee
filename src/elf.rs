//! The host-ELF collaborator: symbol and GOT lookup against the
//! instrumentation binary that call targets and `Symbol` arguments
//! resolve into.

use crate::ty::TypeSig;
use anyhow::Context as _;
use goblin::elf::reloc::{R_X86_64_GLOB_DAT, R_X86_64_JUMP_SLOT};
use goblin::elf::Elf;
use memmap::MmapOptions;
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Result of locating a named object in the host ELF.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ObjectAddr {
    /// Defined locally at this address.
    Addr(i64),
    /// Only reachable through the GOT.
    NeedsGot,
    Missing,
}

#[derive(Clone, Debug)]
struct ElfSymbol {
    /// Raw (possibly mangled) name.
    name: String,
    /// Demangled name, or the raw name when demangling fails.
    demangled: String,
    addr: u64,
    defined: bool,
}

impl ElfSymbol {
    fn new(name: &str, addr: u64, defined: bool) -> ElfSymbol {
        use cpp_demangle::Symbol as CppSymbol;
        use rustc_demangle::try_demangle;

        let demangled = try_demangle(name)
            .map(|n| format!("{:#}", n))
            .or_else(|_| CppSymbol::new(name.as_bytes()).map(|s| s.to_string()))
            .unwrap_or_else(|_| name.to_string());

        ElfSymbol {
            name: name.to_string(),
            demangled,
            addr,
            defined,
        }
    }

    /// The demangled name up to the parameter list.
    fn base_name(&self) -> &str {
        match self.demangled.find('(') {
            Some(idx) => &self.demangled[..idx],
            None => &self.demangled,
        }
    }

    /// Number of parameters in the demangled signature, if it has one.
    fn param_count(&self) -> Option<usize> {
        let open = self.demangled.find('(')?;
        let inner = self.demangled[open + 1..].strip_suffix(')')?;
        if inner.is_empty() || inner == "void" {
            Some(0)
        } else {
            Some(inner.split(',').count())
        }
    }
}

/// A parsed instrumentation binary. Construction reads the whole symbol
/// and relocation picture once; lookups afterwards are pure.
pub struct HostElf {
    path: PathBuf,
    symbols: Vec<ElfSymbol>,
    got: HashMap<String, u64>,
}

static WARNED_SYMBOLS: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

impl HostElf {
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<HostElf> {
        Self::open_inner(path.as_ref())
    }

    fn open_inner(path: &Path) -> anyhow::Result<HostElf> {
        let file = File::open(path)
            .with_context(|| format!("failed to open ELF at path `{}`", path.display()))?;
        let mmap = unsafe { MmapOptions::new().map(&file) }
            .with_context(|| format!("failed to map ELF at path `{}`", path.display()))?;

        let parse_timer = std::time::Instant::now();
        let elf = Elf::parse(&mmap).context("failed to parse ELF object")?;

        let mut symbols = Vec::new();
        for sym in elf.syms.iter() {
            let name = match elf
                .strtab
                .get(sym.st_name)
                .transpose()
                .context("failed to get ELF symbol name")?
            {
                Some(name) if !name.is_empty() => name,
                _ => continue,
            };
            symbols.push(ElfSymbol::new(name, sym.st_value, sym.st_shndx != 0));
        }
        for sym in elf.dynsyms.iter() {
            let name = match elf
                .dynstrtab
                .get(sym.st_name)
                .transpose()
                .context("failed to get ELF dynamic symbol name")?
            {
                Some(name) if !name.is_empty() => name,
                _ => continue,
            };
            symbols.push(ElfSymbol::new(name, sym.st_value, sym.st_shndx != 0));
        }

        let mut got = HashMap::new();
        for reloc in elf.dynrelas.iter().chain(elf.pltrelocs.iter()) {
            if reloc.r_type != R_X86_64_GLOB_DAT && reloc.r_type != R_X86_64_JUMP_SLOT {
                continue;
            }
            let sym = match elf.dynsyms.get(reloc.r_sym) {
                Some(sym) => sym,
                None => continue,
            };
            if let Some(name) = elf.dynstrtab.get(sym.st_name).transpose().ok().flatten() {
                if !name.is_empty() {
                    got.entry(name.to_string()).or_insert(reloc.r_offset);
                }
            }
        }

        log::trace!(
            "parsed {} symbols and {} GOT entries from `{}` in {:?}",
            symbols.len(),
            got.len(),
            path.display(),
            parse_timer.elapsed()
        );

        Ok(HostElf {
            path: PathBuf::from(path),
            symbols,
            got,
        })
    }

    /// Builds a host ELF from an explicit symbol list. Used by frontends
    /// that already hold a parsed view, and by the test suite.
    pub fn synthetic(
        name: &str,
        symbols: Vec<(String, u64, bool)>,
        got: Vec<(String, u64)>,
    ) -> HostElf {
        HostElf {
            path: PathBuf::from(name),
            symbols: symbols
                .into_iter()
                .map(|(name, addr, defined)| ElfSymbol::new(&name, addr, defined))
                .collect(),
            got: got.into_iter().collect(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Locates a named data object: defined here, needs a GOT load, or
    /// absent entirely.
    pub fn object_address(&self, name: &str) -> ObjectAddr {
        let mut seen = false;
        for sym in self.symbols.iter().filter(|s| s.name == name) {
            if sym.defined {
                return ObjectAddr::Addr(sym.addr as i64);
            }
            seen = true;
        }
        if seen || self.got.contains_key(name) {
            ObjectAddr::NeedsGot
        } else {
            ObjectAddr::Missing
        }
    }

    /// Address of `name`'s GOT slot, if the dynamic relocations define one.
    pub fn got_entry(&self, name: &str) -> Option<u64> {
        self.got.get(name).copied()
    }

    /// Resolves a call-target symbol, disambiguating C++ overloads by the
    /// argument count of `sig`. Failure here is fatal to the emission.
    pub fn lookup_symbol(&self, name: &str, sig: TypeSig) -> anyhow::Result<i64> {
        // A plain C symbol wins outright.
        let exact: Vec<&ElfSymbol> = self
            .symbols
            .iter()
            .filter(|s| s.defined && s.name == name)
            .collect();
        if let Some(addr) = unique_address(&exact) {
            return Ok(addr as i64);
        }
        if exact.len() > 1 {
            anyhow::bail!(
                "symbol `{}` is defined at multiple addresses in `{}`",
                name,
                self.path.display()
            );
        }

        let overloads: Vec<&ElfSymbol> = self
            .symbols
            .iter()
            .filter(|s| s.defined && s.base_name() == name)
            .collect();
        if let Some(addr) = unique_address(&overloads) {
            return Ok(addr as i64);
        }
        if overloads.len() > 1 {
            let matching: Vec<&ElfSymbol> = overloads
                .iter()
                .copied()
                .filter(|s| s.param_count() == Some(sig.len()))
                .collect();
            if let Some(addr) = unique_address(&matching) {
                return Ok(addr as i64);
            }
            let mut msg = format!(
                "call target `{}` is ambiguous in `{}`; candidates:",
                sig.display_with_name(name),
                self.path.display()
            );
            for sym in overloads {
                msg.push_str(&format!("\n    - {} (0x{:x})", sym.demangled, sym.addr));
            }
            anyhow::bail!(msg);
        }

        self.lookup_symbol_warnings(name);
        anyhow::bail!(
            "call target `{}` was not found in `{}`",
            sig.display_with_name(name),
            self.path.display()
        )
    }

    /// Logs near-miss candidates for a failed lookup, once per name.
    pub fn lookup_symbol_warnings(&self, name: &str) {
        let mut warned = match WARNED_SYMBOLS.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if !warned.insert(format!("{}:{}", self.path.display(), name)) {
            return;
        }
        for sym in self
            .symbols
            .iter()
            .filter(|s| s.defined && s.base_name().contains(name))
            .take(4)
        {
            log::warn!(
                "`{}` not found; did you mean `{}`?",
                name,
                sym.demangled
            );
        }
    }
}

fn unique_address(symbols: &[&ElfSymbol]) -> Option<u64> {
    let first = symbols.first()?.addr;
    if symbols.iter().all(|s| s.addr == first) {
        Some(first)
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ty::{Type, TypeSig};

    fn sample() -> HostElf {
        HostElf::synthetic(
            "test.so",
            vec![
                ("entry".to_string(), 0x1000, true),
                ("counter".to_string(), 0x2000, true),
                ("malloc".to_string(), 0, false),
                // _Z5traceyy => trace(unsigned long long, unsigned long long)
                ("_Z5traceyy".to_string(), 0x3000, true),
                // _Z5tracey => trace(unsigned long long)
                ("_Z5tracey".to_string(), 0x4000, true),
            ],
            vec![("malloc".to_string(), 0x5f00)],
        )
    }

    #[test]
    fn object_addresses() {
        let elf = sample();
        assert_eq!(elf.object_address("counter"), ObjectAddr::Addr(0x2000));
        assert_eq!(elf.object_address("malloc"), ObjectAddr::NeedsGot);
        assert_eq!(elf.object_address("nothing"), ObjectAddr::Missing);
        assert_eq!(elf.got_entry("malloc"), Some(0x5f00));
    }

    #[test]
    fn plain_lookup() {
        let elf = sample();
        assert_eq!(elf.lookup_symbol("entry", TypeSig::EMPTY).unwrap(), 0x1000);
        assert!(elf.lookup_symbol("nothing", TypeSig::EMPTY).is_err());
    }

    #[test]
    fn overload_by_arity() {
        let elf = sample();
        let mut sig = TypeSig::EMPTY;
        sig.set(0, Type::INT64);
        sig.set(1, Type::INT64);
        assert_eq!(elf.lookup_symbol("trace", sig).unwrap(), 0x3000);

        let mut sig1 = TypeSig::EMPTY;
        sig1.set(0, Type::INT64);
        assert_eq!(elf.lookup_symbol("trace", sig1).unwrap(), 0x4000);
    }
}
