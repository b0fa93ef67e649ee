//! x86-64 general-purpose register identifiers at every addressable width,
//! plus the instruction pointer, the flags register and the two segment
//! registers a 64-bit memory operand can name.

/// A register as named by one decoded operand.
///
/// `Invalid` doubles as the "no register" sentinel in memory operands
/// (absent base or index) and as the failure value of scratch allocation.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Reg {
    Invalid,

    // 8-bit low halves.
    Al,
    Cl,
    Dl,
    Bl,
    Spl,
    Bpl,
    Sil,
    Dil,
    R8b,
    R9b,
    R10b,
    R11b,
    R12b,
    R13b,
    R14b,
    R15b,

    // 8-bit high halves of the four legacy registers.
    Ah,
    Ch,
    Dh,
    Bh,

    // 16-bit.
    Ax,
    Cx,
    Dx,
    Bx,
    Sp,
    Bp,
    Si,
    Di,
    R8w,
    R9w,
    R10w,
    R11w,
    R12w,
    R13w,
    R14w,
    R15w,

    // 32-bit.
    Eax,
    Ecx,
    Edx,
    Ebx,
    Esp,
    Ebp,
    Esi,
    Edi,
    R8d,
    R9d,
    R10d,
    R11d,
    R12d,
    R13d,
    R14d,
    R15d,
    Eip,

    // 64-bit.
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,

    Eflags,
    Fs,
    Gs,
}

/// System V AMD64 argument registers, in argument order. Slots 6 and 7 are
/// the scratch registers used to stage stack-passed arguments.
pub const ARG_REGS: [Reg; 8] = [
    Reg::Rdi,
    Reg::Rsi,
    Reg::Rdx,
    Reg::Rcx,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
];

/// Caller-save registers in the order scratch allocation probes them.
/// RAX first (it is never an argument register), then the two registers the
/// ABI reserves for no argument at all.
pub const SCRATCH_ORDER: [Reg; 9] = [
    Reg::Rax,
    Reg::R10,
    Reg::R11,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
];

/// Callee-save registers under the System V AMD64 ABI.
pub const CALLEE_SAVE: [Reg; 6] = [
    Reg::Rbx,
    Reg::Rbp,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];

impl Reg {
    /// The canonical 64-bit form of this register (`Dil` -> `Rdi`,
    /// `Ah` -> `Rax`, `Eip` -> `Rip`). Non-GPRs map to themselves.
    pub fn canonical(self) -> Reg {
        use Reg::*;
        match self {
            Al | Ah | Ax | Eax | Rax => Rax,
            Cl | Ch | Cx | Ecx | Rcx => Rcx,
            Dl | Dh | Dx | Edx | Rdx => Rdx,
            Bl | Bh | Bx | Ebx | Rbx => Rbx,
            Spl | Sp | Esp | Rsp => Rsp,
            Bpl | Bp | Ebp | Rbp => Rbp,
            Sil | Si | Esi | Rsi => Rsi,
            Dil | Di | Edi | Rdi => Rdi,
            R8b | R8w | R8d | R8 => R8,
            R9b | R9w | R9d | R9 => R9,
            R10b | R10w | R10d | R10 => R10,
            R11b | R11w | R11d | R11 => R11,
            R12b | R12w | R12d | R12 => R12,
            R13b | R13w | R13d | R13 => R13,
            R14b | R14w | R14d | R14 => R14,
            R15b | R15w | R15d | R15 => R15,
            Eip | Rip => Rip,
            other => other,
        }
    }

    /// Hardware encoding index 0..15 for GPRs (high-byte registers map to
    /// their canonical register). `None` for RIP, EFLAGS, segments, Invalid.
    pub fn index(self) -> Option<u8> {
        use Reg::*;
        let idx = match self.canonical() {
            Rax => 0,
            Rcx => 1,
            Rdx => 2,
            Rbx => 3,
            Rsp => 4,
            Rbp => 5,
            Rsi => 6,
            Rdi => 7,
            R8 => 8,
            R9 => 9,
            R10 => 10,
            R11 => 11,
            R12 => 12,
            R13 => 13,
            R14 => 14,
            R15 => 15,
            _ => return None,
        };
        Some(idx)
    }

    /// Width of the register in bytes. EFLAGS reports its stack-slot width.
    pub fn size(self) -> u8 {
        use Reg::*;
        match self {
            Invalid => 0,
            Al | Cl | Dl | Bl | Spl | Bpl | Sil | Dil | R8b | R9b | R10b | R11b | R12b | R13b
            | R14b | R15b | Ah | Ch | Dh | Bh => 1,
            Ax | Cx | Dx | Bx | Sp | Bp | Si | Di | R8w | R9w | R10w | R11w | R12w | R13w
            | R14w | R15w | Fs | Gs => 2,
            Eax | Ecx | Edx | Ebx | Esp | Ebp | Esi | Edi | R8d | R9d | R10d | R11d | R12d
            | R13d | R14d | R15d | Eip => 4,
            _ => 8,
        }
    }

    /// True for AH/BH/CH/DH.
    pub fn is_high(self) -> bool {
        matches!(self, Reg::Ah | Reg::Bh | Reg::Ch | Reg::Dh)
    }

    /// True when encoding this register requires a REX extension bit
    /// (R8..R15 at any width).
    pub fn needs_rex(self) -> bool {
        matches!(self.index(), Some(idx) if idx >= 8)
    }

    pub fn is_gpr(self) -> bool {
        self.index().is_some()
    }

    /// Caller-save under the System V AMD64 ABI (canonical form).
    pub fn is_caller_save(self) -> bool {
        use Reg::*;
        matches!(
            self.canonical(),
            Rax | Rcx | Rdx | Rsi | Rdi | R8 | R9 | R10 | R11
        )
    }

    /// The AT&T name without the `%` sigil.
    pub fn name(self) -> &'static str {
        use Reg::*;
        match self {
            Invalid => "<invalid>",
            Al => "al",
            Cl => "cl",
            Dl => "dl",
            Bl => "bl",
            Spl => "spl",
            Bpl => "bpl",
            Sil => "sil",
            Dil => "dil",
            R8b => "r8b",
            R9b => "r9b",
            R10b => "r10b",
            R11b => "r11b",
            R12b => "r12b",
            R13b => "r13b",
            R14b => "r14b",
            R15b => "r15b",
            Ah => "ah",
            Ch => "ch",
            Dh => "dh",
            Bh => "bh",
            Ax => "ax",
            Cx => "cx",
            Dx => "dx",
            Bx => "bx",
            Sp => "sp",
            Bp => "bp",
            Si => "si",
            Di => "di",
            R8w => "r8w",
            R9w => "r9w",
            R10w => "r10w",
            R11w => "r11w",
            R12w => "r12w",
            R13w => "r13w",
            R14w => "r14w",
            R15w => "r15w",
            Eax => "eax",
            Ecx => "ecx",
            Edx => "edx",
            Ebx => "ebx",
            Esp => "esp",
            Ebp => "ebp",
            Esi => "esi",
            Edi => "edi",
            R8d => "r8d",
            R9d => "r9d",
            R10d => "r10d",
            R11d => "r11d",
            R12d => "r12d",
            R13d => "r13d",
            R14d => "r14d",
            R15d => "r15d",
            Eip => "eip",
            Rax => "rax",
            Rcx => "rcx",
            Rdx => "rdx",
            Rbx => "rbx",
            Rsp => "rsp",
            Rbp => "rbp",
            Rsi => "rsi",
            Rdi => "rdi",
            R8 => "r8",
            R9 => "r9",
            R10 => "r10",
            R11 => "r11",
            R12 => "r12",
            R13 => "r13",
            R14 => "r14",
            R15 => "r15",
            Rip => "rip",
            Eflags => "eflags",
            Fs => "fs",
            Gs => "gs",
        }
    }

    /// Register argument slot `argno` per the System V AMD64 ABI, with R10
    /// and R11 standing in for the two stack slots.
    pub fn arg(argno: usize) -> Reg {
        ARG_REGS.get(argno).copied().unwrap_or(Reg::Invalid)
    }
}

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.name())
    }
}
