//! The metadata assembler: drives one action's whole emission and slices
//! the output into the named fragments the trampoline linker stitches
//! together around the displaced instruction.

pub mod callinfo;
pub mod stream;

mod args;
mod emit;

use self::args::{immediate_label, pcrel_reachable, ArgCtx, DataNeeds, LABEL_ASM_STR, LABEL_BYTES};
use self::callinfo::CallInfo;
use self::stream::Stream;
use crate::action::{Action, ArgKind, CallAction};
use crate::insn::InstrInfo;
use crate::matcher::Matcher;
use crate::regs::Reg;
use crate::ty::{TypeSig, MAX_ARGS};
use anyhow::Context as _;

/// The named fragments emitted for one action. Order is stable; the
/// trampoline linker looks entries up by name.
#[derive(Debug, Default)]
pub struct Metadata {
    entries: Vec<(&'static str, String)>,
}

impl Metadata {
    fn push(&mut self, name: &'static str, body: String) {
        self.entries.push((name, body));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, body)| body.as_str())
    }

    pub fn entries(&self) -> &[(&'static str, String)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Emits the metadata for one `(instruction, action)` pair.
///
/// Recoverable argument failures degrade to null loads (§ error taxonomy);
/// an `Err` here means the action cannot be applied at all and the caller
/// must not patch the instruction.
pub fn build_metadata(
    instr: &InstrInfo,
    action: &Action,
    id: u32,
    matcher: Option<&dyn Matcher>,
) -> anyhow::Result<Metadata> {
    let mut md = Metadata::default();
    match action {
        Action::Passthru | Action::Trap => Ok(md),
        Action::Print => {
            let mut s = Stream::new();
            let text = format!("{}\n", instr.text);
            s.string(&text)?;
            s.byte(0)?;
            md.push("asmStr", s.take());
            s.int32(text.len() as i32)?;
            md.push("asmStrLen", s.take());
            Ok(md)
        }
        Action::Call(call) => build_call_metadata(instr, call, id, matcher, &mut md)
            .with_context(|| {
                format!(
                    "failed to emit call to `{}` at {:#x} (`{}`)",
                    call.symbol, instr.address, instr.text
                )
            })
            .map(|_| md),
    }
}

fn build_call_metadata(
    instr: &InstrInfo,
    call: &CallAction,
    id: u32,
    matcher: Option<&dyn Matcher>,
    md: &mut Metadata,
) -> anyhow::Result<()> {
    if call.args.len() > MAX_ARGS {
        anyhow::bail!(
            "{} arguments requested, at most {} are supported",
            call.args.len(),
            MAX_ARGS
        );
    }

    let state = call.args.iter().any(|arg| arg.kind == ArgKind::State);
    let conditional = call.conv.is_conditional();
    let mut info = CallInfo::new(call.clean, state, conditional, call.args.len());
    let mut s = Stream::new();

    // Prologue: the up-front block. The RSP slot holds the raw push and is
    // corrected after `pushfq`, since the correction dirties the flags.
    let mut rsp_fix = None;
    for reg in info.layout().to_vec() {
        if reg == Reg::Rsp {
            rsp_fix = Some(emit::send_push_rsp(&mut s, &mut info)?);
        } else {
            emit::send_push(&mut s, &mut info, reg)?;
        }
    }
    if let Some(fix) = rsp_fix {
        emit::send_fix_rsp_slot(&mut s, &mut info, fix)?;
    }

    // Arguments, in declaration order.
    let mut sig = TypeSig::EMPTY;
    let mut data = DataNeeds::default();
    {
        let mut ctx = ArgCtx {
            s: &mut s,
            info: &mut info,
            instr,
            conv: call.conv,
            elf: &call.elf,
            id,
            matcher,
            data: &mut data,
        };
        for (argno, arg) in call.args.iter().enumerate() {
            let ty = args::load_argument(&mut ctx, arg, argno)?;
            sig.set(argno, ty);
        }
    }

    // Stack-passed arguments, pushed right-to-left.
    let mut rsp_args_offset = 0;
    for argno in (6..call.args.len()).rev() {
        emit::send_push_stack_arg(&mut s, &mut info, Reg::arg(argno))?;
        rsp_args_offset += 8;
    }

    // A non-clean callee sees the program's callee-save values.
    if !call.clean {
        for reg in info.clobbered_callee_save() {
            if let Some(off) = info.get_offset(reg) {
                emit::mov_stack_r64(&mut s, off, reg, 8, false)?;
                info.use_reg(reg);
            }
        }
    }
    md.push("loadArgs", s.take());

    // The call target itself. The call opcode is prepended by the
    // trampoline linker; we emit only the resolved displacement.
    let addr = call.elf.lookup_symbol(&call.symbol, sig)?;
    if !pcrel_reachable(addr, instr.address) {
        anyhow::bail!(
            "call target `{}` at {:#x} is out of range of {:#x}",
            call.symbol,
            addr,
            instr.address
        );
    }
    s.rel32(addr)?;
    md.push("function", s.take());

    info.call(conditional);

    // Epilogue: drop stack arguments, then drain the saved block. A
    // stack-pointer slot cannot be popped in place (the pop would move
    // the remaining slots out from under their offsets): when it sits
    // mid-block it is skipped here and RSP is loaded last, from below.
    emit::lea_rsp_adjust(&mut s, rsp_args_offset)?;
    info.adjust_rsp(-rsp_args_offset);
    while let Some(&top) = info.pushed().last() {
        if top == Reg::Rsp && info.pushed().len() == 1 {
            break;
        }
        info.pop();
        if top == Reg::Rsp {
            emit::lea_rsp_adjust(&mut s, 8)?;
            info.adjust_rsp(-8);
        } else {
            emit::send_pop(&mut s, &mut info, top, conditional)?;
        }
    }
    md.push("restoreState", s.take());

    // RSP comes back last, from its slot when one exists (the callee may
    // have rewritten it through a STATE or by-reference argument),
    // otherwise by unwinding the red-zone skip.
    if info.is_saved(Reg::Rsp) {
        info.pop();
        let off = info.get_offset(Reg::Rsp).unwrap_or(0);
        emit::mov_stack_r64(&mut s, off, Reg::Rsp, 8, false)?;
    } else {
        let unwind = info.rsp_offset();
        emit::lea_rsp_adjust(&mut s, unwind)?;
        info.adjust_rsp(-unwind);
    }
    md.push("restoreRSP", s.take());

    // Argument data blobs. A `duplicate` argument references a blob some
    // other action already emits.
    if data.asm_str && !data.asm_str_dup {
        s.label(LABEL_ASM_STR)?;
        s.string(&format!("{}\n", instr.text))?;
        s.byte(0)?;
    }
    if data.bytes && !data.bytes_dup {
        s.label(LABEL_BYTES)?;
        s.bytes(&instr.data)?;
    }
    for (n, (value, duplicate)) in data.immediates.iter().enumerate() {
        if !duplicate {
            s.label(&immediate_label(n))?;
            s.int64(*value)?;
        }
    }
    let data_fragment = s.take();
    if !data_fragment.is_empty() {
        md.push("data", data_fragment);
    }

    log::trace!(
        "emitted call to `{}` for `{}`: {}",
        call.symbol,
        instr.text,
        md.entries()
            .iter()
            .map(|(name, body)| format!("{}[{}]", name, body.len()))
            .collect::<Vec<_>>()
            .join(" ")
    );
    Ok(())
}
