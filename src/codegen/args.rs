//! The argument materialiser: translates one abstract argument into the
//! primitive loads of `emit`, and computes the semantic type the callee's
//! signature will be matched against.
//!
//! Every loader follows the same contract: make sure the destination
//! argument register has a saved slot, load the value, mark the
//! destination clobbered and used, return the type. Recoverable failures
//! warn, load zero and type the argument as a null pointer (the emission
//! continues); only collaborator failures are fatal.

use super::callinfo::CallInfo;
use super::emit::{
    lea_pcrel, lea_stack_r64, load_imm, load_memop, mov_high_r64, mov_pcrel, mov_r32_r64,
    mov_r64_r64, mov_stack_r64, movzx_r16_r64, movzx_r8_r64, send_fix_rsp_slot, send_push,
    send_push_rsp, send_save_reg_to_stack, send_temporary_restore_reg, send_temporary_save_reg,
    send_undo_temporary_mov_reg, sext_i32, Tmp,
};
use super::stream::Stream;
use crate::action::{ArgKind, Argument, CallConv, FieldKind, OpSelector};
use crate::elf::{HostElf, ObjectAddr};
use crate::insn::{InstrInfo, Mnemonic, OpInfo, OpKind};
use crate::matcher::Matcher;
use crate::regs::Reg;
use crate::ty::Type;
use crate::util::{capitalize, fits_i32};
use anyhow::Context as _;

/// Labels the trampoline linker resolves.
pub(crate) const LABEL_INSTRUCTION: &str = ".Linstruction";
pub(crate) const LABEL_CONTINUE: &str = ".Lcontinue";
pub(crate) const LABEL_TRAMPOLINE: &str = ".Ltrampoline";
pub(crate) const LABEL_ASM_STR: &str = ".LasmStr";
pub(crate) const LABEL_BYTES: &str = ".Lbytes";

/// Data-section blobs the loaded arguments referenced; emitted after the
/// epilogue by the metadata assembler.
#[derive(Default)]
pub(crate) struct DataNeeds {
    /// (emit the blob, referenced at all)
    pub asm_str: bool,
    pub asm_str_dup: bool,
    pub bytes: bool,
    pub bytes_dup: bool,
    /// (value, duplicate) per `.Limmediate_<n>` label.
    pub immediates: Vec<(i64, bool)>,
}

/// Everything one argument load may touch.
pub(crate) struct ArgCtx<'a> {
    pub s: &'a mut Stream,
    pub info: &'a mut CallInfo,
    pub instr: &'a InstrInfo,
    pub conv: CallConv,
    pub elf: &'a HostElf,
    pub id: u32,
    pub matcher: Option<&'a dyn Matcher>,
    pub data: &'a mut DataNeeds,
}

impl<'a> ArgCtx<'a> {
    /// The warn-and-null failure path of the error taxonomy.
    fn load_null(&mut self, dst: Reg, why: &str) -> anyhow::Result<Type> {
        log::warn!("{} (instruction `{}`); passing null", why, self.instr.text);
        sext_i32(self.s, 0, dst)?;
        Ok(Type::NULL_PTR)
    }
}

/// Materialises one argument into its ABI register and returns its type.
pub(crate) fn load_argument(
    ctx: &mut ArgCtx<'_>,
    arg: &Argument,
    argno: usize,
) -> anyhow::Result<Type> {
    let dst = Reg::arg(argno);
    if dst == Reg::Invalid {
        anyhow::bail!("argument index {} exceeds the supported maximum", argno);
    }
    send_save_reg_to_stack(ctx.s, ctx.info, dst)?;

    let ty = load_argument_value(ctx, arg, dst)?;

    ctx.info.clobber(dst);
    ctx.info.use_reg(dst);
    ctx.info.reset_tmp_slots();
    Ok(ty)
}

fn load_argument_value(ctx: &mut ArgCtx<'_>, arg: &Argument, dst: Reg) -> anyhow::Result<Type> {
    match arg.kind {
        ArgKind::User => load_user(ctx, arg, dst),
        ArgKind::Integer => {
            load_imm(ctx.s, arg.value, dst)?;
            Ok(Type::INT64)
        }
        ArgKind::Random => {
            let r = (rand::random::<u32>() & 0x7fff_ffff) as i32;
            sext_i32(ctx.s, r, dst)?;
            Ok(Type::INT32)
        }
        ArgKind::Offset => {
            if fits_i32(ctx.instr.offset as i64) {
                sext_i32(ctx.s, ctx.instr.offset as i32, dst)?;
                Ok(Type::INT32)
            } else {
                ctx.load_null(dst, "instruction offset does not fit 32 bits")
            }
        }
        ArgKind::Addr => {
            lea_pcrel(ctx.s, LABEL_INSTRUCTION, dst)?;
            Ok(Type::VOID | Type::PTR | Type::CONST)
        }
        ArgKind::StaticAddr => {
            load_imm(ctx.s, ctx.instr.address as i64, dst)?;
            Ok(Type::INT64)
        }
        ArgKind::Base => {
            lea_pcrel(ctx.s, 0, dst)?;
            Ok(Type::VOID | Type::PTR | Type::CONST)
        }
        ArgKind::Trampoline => {
            lea_pcrel(ctx.s, LABEL_TRAMPOLINE, dst)?;
            Ok(Type::VOID | Type::PTR | Type::CONST)
        }
        ArgKind::Id => {
            sext_i32(ctx.s, ctx.id as i32, dst)?;
            Ok(Type::INT32)
        }
        ArgKind::Next => load_next(ctx, dst),
        ArgKind::Target => load_target(ctx, dst),
        ArgKind::Asm => {
            ctx.data.asm_str = true;
            ctx.data.asm_str_dup |= arg.duplicate;
            lea_pcrel(ctx.s, LABEL_ASM_STR, dst)?;
            Ok(Type::INT8 | Type::PTR | Type::CONST)
        }
        ArgKind::AsmSize => {
            sext_i32(ctx.s, ctx.instr.text.len() as i32 + 2, dst)?;
            Ok(Type::INT32)
        }
        ArgKind::AsmLen => {
            sext_i32(ctx.s, ctx.instr.text.len() as i32 + 1, dst)?;
            Ok(Type::INT32)
        }
        ArgKind::Bytes => {
            ctx.data.bytes = true;
            ctx.data.bytes_dup |= arg.duplicate;
            lea_pcrel(ctx.s, LABEL_BYTES, dst)?;
            Ok(Type::INT8 | Type::PTR | Type::CONST)
        }
        ArgKind::BytesSize => {
            sext_i32(ctx.s, i32::from(ctx.instr.size), dst)?;
            Ok(Type::INT32)
        }
        ArgKind::Register(reg) => {
            if arg.ptr {
                load_register_ptr(ctx, reg, dst)
            } else {
                load_register_value(ctx, reg, dst)
            }
        }
        ArgKind::State => {
            match ctx.info.get_offset(Reg::Eflags) {
                Some(off) => {
                    lea_stack_r64(ctx.s, off, dst)?;
                    Ok(Type::VOID | Type::PTR)
                }
                None => ctx.load_null(dst, "no saved-state block to point at"),
            }
        }
        ArgKind::Symbol => load_symbol(ctx, arg, dst),
        ArgKind::Memop => match arg.memop {
            Some((mem, size)) => {
                if load_memop(ctx.s, ctx.info, ctx.instr, &mem, size, arg.ptr, dst)? {
                    let ty = Type::int_of_size(if arg.ptr { 8 } else { size });
                    Ok(if arg.ptr { ty | Type::PTR } else { ty })
                } else {
                    Ok(Type::NULL_PTR)
                }
            }
            None => ctx.load_null(dst, "memory-operand argument carries no operand"),
        },
        ArgKind::Operand(sel) => load_operand(ctx, arg, sel, dst),
    }
}

fn load_user(ctx: &mut ArgCtx<'_>, arg: &Argument, dst: Reg) -> anyhow::Result<Type> {
    let matcher = ctx
        .matcher
        .with_context(|| format!("no match engine to resolve user argument `{}`", arg.name))?;
    let record = matcher.lookup(&arg.name, ctx.instr)?;
    let record = match record {
        Some(record) => record,
        None => {
            return ctx.load_null(
                dst,
                &format!("no match record for user argument `{}`", arg.name),
            )
        }
    };
    let idx = arg.value as usize;
    let field = record.fields.get(idx).with_context(|| {
        format!(
            "field index {} out of range for `{}` ({} fields)",
            idx,
            arg.name,
            record.fields.len()
        )
    })?;
    let value: i64 = field
        .trim()
        .parse()
        .with_context(|| format!("field {} of `{}` is not an integer", idx, arg.name))?;
    load_imm(ctx.s, value, dst)?;
    Ok(Type::INT64)
}

fn load_symbol(ctx: &mut ArgCtx<'_>, arg: &Argument, dst: Reg) -> anyhow::Result<Type> {
    match ctx.elf.object_address(&arg.name) {
        ObjectAddr::Addr(addr) if pcrel_reachable(addr, ctx.instr.address) => {
            lea_pcrel(ctx.s, addr, dst)?;
            Ok(Type::VOID | Type::PTR)
        }
        ObjectAddr::Addr(_) | ObjectAddr::NeedsGot => match ctx.elf.got_entry(&arg.name) {
            Some(got) if pcrel_reachable(got as i64, ctx.instr.address) => {
                mov_pcrel(ctx.s, got as i64, dst)?;
                Ok(Type::VOID | Type::PTR)
            }
            _ => {
                ctx.elf.lookup_symbol_warnings(&arg.name);
                ctx.load_null(
                    dst,
                    &format!("symbol `{}` is not reachable from the trampoline", arg.name),
                )
            }
        },
        ObjectAddr::Missing => {
            ctx.elf.lookup_symbol_warnings(&arg.name);
            ctx.load_null(dst, &format!("symbol `{}` was not found", arg.name))
        }
    }
}

/// ±2 GiB reachability with a guard band for trampoline placement slack.
pub(crate) fn pcrel_reachable(target: i64, from: u64) -> bool {
    const MARGIN: i64 = 0x100_0000;
    let delta = target - from as i64;
    delta > i64::from(i32::MIN) + MARGIN && delta < i64::from(i32::MAX) - MARGIN
}

/// Loads a concrete register's current program value.
fn load_register_value(ctx: &mut ArgCtx<'_>, reg: Reg, dst: Reg) -> anyhow::Result<Type> {
    let canon = reg.canonical();
    match canon {
        Reg::Invalid => return ctx.load_null(dst, "invalid register argument"),
        Reg::Fs | Reg::Gs => {
            return ctx.load_null(dst, "segment registers cannot be loaded")
        }
        // The pre-instruction address stands in for RIP, for AFTER calls
        // too: callers that want the continuation address pass NEXT.
        Reg::Rip => {
            lea_pcrel(ctx.s, LABEL_INSTRUCTION, dst)?;
            return Ok(Type::VOID | Type::PTR | Type::CONST);
        }
        Reg::Rsp => {
            lea_stack_r64(ctx.s, ctx.info.rsp_offset(), dst)?;
            match reg.size() {
                8 => {}
                4 => mov_r32_r64(ctx.s, dst, dst)?,
                2 => movzx_r16_r64(ctx.s, dst, dst)?,
                _ => movzx_r8_r64(ctx.s, dst, dst)?,
            }
            return Ok(Type::int_of_size(reg.size()));
        }
        Reg::Eflags => return load_eflags(ctx, dst),
        _ => {}
    }

    let size = reg.size();
    if ctx.info.is_clobbered(canon) && !ctx.info.is_used(canon) {
        // The live value is ours; the program's is on the stack.
        match ctx.info.get_offset(canon) {
            Some(off) => {
                let (off, load_size) = if reg.is_high() { (off + 1, 1) } else { (off, size) };
                mov_stack_r64(ctx.s, off, dst, load_size, false)?;
            }
            None => {
                return ctx.load_null(
                    dst,
                    &format!("the original value of {} is gone", canon),
                )
            }
        }
    } else {
        match size {
            8 => mov_r64_r64(ctx.s, canon, dst)?,
            4 => mov_r32_r64(ctx.s, canon, dst)?,
            2 => movzx_r16_r64(ctx.s, canon, dst)?,
            _ => {
                if reg.is_high() {
                    mov_high_r64(ctx.s, reg, dst)?;
                } else {
                    movzx_r8_r64(ctx.s, canon, dst)?;
                }
            }
        }
    }
    Ok(Type::int_of_size(size))
}

/// EFLAGS by value: read the saved slot when one exists, otherwise
/// synthesise `seto %al; lahf` around a displaced RAX.
fn load_eflags(ctx: &mut ArgCtx<'_>, dst: Reg) -> anyhow::Result<Type> {
    if let Some(off) = ctx.info.get_offset(Reg::Eflags) {
        mov_stack_r64(ctx.s, off, dst, 2, false)?;
        return Ok(Type::INT16);
    }
    let rax = Reg::Rax;
    let tmp = send_temporary_save_reg(ctx.s, ctx.info, rax, &[dst])?;
    ctx.s.bytes(&[0x0f, 0x90, 0xc0])?; // seto %al
    ctx.s.byte(0x9f)?; // lahf
    ctx.info.clobber(rax);
    movzx_r16_r64(ctx.s, Reg::Ax, dst)?;
    send_undo_temporary_mov_reg(ctx.s, ctx.info, rax, tmp)?;
    Ok(Type::INT16)
}

/// A register passed by reference: a pointer to its saved slot.
fn load_register_ptr(ctx: &mut ArgCtx<'_>, reg: Reg, dst: Reg) -> anyhow::Result<Type> {
    let canon = reg.canonical();
    match canon {
        Reg::Rip | Reg::Fs | Reg::Gs | Reg::Invalid => {
            return ctx.load_null(dst, "register cannot be passed by reference")
        }
        _ => {}
    }
    if !ctx.info.is_saved(canon) {
        if canon == Reg::Rsp {
            // The slot fix-up below dirties the flags; secure them first
            // so a later EFLAGS argument still sees the originals.
            if !ctx.info.is_saved(Reg::Eflags) {
                send_push(ctx.s, ctx.info, Reg::Eflags)?;
            }
            let fix = send_push_rsp(ctx.s, ctx.info)?;
            send_fix_rsp_slot(ctx.s, ctx.info, fix)?;
        } else {
            send_push(ctx.s, ctx.info, canon)?;
        }
    }
    let off = match ctx.info.get_offset(canon) {
        Some(off) => off + if reg.is_high() { 1 } else { 0 },
        None => return ctx.load_null(dst, "register has no saved slot"),
    };
    lea_stack_r64(ctx.s, off, dst)?;
    Ok(Type::int_of_size(reg.size()) | Type::PTR)
}

fn select_operand<'i>(
    instr: &'i InstrInfo,
    sel: OpSelector,
    idx: usize,
) -> Option<(usize, &'i OpInfo)> {
    let matches_sel = |op: &OpInfo| match sel {
        OpSelector::Any => true,
        OpSelector::Src => op.access.is_read() || matches!(op.kind, OpKind::Imm(_)),
        OpSelector::Dst => op.access.is_write(),
        OpSelector::Imm => matches!(op.kind, OpKind::Imm(_)),
        OpSelector::Reg => matches!(op.kind, OpKind::Reg(_)),
        OpSelector::Mem => matches!(op.kind, OpKind::Mem(_)),
    };
    instr
        .ops
        .iter()
        .enumerate()
        .filter(|(_, op)| matches_sel(op))
        .nth(idx)
}

fn load_operand(
    ctx: &mut ArgCtx<'_>,
    arg: &Argument,
    sel: OpSelector,
    dst: Reg,
) -> anyhow::Result<Type> {
    let idx = arg.value as usize;
    let (_, op) = match select_operand(ctx.instr, sel, idx) {
        Some(found) => found,
        None => {
            return ctx.load_null(dst, &format!("operand index {} is out of range", idx))
        }
    };
    let op = op.clone();

    if arg.field != FieldKind::None {
        return load_operand_field(ctx, &op, arg.field, dst);
    }

    match op.kind {
        OpKind::Imm(v) => {
            if arg.ptr {
                let n = ctx.data.immediates.len();
                ctx.data.immediates.push((v, arg.duplicate));
                lea_pcrel(ctx.s, immediate_label(n).as_str(), dst)?;
                Ok(Type::INT64 | Type::PTR | Type::CONST)
            } else if op.size == 8 {
                load_imm(ctx.s, v, dst)?;
                Ok(Type::INT64)
            } else {
                sext_i32(ctx.s, v as i32, dst)?;
                Ok(Type::int_of_size(op.size))
            }
        }
        OpKind::Reg(reg) => {
            if arg.ptr {
                load_register_ptr(ctx, reg, dst)
            } else {
                load_register_value(ctx, reg, dst)
            }
        }
        OpKind::Mem(mem) => {
            if arg.ptr {
                if load_memop(ctx.s, ctx.info, ctx.instr, &mem, op.size, true, dst)? {
                    let mut ty = Type::int_of_size(op.size) | Type::PTR;
                    if !op.access.is_write() {
                        ty = ty | Type::CONST;
                    }
                    Ok(ty)
                } else {
                    Ok(Type::NULL_PTR)
                }
            } else {
                // Pass-by-value is only safe when the operand is actually
                // accessed and its base/index state is still current.
                if ctx.conv == CallConv::After {
                    return ctx.load_null(dst, "memory operand is stale after the instruction");
                }
                if matches!(ctx.instr.mnemonic, Mnemonic::Lea | Mnemonic::Nop) {
                    return ctx.load_null(dst, "memory operand is never accessed");
                }
                if op.access.is_empty() {
                    return ctx.load_null(dst, "memory operand has an empty access mask");
                }
                if load_memop(ctx.s, ctx.info, ctx.instr, &mem, op.size, false, dst)? {
                    Ok(Type::int_of_size(op.size))
                } else {
                    Ok(Type::NULL_PTR)
                }
            }
        }
    }
}

pub(crate) fn immediate_label(n: usize) -> String {
    format!(".Limmediate_{}", n)
}

fn load_operand_field(
    ctx: &mut ArgCtx<'_>,
    op: &OpInfo,
    field: FieldKind,
    dst: Reg,
) -> anyhow::Result<Type> {
    match field {
        FieldKind::Size => {
            sext_i32(ctx.s, i32::from(op.size), dst)?;
            Ok(Type::INT8)
        }
        FieldKind::Type => {
            sext_i32(ctx.s, op.kind.code(), dst)?;
            Ok(Type::INT8)
        }
        FieldKind::Access => {
            sext_i32(ctx.s, i32::from(op.access.0), dst)?;
            Ok(Type::INT8)
        }
        FieldKind::Base | FieldKind::Index | FieldKind::Scale | FieldKind::Displ => {
            let mem = match op.kind {
                OpKind::Mem(ref mem) => *mem,
                _ => return ctx.load_null(dst, "operand field requires a memory operand"),
            };
            match field {
                FieldKind::Base => {
                    if mem.base.is_gpr() {
                        load_register_value(ctx, mem.base, dst)
                    } else {
                        ctx.load_null(dst, "memory operand has no base register")
                    }
                }
                FieldKind::Index => {
                    if mem.index.is_gpr() {
                        load_register_value(ctx, mem.index, dst)
                    } else {
                        ctx.load_null(dst, "memory operand has no index register")
                    }
                }
                FieldKind::Scale => {
                    sext_i32(ctx.s, i32::from(mem.scale), dst)?;
                    Ok(Type::INT8)
                }
                _ => {
                    sext_i32(ctx.s, mem.disp, dst)?;
                    Ok(Type::INT32)
                }
            }
        }
        FieldKind::None => unreachable!(),
    }
}

/// NEXT: the address of the next instruction the CPU will execute.
fn load_next(ctx: &mut ArgCtx<'_>, dst: Reg) -> anyhow::Result<Type> {
    if ctx.conv == CallConv::After {
        lea_pcrel(ctx.s, LABEL_CONTINUE, dst)?;
        return Ok(Type::VOID | Type::PTR | Type::CONST);
    }
    match ctx.instr.mnemonic {
        m if m.is_conditional() => send_branch_island(ctx, dst),
        Mnemonic::Jmp | Mnemonic::Call | Mnemonic::Ret => load_target(ctx, dst),
        _ => {
            lea_pcrel(ctx.s, LABEL_CONTINUE, dst)?;
            Ok(Type::VOID | Type::PTR | Type::CONST)
        }
    }
}

/// TARGET: the control-transfer destination of the instruction. For a
/// conditional branch this is the taken target, island-free.
fn load_target(ctx: &mut ArgCtx<'_>, dst: Reg) -> anyhow::Result<Type> {
    match ctx.instr.mnemonic {
        Mnemonic::Ret => {
            let ret_slot = crate::insn::MemOp::base_disp(Reg::Rsp, 0);
            if load_memop(ctx.s, ctx.info, ctx.instr, &ret_slot, 8, false, dst)? {
                Ok(Type::VOID | Type::PTR | Type::CONST)
            } else {
                Ok(Type::NULL_PTR)
            }
        }
        Mnemonic::Jmp | Mnemonic::Call => load_branch_target_value(ctx, dst),
        m if m.is_conditional() => load_branch_target_value(ctx, dst),
        _ => ctx.load_null(dst, "instruction has no control-transfer target"),
    }
}

/// Loads the destination encoded in a branch's first operand.
fn load_branch_target_value(ctx: &mut ArgCtx<'_>, dst: Reg) -> anyhow::Result<Type> {
    let op = match ctx.instr.op(0) {
        Some(op) => op.clone(),
        None => return ctx.load_null(dst, "branch has no target operand"),
    };
    match op.kind {
        OpKind::Imm(imm) => {
            let target = ctx.instr.next_address() as i64 + imm;
            lea_pcrel(ctx.s, target, dst)?;
            Ok(Type::VOID | Type::PTR | Type::CONST)
        }
        OpKind::Reg(reg) => {
            load_register_value(ctx, reg.canonical(), dst)?;
            Ok(Type::VOID | Type::PTR | Type::CONST)
        }
        OpKind::Mem(mem) => {
            if load_memop(ctx.s, ctx.info, ctx.instr, &mem, 8, false, dst)? {
                Ok(Type::VOID | Type::PTR | Type::CONST)
            } else {
                Ok(Type::NULL_PTR)
            }
        }
    }
}

/// The conditional-branch island: take the original branch inside the
/// trampoline to decide which address lands in `dst`.
///
/// ```text
///     Jcc  .Ltaken<dst>
///     lea  .Lcontinue(%rip), dst
///     jmp  .Lnext<dst>
/// .Ltaken<dst>:
///     <load taken target>
/// .Lnext<dst>:
/// ```
fn send_branch_island(ctx: &mut ArgCtx<'_>, dst: Reg) -> anyhow::Result<Type> {
    let suffix = capitalize(dst.name());
    let taken = format!(".Ltaken{}", suffix);
    let next = format!(".Lnext{}", suffix);

    // JECXZ/JRCXZ test RCX itself, which must hold the program's value
    // while the island's copy of the branch executes.
    let cx_sensitive = matches!(ctx.instr.mnemonic, Mnemonic::Jecxz | Mnemonic::Jrcxz);
    let tmp = if cx_sensitive {
        send_temporary_restore_reg(ctx.s, ctx.info, Reg::Rcx, &[dst])?
    } else {
        Tmp::None
    };

    match ctx.instr.mnemonic {
        Mnemonic::Jecxz => {
            ctx.s.byte(0x67)?;
            ctx.s.byte(0xe3)?;
        }
        Mnemonic::Jrcxz => ctx.s.byte(0xe3)?,
        m => match m.jcc_opcode() {
            Some(op) => ctx.s.byte(op)?,
            None => return ctx.load_null(dst, "not a conditional branch"),
        },
    }
    ctx.s.rel8(taken.as_str())?;

    lea_pcrel(ctx.s, LABEL_CONTINUE, dst)?;
    ctx.s.byte(0xeb)?;
    ctx.s.rel8(next.as_str())?;

    ctx.s.label(&taken)?;
    let ty = load_branch_target_value(ctx, dst)?;
    ctx.s.label(&next)?;

    if cx_sensitive {
        send_undo_temporary_mov_reg(ctx.s, ctx.info, Reg::Rcx, tmp)?;
    }
    Ok(ty)
}
