//! Single-instruction emitters. Every function here writes exactly the
//! bytes (and linker escapes) of one x86-64 instruction, or a short fixed
//! sequence where the hardware offers no single-instruction form. Liveness
//! is the caller's problem; byte-accuracy is ours.

use super::callinfo::CallInfo;
use super::stream::{RelTarget, Stream};
use crate::insn::{InstrInfo, MemOp};
use crate::regs::Reg;
use crate::util::{fits_i32, fits_i8};
use anyhow::bail;

fn modrm(m0d: u8, reg: u8, rm: u8) -> u8 {
    debug_assert!(m0d < 4 && reg < 8 && rm < 8);
    (m0d << 6) | (reg << 3) | rm
}

fn sib(scale: u8, index: u8, base: u8) -> u8 {
    debug_assert!(scale < 4 && index < 8 && base < 8);
    (scale << 6) | (index << 3) | base
}

fn rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
    0x40 | ((w as u8) << 3) | ((r as u8) << 2) | ((x as u8) << 1) | (b as u8)
}

/// ModR/M + SIB + displacement for `off(%rsp)`.
fn stack_rm(s: &mut Stream, reg_field: u8, off: i32) -> anyhow::Result<()> {
    if off == 0 {
        s.byte(modrm(0, reg_field, 4))?;
        s.byte(sib(0, 4, 4))?;
    } else if fits_i8(i64::from(off)) {
        s.byte(modrm(1, reg_field, 4))?;
        s.byte(sib(0, 4, 4))?;
        s.int8(off as i8)?;
    } else {
        s.byte(modrm(2, reg_field, 4))?;
        s.byte(sib(0, 4, 4))?;
        s.int32(off)?;
    }
    Ok(())
}

fn gpr_idx(reg: Reg) -> u8 {
    reg.index().unwrap_or(0)
}

/// `mov %src64, %dst64`
pub(crate) fn mov_r64_r64(s: &mut Stream, src: Reg, dst: Reg) -> anyhow::Result<()> {
    let (si, di) = (gpr_idx(src), gpr_idx(dst));
    s.byte(rex(true, si >= 8, false, di >= 8))?;
    s.byte(0x89)?;
    s.byte(modrm(3, si & 7, di & 7))
}

/// `mov %src32, %dst32` — zero-extends into the full destination.
pub(crate) fn mov_r32_r64(s: &mut Stream, src: Reg, dst: Reg) -> anyhow::Result<()> {
    let (si, di) = (gpr_idx(src), gpr_idx(dst));
    if si >= 8 || di >= 8 {
        s.byte(rex(false, si >= 8, false, di >= 8))?;
    }
    s.byte(0x89)?;
    s.byte(modrm(3, si & 7, di & 7))
}

/// `movzwq %src16, %dst64`
pub(crate) fn movzx_r16_r64(s: &mut Stream, src: Reg, dst: Reg) -> anyhow::Result<()> {
    let (si, di) = (gpr_idx(src), gpr_idx(dst));
    s.byte(rex(true, di >= 8, false, si >= 8))?;
    s.byte(0x0f)?;
    s.byte(0xb7)?;
    s.byte(modrm(3, di & 7, si & 7))
}

/// `movzbq %src8, %dst64` for a low-byte source.
pub(crate) fn movzx_r8_r64(s: &mut Stream, src: Reg, dst: Reg) -> anyhow::Result<()> {
    let (si, di) = (gpr_idx(src), gpr_idx(dst));
    s.byte(rex(true, di >= 8, false, si >= 8))?;
    s.byte(0x0f)?;
    s.byte(0xb6)?;
    s.byte(modrm(3, di & 7, si & 7))
}

/// Loads a high-byte register (AH..DH) zero-extended into `dst`. The
/// REX prefix a possibly-extended destination needs makes the high byte
/// unencodable directly, so go through the canonical register:
/// `mov %rax,%dst; shr $8,%dst; movzbq %dstb,%dst`.
pub(crate) fn mov_high_r64(s: &mut Stream, src: Reg, dst: Reg) -> anyhow::Result<()> {
    mov_r64_r64(s, src.canonical(), dst)?;
    let di = gpr_idx(dst);
    s.byte(rex(true, false, false, di >= 8))?;
    s.byte(0xc1)?;
    s.byte(modrm(3, 5, di & 7))?;
    s.byte(8)?;
    movzx_r8_r64(s, dst, dst)
}

/// Loads `size` bytes at `off(%rsp)` into `dst`, sign- or zero-extended.
pub(crate) fn mov_stack_r64(
    s: &mut Stream,
    off: i32,
    dst: Reg,
    size: u8,
    signed: bool,
) -> anyhow::Result<()> {
    let di = gpr_idx(dst);
    let r = di >= 8;
    match (size, signed) {
        (8, _) => {
            s.byte(rex(true, r, false, false))?;
            s.byte(0x8b)?;
        }
        (4, false) => {
            if r {
                s.byte(rex(false, true, false, false))?;
            }
            s.byte(0x8b)?;
        }
        (4, true) => {
            s.byte(rex(true, r, false, false))?;
            s.byte(0x63)?;
        }
        (2, false) => {
            s.byte(rex(true, r, false, false))?;
            s.byte(0x0f)?;
            s.byte(0xb7)?;
        }
        (2, true) => {
            s.byte(rex(true, r, false, false))?;
            s.byte(0x0f)?;
            s.byte(0xbf)?;
        }
        (1, false) => {
            s.byte(rex(true, r, false, false))?;
            s.byte(0x0f)?;
            s.byte(0xb6)?;
        }
        (1, true) => {
            s.byte(rex(true, r, false, false))?;
            s.byte(0x0f)?;
            s.byte(0xbe)?;
        }
        _ => bail!("unsupported stack load width {}", size),
    }
    stack_rm(s, di & 7, off)
}

/// `mov %src, off(%rsp)`
pub(crate) fn mov_r64_stack(s: &mut Stream, src: Reg, off: i32) -> anyhow::Result<()> {
    let si = gpr_idx(src);
    s.byte(rex(true, si >= 8, false, false))?;
    s.byte(0x89)?;
    stack_rm(s, si & 7, off)
}

/// `lea off(%rsp), %dst`
pub(crate) fn lea_stack_r64(s: &mut Stream, off: i32, dst: Reg) -> anyhow::Result<()> {
    let di = gpr_idx(dst);
    s.byte(rex(true, di >= 8, false, false))?;
    s.byte(0x8d)?;
    stack_rm(s, di & 7, off)
}

/// `lea delta(%rsp), %rsp` — the flag-preserving stack adjustment.
pub(crate) fn lea_rsp_adjust(s: &mut Stream, delta: i32) -> anyhow::Result<()> {
    if delta == 0 {
        return Ok(());
    }
    s.byte(rex(true, false, false, false))?;
    s.byte(0x8d)?;
    stack_rm(s, 4, delta)
}

/// `addq $imm, off(%rsp)` — clobbers flags.
pub(crate) fn add_i32_stack(s: &mut Stream, imm: i32, off: i32) -> anyhow::Result<()> {
    s.byte(rex(true, false, false, false))?;
    s.byte(0x81)?;
    stack_rm(s, 0, off)?;
    s.int32(imm)
}

/// `lea target(%rip), %dst`
pub(crate) fn lea_pcrel<'a, T: Into<RelTarget<'a>>>(
    s: &mut Stream,
    target: T,
    dst: Reg,
) -> anyhow::Result<()> {
    let di = gpr_idx(dst);
    s.byte(rex(true, di >= 8, false, false))?;
    s.byte(0x8d)?;
    s.byte(modrm(0, di & 7, 5))?;
    s.rel32(target)
}

/// `mov target(%rip), %dst` — dereferences, e.g. a GOT slot.
pub(crate) fn mov_pcrel<'a, T: Into<RelTarget<'a>>>(
    s: &mut Stream,
    target: T,
    dst: Reg,
) -> anyhow::Result<()> {
    let di = gpr_idx(dst);
    s.byte(rex(true, di >= 8, false, false))?;
    s.byte(0x8b)?;
    s.byte(modrm(0, di & 7, 5))?;
    s.rel32(target)
}

/// `movq $imm32, %dst` — sign-extends.
pub(crate) fn sext_i32(s: &mut Stream, imm: i32, dst: Reg) -> anyhow::Result<()> {
    let di = gpr_idx(dst);
    s.byte(rex(true, false, false, di >= 8))?;
    s.byte(0xc7)?;
    s.byte(modrm(3, 0, di & 7))?;
    s.int32(imm)
}

/// `mov $imm32, %dst32` — zero-extends.
pub(crate) fn zext_i32(s: &mut Stream, imm: u32, dst: Reg) -> anyhow::Result<()> {
    let di = gpr_idx(dst);
    if di >= 8 {
        s.byte(rex(false, false, false, true))?;
    }
    s.byte(0xb8 + (di & 7))?;
    s.int32(imm as i32)
}

/// `movabs $imm64, %dst`
pub(crate) fn mov_i64(s: &mut Stream, imm: i64, dst: Reg) -> anyhow::Result<()> {
    let di = gpr_idx(dst);
    s.byte(rex(true, false, false, di >= 8))?;
    s.byte(0xb8 + (di & 7))?;
    s.int64(imm)
}

/// Loads an arbitrary immediate with the shortest valid form.
pub(crate) fn load_imm(s: &mut Stream, imm: i64, dst: Reg) -> anyhow::Result<()> {
    if fits_i32(imm) {
        sext_i32(s, imm as i32, dst)
    } else if imm > 0 && imm <= i64::from(u32::MAX) {
        zext_i32(s, imm as u32, dst)
    } else {
        mov_i64(s, imm, dst)
    }
}

fn push_gpr(s: &mut Stream, reg: Reg) -> anyhow::Result<()> {
    let i = gpr_idx(reg);
    if i >= 8 {
        s.byte(0x41)?;
    }
    s.byte(0x50 + (i & 7))
}

fn pop_gpr(s: &mut Stream, reg: Reg) -> anyhow::Result<()> {
    let i = gpr_idx(reg);
    if i >= 8 {
        s.byte(0x41)?;
    }
    s.byte(0x58 + (i & 7))
}

/// Pushes a live argument-register value as a stack-passed argument.
/// This is not a save: the value has no slot in the saved block, but the
/// stack still moved.
pub(crate) fn send_push_stack_arg(
    s: &mut Stream,
    info: &mut CallInfo,
    reg: Reg,
) -> anyhow::Result<()> {
    push_gpr(s, reg.canonical())?;
    info.adjust_rsp(8);
    Ok(())
}

/// Pushes `reg`'s current value into its saved slot and records it.
/// RFLAGS pushes as `pushfq`; RSP goes through [`send_push_rsp`].
pub(crate) fn send_push(s: &mut Stream, info: &mut CallInfo, reg: Reg) -> anyhow::Result<()> {
    let reg = reg.canonical();
    match reg {
        Reg::Eflags => s.byte(0x9c)?,
        Reg::Rsp => {
            let fix = send_push_rsp(s, info)?;
            return send_fix_rsp_slot(s, info, fix);
        }
        r if r.is_gpr() => push_gpr(s, r)?,
        other => bail!("cannot save {} to the trampoline stack", other),
    }
    info.record_push(reg);
    Ok(())
}

/// Pushes the raw `%rsp` and returns the fix-up the slot still needs to
/// hold the program's value. The fix-up (`addq` — it dirties flags) is
/// applied by [`send_fix_rsp_slot`], deferred until after `pushfq` when
/// RSP is part of an up-front block.
pub(crate) fn send_push_rsp(s: &mut Stream, info: &mut CallInfo) -> anyhow::Result<i32> {
    let fix = info.rsp_offset();
    s.byte(0x54)?;
    info.record_push(Reg::Rsp);
    Ok(fix)
}

pub(crate) fn send_fix_rsp_slot(
    s: &mut Stream,
    info: &mut CallInfo,
    fix: i32,
) -> anyhow::Result<()> {
    let off = info.get_offset(Reg::Rsp).unwrap_or(0);
    add_i32_stack(s, fix, off)
}

/// Ensures `reg` has a slot in the saved block, pushing it on demand.
pub(crate) fn send_save_reg_to_stack(
    s: &mut Stream,
    info: &mut CallInfo,
    reg: Reg,
) -> anyhow::Result<()> {
    let reg = reg.canonical();
    if info.is_saved(reg) {
        return Ok(());
    }
    if info.is_clobbered(reg) {
        log::warn!("saving {} after its original value was overwritten", reg);
    }
    send_push(s, info, reg)
}

/// Restores one saved register in the epilogue drain. For a conditional
/// call the flags slot is discarded (the callee's predicate is live in
/// EFLAGS) and a live RAX result is preserved by popping the original
/// into a scratch register instead.
pub(crate) fn send_pop(
    s: &mut Stream,
    info: &mut CallInfo,
    reg: Reg,
    preserve_rax: bool,
) -> anyhow::Result<()> {
    let reg = reg.canonical();
    match reg {
        Reg::Eflags => {
            if info.conditional() {
                lea_rsp_adjust(s, 8)?;
            } else {
                s.byte(0x9d)?;
            }
        }
        Reg::Rax if preserve_rax => {
            let scratch = info.get_scratch(&[Reg::Rax]);
            if scratch.is_gpr() {
                pop_gpr(s, scratch)?;
            } else {
                lea_rsp_adjust(s, 8)?;
            }
        }
        r if r.is_gpr() => pop_gpr(s, r)?,
        other => bail!("cannot restore {} from the trampoline stack", other),
    }
    info.adjust_rsp(-8);
    info.restore(reg);
    Ok(())
}

/// The bookkeeping state of a register before a temporary move, restored
/// by the matching undo.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct RegState {
    clobbered: bool,
    used: bool,
}

/// Where a temporarily displaced value went.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum Tmp {
    None,
    Scratch(Reg, RegState),
    Slot(i32, RegState),
}

/// Unconditionally relocates `reg`'s live value: into a scratch register
/// when one is free, else into a red-zone slot below `%rsp`.
pub(crate) fn send_temporary_mov_reg(
    s: &mut Stream,
    info: &mut CallInfo,
    reg: Reg,
    exclude: &[Reg],
) -> anyhow::Result<Tmp> {
    let reg = reg.canonical();
    if !reg.is_gpr() || reg == Reg::Rsp {
        return Ok(Tmp::None);
    }
    let prior = RegState {
        clobbered: info.is_clobbered(reg),
        used: info.is_used(reg),
    };
    let mut ex = exclude.to_vec();
    ex.push(reg);
    let scratch = info.get_scratch(&ex);
    if scratch.is_gpr() {
        mov_r64_r64(s, reg, scratch)?;
        info.clobber(scratch);
        Ok(Tmp::Scratch(scratch, prior))
    } else {
        let off = info.next_tmp_slot();
        mov_r64_stack(s, reg, off)?;
        Ok(Tmp::Slot(off, prior))
    }
}

/// Like [`send_temporary_mov_reg`], but a no-op when `reg`'s original is
/// already secured and its live value is disposable (clobbered, not a
/// value later emission still needs).
pub(crate) fn send_temporary_save_reg(
    s: &mut Stream,
    info: &mut CallInfo,
    reg: Reg,
    exclude: &[Reg],
) -> anyhow::Result<Tmp> {
    let reg = reg.canonical();
    if info.is_clobbered(reg) && !info.is_used(reg) {
        return Ok(Tmp::None);
    }
    send_temporary_mov_reg(s, info, reg, exclude)
}

/// Makes `reg` hold its program-original value for the next instruction.
/// A live loaded-argument value (clobbered + used) is displaced first;
/// plain scratch damage is simply overwritten by the reload.
pub(crate) fn send_temporary_restore_reg(
    s: &mut Stream,
    info: &mut CallInfo,
    reg: Reg,
    exclude: &[Reg],
) -> anyhow::Result<Tmp> {
    let reg = reg.canonical();
    if !reg.is_gpr() || reg == Reg::Rsp || !info.is_clobbered(reg) {
        return Ok(Tmp::None);
    }
    let tmp = if info.is_used(reg) {
        send_temporary_mov_reg(s, info, reg, exclude)?
    } else {
        Tmp::None
    };
    match info.get_offset(reg) {
        Some(off) => {
            mov_stack_r64(s, off, reg, 8, false)?;
            info.use_reg(reg);
        }
        None => log::warn!("no saved slot to restore {} from", reg),
    }
    Ok(tmp)
}

/// Inverse of a temporary move: puts the displaced live value back and
/// rewinds the bookkeeping to the pre-move state.
pub(crate) fn send_undo_temporary_mov_reg(
    s: &mut Stream,
    info: &mut CallInfo,
    reg: Reg,
    tmp: Tmp,
) -> anyhow::Result<()> {
    let reg = reg.canonical();
    let prior = match tmp {
        Tmp::None => return Ok(()),
        Tmp::Scratch(r, prior) => {
            mov_r64_r64(s, r, reg)?;
            prior
        }
        Tmp::Slot(off, prior) => {
            mov_stack_r64(s, off, reg, 8, false)?;
            prior
        }
    };
    info.set_flags(reg, prior.clobbered, prior.used);
    Ok(())
}

fn scale_bits(scale: u8) -> Option<u8> {
    match scale {
        1 => Some(0),
        2 => Some(1),
        4 => Some(2),
        8 => Some(3),
        _ => None,
    }
}

/// Synthesises one MOV (or LEA with `lea`) producing the value (or the
/// effective address) of a fully-decoded memory operand in `dst`,
/// compensating the displacement for the trampoline's stack movement and
/// restoring any displaced base/index register around the access.
///
/// Returns `false` after warning and loading zero when the operand is
/// unencodable; the caller types the argument as a null pointer.
pub(crate) fn load_memop(
    s: &mut Stream,
    info: &mut CallInfo,
    instr: &InstrInfo,
    mem: &MemOp,
    size: u8,
    lea: bool,
    dst: Reg,
) -> anyhow::Result<bool> {
    // All validation happens before any byte is emitted.
    if lea && matches!(mem.seg, Reg::Fs | Reg::Gs) {
        log::warn!(
            "cannot load effective address of a {}-segment operand of `{}`: \
             LEA ignores the segment base",
            mem.seg.name(),
            instr.text
        );
        sext_i32(s, 0, dst)?;
        return Ok(false);
    }
    if !lea && !matches!(size, 1 | 2 | 4 | 8) {
        log::warn!("unsupported memory operand size {} in `{}`", size, instr.text);
        sext_i32(s, 0, dst)?;
        return Ok(false);
    }
    if matches!(mem.index.canonical(), Reg::Rsp) && mem.index.is_gpr() {
        log::warn!("stack-pointer index register in `{}`", instr.text);
        sext_i32(s, 0, dst)?;
        return Ok(false);
    }
    let scale = match scale_bits(mem.scale) {
        Some(bits) => bits,
        None => {
            log::warn!("bad index scale {} in `{}`", mem.scale, instr.text);
            sext_i32(s, 0, dst)?;
            return Ok(false);
        }
    };

    let rip_base = matches!(mem.base, Reg::Rip | Reg::Eip);
    if rip_base && mem.index.is_gpr() {
        log::warn!("RIP-relative operand with an index in `{}`", instr.text);
        sext_i32(s, 0, dst)?;
        return Ok(false);
    }

    let mut disp = i64::from(mem.disp);
    if mem.base.canonical() == Reg::Rsp && mem.base.is_gpr() {
        disp += i64::from(info.rsp_offset());
    }
    if !rip_base && !fits_i32(disp) {
        log::warn!(
            "stack-adjusted displacement {:#x} of `{}` does not fit 32 bits",
            disp,
            instr.text
        );
        sext_i32(s, 0, dst)?;
        return Ok(false);
    }

    // Bring the program's base/index values back for the access.
    let base_gpr = if mem.base.is_gpr() && mem.base.canonical() != Reg::Rsp {
        Some(mem.base.canonical())
    } else {
        None
    };
    let index_gpr = if mem.index.is_gpr() {
        Some(mem.index.canonical())
    } else {
        None
    };
    let exclude = [
        dst,
        base_gpr.unwrap_or(Reg::Invalid),
        index_gpr.unwrap_or(Reg::Invalid),
    ];
    let mut undo = Vec::new();
    if let Some(base) = base_gpr {
        undo.push((base, send_temporary_restore_reg(s, info, base, &exclude)?));
    }
    if let Some(index) = index_gpr {
        if Some(index) != base_gpr {
            undo.push((index, send_temporary_restore_reg(s, info, index, &exclude)?));
        }
    }

    // Prefixes.
    if mem.base.size() == 4 || mem.index.size() == 4 {
        s.byte(0x67)?;
    }
    match mem.seg {
        Reg::Fs => s.byte(0x64)?,
        Reg::Gs => s.byte(0x65)?,
        _ => {}
    }

    let di = gpr_idx(dst);
    let base_idx = mem.base.index();
    let index_idx = mem.index.index();
    s.byte(rex(
        true,
        di >= 8,
        index_idx.map(|i| i >= 8).unwrap_or(false),
        base_idx.map(|i| i >= 8).unwrap_or(false),
    ))?;

    if lea {
        s.byte(0x8d)?;
    } else {
        match size {
            1 => {
                s.byte(0x0f)?;
                s.byte(0xbe)?;
            }
            2 => {
                s.byte(0x0f)?;
                s.byte(0xbf)?;
            }
            4 => s.byte(0x63)?,
            8 => s.byte(0x8b)?,
            _ => unreachable!(),
        }
    }

    if rip_base {
        s.byte(modrm(0, di & 7, 5))?;
        s.rel32(i64::from(mem.disp) + instr.address as i64 + i64::from(instr.size))?;
    } else if base_idx.is_none() {
        // Absolute: SIB with no base, always disp32.
        let index_bits = index_idx.map(|i| i & 7).unwrap_or(4);
        s.byte(modrm(0, di & 7, 4))?;
        s.byte(sib(scale, index_bits, 5))?;
        s.int32(disp as i32)?;
    } else {
        let base_i = base_idx.unwrap();
        let need_sib = index_idx.is_some() || (base_i & 7) == 4;
        let forced_disp = (base_i & 7) == 5;
        let m0d = if disp == 0 && !forced_disp {
            0
        } else if fits_i8(disp) {
            1
        } else {
            2
        };
        if need_sib {
            let index_bits = index_idx.map(|i| i & 7).unwrap_or(4);
            s.byte(modrm(m0d, di & 7, 4))?;
            s.byte(sib(scale, index_bits, base_i & 7))?;
        } else {
            s.byte(modrm(m0d, di & 7, base_i & 7))?;
        }
        match m0d {
            1 => s.int8(disp as i8)?,
            2 => s.int32(disp as i32)?,
            _ => {}
        }
    }

    for (reg, tmp) in undo.into_iter().rev() {
        send_undo_temporary_mov_reg(s, info, reg, tmp)?;
    }
    Ok(true)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::insn::Mnemonic;

    fn instr_at(address: u64, size: u8) -> InstrInfo {
        InstrInfo {
            address,
            offset: 0,
            size,
            data: vec![0x90; size as usize],
            text: String::from("test"),
            mnemonic: Mnemonic::Other,
            ops: Vec::new(),
        }
    }

    fn fresh_info(rsp_offset: i32) -> CallInfo {
        let mut info = CallInfo::new(false, false, false, 0);
        info.set_rsp_offset(rsp_offset);
        info
    }

    #[test]
    fn reg_to_reg_moves() {
        let mut s = Stream::new();
        mov_r64_r64(&mut s, Reg::Rax, Reg::R10).unwrap();
        assert_eq!(s.take(), "73,137,194"); // 49 89 c2

        mov_r64_r64(&mut s, Reg::R10, Reg::Rax).unwrap();
        assert_eq!(s.take(), "76,137,208"); // 4c 89 d0

        mov_r32_r64(&mut s, Reg::Rcx, Reg::Rdi).unwrap();
        assert_eq!(s.take(), "137,207"); // 89 cf

        movzx_r16_r64(&mut s, Reg::Rax, Reg::Rdi).unwrap();
        assert_eq!(s.take(), "72,15,183,248"); // 48 0f b7 f8
    }

    #[test]
    fn immediates() {
        let mut s = Stream::new();
        sext_i32(&mut s, 0x7fffffff, Reg::Rdi).unwrap();
        assert_eq!(s.take(), "72,199,199,{\"int32\":2147483647}"); // 48 c7 c7

        sext_i32(&mut s, 0, Reg::R9).unwrap();
        assert_eq!(s.take(), "73,199,193,{\"int32\":0}");

        mov_i64(&mut s, i64::MIN, Reg::Rsi).unwrap();
        assert_eq!(s.take(), "72,190,{\"int64\":-9223372036854775808}"); // 48 be

        zext_i32(&mut s, 5, Reg::R10).unwrap();
        assert_eq!(s.take(), "65,186,{\"int32\":5}"); // 41 ba
    }

    #[test]
    fn stack_loads_pick_disp_width() {
        let mut s = Stream::new();
        mov_stack_r64(&mut s, 0, Reg::Rdi, 8, false).unwrap();
        assert_eq!(s.take(), "72,139,60,36"); // mov (%rsp),%rdi

        mov_stack_r64(&mut s, 0x10, Reg::Rdi, 8, false).unwrap();
        assert_eq!(s.take(), "72,139,124,36,{\"int8\":16}");

        mov_stack_r64(&mut s, 0x1000, Reg::Rdi, 8, false).unwrap();
        assert_eq!(s.take(), "72,139,188,36,{\"int32\":4096}");

        mov_stack_r64(&mut s, 2, Reg::Rdi, 2, false).unwrap();
        assert_eq!(s.take(), "72,15,183,124,36,{\"int8\":2}"); // movzwq

        lea_stack_r64(&mut s, 0, Reg::Rdi).unwrap();
        assert_eq!(s.take(), "72,141,60,36"); // lea (%rsp),%rdi
    }

    #[test]
    fn pcrel_forms() {
        let mut s = Stream::new();
        lea_pcrel(&mut s, ".Lcontinue", Reg::Rdi).unwrap();
        assert_eq!(s.take(), "72,141,61,{\"rel32\":\".Lcontinue\"}"); // 48 8d 3d

        mov_pcrel(&mut s, 0x5f00, Reg::R8).unwrap();
        assert_eq!(s.take(), "76,139,5,{\"rel32\":24320}"); // 4c 8b 05
    }

    #[test]
    fn memop_with_sib_and_stack_compensation() {
        // mov 0x10(%rsp,%rbx,2) at rsp_offset 0x20:
        // displacement compensates to 0x30, SIB required, dest %rdi.
        let mut s = Stream::new();
        let mut info = fresh_info(0x20);
        let instr = instr_at(0x1000, 4);
        let mem = MemOp {
            seg: Reg::Invalid,
            base: Reg::Rsp,
            index: Reg::Rbx,
            scale: 2,
            disp: 0x10,
        };
        assert!(load_memop(&mut s, &mut info, &instr, &mem, 8, false, Reg::Rdi).unwrap());
        assert_eq!(s.take(), "72,139,124,92,{\"int8\":48}"); // 48 8b 7c 5c 30

        let mem4 = MemOp { scale: 4, ..mem };
        assert!(load_memop(&mut s, &mut info, &instr, &mem4, 8, false, Reg::Rdi).unwrap());
        assert_eq!(s.take(), "72,139,124,156,{\"int8\":48}"); // sib 9c
    }

    #[test]
    fn memop_rex_bits() {
        let mut s = Stream::new();
        let mut info = fresh_info(0);
        let instr = instr_at(0x1000, 4);
        let mem = MemOp {
            seg: Reg::Invalid,
            base: Reg::R13,
            index: Reg::R9,
            scale: 1,
            disp: 0,
        };
        assert!(load_memop(&mut s, &mut info, &instr, &mem, 8, false, Reg::R8).unwrap());
        // REX.WRXB = 4f, base r13 forces disp8 0.
        assert_eq!(s.take(), "79,139,68,13,{\"int8\":0}");
    }

    #[test]
    fn memop_rip_relative() {
        let mut s = Stream::new();
        let mut info = fresh_info(0x4000);
        let instr = instr_at(0x1000, 7);
        let mem = MemOp {
            seg: Reg::Invalid,
            base: Reg::Rip,
            index: Reg::Invalid,
            scale: 1,
            disp: 0x200,
        };
        assert!(load_memop(&mut s, &mut info, &instr, &mem, 8, false, Reg::Rdi).unwrap());
        // Target = 0x1000 + 7 + 0x200.
        assert_eq!(s.take(), "72,139,61,{\"rel32\":4615}");
    }

    #[test]
    fn memop_absolute_and_32bit_base() {
        let mut s = Stream::new();
        let mut info = fresh_info(0x4000);
        let instr = instr_at(0x1000, 4);

        let abs = MemOp::absolute(0x601000);
        assert!(load_memop(&mut s, &mut info, &instr, &abs, 4, false, Reg::Rsi).unwrap());
        // movslq: 48 63, sib no-base.
        assert_eq!(s.take(), "72,99,52,37,{\"int32\":6295552}");

        let mem = MemOp {
            seg: Reg::Gs,
            base: Reg::Eax,
            index: Reg::Invalid,
            scale: 1,
            disp: 8,
        };
        assert!(load_memop(&mut s, &mut info, &instr, &mem, 8, false, Reg::Rdi).unwrap());
        // 67 (addr-size), 65 (gs), rex, mov.
        assert_eq!(s.take(), "103,101,72,139,120,{\"int8\":8}");
    }

    #[test]
    fn memop_rejects_lea_with_segment() {
        let mut s = Stream::new();
        let mut info = fresh_info(0x4000);
        let instr = instr_at(0x1000, 4);
        let mem = MemOp {
            seg: Reg::Fs,
            base: Reg::Invalid,
            index: Reg::Invalid,
            scale: 1,
            disp: 0x10,
        };
        assert!(!load_memop(&mut s, &mut info, &instr, &mem, 8, true, Reg::Rdi).unwrap());
        assert_eq!(s.take(), "72,199,199,{\"int32\":0}");
    }

    #[test]
    fn memop_rejects_a_stack_pointer_index() {
        let mut s = Stream::new();
        let mut info = fresh_info(0x4000);
        let instr = instr_at(0x1000, 4);
        let mem = MemOp {
            seg: Reg::Invalid,
            base: Reg::Rax,
            index: Reg::Rsp,
            scale: 1,
            disp: 0,
        };
        assert!(!load_memop(&mut s, &mut info, &instr, &mem, 8, false, Reg::Rdi).unwrap());
        assert_eq!(s.take(), "72,199,199,{\"int32\":0}");
    }

    #[test]
    fn memop_rejects_unrepresentable_displacement() {
        let mut s = Stream::new();
        let mut info = fresh_info(0x4000);
        let instr = instr_at(0x1000, 4);
        let mem = MemOp::base_disp(Reg::Rsp, i32::MAX - 0x100);
        assert!(!load_memop(&mut s, &mut info, &instr, &mem, 8, false, Reg::Rdi).unwrap());
        assert_eq!(s.take(), "72,199,199,{\"int32\":0}");
    }

    #[test]
    fn memop_restores_a_displaced_base_register() {
        let mut s = Stream::new();
        let mut info = fresh_info(0x4000);
        let instr = instr_at(0x1000, 4);
        // RBX was saved and dirtied earlier in the emission.
        info.record_push(Reg::Rbx);
        info.clobber(Reg::Rbx);
        let mem = MemOp::base_disp(Reg::Rbx, 0);
        assert!(load_memop(&mut s, &mut info, &instr, &mem, 8, false, Reg::Rdi).unwrap());
        // Reload of the original %rbx from its slot precedes the access;
        // nothing was displaced, so nothing is undone.
        assert_eq!(s.take(), "72,139,28,36,72,139,59");
        assert!(info.is_used(Reg::Rbx));
    }

    #[test]
    fn temporary_mov_undo_roundtrip() {
        let mut s = Stream::new();
        let mut info = fresh_info(0x4000);
        let tmp = send_temporary_mov_reg(&mut s, &mut info, Reg::Rcx, &[]).unwrap();
        assert!(matches!(tmp, Tmp::Scratch(Reg::Rax, _)));
        send_undo_temporary_mov_reg(&mut s, &mut info, Reg::Rcx, tmp).unwrap();
        // 48 89 c8 (mov %rcx,%rax) then 48 89 c1 (mov %rax,%rcx).
        assert_eq!(s.take(), "72,137,200,72,137,193");
        // The round trip leaves the register's state untouched.
        assert!(!info.is_clobbered(Reg::Rcx));
        assert!(!info.is_used(Reg::Rcx));
    }

    #[test]
    fn temporary_mov_falls_back_to_red_zone() {
        let mut s = Stream::new();
        let mut info = fresh_info(0x4000);
        for &r in crate::regs::SCRATCH_ORDER.iter() {
            info.use_reg(r);
        }
        let tmp = send_temporary_mov_reg(&mut s, &mut info, Reg::Rbx, &[]).unwrap();
        assert!(matches!(tmp, Tmp::Slot(-8, _)));
        // mov %rbx,-8(%rsp)
        assert_eq!(s.take(), "72,137,92,36,{\"int8\":-8}");
    }

    #[test]
    fn push_pop_forms() {
        let mut s = Stream::new();
        let mut info = fresh_info(0x4000);
        send_push(&mut s, &mut info, Reg::Rbx).unwrap();
        assert_eq!(s.take(), "83"); // 53
        send_push(&mut s, &mut info, Reg::R9).unwrap();
        assert_eq!(s.take(), "65,81"); // 41 51
        send_push(&mut s, &mut info, Reg::Eflags).unwrap();
        assert_eq!(s.take(), "156"); // 9c
        assert_eq!(info.rsp_offset(), 0x4000 + 24);

        send_pop(&mut s, &mut info, Reg::Eflags, false).unwrap();
        assert_eq!(s.take(), "157"); // 9d
        send_pop(&mut s, &mut info, Reg::R9, false).unwrap();
        assert_eq!(s.take(), "65,89");
        send_pop(&mut s, &mut info, Reg::Rbx, false).unwrap();
        assert_eq!(s.take(), "91");
        assert_eq!(info.rsp_offset(), 0x4000);
    }

    mod props {
        use super::*;
        use quickcheck_macros::quickcheck;

        const BASES: [Reg; 15] = [
            Reg::Rax,
            Reg::Rcx,
            Reg::Rdx,
            Reg::Rbx,
            Reg::Rbp,
            Reg::Rsi,
            Reg::Rdi,
            Reg::R8,
            Reg::R9,
            Reg::R10,
            Reg::R11,
            Reg::R12,
            Reg::R13,
            Reg::R14,
            Reg::R15,
        ];
        const DESTS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

        /// REX bits, ModR/M mod, SIB presence and displacement width all
        /// follow the encoding rules, for every base/index/dest mix.
        #[quickcheck]
        fn memop_encoding_rules(
            base_pick: u8,
            index_pick: u8,
            scale_pick: u8,
            disp: i32,
            dst_pick: u8,
        ) -> bool {
            let base = BASES[base_pick as usize % BASES.len()];
            let index = match index_pick as usize % (BASES.len() + 1) {
                0 => Reg::Invalid,
                i => BASES[i - 1],
            };
            let scale = [1u8, 2, 4, 8][scale_pick as usize % 4];
            let dst = DESTS[dst_pick as usize % DESTS.len()];

            let mut s = Stream::new();
            let mut info = CallInfo::new(false, false, false, 0);
            let instr = instr_at(0x400000, 4);
            let mem = MemOp {
                seg: Reg::Invalid,
                base,
                index,
                scale,
                disp,
            };
            if !load_memop(&mut s, &mut info, &instr, &mem, 8, false, dst).unwrap() {
                return false;
            }
            let frag = s.take();
            let tokens: Vec<&str> = frag.split(',').collect();

            let base_i = base.index().unwrap();
            let index_i = index.index();
            let expect_rex = rex(
                true,
                dst.index().unwrap() >= 8,
                index_i.map(|i| i >= 8).unwrap_or(false),
                base_i >= 8,
            );
            if tokens[0].parse::<u8>() != Ok(expect_rex) || tokens[1] != "139" {
                return false;
            }

            let need_sib = index_i.is_some() || (base_i & 7) == 4;
            let forced = (base_i & 7) == 5;
            let expect_mod = if disp == 0 && !forced {
                0
            } else if fits_i8(i64::from(disp)) {
                1
            } else {
                2
            };
            let disp_tokens = if expect_mod == 0 { 0 } else { 1 };
            if tokens.len() != 3 + need_sib as usize + disp_tokens {
                return false;
            }
            let modrm_byte: u8 = tokens[2].parse().unwrap();
            if modrm_byte >> 6 != expect_mod {
                return false;
            }
            if disp_tokens == 1 {
                let kind = if expect_mod == 1 { "int8" } else { "int32" };
                if !tokens.last().unwrap().contains(kind) {
                    return false;
                }
            }
            true
        }
    }

    #[test]
    fn rsp_push_records_the_entry_value_fixup() {
        let mut s = Stream::new();
        let mut info = fresh_info(0x4000);
        send_push(&mut s, &mut info, Reg::Rsp).unwrap();
        // push %rsp; addq $0x4000,(%rsp)
        assert_eq!(s.take(), "84,72,129,4,36,{\"int32\":16384}");
        assert_eq!(info.get_offset(Reg::Rsp), Some(0));
    }
}
