//! Per-emission register bookkeeping. One `CallInfo` lives for exactly
//! one action's emission and tracks where every original register value
//! is, how far the stack has moved, and which registers may still be
//! overwritten freely.

use crate::regs::{Reg, CALLEE_SAVE, SCRATCH_ORDER};

/// Bytes the trampoline prologue drops below the program's stack pointer
/// before any fragment runs, so pushes and red-zone temporaries never
/// touch memory the program can observe.
pub const RED_ZONE_SKIP: i32 = 0x4000;

/// Bookkeeping slots: hardware indexes 0..15 plus RFLAGS.
const NSLOTS: usize = 17;
const FLAGS_SLOT: usize = 16;

fn slot(reg: Reg) -> Option<usize> {
    if reg.canonical() == Reg::Eflags {
        return Some(FLAGS_SLOT);
    }
    reg.index().map(usize::from)
}

pub struct CallInfo {
    /// Signed delta between the `%rsp` the trampoline was entered with
    /// and the current runtime `%rsp` (positive = below entry).
    rsp_offset: i32,
    saved: [bool; NSLOTS],
    clobbered: [bool; NSLOTS],
    used: [bool; NSLOTS],
    /// Push order; drained LIFO by the epilogue.
    pushed: Vec<Reg>,
    /// `rsp_offset` captured right after each register's push.
    push_off: [i32; NSLOTS],
    /// Registers the prologue must push before any argument loads.
    layout: Vec<Reg>,
    /// Red-zone temporary slot counter, reset per emission sequence.
    tmp_slot: i32,
    clean: bool,
    state: bool,
    conditional: bool,
    num_args: usize,
}

impl CallInfo {
    pub fn new(clean: bool, state: bool, conditional: bool, num_args: usize) -> CallInfo {
        let mut layout = Vec::new();
        if state {
            // Full block, RSP topmost, RFLAGS lowest.
            layout.push(Reg::Rsp);
            layout.extend_from_slice(&[
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
            ]);
            layout.push(Reg::Eflags);
        } else if clean {
            layout.extend_from_slice(&[
                Reg::Rax,
                Reg::Rcx,
                Reg::Rdx,
                Reg::Rsi,
                Reg::Rdi,
                Reg::R8,
                Reg::R9,
                Reg::R10,
                Reg::R11,
            ]);
            layout.push(Reg::Eflags);
        }

        CallInfo {
            rsp_offset: RED_ZONE_SKIP,
            saved: [false; NSLOTS],
            clobbered: [false; NSLOTS],
            used: [false; NSLOTS],
            pushed: Vec::new(),
            push_off: [0; NSLOTS],
            layout,
            tmp_slot: 0,
            clean,
            state,
            conditional,
            num_args,
        }
    }

    pub fn rsp_offset(&self) -> i32 {
        self.rsp_offset
    }

    /// Records a `%rsp` move of `delta` bytes downward (negative = back up).
    pub fn adjust_rsp(&mut self, delta: i32) {
        self.rsp_offset += delta;
    }

    pub fn clean(&self) -> bool {
        self.clean
    }

    pub fn state(&self) -> bool {
        self.state
    }

    pub fn conditional(&self) -> bool {
        self.conditional
    }

    pub fn num_args(&self) -> usize {
        self.num_args
    }

    /// The registers the prologue pushes before any argument loads.
    pub fn layout(&self) -> &[Reg] {
        &self.layout
    }

    pub fn is_saved(&self, reg: Reg) -> bool {
        slot(reg).map(|i| self.saved[i]).unwrap_or(false)
    }

    pub fn is_clobbered(&self, reg: Reg) -> bool {
        slot(reg).map(|i| self.clobbered[i]).unwrap_or(false)
    }

    pub fn is_used(&self, reg: Reg) -> bool {
        slot(reg).map(|i| self.used[i]).unwrap_or(false)
    }

    /// The live value of `reg` is no longer the program's.
    pub fn clobber(&mut self, reg: Reg) {
        if let Some(i) = slot(reg) {
            self.clobbered[i] = true;
        }
    }

    /// The program-original of `reg` is back in `reg` and later emission
    /// may read it directly.
    pub fn use_reg(&mut self, reg: Reg) {
        if let Some(i) = slot(reg) {
            self.used[i] = true;
        }
    }

    /// `reg` no longer holds its program-original value.
    pub fn unuse_reg(&mut self, reg: Reg) {
        if let Some(i) = slot(reg) {
            self.used[i] = false;
        }
    }

    /// Epilogue restored `reg` from its slot: it holds its
    /// program-original again and must not be handed out as scratch.
    pub fn restore(&mut self, reg: Reg) {
        if let Some(i) = slot(reg) {
            self.clobbered[i] = false;
            self.used[i] = true;
        }
    }

    /// Records that `reg` was pushed to the trampoline stack. The caller
    /// has already emitted the push itself.
    pub fn record_push(&mut self, reg: Reg) {
        let reg = reg.canonical();
        self.rsp_offset += 8;
        self.pushed.push(reg);
        if let Some(i) = slot(reg) {
            self.saved[i] = true;
            self.push_off[i] = self.rsp_offset;
        }
    }

    /// Byte offset of `reg`'s saved slot relative to the current `%rsp`.
    pub fn get_offset(&self, reg: Reg) -> Option<i32> {
        let i = slot(reg.canonical())?;
        if !self.saved[i] {
            return None;
        }
        Some(self.rsp_offset - self.push_off[i])
    }

    /// Next register to restore, LIFO. RSP is pushed first when present,
    /// so it always comes out last.
    pub fn pop(&mut self) -> Option<Reg> {
        self.pushed.pop()
    }

    pub fn pushed(&self) -> &[Reg] {
        &self.pushed
    }

    /// A caller-save register whose live value may be overwritten:
    /// not excluded, not holding a program-original we re-loaded, and
    /// preferably one whose program value is already secured on the
    /// stack. `Invalid` when every candidate is spoken for.
    pub fn get_scratch(&self, exclude: &[Reg]) -> Reg {
        let excluded =
            |r: Reg| exclude.iter().any(|e| e.canonical() == r);
        for &r in SCRATCH_ORDER.iter() {
            if excluded(r) || self.is_used(r) {
                continue;
            }
            if self.is_saved(r) || self.is_clobbered(r) {
                return r;
            }
        }
        for &r in SCRATCH_ORDER.iter() {
            if !excluded(r) && !self.is_used(r) {
                return r;
            }
        }
        Reg::Invalid
    }

    /// The called function may clobber every caller-save register. For a
    /// conditional call the flags are left alone: the callee's predicate
    /// rides out in them.
    pub fn call(&mut self, conditional: bool) {
        for &r in SCRATCH_ORDER.iter() {
            if let Some(i) = slot(r) {
                self.clobbered[i] = true;
                self.used[i] = false;
            }
        }
        if !conditional {
            self.clobbered[FLAGS_SLOT] = true;
            self.used[FLAGS_SLOT] = false;
        }
    }

    /// Callee-save registers we dirtied and can restore from their slots.
    pub fn clobbered_callee_save(&self) -> Vec<Reg> {
        CALLEE_SAVE
            .iter()
            .copied()
            .filter(|&r| self.is_clobbered(r) && self.is_saved(r))
            .collect()
    }

    /// Rewinds `reg` to a captured bookkeeping state (temporary-move undo).
    pub(crate) fn set_flags(&mut self, reg: Reg, clobbered: bool, used: bool) {
        if let Some(i) = slot(reg) {
            self.clobbered[i] = clobbered;
            self.used[i] = used;
        }
    }

    /// Allocates the next red-zone temporary slot (a negative offset from
    /// the current `%rsp`).
    pub fn next_tmp_slot(&mut self) -> i32 {
        self.tmp_slot -= 1;
        self.tmp_slot * 8
    }

    /// Temporary slots are released in LIFO order before a sequence ends;
    /// the counter restarts with each argument.
    pub fn reset_tmp_slots(&mut self) {
        self.tmp_slot = 0;
    }

    #[cfg(test)]
    pub(crate) fn set_rsp_offset(&mut self, off: i32) {
        self.rsp_offset = off;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn push_offsets_track_the_moving_stack() {
        let mut info = CallInfo::new(false, false, false, 1);
        assert_eq!(info.rsp_offset(), RED_ZONE_SKIP);

        info.record_push(Reg::Rdi);
        assert_eq!(info.get_offset(Reg::Rdi), Some(0));

        info.record_push(Reg::Rbx);
        assert_eq!(info.get_offset(Reg::Rbx), Some(0));
        assert_eq!(info.get_offset(Reg::Rdi), Some(8));

        // A later stack-argument push shifts every slot by eight.
        info.adjust_rsp(8);
        assert_eq!(info.get_offset(Reg::Rbx), Some(8));
        assert_eq!(info.get_offset(Reg::Rdi), Some(16));
    }

    #[test]
    fn pop_is_lifo_with_rsp_last() {
        let mut info = CallInfo::new(false, true, false, 0);
        let layout = info.layout().to_vec();
        for reg in layout {
            info.record_push(reg);
        }
        assert_eq!(info.pop(), Some(Reg::Eflags));
        let mut last = None;
        while let Some(reg) = info.pop() {
            last = Some(reg);
        }
        assert_eq!(last, Some(Reg::Rsp));
    }

    #[test]
    fn state_layout_places_flags_lowest() {
        let mut info = CallInfo::new(false, true, false, 0);
        assert_eq!(info.layout().first(), Some(&Reg::Rsp));
        assert_eq!(info.layout().last(), Some(&Reg::Eflags));
        let layout = info.layout().to_vec();
        for reg in layout {
            info.record_push(reg);
        }
        // Last push lands on the stack top: the lowest address.
        assert_eq!(info.get_offset(Reg::Eflags), Some(0));
        assert_eq!(info.get_offset(Reg::Rsp), Some(16 * 8));
    }

    #[test]
    fn scratch_respects_exclusions_and_live_args() {
        let mut info = CallInfo::new(true, false, false, 2);
        let layout = info.layout().to_vec();
        for reg in layout {
            info.record_push(reg);
        }
        info.clobber(Reg::Rdi);
        info.use_reg(Reg::Rdi);

        let scratch = info.get_scratch(&[Reg::Rax]);
        assert_ne!(scratch, Reg::Rax);
        assert_ne!(scratch, Reg::Rdi);
        assert!(scratch.is_caller_save());
    }

    #[test]
    fn call_clobbers_caller_save_but_spares_conditional_flags() {
        let mut info = CallInfo::new(false, false, true, 0);
        info.use_reg(Reg::Rdi);
        info.call(true);
        assert!(info.is_clobbered(Reg::R11));
        assert!(!info.is_used(Reg::Rdi));
        assert!(!info.is_clobbered(Reg::Eflags));

        let mut info = CallInfo::new(false, false, false, 0);
        info.call(false);
        assert!(info.is_clobbered(Reg::Eflags));
    }

    mod props {
        use super::*;
        use quickcheck_macros::quickcheck;

        #[quickcheck]
        fn scratch_never_excluded_or_live(ex_mask: u16, used_mask: u16) -> bool {
            let mut info = CallInfo::new(false, false, false, 0);
            for (i, &r) in SCRATCH_ORDER.iter().enumerate() {
                if used_mask & (1 << i) != 0 {
                    info.use_reg(r);
                }
            }
            let exclude: Vec<Reg> = SCRATCH_ORDER
                .iter()
                .enumerate()
                .filter(|(i, _)| ex_mask & (1 << i) != 0)
                .map(|(_, &r)| r)
                .collect();
            let scratch = info.get_scratch(&exclude);
            if scratch == Reg::Invalid {
                return true;
            }
            scratch.is_caller_save() && !exclude.contains(&scratch) && !info.is_used(scratch)
        }

        #[quickcheck]
        fn push_pop_round_trip(picks: Vec<u8>) -> bool {
            const POOL: [Reg; 16] = [
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
                Reg::Eflags,
            ];
            let mut info = CallInfo::new(false, false, false, 0);
            let mut pushed = Vec::new();
            for &p in picks.iter().take(12) {
                let r = POOL[p as usize % POOL.len()];
                if info.is_saved(r) {
                    continue;
                }
                info.record_push(r);
                pushed.push(r);
            }
            // The k-th push sits 8 bytes per later push above the stack top.
            for (k, &r) in pushed.iter().enumerate() {
                if info.get_offset(r) != Some(8 * (pushed.len() - 1 - k) as i32) {
                    return false;
                }
            }
            while info.pop().is_some() {
                info.adjust_rsp(-8);
            }
            info.rsp_offset() == RED_ZONE_SKIP
        }
    }

    #[test]
    fn tmp_slots_descend() {
        let mut info = CallInfo::new(false, false, false, 0);
        assert_eq!(info.next_tmp_slot(), -8);
        assert_eq!(info.next_tmp_slot(), -16);
        info.reset_tmp_slots();
        assert_eq!(info.next_tmp_slot(), -8);
    }
}
