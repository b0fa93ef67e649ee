//! The decoded-instruction records handed in by the external disassembler.
//! These are plain data: the code generator never decodes bytes itself.

use crate::regs::Reg;

/// One decoded instruction of the target program.
#[derive(Clone, Debug)]
pub struct InstrInfo {
    /// Absolute virtual address of the instruction.
    pub address: u64,
    /// File offset of the instruction within the rewritten binary.
    pub offset: u64,
    /// Length of the instruction in bytes.
    pub size: u8,
    /// The raw instruction bytes.
    pub data: Vec<u8>,
    /// Disassembled source text, e.g. `mov 0x10(%rsp,%rbx,4),%rax`.
    pub text: String,
    pub mnemonic: Mnemonic,
    pub ops: Vec<OpInfo>,
}

impl InstrInfo {
    pub fn op(&self, idx: usize) -> Option<&OpInfo> {
        self.ops.get(idx)
    }

    /// Address of the next sequential instruction.
    pub fn next_address(&self) -> u64 {
        self.address + u64::from(self.size)
    }
}

/// One operand of a decoded instruction.
#[derive(Clone, Debug)]
pub struct OpInfo {
    pub kind: OpKind,
    /// Operand width in bytes (1, 2, 4 or 8).
    pub size: u8,
    pub access: Access,
}

#[derive(Clone, Debug)]
pub enum OpKind {
    Reg(Reg),
    Imm(i64),
    Mem(MemOp),
}

impl OpKind {
    /// Small integer code for the TYPE operand-field selector.
    pub fn code(&self) -> i32 {
        match self {
            OpKind::Reg(_) => 1,
            OpKind::Imm(_) => 2,
            OpKind::Mem(_) => 3,
        }
    }
}

/// A fully-decoded memory operand.
#[derive(Copy, Clone, Debug)]
pub struct MemOp {
    /// Segment override register (`Fs`, `Gs`) or `Invalid` for none.
    pub seg: Reg,
    /// Base register or `Invalid`.
    pub base: Reg,
    /// Index register or `Invalid`.
    pub index: Reg,
    /// Index scale: 1, 2, 4 or 8.
    pub scale: u8,
    /// Signed 32-bit displacement.
    pub disp: i32,
}

impl MemOp {
    pub fn absolute(disp: i32) -> MemOp {
        MemOp {
            seg: Reg::Invalid,
            base: Reg::Invalid,
            index: Reg::Invalid,
            scale: 1,
            disp,
        }
    }

    pub fn base_disp(base: Reg, disp: i32) -> MemOp {
        MemOp {
            seg: Reg::Invalid,
            base,
            index: Reg::Invalid,
            scale: 1,
            disp,
        }
    }
}

/// Operand access mask.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Access(pub u8);

impl Access {
    pub const NONE: Access = Access(0);
    pub const READ: Access = Access(1);
    pub const WRITE: Access = Access(2);
    pub const READ_WRITE: Access = Access(3);

    pub fn is_read(self) -> bool {
        self.0 & Access::READ.0 != 0
    }

    pub fn is_write(self) -> bool {
        self.0 & Access::WRITE.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Instruction mnemonic, with every control-transfer mnemonic
/// distinguished. Anything the generator has no special handling for
/// collapses into `Other`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Mnemonic {
    Jo,
    Jno,
    Jb,
    Jae,
    Je,
    Jne,
    Jbe,
    Ja,
    Js,
    Jns,
    Jp,
    Jnp,
    Jl,
    Jge,
    Jle,
    Jg,
    Jecxz,
    Jrcxz,
    Jmp,
    Call,
    Ret,
    Lea,
    Nop,
    Other,
}

impl Mnemonic {
    /// The short-form `Jcc rel8` opcode for a condition-code branch.
    /// `Jecxz`/`Jrcxz` share opcode 0xE3 (the former with a 0x67 prefix)
    /// and are handled separately because they test RCX, not the flags.
    pub fn jcc_opcode(self) -> Option<u8> {
        use Mnemonic::*;
        let op = match self {
            Jo => 0x70,
            Jno => 0x71,
            Jb => 0x72,
            Jae => 0x73,
            Je => 0x74,
            Jne => 0x75,
            Jbe => 0x76,
            Ja => 0x77,
            Js => 0x78,
            Jns => 0x79,
            Jp => 0x7a,
            Jnp => 0x7b,
            Jl => 0x7c,
            Jge => 0x7d,
            Jle => 0x7e,
            Jg => 0x7f,
            _ => return None,
        };
        Some(op)
    }

    pub fn is_conditional(self) -> bool {
        self.jcc_opcode().is_some() || matches!(self, Mnemonic::Jecxz | Mnemonic::Jrcxz)
    }

    pub fn is_branch(self) -> bool {
        self.is_conditional() || matches!(self, Mnemonic::Jmp | Mnemonic::Call | Mnemonic::Ret)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn jcc_opcodes_span_the_short_form_row() {
        assert_eq!(Mnemonic::Jo.jcc_opcode(), Some(0x70));
        assert_eq!(Mnemonic::Jne.jcc_opcode(), Some(0x75));
        assert_eq!(Mnemonic::Jg.jcc_opcode(), Some(0x7f));
        assert_eq!(Mnemonic::Jmp.jcc_opcode(), None);
        assert_eq!(Mnemonic::Jecxz.jcc_opcode(), None);
    }

    #[test]
    fn branch_classes() {
        assert!(Mnemonic::Jrcxz.is_conditional());
        assert!(Mnemonic::Ret.is_branch());
        assert!(!Mnemonic::Lea.is_branch());
    }

    #[test]
    fn access_mask() {
        assert!(Access::READ_WRITE.is_read());
        assert!(Access::READ_WRITE.is_write());
        assert!(!Access::READ.is_write());
        assert!(Access::NONE.is_empty());
    }
}
