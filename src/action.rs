//! User-declared transformations and their argument descriptions, as built
//! by the external match/config frontend.

use crate::elf::HostElf;
use crate::insn::MemOp;
use crate::regs::Reg;
use std::rc::Rc;

/// One transformation to apply at matching instructions. The code
/// generator only emits metadata for `Print` and `Call`; the pass-through
/// variants are resolved entirely by the patching frontend.
#[derive(Clone)]
pub enum Action {
    /// Leave the instruction as-is.
    Passthru,
    /// Replace the instruction with a trap.
    Trap,
    /// Print the disassembled instruction at runtime.
    Print,
    /// Call an instrumentation function around the instruction.
    Call(CallAction),
}

#[derive(Clone)]
pub struct CallAction {
    /// The instrumentation binary the target symbol lives in.
    pub elf: Rc<HostElf>,
    /// Name of the function to call.
    pub symbol: String,
    pub conv: CallConv,
    /// Save every caller-save register, not just the ones argument
    /// loading touches.
    pub clean: bool,
    pub args: Vec<Argument>,
}

/// When, relative to the displaced instruction, the call runs — and
/// whether its result gates execution.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CallConv {
    Before,
    After,
    Conditional,
    ConditionalJump,
}

impl CallConv {
    pub fn is_conditional(self) -> bool {
        matches!(self, CallConv::Conditional | CallConv::ConditionalJump)
    }
}

/// One value to load into an argument register.
#[derive(Clone, Debug)]
pub struct Argument {
    pub kind: ArgKind,
    /// Literal payload: the integer for `Integer`, the operand index for
    /// `Operand`, the CSV column for `User`.
    pub value: i64,
    /// Symbol name (`Symbol`) or match-engine basename (`User`).
    pub name: String,
    /// Pass by reference instead of by value.
    pub ptr: bool,
    /// Sub-component selector for operand arguments.
    pub field: FieldKind,
    /// The same data blob is emitted by another argument; skip the data
    /// section for this one.
    pub duplicate: bool,
    /// The decoded memory operand a `Memop` argument carries, with its
    /// access width.
    pub memop: Option<(MemOp, u8)>,
}

impl Argument {
    pub fn new(kind: ArgKind) -> Argument {
        Argument {
            kind,
            value: 0,
            name: String::new(),
            ptr: false,
            field: FieldKind::None,
            duplicate: false,
            memop: None,
        }
    }

    pub fn integer(value: i64) -> Argument {
        Argument {
            value,
            ..Argument::new(ArgKind::Integer)
        }
    }

    pub fn operand(sel: OpSelector, idx: i64) -> Argument {
        Argument {
            value: idx,
            ..Argument::new(ArgKind::Operand(sel))
        }
    }

    pub fn register(reg: Reg) -> Argument {
        Argument::new(ArgKind::Register(reg))
    }

    pub fn symbol(name: &str) -> Argument {
        Argument {
            name: name.to_string(),
            ..Argument::new(ArgKind::Symbol)
        }
    }

    pub fn by_ptr(mut self) -> Argument {
        self.ptr = true;
        self
    }

    pub fn with_field(mut self, field: FieldKind) -> Argument {
        self.field = field;
        self
    }
}

/// The abstract argument kinds the materialiser understands.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ArgKind {
    /// A value resolved through the external match engine's CSV row.
    User,
    /// The literal in `value`.
    Integer,
    /// A random constant baked in at instrumentation time.
    Random,
    /// File offset of the instruction.
    Offset,
    /// Runtime address of the instruction.
    Addr,
    /// Static (link-time) address of the instruction.
    StaticAddr,
    /// Runtime base address of the rewritten binary.
    Base,
    /// Runtime address of the trampoline itself.
    Trampoline,
    /// The caller-supplied action id.
    Id,
    /// Address of the next instruction the CPU will execute.
    Next,
    /// Pointer to the disassembled instruction text.
    Asm,
    /// Size of the instruction text including the NUL.
    AsmSize,
    /// Length of the instruction text.
    AsmLen,
    /// Pointer to the raw instruction bytes.
    Bytes,
    /// Number of raw instruction bytes.
    BytesSize,
    /// The control-transfer target of this instruction.
    Target,
    /// A concrete register's value (or a pointer to its saved slot).
    Register(Reg),
    /// Pointer to the whole saved-register block.
    State,
    /// Address of a symbol in the instrumentation binary.
    Symbol,
    /// A memory operand described by the frontend, not the instruction.
    Memop,
    /// An operand of the instruction, chosen by filter and index.
    Operand(OpSelector),
}

/// Which operands an `Operand` argument's index counts over.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum OpSelector {
    /// All operands.
    Any,
    /// Operands that are read.
    Src,
    /// Operands that are written.
    Dst,
    /// Immediate operands only.
    Imm,
    /// Register operands only.
    Reg,
    /// Memory operands only.
    Mem,
}

/// Sub-component of an operand to load instead of the operand itself.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FieldKind {
    None,
    Base,
    Index,
    Scale,
    Displ,
    Size,
    Type,
    Access,
}
