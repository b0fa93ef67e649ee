//! Instrumentation code generation for an x86-64 ELF binary rewriter.
//!
//! Given one decoded instruction and one user action ("call function F
//! with these arguments, before/after/conditionally around this
//! instruction"), this crate emits the trampoline fragments the rewriter
//! patches into the binary: argument-loading code that materialises
//! abstract values (operands, effective addresses, branch targets, the
//! flags) into the right calling-convention registers, the register
//! save/restore choreography around the call, and the labelled data
//! blobs the arguments reference.
//!
//! Disassembly, ELF patching, match-expression evaluation and trampoline
//! linking are external collaborators; their records come in through
//! [`insn`], [`action`], [`elf`] and [`matcher`].

pub mod action;
pub mod codegen;
pub mod elf;
pub mod insn;
pub mod matcher;
pub mod regs;
pub mod ty;

mod util;

pub use codegen::{build_metadata, Metadata};
