//! The seam to the external match-expression engine. `User` arguments are
//! resolved against the CSV row the engine matched for the instruction.

use crate::insn::InstrInfo;

/// One matched CSV row.
#[derive(Clone, Debug, Default)]
pub struct MatchRecord {
    pub fields: Vec<String>,
}

/// Implemented by the external match engine. The generator hands it the
/// basename a `User` argument names and the instruction being
/// instrumented; the engine re-evaluates its match expression and returns
/// the row that matched, if any.
///
/// An `Err` from the engine (e.g. an ambiguous match) is fatal to the
/// emission; `Ok(None)` merely degrades the argument to null.
pub trait Matcher {
    fn lookup(&self, basename: &str, instr: &InstrInfo) -> anyhow::Result<Option<MatchRecord>>;
}
