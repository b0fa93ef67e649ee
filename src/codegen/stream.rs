//! The assembler-token writer. Everything the generator emits goes
//! through this type: decimal bytes, sized-integer escapes the trampoline
//! linker resolves, label definitions and raw strings, all
//! comma-separated inside one bounded buffer.

use crate::util::json_escape;
use anyhow::bail;

/// Default capacity of the fragment buffer. One action's fragments are
/// tiny; hitting this means something is badly wrong upstream.
const DEFAULT_LIMIT: usize = 1 << 16;

/// A branch-relative token target: either a literal absolute address or
/// a named label the linker resolves.
#[derive(Clone, Debug)]
pub enum RelTarget<'a> {
    Abs(i64),
    Label(&'a str),
}

impl<'a> From<i64> for RelTarget<'a> {
    fn from(v: i64) -> RelTarget<'a> {
        RelTarget::Abs(v)
    }
}

impl<'a> From<&'a str> for RelTarget<'a> {
    fn from(l: &'a str) -> RelTarget<'a> {
        RelTarget::Label(l)
    }
}

/// The bounded output buffer for one action's emission. Fragments are
/// sliced out of it with [`Stream::take`] as the metadata assembler
/// finishes each section.
pub struct Stream {
    buf: String,
    limit: usize,
    /// Start of the fragment currently being written.
    cut: usize,
}

impl Stream {
    pub fn new() -> Stream {
        Stream::with_limit(DEFAULT_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Stream {
        Stream {
            buf: String::new(),
            limit,
            cut: 0,
        }
    }

    fn push(&mut self, token: &str) -> anyhow::Result<()> {
        let sep = if self.buf.len() > self.cut { 1 } else { 0 };
        if self.buf.len() + sep + token.len() > self.limit {
            bail!("trampoline output buffer exhausted ({} bytes)", self.limit);
        }
        if sep == 1 {
            self.buf.push(',');
        }
        self.buf.push_str(token);
        Ok(())
    }

    pub fn byte(&mut self, b: u8) -> anyhow::Result<()> {
        self.push(&b.to_string())
    }

    pub fn bytes(&mut self, bs: &[u8]) -> anyhow::Result<()> {
        for &b in bs {
            self.byte(b)?;
        }
        Ok(())
    }

    pub fn int8(&mut self, v: i8) -> anyhow::Result<()> {
        self.push(&format!("{{\"int8\":{}}}", v))
    }

    pub fn int16(&mut self, v: i16) -> anyhow::Result<()> {
        self.push(&format!("{{\"int16\":{}}}", v))
    }

    pub fn int32(&mut self, v: i32) -> anyhow::Result<()> {
        self.push(&format!("{{\"int32\":{}}}", v))
    }

    pub fn int64(&mut self, v: i64) -> anyhow::Result<()> {
        self.push(&format!("{{\"int64\":{}}}", v))
    }

    pub fn rel8<'a, T: Into<RelTarget<'a>>>(&mut self, target: T) -> anyhow::Result<()> {
        match target.into() {
            RelTarget::Abs(v) => self.push(&format!("{{\"rel8\":{}}}", v)),
            RelTarget::Label(l) => self.push(&format!("{{\"rel8\":\"{}\"}}", json_escape(l))),
        }
    }

    pub fn rel32<'a, T: Into<RelTarget<'a>>>(&mut self, target: T) -> anyhow::Result<()> {
        match target.into() {
            RelTarget::Abs(v) => self.push(&format!("{{\"rel32\":{}}}", v)),
            RelTarget::Label(l) => self.push(&format!("{{\"rel32\":\"{}\"}}", json_escape(l))),
        }
    }

    /// Defines a label at the current position.
    pub fn label(&mut self, name: &str) -> anyhow::Result<()> {
        self.push(&format!("\"{}\"", json_escape(name)))
    }

    pub fn string(&mut self, s: &str) -> anyhow::Result<()> {
        self.push(&format!("{{\"string\":\"{}\"}}", json_escape(s)))
    }

    /// Slices out everything emitted since the previous `take` as one
    /// named fragment's body.
    pub fn take(&mut self) -> String {
        let fragment = self.buf[self.cut..].to_string();
        self.cut = self.buf.len();
        fragment
    }
}

impl Default for Stream {
    fn default() -> Stream {
        Stream::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn token_grammar() {
        let mut s = Stream::new();
        s.byte(0x48).unwrap();
        s.byte(0x8d).unwrap();
        s.rel32(".Lcontinue").unwrap();
        s.int32(-1).unwrap();
        s.label(".LtakenRdi").unwrap();
        assert_eq!(
            s.take(),
            "72,141,{\"rel32\":\".Lcontinue\"},{\"int32\":-1},\".LtakenRdi\""
        );
    }

    #[test]
    fn fragments_do_not_leak_commas() {
        let mut s = Stream::new();
        s.byte(1).unwrap();
        assert_eq!(s.take(), "1");
        s.byte(2).unwrap();
        s.byte(3).unwrap();
        assert_eq!(s.take(), "2,3");
        assert_eq!(s.take(), "");
    }

    #[test]
    fn exhaustion_is_an_error() {
        let mut s = Stream::with_limit(4);
        s.byte(255).unwrap();
        assert!(s.byte(255).is_err());
    }

    #[test]
    fn rel_targets() {
        let mut s = Stream::new();
        s.rel8(".LnextRdi").unwrap();
        s.rel32(0x1016).unwrap();
        assert_eq!(s.take(), "{\"rel8\":\".LnextRdi\"},{\"rel32\":4118}");
    }
}
