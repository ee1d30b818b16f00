use std::fmt::{Display, Formatter};

/// Wire sequence number with wrap-around semantics.
///
/// The 32-bit sequence space is cyclic: all ordering checks go through the
/// modular comparisons below, so a conversation survives the wrap from
/// `0xFFFF_FFFF` back to `0`. A number is 'before' another iff the modular
/// distance between them, interpreted as a signed offset, is negative.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SeqNo(u32);

impl Display for SeqNo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNo {
    pub fn from_raw(value: u32) -> Self {
        SeqNo(value)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn next(self) -> SeqNo {
        SeqNo(self.0.wrapping_add(1))
    }

    pub fn minus(self, offset: u32) -> SeqNo {
        SeqNo(self.0.wrapping_sub(offset))
    }

    /// Modular `<`.
    pub fn is_before(self, other: SeqNo) -> bool {
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    /// Modular `>=`.
    pub fn is_at_or_after(self, other: SeqNo) -> bool {
        !self.is_before(other)
    }
}
