//! 32-bit sequence numbers with modular ordering.
//!
//! TCP sequence numbers live on a ring of 2³² values. Two sequence numbers
//! compare by the sign of their wrapping difference: `a < b` holds when
//! `(a - b) as i32` is negative, which makes the comparison meaningful for
//! any two values less than 2³¹ apart — exactly the guarantee the window
//! rules provide. The field is private so that no caller can fall back to a
//! plain `u32` comparison, which would be wrong near the wrap point.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// A TCP sequence number.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Seq(u32);

impl Seq {
    pub const ZERO: Seq = Seq(0);

    pub const fn new(number: u32) -> Self {
        Seq(number)
    }

    /// The raw 32-bit value. Only for display, wire encoding, and hashing;
    /// never compare the results directly.
    pub const fn number(self) -> u32 {
        self.0
    }

    /// The smaller of two sequence numbers under modular ordering.
    pub fn min(self, other: Seq) -> Seq {
        if self < other {
            self
        } else {
            other
        }
    }

    /// The larger of two sequence numbers under modular ordering.
    pub fn max(self, other: Seq) -> Seq {
        if self > other {
            self
        } else {
            other
        }
    }
}

impl From<u32> for Seq {
    fn from(number: u32) -> Self {
        Seq(number)
    }
}

impl Add<u32> for Seq {
    type Output = Seq;

    fn add(self, rhs: u32) -> Seq {
        Seq(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u32> for Seq {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<u32> for Seq {
    type Output = Seq;

    fn sub(self, rhs: u32) -> Seq {
        Seq(self.0.wrapping_sub(rhs))
    }
}

/// The distance from `rhs` forward to `self` on the ring.
impl Sub<Seq> for Seq {
    type Output = u32;

    fn sub(self, rhs: Seq) -> u32 {
        self.0.wrapping_sub(rhs.0)
    }
}

// Modular ordering is not transitive over the full ring, so `Ord` is
// deliberately not implemented; `PartialOrd` matches the RFC 793 window
// comparisons for values within 2³¹ of each other.
impl PartialOrd for Seq {
    fn partial_cmp(&self, other: &Seq) -> Option<Ordering> {
        Some((self.0.wrapping_sub(other.0) as i32).cmp(&0))
    }
}

impl fmt::Debug for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_modular() {
        assert!(Seq::new(10) < Seq::new(20));
        assert!(Seq::new(20) > Seq::new(10));
        assert!(Seq::new(2_000_000_000) < Seq::new(3_000_000_000));
        assert!(Seq::new(3_000_000_000) < Seq::new(4_000_000_000));

        // across the wrap point
        assert!(Seq::new(u32::MAX - 5) < Seq::new(5));
        assert!(Seq::new(5) > Seq::new(u32::MAX - 5));

        assert!(Seq::new(5) <= Seq::new(5));
        assert!(!(Seq::new(5) < Seq::new(5)));
        assert!(Seq::new(5) >= Seq::new(5));
    }

    #[test]
    fn arithmetic_wraps() {
        assert_eq!(Seq::new(u32::MAX) + 1, Seq::new(0));
        assert_eq!(Seq::new(3) - 5, Seq::new(u32::MAX - 1));
        assert_eq!(Seq::new(3) - Seq::new(u32::MAX - 1), 5);
        assert_eq!(Seq::new(100) - Seq::new(100), 0);

        let mut seq = Seq::new(u32::MAX - 1);
        seq += 3;
        assert_eq!(seq, Seq::new(1));
    }

    #[test]
    fn min_max_respect_the_ring() {
        assert_eq!(Seq::new(u32::MAX - 5).min(Seq::new(5)), Seq::new(u32::MAX - 5));
        assert_eq!(Seq::new(u32::MAX - 5).max(Seq::new(5)), Seq::new(5));
    }
}
