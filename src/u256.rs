//! Unsigned 256-bit integers for target arithmetic.
//!
//! Share validation compares block-hash values against pool and network
//! targets, all of which are 256-bit quantities the standard library has no
//! type for. This newtype narrows the `ruint` crate down to exactly what the
//! pipeline performs: little-endian byte conversion (the order hashes carry
//! internally), left shifts for compact-target expansion, and division by
//! small scalars for difficulty targets. Nothing else in the crate touches
//! the backing library.

use ruint::aliases::U256 as Inner;
use std::ops::{Div, Shl};

/// A 256-bit unsigned integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct U256(Inner);

impl U256 {
    /// Zero.
    pub const ZERO: Self = Self(Inner::ZERO);

    /// 2^256 - 1, the target every hash meets.
    pub const MAX: Self = Self(Inner::MAX);

    pub fn from_u64(value: u64) -> Self {
        Self(Inner::from(value))
    }

    /// Interpret 32 bytes as a little-endian integer. Hash digests feed in
    /// here directly, without reordering.
    pub fn from_le_bytes(bytes: [u8; 32]) -> Self {
        Self(Inner::from_le_bytes(bytes))
    }

    pub fn to_le_bytes(self) -> [u8; 32] {
        self.0.to_le_bytes()
    }

    /// Shift left, or `None` when a set bit would fall off the top. Compact
    /// target expansion relies on this to detect out-of-range exponents.
    pub fn checked_shl(self, bits: usize) -> Option<Self> {
        self.0.checked_shl(bits).map(Self)
    }
}

impl Shl<usize> for U256 {
    type Output = Self;

    fn shl(self, bits: usize) -> Self::Output {
        Self(self.0 << bits)
    }
}

/// Scalar division, as difficulty-to-target uses. A full `U256 / U256` is
/// never needed; the divisor always fits a machine word.
impl Div<u64> for U256 {
    type Output = Self;

    fn div(self, divisor: u64) -> Self::Output {
        Self(self.0 / Self::from_u64(divisor).0)
    }
}
