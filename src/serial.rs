//! Serial arithmetic for 32-bit sequence numbers
//!
//! CmdSN, ExpCmdSN, StatSN and the target transfer tags all live in a
//! 32-bit space that wraps. Comparison follows the serial number
//! arithmetic of RFC 1982 as applied by RFC 3720: `a` precedes `b`
//! iff `(b - a) mod 2^32 < 2^31` and the values differ.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

/// The reserved tag value, never issued by [`SerialNumber::advance`] or
/// [`TransferTagGenerator::next_tag`].
pub const RESERVED_TAG: u32 = 0xFFFF_FFFF;

/// Compare two sequence numbers under wraparound.
///
/// Values exactly 2^31 apart have no defined order in RFC 1982; the
/// tie is broken on the raw values so the comparison stays total and
/// anti-symmetric. Normal operation never reaches that region because
/// counters advance by small increments.
pub fn compare(a: u32, b: u32) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    let diff = b.wrapping_sub(a);
    if diff < 0x8000_0000 {
        Ordering::Less
    } else if diff == 0x8000_0000 {
        a.cmp(&b)
    } else {
        Ordering::Greater
    }
}

/// A wraparound-safe 32-bit sequence counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialNumber(u32);

impl SerialNumber {
    pub fn new(value: u32) -> Self {
        SerialNumber(value)
    }

    /// The counter's current value, i.e. the next value [`advance`]
    /// will hand out.
    ///
    /// [`advance`]: SerialNumber::advance
    pub fn current(&self) -> u32 {
        self.0
    }

    /// Returns the next value and increments internally, skipping the
    /// reserved value `0xFFFFFFFF`.
    pub fn advance(&mut self) -> u32 {
        if self.0 == RESERVED_TAG {
            self.0 = 0;
        }
        let value = self.0;
        self.0 = self.0.wrapping_add(1);
        value
    }

    /// `true` iff this counter's value precedes `other` under
    /// wraparound comparison.
    pub fn is_before(&self, other: u32) -> bool {
        compare(self.0, other) == Ordering::Less
    }

    /// `true` iff this counter's value succeeds `other` under
    /// wraparound comparison.
    pub fn is_after(&self, other: u32) -> bool {
        compare(self.0, other) == Ordering::Greater
    }
}

/// Server-wide source of Target Transfer Tag values.
///
/// One instance is created per server and shared by all connections;
/// tags increase monotonically across the whole process lifetime and
/// never take the reserved value.
#[derive(Debug)]
pub struct TransferTagGenerator {
    next: AtomicU32,
}

impl TransferTagGenerator {
    pub fn new() -> Self {
        TransferTagGenerator { next: AtomicU32::new(0) }
    }

    /// Gets and increments the tag to use in the next unreserved
    /// `Target Transfer Tag` field.
    pub fn next_tag(&self) -> u32 {
        loop {
            let tag = self.next.fetch_add(1, AtomicOrdering::Relaxed);
            if tag != RESERVED_TAG {
                return tag;
            }
        }
    }
}

impl Default for TransferTagGenerator {
    fn default() -> Self {
        Self::new()
    }
}
