//! Queue-wide control flags
//!
//! A small copyable bit-set shared by every participant of a queue.
//! Callers request a halt or abort; the engine owns the `PAUSED`
//! acknowledgment and raises `FINISHED` once all producers have retired
//! and the queue has drained.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Control flag bit-set
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ControlFlags(u8);

impl ControlFlags {
    /// No flags set
    pub const NONE: Self = Self(0);

    /// Pause requested; workers stop at their next check
    pub const HALT: Self = Self(1 << 0);

    /// Acknowledgment: every active worker is paused
    pub const PAUSED: Self = Self(1 << 1);

    /// Hard cancellation requested
    pub const ABORT: Self = Self(1 << 2);

    /// All producers exhausted and the queue drained
    pub const FINISHED: Self = Self(1 << 3);

    /// Flags after which no normal production or consumption happens
    pub const TERMINAL: Self = Self(Self::ABORT.0 | Self::FINISHED.0);

    /// Flags a caller is allowed to set or clear
    pub const CALLER_MASK: Self = Self(Self::HALT.0 | Self::ABORT.0 | Self::FINISHED.0);

    const NAMES: [(Self, &'static str); 4] = [
        (Self::HALT, "HALT"),
        (Self::PAUSED, "PAUSED"),
        (Self::ABORT, "ABORT"),
        (Self::FINISHED, "FINISHED"),
    ];

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any bit of `other` is set
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub const fn is_terminal(self) -> bool {
        self.intersects(Self::TERMINAL)
    }

    /// Halt is only honoured while the queue is not finished
    pub const fn is_halted(self) -> bool {
        self.contains(Self::HALT) && !self.contains(Self::FINISHED)
    }
}

impl BitOr for ControlFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for ControlFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.insert(rhs);
    }
}

impl BitAnd for ControlFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Display for ControlFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ControlFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ControlFlags({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove() {
        let mut flags = ControlFlags::NONE;
        flags.insert(ControlFlags::HALT);
        flags |= ControlFlags::ABORT;
        assert!(flags.contains(ControlFlags::HALT | ControlFlags::ABORT));
        assert!(flags.is_terminal());

        flags.remove(ControlFlags::ABORT);
        assert_eq!(flags, ControlFlags::HALT);
        assert!(!flags.is_terminal());
    }

    #[test]
    fn test_halt_ignored_once_finished() {
        let flags = ControlFlags::HALT | ControlFlags::FINISHED;
        assert!(!flags.is_halted());
        assert!(ControlFlags::HALT.is_halted());
    }

    #[test]
    fn test_display() {
        assert_eq!(ControlFlags::NONE.to_string(), "NONE");
        assert_eq!(
            (ControlFlags::HALT | ControlFlags::PAUSED).to_string(),
            "HALT|PAUSED"
        );
        assert_eq!(
            format!("{:?}", ControlFlags::FINISHED),
            "ControlFlags(FINISHED)"
        );
    }
}
