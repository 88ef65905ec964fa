//! Pipe flag bits.
//!
//! The 32-bit layout keeps the 16-bit target-pipe id in the low half and
//! the property bits above it:
//!
//! ```text
//! rrrrrrrr rrrDsapd tttttttt tttttttt
//! D = disabled, s = shadow, a = async write, p = persist,
//! d = direction (set = output), t = target pipe id, r = reserved
//! ```

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::pipe::PipeId;

/// Flag bits carried by every pipe endpoint.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PipeFlags(u32);

impl PipeFlags {
    /// The read end of an edge. This is the all-zero default.
    pub const INPUT: PipeFlags = PipeFlags(0);
    /// The write end of an edge.
    pub const OUTPUT: PipeFlags = PipeFlags(0x1_0000);
    /// Suggests (never requires) that the module keep the underlying
    /// resource alive across requests. Modules that cannot honour it
    /// ignore it silently.
    pub const PERSIST: PipeFlags = PipeFlags(0x2_0000);
    /// Output writes go through the module's asynchronous write loop.
    pub const ASYNC: PipeFlags = PipeFlags(0x4_0000);
    /// The pipe is a shadow: a second read view of another output edge,
    /// carrying no independent bytes. The target bits name the mirrored
    /// slot.
    pub const SHADOW: PipeFlags = PipeFlags(0x8_0000);
    /// Only meaningful on shadows: the downstream is cancelled by default
    /// unless this bit is cleared before the producing task completes.
    pub const DISABLED: PipeFlags = PipeFlags(0x10_0000);

    const TARGET_MASK: u32 = 0xffff;
    /// The bits shared across companion endpoints of the same edge.
    const SHARED_MASK: u32 = Self::PERSIST.0;

    /// Flags with just the given target id.
    pub fn with_target(self, target: PipeId) -> PipeFlags {
        PipeFlags((self.0 & !Self::TARGET_MASK) | u32::from(target))
    }

    /// The 16-bit target-pipe id.
    pub fn target(self) -> PipeId {
        (self.0 & Self::TARGET_MASK) as PipeId
    }

    /// Whether every bit of `other` is set in `self`.
    pub fn contains(self, other: PipeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the given bits.
    pub fn insert(&mut self, other: PipeFlags) {
        self.0 |= other.0 & !Self::TARGET_MASK;
    }

    /// Clear the given bits.
    pub fn remove(&mut self, other: PipeFlags) {
        self.0 &= !(other.0 & !Self::TARGET_MASK);
    }

    /// Whether this is a read end.
    pub fn is_input(self) -> bool {
        !self.is_output()
    }

    /// Whether this is a write end.
    pub fn is_output(self) -> bool {
        self.contains(Self::OUTPUT)
    }

    /// Whether the persist hint is set.
    pub fn is_persist(self) -> bool {
        self.contains(Self::PERSIST)
    }

    /// Whether this is a shadow view.
    pub fn is_shadow(self) -> bool {
        self.contains(Self::SHADOW)
    }

    /// Whether the shadow is currently disabled.
    pub fn is_disabled(self) -> bool {
        self.contains(Self::DISABLED)
    }

    /// The subset of flags copied to companion endpoints of the same edge.
    pub fn shared(self) -> PipeFlags {
        PipeFlags(self.0 & Self::SHARED_MASK)
    }

    /// The raw bit pattern.
    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for PipeFlags {
    type Output = PipeFlags;

    fn bitor(self, rhs: PipeFlags) -> PipeFlags {
        PipeFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for PipeFlags {
    fn bitor_assign(&mut self, rhs: PipeFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for PipeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        parts.push(if self.is_output() { "OUTPUT" } else { "INPUT" });
        if self.is_persist() {
            parts.push("PERSIST");
        }
        if self.contains(Self::ASYNC) {
            parts.push("ASYNC");
        }
        if self.is_shadow() {
            parts.push("SHADOW");
        }
        if self.is_disabled() {
            parts.push("DISABLED");
        }
        write!(f, "PipeFlags({}, target={})", parts.join("|"), self.target())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_checks() {
        assert!(PipeFlags::INPUT.is_input());
        assert!(!PipeFlags::INPUT.is_output());
        assert!(PipeFlags::OUTPUT.is_output());
        assert!(!PipeFlags::OUTPUT.is_input());
    }

    #[test]
    fn shared_flags_keep_only_persist() {
        let all = PipeFlags::OUTPUT
            | PipeFlags::PERSIST
            | PipeFlags::SHADOW
            | PipeFlags::DISABLED;
        let shared = all.shared();
        assert!(shared.is_persist());
        assert!(!shared.is_output());
        assert!(!shared.is_shadow());
        assert!(!shared.is_disabled());
    }

    #[test]
    fn target_is_preserved_by_bit_ops() {
        let mut f = PipeFlags::OUTPUT.with_target(42);
        f.insert(PipeFlags::DISABLED);
        f.remove(PipeFlags::DISABLED);
        assert_eq!(f.target(), 42);
        assert!(f.is_output());
    }
}
