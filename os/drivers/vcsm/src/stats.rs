//! # Operation Statistics
//!
//! Every resource counts attempts and failures per operation. When a resource
//! dies its counters are folded into one of two global buckets depending on
//! whether it ended naturally (explicit free) or was torn down forcibly.

use core::fmt;

/// Operation a counter belongs to.
#[repr(usize)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum StatKind {
    Alloc,
    Free,
    Lock,
    Unlock,
    Map,
    Flush,
    Invalidate,
}

impl StatKind {
    pub const ALL: [Self; 7] = [
        Self::Alloc,
        Self::Free,
        Self::Lock,
        Self::Unlock,
        Self::Map,
        Self::Flush,
        Self::Invalidate,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Alloc => "Alloc",
            Self::Free => "Free",
            Self::Lock => "Lock",
            Self::Unlock => "Unlock",
            Self::Map => "Map",
            Self::Flush => "Flush",
            Self::Invalidate => "Invalidate",
        }
    }
}

/// Attempt and failure counters, one pair per [`StatKind`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct OpStats {
    attempts: [u32; 7],
    failures: [u32; 7],
}

impl OpStats {
    #[inline]
    pub const fn record(&mut self, kind: StatKind) {
        self.attempts[kind as usize] = self.attempts[kind as usize].wrapping_add(1);
    }

    #[inline]
    pub const fn record_failure(&mut self, kind: StatKind) {
        self.failures[kind as usize] = self.failures[kind as usize].wrapping_add(1);
    }

    #[inline]
    #[must_use]
    pub const fn attempts(&self, kind: StatKind) -> u32 {
        self.attempts[kind as usize]
    }

    #[inline]
    #[must_use]
    pub const fn failures(&self, kind: StatKind) -> u32 {
        self.failures[kind as usize]
    }

    /// Adds all counters of `other` to `self`.
    pub fn absorb(&mut self, other: &Self) {
        for kind in StatKind::ALL {
            let i = kind as usize;
            self.attempts[i] = self.attempts[i].wrapping_add(other.attempts[i]);
            self.failures[i] = self.failures[i].wrapping_add(other.failures[i]);
        }
    }
}

impl fmt::Display for OpStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for kind in StatKind::ALL {
            writeln!(
                f,
                "  {:<10} {:>8} attempts {:>8} failures",
                kind.name(),
                self.attempts(kind),
                self.failures(kind)
            )?;
        }
        Ok(())
    }
}

/// Counters of resources that are gone.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LifecycleStats {
    /// Resources freed by their owner.
    pub natural: u32,
    /// Resources torn down by session teardown or failed setup.
    pub forced: u32,
    pub natural_ops: OpStats,
    pub forced_ops: OpStats,
}

impl LifecycleStats {
    pub fn record(&mut self, ops: &OpStats, forced: bool) {
        if forced {
            self.forced = self.forced.wrapping_add(1);
            self.forced_ops.absorb(ops);
        } else {
            self.natural = self.natural.wrapping_add(1);
            self.natural_ops.absorb(ops);
        }
    }
}

impl fmt::Display for LifecycleStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "natural terminations: {}", self.natural)?;
        write!(f, "{}", self.natural_ops)?;
        writeln!(f, "forced terminations: {}", self.forced)?;
        write!(f, "{}", self.forced_ops)
    }
}
