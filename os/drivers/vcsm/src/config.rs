//! # Broker Configuration

use crate::addresses::{BUS_ALIAS_MASK, PAGE_SIZE, PhysicalAddress};
use crate::error::SmError;

/// Alignment requested from the remote allocator, in bytes.
pub const ALLOC_ALIGNMENT: u32 = 4096;

/// Name given to allocations that arrive without one.
pub const DEFAULT_RESOURCE_NAME: &str = "sm-host-resource";

/// Number of distinct GUIDs before the counter wraps.
///
/// GUIDs are the counter shifted by the page shift, so they must stay
/// representable as 32-bit page offsets.
pub const GUID_COUNTER_LIMIT: u32 = 1 << 20;

const _: () = {
    assert!(ALLOC_ALIGNMENT as u64 == PAGE_SIZE);
    assert!(DEFAULT_RESOURCE_NAME.len() <= vcsm_abi::RESOURCE_NAME_LEN);
    assert!(BUS_ALIAS_MASK.count_ones() == 30);
    assert!((GUID_COUNTER_LIMIT as u64) * PAGE_SIZE <= 1 << 32);
};

/// Verbosity of per-operation diagnostics.
///
/// This sits on top of the `log` level filter: a message is only emitted if
/// both allow it.
#[repr(u8)]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum DebugLevel {
    #[default]
    Disabled = 0,
    Min = 1,
    Intermediate = 2,
    Max = 3,
}

impl DebugLevel {
    #[inline]
    #[must_use]
    pub const fn from_bits(v: u8) -> Self {
        match v {
            0 => Self::Disabled,
            1 => Self::Min,
            2 => Self::Intermediate,
            _ => Self::Max,
        }
    }

    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u32> for DebugLevel {
    type Error = SmError;

    #[allow(clippy::cast_possible_truncation)]
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0..=3 => Ok(Self::from_bits(value as u8)),
            _ => Err(SmError::InvalidArgument("debug level above maximum")),
        }
    }
}

/// Runtime configuration handed to [`SharedMemory::connect`](crate::SharedMemory::connect).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SmConfig {
    /// Host physical address at which the remote memory window begins.
    pub window_base: PhysicalAddress,
    /// Initial diagnostics verbosity.
    pub debug_level: DebugLevel,
}

impl SmConfig {
    #[must_use]
    pub const fn new(window_base: PhysicalAddress) -> Self {
        Self {
            window_base,
            debug_level: DebugLevel::Disabled,
        }
    }

    #[must_use]
    pub const fn with_debug_level(mut self, level: DebugLevel) -> Self {
        self.debug_level = level;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_level_rejects_out_of_range() {
        assert_eq!(DebugLevel::try_from(2).ok(), Some(DebugLevel::Intermediate));
        assert!(matches!(
            DebugLevel::try_from(4),
            Err(SmError::InvalidArgument(_))
        ));
    }

    #[test]
    fn levels_are_ordered() {
        assert!(DebugLevel::Max > DebugLevel::Min);
        assert_eq!(DebugLevel::from_bits(DebugLevel::Max.into_bits()), DebugLevel::Max);
    }
}
