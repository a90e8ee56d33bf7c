//! # Shared Memory Control ABI
//!
//! Fixed-layout records exchanged between consumers and the shared-memory
//! broker, the command word that selects them, and the status codes the
//! broker answers with.
//!
//! Everything in here is `#[repr(C)]` or `#[repr(u32)]`/`#[repr(i32)]` so the
//! same definitions can be used on both sides of a system-call boundary.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod command;
mod records;

pub use command::{Command, Direction, IoctlCommand, VCSM_MAGIC};
pub use records::*;

use core::fmt;

/// Fixed width of the resource name carried in an allocation request.
pub const RESOURCE_NAME_LEN: usize = 32;

/// Caching behavior requested for a resource.
///
/// The two low bits are independent: bit 0 enables caching on the host side,
/// bit 1 on the remote side.
#[repr(u32)]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CachePolicy {
    /// Uncached on both sides.
    #[default]
    None = 0,
    /// Cached by the host only.
    Host = 1,
    /// Cached by the remote side only.
    Remote = 2,
    /// Cached on both sides.
    Both = 3,
}

impl CachePolicy {
    /// Whether either side caches the resource.
    #[inline]
    #[must_use]
    pub const fn is_cached(self) -> bool {
        !matches!(self, Self::None)
    }

    /// Whether host-side cache maintenance is needed for this resource.
    #[inline]
    #[must_use]
    pub const fn host_cached(self) -> bool {
        matches!(self, Self::Host | Self::Both)
    }

    /// Whether the remote allocator should back this resource with cached memory.
    #[inline]
    #[must_use]
    pub const fn remote_cached(self) -> bool {
        matches!(self, Self::Remote | Self::Both)
    }

    /// Decodes a raw policy value as found in the control records.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Host),
            2 => Some(Self::Remote),
            3 => Some(Self::Both),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "(null)",
            Self::Host => "host",
            Self::Remote => "remote",
            Self::Both => "host+remote",
        })
    }
}

/// Result code of a control request.
///
/// Values follow the usual negative errno convention.
#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Status {
    Ok = 0,
    PermissionDenied = -1,
    NotFound = -2,
    Interrupted = -4,
    RemoteFailure = -5,
    OutOfMemory = -12,
    BusFault = -14,
    InvalidArgument = -22,
}

impl Status {
    #[inline]
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self as i32
    }

    #[inline]
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}
