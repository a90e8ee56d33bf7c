//! # Control Records
//!
//! Request/response records. Fields named `handle` carry the broker-issued
//! user handle (GUID) unless stated otherwise; addresses are host virtual
//! addresses of the calling process.

use crate::RESOURCE_NAME_LEN;

/// [`Command::Allocate`](crate::Command::Allocate).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct AllocRecord {
    /// Size of one unit in bytes.
    pub size: u32,
    /// Number of units.
    pub num: u32,
    /// Raw [`CachePolicy`](crate::CachePolicy).
    pub cached: u32,
    /// NUL-padded resource name.
    pub name: [u8; RESOURCE_NAME_LEN],
    /// Out: the new handle.
    pub handle: u32,
}

impl AllocRecord {
    /// Creates a request, truncating `name` to the record width.
    #[must_use]
    pub fn new(size: u32, num: u32, cached: crate::CachePolicy, name: &str) -> Self {
        let mut record = Self {
            size,
            num,
            cached: cached.as_raw(),
            ..Self::default()
        };
        let len = name.len().min(RESOURCE_NAME_LEN);
        record.name[..len].copy_from_slice(&name.as_bytes()[..len]);
        record
    }

    /// The name up to the first NUL, if it is valid UTF-8.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(RESOURCE_NAME_LEN);
        core::str::from_utf8(&self.name[..end]).ok()
    }
}

/// [`Command::Share`](crate::Command::Share).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ShareRecord {
    /// In: handle to share. Out: handle of the alias.
    pub handle: u32,
    /// Out: size of the shared resource.
    pub size: u32,
}

/// [`Command::Lock`](crate::Command::Lock) and [`Command::Unlock`](crate::Command::Unlock).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct LockUnlockRecord {
    pub handle: u32,
    /// Out (lock only): user address of the resource, zero if unmapped.
    pub addr: u64,
}

/// [`Command::LockWithCache`](crate::Command::LockWithCache).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct LockCacheRecord {
    pub handle: u32,
    /// Raw [`CachePolicy`](crate::CachePolicy) to adopt.
    pub cached: u32,
}

/// [`Command::Resize`](crate::Command::Resize).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ResizeRecord {
    pub handle: u32,
    pub new_size: u32,
    /// Out: size before the resize.
    pub old_size: u32,
}

/// [`Command::Free`](crate::Command::Free).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct FreeRecord {
    pub handle: u32,
}

/// [`Command::SizeOfHandle`](crate::Command::SizeOfHandle).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct SizeRecord {
    pub handle: u32,
    /// Out: size in bytes, zero when the handle is unknown.
    pub size: u32,
}

/// [`Command::CheckHandle`](crate::Command::CheckHandle).
///
/// The output fields are filled only for host-cached resources.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct CheckRecord {
    pub handle: u32,
    pub size: u32,
    pub addr: u64,
    pub cache: u32,
}

/// The four address/handle lookups.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct MapRecord {
    /// Process the lookup is performed for.
    pub pid: u32,
    pub handle: u32,
    pub addr: u64,
    pub size: u32,
}

/// [`Command::Flush`](crate::Command::Flush) and [`Command::Invalidate`](crate::Command::Invalidate).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct CacheRecord {
    pub handle: u32,
    pub size: u32,
    /// Start of the range to maintain.
    pub addr: u64,
}

/// Per-process host walks.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct WalkRecord {
    pub pid: u32,
}
