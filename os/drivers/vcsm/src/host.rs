//! # Host Virtual-Memory Integration
//!
//! What the broker needs from the host's own virtual-memory subsystem. The
//! host owns page tables and address spaces; the broker only asks it to
//! install single frames, drop translations, and create kernel windows.

use crate::addresses::{PageFrame, PhysicalRange, VirtualAddress, VirtualRange};
use crate::session::ProcessId;
use bitfield_struct::bitfield;

/// Attributes the host applies to a region backed by remote memory.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct RegionFlags {
    /// Region maps device memory.
    pub io: bool,
    /// Pages must never be swapped out.
    pub reserved: bool,
    /// Pages are raw frames without backing page structures.
    pub pfn_map: bool,
    /// Not inherited by forked address spaces.
    pub dont_copy: bool,
    /// Region cannot be grown.
    pub dont_expand: bool,
    /// Host caching disabled.
    pub non_cached: bool,
    #[bits(26)]
    __: u32,
}

impl RegionFlags {
    /// Flags for a demand-resolved mapping of remote memory.
    #[must_use]
    pub const fn shared_memory(host_cached: bool) -> Self {
        Self::new()
            .with_io(true)
            .with_reserved(true)
            .with_pfn_map(true)
            .with_dont_copy(true)
            .with_dont_expand(true)
            .with_non_cached(!host_cached)
    }
}

/// Why a frame could not be installed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum InsertError {
    /// The access should simply be retried.
    #[error("retry")]
    Retry,
    #[error("out of memory")]
    OutOfMemory,
    #[error("no such region")]
    NoRegion,
}

/// Why a region could not be unmapped.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HostError {
    #[error("address space of {0} is gone")]
    NoAddressSpace(ProcessId),
    #[error("range is not mapped")]
    NotMapped,
}

/// Host virtual-memory operations used by the broker.
pub trait HostMemory {
    /// Installs one translation `address -> frame` in `pid`'s address space.
    ///
    /// # Errors
    /// See [`InsertError`].
    fn insert_frame(
        &self,
        pid: ProcessId,
        address: VirtualAddress,
        frame: PageFrame,
    ) -> Result<(), InsertError>;

    /// Drops all translations in `range`; the region itself stays.
    fn zap_range(&self, pid: ProcessId, range: VirtualRange);

    /// Removes the region from `pid`'s address space altogether.
    ///
    /// # Errors
    /// See [`HostError`].
    fn unmap_range(&self, pid: ProcessId, range: VirtualRange) -> Result<(), HostError>;

    /// Whether `address` currently has a translation.
    fn is_populated(&self, pid: ProcessId, address: VirtualAddress) -> bool;

    /// Maps physical memory into the kernel.
    fn map_kernel_window(&self, range: PhysicalRange, cached: bool) -> Option<VirtualAddress>;

    fn unmap_kernel_window(&self, address: VirtualAddress);
}
