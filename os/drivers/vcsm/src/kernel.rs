//! # Kernel Client
//!
//! In-process access for other kernel components. Everything runs in the
//! kernel's own session with kernel ownership, so no permission checks apply.

use crate::addresses::{BusAddress, VirtualAddress};
use crate::cache::CacheMaintenance;
use crate::coordinator::{LockOptions, UnlockOptions};
use crate::error::SmError;
use crate::host::HostMemory;
use crate::lifecycle::AllocSpec;
use crate::registry::Guid;
use crate::remote::{RemoteHandle, RemoteMemoryService};
use crate::session::ProcessId;
use crate::{CachePolicy, SharedMemory};

/// How the kernel wants to access locked memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LockMode {
    Cached,
    Uncached,
}

impl LockMode {
    const fn policy(self) -> CachePolicy {
        match self {
            Self::Cached => CachePolicy::Host,
            Self::Uncached => CachePolicy::None,
        }
    }
}

pub struct KernelClient<'a, R, H, C> {
    sm: &'a SharedMemory<R, H, C>,
}

impl<R, H, C> SharedMemory<R, H, C>
where
    R: RemoteMemoryService,
    H: HostMemory,
    C: CacheMaintenance,
{
    /// Access for in-kernel consumers.
    pub const fn kernel(&self) -> KernelClient<'_, R, H, C> {
        KernelClient { sm: self }
    }
}

impl<R, H, C> KernelClient<'_, R, H, C>
where
    R: RemoteMemoryService,
    H: HostMemory,
    C: CacheMaintenance,
{
    /// # Errors
    /// See [`SharedMemory::allocate`].
    pub fn alloc(&self, params: AllocSpec<'_>) -> Result<Guid, SmError> {
        self.sm.allocate(&self.sm.kernel, ProcessId::KERNEL, params)
    }

    /// The remote handle behind a kernel-owned GUID.
    #[must_use]
    pub fn remote_handle(&self, guid: Guid) -> Option<RemoteHandle> {
        self.sm.settle_pending(&self.sm.kernel);
        self.sm.remote_handle_from_handle(&self.sm.kernel, guid)
    }

    /// # Errors
    /// See [`SharedMemory::free`].
    pub fn free(&self, guid: Guid) -> Result<(), SmError> {
        self.sm.free(&self.sm.kernel, ProcessId::KERNEL, guid)
    }

    /// Locks the memory and maps it into the kernel.
    ///
    /// # Errors
    /// See [`SharedMemory::lock`].
    pub fn lock(&self, guid: Guid, mode: LockMode) -> Result<Option<VirtualAddress>, SmError> {
        let options = LockOptions {
            cache: Some(mode.policy()),
            external_address: None,
        };
        self.sm.lock(&self.sm.kernel, ProcessId::KERNEL, guid, options)
    }

    /// # Errors
    /// See [`SharedMemory::unlock`].
    pub fn unlock(&self, guid: Guid, flush: bool, skip_remote: bool) -> Result<(), SmError> {
        let options = UnlockOptions {
            flush,
            wait_reply: true,
            skip_remote,
        };
        self.sm.unlock(&self.sm.kernel, ProcessId::KERNEL, guid, options)
    }

    /// Maps memory whose bus address the caller already knows, without
    /// asking the remote side to lock it.
    ///
    /// # Errors
    /// See [`SharedMemory::lock`].
    pub fn map(
        &self,
        guid: Guid,
        address: BusAddress,
        mode: LockMode,
    ) -> Result<Option<VirtualAddress>, SmError> {
        let options = LockOptions {
            cache: Some(mode.policy()),
            external_address: Some(address),
        };
        self.sm.lock(&self.sm.kernel, ProcessId::KERNEL, guid, options)
    }
}
