//! # Remote Shared-Memory Broker
//!
//! Brokers memory owned by a coprocessor (the *remote side*) to host
//! processes and to the host kernel. Consumers allocate blocks remotely, share
//! them between processes, map them into their address spaces, and lock them
//! while they access them; the broker keeps the bookkeeping consistent and
//! sequences the cache maintenance that keeps both sides coherent.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Control surface / kernel client / fault entry       │
//! └──────────────┬───────────────────────────────────────┘
//!                │
//! ┌──────────────▼───────────────────────────────────────┐
//! │  Lock coordinator · mapping table · session teardown │
//! └──────┬──────────────────┬───────────────────┬────────┘
//!        │                  │                   │
//! ┌──────▼───────┐  ┌───────▼────────┐  ┌───────▼────────┐
//! │   Registry   │  │ Remote service │  │ Cache control  │
//! │ (one lock)   │  │ (never locked) │  │ (local, outer) │
//! └──────────────┘  └────────────────┘  └────────────────┘
//! ```
//!
//! The registry lock serializes every change to the resource and mapping
//! tables. It is never held while the remote side is called: operations take
//! a reference on the resource, drop the lock, talk to the remote side and
//! then re-take the lock to publish the result.
//!
//! ## Collaborators
//!
//! The broker is generic over three traits supplied by the embedding kernel:
//!
//! * [`RemoteMemoryService`]: the coprocessor's memory RPC client,
//! * [`HostMemory`]: page-table and kernel-window operations of the host,
//! * [`CacheMaintenance`]: the CPU's cache maintenance primitives.
//!
//! ## Interrupted calls
//!
//! A remote call may be abandoned before its reply arrives. The broker then
//! stores a [`PendingAction`] on the calling session and asks the remote side
//! to clean it up before the session's next request, or when the session
//! closes.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod addresses;
pub mod cache;
pub mod config;
pub mod control;
mod coordinator;
mod error;
pub mod host;
mod kernel;
mod lifecycle;
mod mapping;
mod name;
pub mod registry;
pub mod remote;
pub mod report;
pub mod session;
pub mod stats;
mod sync;

pub use cache::{CacheController, CacheMaintenance, MappedRange};
pub use control::{ControlRequest, HandleCheck};
pub use config::{DebugLevel, SmConfig};
pub use coordinator::{LockOptions, UnlockOptions};
pub use error::SmError;
pub use host::{HostError, HostMemory, InsertError, RegionFlags};
pub use kernel::{KernelClient, LockMode};
pub use lifecycle::AllocSpec;
pub use mapping::{MapRequest, Mapped};
pub use name::ResourceName;
pub use registry::{Guid, MapKey, Registry, Release, ResourceInfo};
pub use remote::{PendingAction, RemoteMemoryService};
pub use report::{Report, ReportRequest};
pub use session::{ProcessId, Session, SessionId};
pub use vcsm_abi::{CachePolicy, Status};

use core::sync::atomic::{AtomicU8, Ordering};
use log::info;

/// Driver state: the registry plus the three collaborators.
pub struct SharedMemory<R, H, C> {
    registry: Registry,
    remote: R,
    host: H,
    cache: C,
    config: SmConfig,
    debug: AtomicU8,
    kernel: Session,
}

impl<R, H, C> SharedMemory<R, H, C>
where
    R: RemoteMemoryService,
    H: HostMemory,
    C: CacheMaintenance,
{
    /// Brings the broker up once the link to the remote side is available.
    ///
    /// Creates the kernel's own session, used by [`KernelClient`].
    pub fn connect(remote: R, host: H, cache: C, config: SmConfig) -> Self {
        let registry = Registry::new();
        let kernel = registry.open_session(ProcessId::KERNEL);
        info!(
            "shared memory connected, window at {}, debug level {:?}",
            config.window_base, config.debug_level
        );
        Self {
            registry,
            remote,
            host,
            cache,
            debug: AtomicU8::new(config.debug_level.into_bits()),
            config,
            kernel,
        }
    }

    /// Tears down the kernel session.
    pub fn shutdown(self) {
        self.teardown_session(&self.kernel);
        info!(
            "shared memory shut down, {} resources still referenced",
            self.registry.resource_count()
        );
    }

    #[inline]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    #[inline]
    pub const fn remote(&self) -> &R {
        &self.remote
    }

    #[inline]
    pub const fn host(&self) -> &H {
        &self.host
    }

    #[inline]
    pub const fn cache(&self) -> &C {
        &self.cache
    }

    #[inline]
    pub const fn config(&self) -> &SmConfig {
        &self.config
    }

    /// Snapshot of a live resource.
    #[must_use]
    pub fn resource(&self, guid: Guid) -> Option<ResourceInfo> {
        self.registry.info(guid)
    }

    #[must_use]
    pub fn debug_level(&self) -> DebugLevel {
        DebugLevel::from_bits(self.debug.load(Ordering::Relaxed))
    }

    /// Changes the diagnostics verbosity at runtime.
    ///
    /// # Errors
    /// [`SmError::InvalidArgument`] for levels above [`DebugLevel::Max`].
    pub fn set_debug_level(&self, level: u32) -> Result<(), SmError> {
        let level = DebugLevel::try_from(level)?;
        self.debug.store(level.into_bits(), Ordering::Relaxed);
        info!("debug level set to {level:?}");
        Ok(())
    }

    #[inline]
    pub(crate) fn verbose(&self, level: DebugLevel) -> bool {
        self.debug_level() >= level
    }

    pub(crate) fn cache_controller(&self) -> CacheController<'_, H, C> {
        CacheController::new(&self.host, &self.cache)
    }
}
