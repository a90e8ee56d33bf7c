//! # Control Surface
//!
//! Decodes fixed-layout control records into broker operations and writes
//! the results back into the same records. Every request first settles the
//! session's pending interrupted call, if there is one.

use log::{error, info};
use vcsm_abi::{
    AllocRecord, CacheRecord, CheckRecord, Command, FreeRecord, LockCacheRecord,
    LockUnlockRecord, MapRecord, ResizeRecord, ShareRecord, SizeRecord, Status, WalkRecord,
};

use crate::addresses::{VirtualAddress, VirtualRange};
use crate::cache::{CacheMaintenance, MappedRange};
use crate::config::DEFAULT_RESOURCE_NAME;
use crate::coordinator::{LockOptions, UnlockOptions};
use crate::error::SmError;
use crate::host::HostMemory;
use crate::lifecycle::AllocSpec;
use crate::registry::Guid;
use crate::remote::{RemoteHandle, RemoteMemoryService};
use crate::report::ReportRequest;
use crate::session::{ProcessId, Session};
use crate::stats::StatKind;
use crate::{CachePolicy, SharedMemory};

/// A decoded control request together with its record.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ControlRequest {
    Allocate(AllocRecord),
    Share(ShareRecord),
    Lock(LockUnlockRecord),
    LockWithCache(LockCacheRecord),
    Unlock(LockUnlockRecord),
    Resize(ResizeRecord),
    Free(FreeRecord),
    RemoteWalkAllocations,
    HostWalkMappings,
    HostWalkProcessAllocations(WalkRecord),
    HostWalkProcessMappings(WalkRecord),
    SizeOfHandle(SizeRecord),
    CheckHandle(CheckRecord),
    HandleFromAddress(MapRecord),
    RemoteHandleFromAddress(MapRecord),
    RemoteHandleFromHandle(MapRecord),
    AddressFromHandle(MapRecord),
    Flush(CacheRecord),
    Invalidate(CacheRecord),
}

impl ControlRequest {
    #[must_use]
    pub const fn command(&self) -> Command {
        match self {
            Self::Allocate(_) => Command::Allocate,
            Self::Share(_) => Command::Share,
            Self::Lock(_) => Command::Lock,
            Self::LockWithCache(_) => Command::LockWithCache,
            Self::Unlock(_) => Command::Unlock,
            Self::Resize(_) => Command::Resize,
            Self::Free(_) => Command::Free,
            Self::RemoteWalkAllocations => Command::RemoteWalkAllocations,
            Self::HostWalkMappings => Command::HostWalkMappings,
            Self::HostWalkProcessAllocations(_) => Command::HostWalkProcessAllocations,
            Self::HostWalkProcessMappings(_) => Command::HostWalkProcessMappings,
            Self::SizeOfHandle(_) => Command::SizeOfHandle,
            Self::CheckHandle(_) => Command::CheckHandle,
            Self::HandleFromAddress(_) => Command::HandleFromAddress,
            Self::RemoteHandleFromAddress(_) => Command::RemoteHandleFromAddress,
            Self::RemoteHandleFromHandle(_) => Command::RemoteHandleFromHandle,
            Self::AddressFromHandle(_) => Command::AddressFromHandle,
            Self::Flush(_) => Command::Flush,
            Self::Invalidate(_) => Command::Invalidate,
        }
    }
}

/// Answer of [`SharedMemory::check`].
///
/// Address and size are only reported for host-cached resources, which are
/// the ones a caller has to maintain caches for.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct HandleCheck {
    pub address: Option<VirtualAddress>,
    pub size: u32,
    pub cache: CachePolicy,
}

fn raw_handle(handle: Option<RemoteHandle>) -> u32 {
    handle.map_or(0, RemoteHandle::as_u32)
}

fn raw_address(address: Option<VirtualAddress>) -> u64 {
    address.map_or(0, VirtualAddress::as_u64)
}

impl<R, H, C> SharedMemory<R, H, C>
where
    R: RemoteMemoryService,
    H: HostMemory,
    C: CacheMaintenance,
{
    /// Executes a control request on behalf of `caller`.
    ///
    /// Output fields of the record are updated in place.
    ///
    /// # Errors
    /// Whatever the underlying operation reports; see [`SmError::status`] for
    /// the status code handed back to the caller.
    pub fn control(
        &self,
        session: &Session,
        caller: ProcessId,
        request: &mut ControlRequest,
    ) -> Result<(), SmError> {
        self.settle_pending(session);

        match request {
            ControlRequest::Allocate(record) => {
                let cache = CachePolicy::from_raw(record.cached)
                    .ok_or(SmError::InvalidArgument("unknown cache policy"))?;
                let name = record.name().unwrap_or(DEFAULT_RESOURCE_NAME);
                let params = AllocSpec::new(record.size, cache)
                    .with_count(record.num)
                    .with_name(name);
                record.handle = self.allocate_as(session, caller, params)?.as_u32();
            }
            ControlRequest::Share(record) => {
                let (alias, size) =
                    self.allocate_share(session, caller, Guid::from_raw(record.handle))?;
                record.handle = alias.as_u32();
                record.size = size;
            }
            ControlRequest::Lock(record) => {
                let address = self.lock_unsettled(
                    session,
                    caller,
                    Guid::from_raw(record.handle),
                    LockOptions::default(),
                )?;
                record.addr = raw_address(address);
            }
            ControlRequest::LockWithCache(record) => {
                let cache = CachePolicy::from_raw(record.cached)
                    .ok_or(SmError::InvalidArgument("unknown cache policy"))?;
                let options = LockOptions {
                    cache: Some(cache),
                    external_address: None,
                };
                self.lock_unsettled(session, caller, Guid::from_raw(record.handle), options)?;
            }
            ControlRequest::Unlock(record) => {
                self.unlock_unsettled(
                    session,
                    caller,
                    Guid::from_raw(record.handle),
                    UnlockOptions::default(),
                )?;
            }
            ControlRequest::Resize(record) => {
                record.old_size = self.resize_unsettled(
                    session,
                    caller,
                    Guid::from_raw(record.handle),
                    record.new_size,
                )?;
            }
            ControlRequest::Free(record) => {
                self.free_unsettled(session, caller, Guid::from_raw(record.handle))?;
            }
            ControlRequest::RemoteWalkAllocations => {
                if let Err(status) = self.remote.walk_allocations() {
                    error!("remote allocation walk failed with status {status}");
                    return Err(SmError::RemoteFailure(status));
                }
            }
            ControlRequest::HostWalkMappings => {
                info!("{}", self.report(ReportRequest::Mappings(None)));
            }
            ControlRequest::HostWalkProcessAllocations(record) => {
                let pid = ProcessId(record.pid);
                info!("{}", self.report(ReportRequest::Allocations(Some(pid))));
            }
            ControlRequest::HostWalkProcessMappings(record) => {
                let pid = ProcessId(record.pid);
                info!("{}", self.report(ReportRequest::Mappings(Some(pid))));
            }
            ControlRequest::SizeOfHandle(record) => {
                record.size = self
                    .size_of(session, Guid::from_raw(record.handle))
                    .unwrap_or(0);
            }
            ControlRequest::CheckHandle(record) => {
                let check = self.check(session, caller, Guid::from_raw(record.handle))?;
                record.addr = raw_address(check.address);
                record.size = check.size;
                record.cache = check.cache.as_raw();
            }
            ControlRequest::HandleFromAddress(record) => {
                let pid = ProcessId(record.pid);
                let guid = self.handle_from_address(pid, VirtualAddress::new(record.addr));
                record.handle = guid.map_or(0, Guid::as_u32);
                record.size = guid
                    .and_then(|guid| self.host_cached_size(session, guid))
                    .unwrap_or(0);
            }
            ControlRequest::RemoteHandleFromAddress(record) => {
                let handle = self
                    .remote_handle_from_address(ProcessId(record.pid), VirtualAddress::new(record.addr));
                record.handle = raw_handle(handle);
            }
            ControlRequest::RemoteHandleFromHandle(record) => {
                let handle = self.remote_handle_from_handle(session, Guid::from_raw(record.handle));
                record.handle = raw_handle(handle);
            }
            ControlRequest::AddressFromHandle(record) => {
                let address =
                    self.address_from_handle(ProcessId(record.pid), Guid::from_raw(record.handle));
                record.addr = raw_address(address);
            }
            ControlRequest::Flush(record) => {
                let range = VirtualRange::new(VirtualAddress::new(record.addr), u64::from(record.size));
                self.flush(session, caller, Guid::from_raw(record.handle), range)?;
            }
            ControlRequest::Invalidate(record) => {
                let range = VirtualRange::new(VirtualAddress::new(record.addr), u64::from(record.size));
                self.invalidate(session, caller, Guid::from_raw(record.handle), range)?;
            }
        }
        Ok(())
    }

    /// [`control`](Self::control), reduced to the status code of the ABI.
    pub fn control_status(
        &self,
        session: &Session,
        caller: ProcessId,
        request: &mut ControlRequest,
    ) -> Status {
        match self.control(session, caller, request) {
            Ok(()) => Status::Ok,
            Err(e) => e.status(),
        }
    }

    /// Size of a resource the session owns.
    #[must_use]
    pub fn size_of(&self, session: &Session, guid: Guid) -> Option<u32> {
        let info = self.registry.acquire_by_guid(session, guid).ok()?;
        self.release(guid, false);
        Some(info.size)
    }

    fn host_cached_size(&self, session: &Session, guid: Guid) -> Option<u32> {
        let info = self.registry.acquire_by_guid(session, guid).ok()?;
        self.release(guid, false);
        info.cache.host_cached().then_some(info.size)
    }

    /// Validates a handle the session owns.
    ///
    /// # Errors
    /// [`SmError::NotFound`] if the session does not own `guid`.
    pub fn check(&self, session: &Session, caller: ProcessId, guid: Guid) -> Result<HandleCheck, SmError> {
        let info = self.registry.acquire_by_guid(session, guid)?;
        self.release(guid, false);
        if !info.cache.host_cached() {
            return Ok(HandleCheck {
                cache: info.cache,
                ..HandleCheck::default()
            });
        }
        Ok(HandleCheck {
            address: self.address_from_handle(caller, guid),
            size: info.size,
            cache: info.cache,
        })
    }

    /// Remote handle of a resource the session owns.
    #[must_use]
    pub fn remote_handle_from_handle(&self, session: &Session, guid: Guid) -> Option<RemoteHandle> {
        let info = self.registry.acquire_by_guid(session, guid).ok()?;
        self.release(guid, false);
        info.handle
    }

    /// Cleans host caches over `range` of `caller`'s mapping of a resource.
    ///
    /// Uncached resources are left alone.
    ///
    /// # Errors
    /// [`SmError::NotFound`] if the session does not own `guid`.
    pub fn flush(
        &self,
        session: &Session,
        caller: ProcessId,
        guid: Guid,
        range: VirtualRange,
    ) -> Result<(), SmError> {
        self.maintain(session, caller, guid, range, true)
    }

    /// Invalidates host caches over `range` of `caller`'s mapping of a resource.
    ///
    /// # Errors
    /// [`SmError::NotFound`] if the session does not own `guid`.
    pub fn invalidate(
        &self,
        session: &Session,
        caller: ProcessId,
        guid: Guid,
        range: VirtualRange,
    ) -> Result<(), SmError> {
        self.maintain(session, caller, guid, range, false)
    }

    fn maintain(
        &self,
        session: &Session,
        caller: ProcessId,
        guid: Guid,
        range: VirtualRange,
        clean: bool,
    ) -> Result<(), SmError> {
        let info = self.registry.acquire_by_guid(session, guid)?;
        if info.cache.is_cached() {
            let len = range.len.min(u64::from(info.size));
            let physical = self.physical_range(info.base, len);
            let ranges = [MappedRange { pid: caller, range }];
            let controller = self.cache_controller();
            let kind = if clean {
                controller.clean(&ranges, physical);
                StatKind::Flush
            } else {
                controller.invalidate(&ranges, physical);
                StatKind::Invalidate
            };
            self.registry.update(guid, |r| r.stats.record(kind));
        }
        self.release(guid, false);
        Ok(())
    }
}

/// Decodes a raw command word and its record bytes into a request.
///
/// # Errors
/// [`SmError::InvalidArgument`] for an unknown command word or a record of
/// the wrong size.
pub fn decode(raw_command: u32, record: &[u8]) -> Result<ControlRequest, SmError> {
    let command = Command::decode(raw_command)
        .ok_or(SmError::InvalidArgument("unknown command"))?;
    if record.len() != command.record_size() {
        return Err(SmError::InvalidArgument("record size mismatch"));
    }
    let reader = RecordReader(record);
    Ok(match command {
        Command::Allocate => ControlRequest::Allocate(reader.read()),
        Command::Share => ControlRequest::Share(reader.read()),
        Command::Lock => ControlRequest::Lock(reader.read()),
        Command::LockWithCache => ControlRequest::LockWithCache(reader.read()),
        Command::Unlock => ControlRequest::Unlock(reader.read()),
        Command::Resize => ControlRequest::Resize(reader.read()),
        Command::Free => ControlRequest::Free(reader.read()),
        Command::RemoteWalkAllocations => ControlRequest::RemoteWalkAllocations,
        Command::HostWalkMappings => ControlRequest::HostWalkMappings,
        Command::HostWalkProcessAllocations => ControlRequest::HostWalkProcessAllocations(reader.read()),
        Command::HostWalkProcessMappings => ControlRequest::HostWalkProcessMappings(reader.read()),
        Command::SizeOfHandle => ControlRequest::SizeOfHandle(reader.read()),
        Command::CheckHandle => ControlRequest::CheckHandle(reader.read()),
        Command::HandleFromAddress => ControlRequest::HandleFromAddress(reader.read()),
        Command::RemoteHandleFromAddress => ControlRequest::RemoteHandleFromAddress(reader.read()),
        Command::RemoteHandleFromHandle => ControlRequest::RemoteHandleFromHandle(reader.read()),
        Command::AddressFromHandle => ControlRequest::AddressFromHandle(reader.read()),
        Command::Flush => ControlRequest::Flush(reader.read()),
        Command::Invalidate => ControlRequest::Invalidate(reader.read()),
    })
}

/// Fixed-layout records that are valid for any bit pattern.
trait Record: Copy + Default {}

macro_rules! records {
    ($($record:ty),* $(,)?) => {
        $(impl Record for $record {})*
    };
}

records!(
    AllocRecord,
    ShareRecord,
    LockUnlockRecord,
    LockCacheRecord,
    ResizeRecord,
    FreeRecord,
    WalkRecord,
    SizeRecord,
    CheckRecord,
    MapRecord,
    CacheRecord,
);

struct RecordReader<'a>(&'a [u8]);

impl RecordReader<'_> {
    /// Reads a record; the length was checked by the caller.
    fn read<T: Record>(&self) -> T {
        let mut value = T::default();
        let len = core::mem::size_of::<T>().min(self.0.len());
        // Safety: every record type is `#[repr(C)]` made of integers and byte
        // arrays, so any bit pattern is a valid value.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.0.as_ptr(),
                (&raw mut value).cast::<u8>(),
                len,
            );
        }
        value
    }
}
