//! # Resource Registry
//!
//! Owns every resource record, every mapping record and every session's
//! bookkeeping. All of it lives in one [`Tables`] value behind a single lock;
//! records refer to each other by key ([`Guid`], [`MapKey`], [`SessionId`])
//! rather than by pointer.
//!
//! Indices kept in sync by this module:
//!
//! * all resources, by GUID,
//! * the resources of each session,
//! * all mappings, by mapping key, and the mappings of each resource,
//! * all mappings by `(process, start address)`.
//!
//! The registry never talks to the remote side. Operations that need to
//! (allocation, the final release) do their bookkeeping here and their remote
//! calls in [`SharedMemory`](crate::SharedMemory), outside the lock.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use core::fmt;
use core::mem;

use crate::addresses::{BusAddress, PAGE_SHIFT, VirtualAddress, VirtualRange};
use crate::cache::MappedRange;
use crate::config::GUID_COUNTER_LIMIT;
use crate::error::SmError;
use crate::name::ResourceName;
use crate::remote::{PendingAction, RemoteHandle};
use crate::session::{ProcessId, Session, SessionId};
use crate::stats::{LifecycleStats, OpStats};
use crate::sync::SpinLock;
use vcsm_abi::CachePolicy;

/// Host-issued resource identifier.
///
/// GUIDs are page aligned so they can be passed as a mapping offset.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Guid(u32);

impl Guid {
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// The GUID as a page offset into the device.
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        (self.0 >> PAGE_SHIFT) as u64
    }

    /// Recovers a GUID from a mapping page offset.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_page_offset(offset: u64) -> Option<Self> {
        if offset > (u32::MAX >> PAGE_SHIFT) as u64 {
            None
        } else {
            Some(Self((offset as u32) << PAGE_SHIFT))
        }
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Key of a mapping record.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MapKey(u64);

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "map#{}", self.0)
    }
}

#[derive(Debug)]
pub(crate) struct Resource {
    pub guid: Guid,
    /// Session that owns the resource; `None` once orphaned.
    pub session: Option<SessionId>,
    pub owner: ProcessId,
    /// Cleared when another record shares the handle and outlives this one.
    pub handle: Option<RemoteHandle>,
    pub base: BusAddress,
    pub size: u32,
    pub cache: CachePolicy,
    pub lock_count: u32,
    pub ref_count: u32,
    /// Canonical resource this one aliases.
    pub shared: Option<Guid>,
    pub mappings: Vec<MapKey>,
    pub stats: OpStats,
    pub name: ResourceName,
}

impl Resource {
    pub(crate) fn info(&self) -> ResourceInfo {
        ResourceInfo {
            guid: self.guid,
            owner: self.owner,
            handle: self.handle,
            base: self.base,
            size: self.size,
            cache: self.cache,
            lock_count: self.lock_count,
            ref_count: self.ref_count,
            map_count: self.mappings.len(),
            shared: self.shared,
            stats: self.stats,
            name: self.name,
        }
    }
}

/// Snapshot of a resource, taken under the registry lock.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ResourceInfo {
    pub guid: Guid,
    pub owner: ProcessId,
    pub handle: Option<RemoteHandle>,
    pub base: BusAddress,
    pub size: u32,
    pub cache: CachePolicy,
    pub lock_count: u32,
    pub ref_count: u32,
    pub map_count: usize,
    pub shared: Option<Guid>,
    pub stats: OpStats,
    pub name: ResourceName,
}

impl ResourceInfo {
    /// Kernel-owned resources are open to everyone; others only to their owner.
    ///
    /// # Errors
    /// [`SmError::PermissionDenied`] if `caller` may not touch the resource.
    pub const fn check_access(&self, caller: ProcessId) -> Result<(), SmError> {
        if self.owner.is_kernel() || self.owner.0 == caller.0 {
            Ok(())
        } else {
            Err(SmError::PermissionDenied {
                guid: self.guid,
                owner: self.owner,
                caller,
            })
        }
    }
}

/// One virtual mapping of a resource.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Mapping {
    pub resource: Guid,
    pub pid: ProcessId,
    /// Remote handle at the time the mapping was made.
    pub remote_handle: Option<RemoteHandle>,
    pub region: VirtualRange,
    /// Address spaces sharing this mapping.
    pub attachments: u32,
}

impl Mapping {
    pub(crate) const fn mapped_range(&self) -> MappedRange {
        MappedRange {
            pid: self.pid,
            range: self.region,
        }
    }
}

#[derive(Debug)]
pub(crate) struct SessionState {
    pub pid: ProcessId,
    pub resources: BTreeSet<Guid>,
    pub pending: Option<PendingAction>,
}

#[derive(Debug, Default)]
pub(crate) struct Tables {
    pub resources: BTreeMap<Guid, Resource>,
    pub mappings: BTreeMap<MapKey, Mapping>,
    pub by_address: BTreeMap<(ProcessId, VirtualAddress), MapKey>,
    pub sessions: BTreeMap<SessionId, SessionState>,
    pub lifecycle: LifecycleStats,
    next_map: u64,
    next_session: u64,
}

impl Tables {
    /// Resource `guid` if `session` owns it.
    pub fn owned_mut(&mut self, session: SessionId, guid: Guid) -> Option<&mut Resource> {
        let owned = self
            .sessions
            .get(&session)
            .is_some_and(|s| s.resources.contains(&guid));
        if owned {
            self.resources.get_mut(&guid)
        } else {
            None
        }
    }

    pub fn add_mapping(&mut self, mapping: Mapping) -> MapKey {
        self.next_map += 1;
        let key = MapKey(self.next_map);
        if let Some(resource) = self.resources.get_mut(&mapping.resource) {
            resource.mappings.push(key);
        }
        self.by_address
            .insert((mapping.pid, mapping.region.start), key);
        self.mappings.insert(key, mapping);
        key
    }

    /// Removes a mapping from every index.
    pub fn remove_mapping(&mut self, key: MapKey) -> Option<Mapping> {
        let mapping = self.unindex_mapping(key)?;
        if let Some(resource) = self.resources.get_mut(&mapping.resource) {
            resource.mappings.retain(|k| *k != key);
        }
        Some(mapping)
    }

    /// Removes a mapping from the global indices only.
    fn unindex_mapping(&mut self, key: MapKey) -> Option<Mapping> {
        let mapping = self.mappings.remove(&key)?;
        let address_key = (mapping.pid, mapping.region.start);
        if self.by_address.get(&address_key) == Some(&key) {
            self.by_address.remove(&address_key);
        }
        Some(mapping)
    }

    /// The mapping of `pid` that covers `address`.
    pub fn mapping_at(&self, pid: ProcessId, address: VirtualAddress) -> Option<(MapKey, &Mapping)> {
        let (_, key) = self.by_address.range(..=(pid, address)).next_back()?;
        let mapping = self.mappings.get(key)?;
        (mapping.pid == pid && mapping.region.contains(address)).then_some((*key, mapping))
    }

    /// First mapping of resource `guid` made by `pid`.
    pub fn mapping_of(&self, pid: ProcessId, guid: Guid) -> Option<(MapKey, &Mapping)> {
        let resource = self.resources.get(&guid)?;
        resource.mappings.iter().find_map(|key| {
            self.mappings
                .get(key)
                .filter(|m| m.pid == pid)
                .map(|m| (*key, m))
        })
    }

    pub fn mapped_ranges(&self, guid: Guid) -> Vec<MappedRange> {
        self.resources
            .get(&guid)
            .map(|r| {
                r.mappings
                    .iter()
                    .filter_map(|key| self.mappings.get(key))
                    .map(Mapping::mapped_range)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether any record backed by the remote block `handle` is locked or mapped.
    pub fn share_in_use(&self, handle: RemoteHandle) -> bool {
        self.resources
            .values()
            .filter(|r| r.handle == Some(handle))
            .any(|r| r.lock_count > 0 || !r.mappings.is_empty())
    }

    /// Sets the size of every record backed by `handle`.
    ///
    /// Returns the previous size of `guid`.
    pub fn resize_shared(&mut self, guid: Guid, handle: RemoteHandle, size: u32) -> Option<u32> {
        let old = self.resources.get(&guid).map(|r| r.size);
        for resource in self.resources.values_mut() {
            if resource.handle == Some(handle) {
                resource.size = size;
            }
        }
        old
    }
}

/// Outcome of dropping one reference.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Release {
    /// No such resource.
    Missing,
    /// Other holders remain.
    Referenced(u32),
    /// The last reference is gone and the resource was torn down.
    Destroyed,
}

/// A resource unlinked from every index, ready for teardown.
#[derive(Debug)]
pub(crate) struct Detached {
    pub resource: Resource,
    pub mappings: Vec<Mapping>,
}

pub(crate) enum Unref {
    Missing,
    Referenced(u32),
    Detached(Detached),
}

pub struct Registry {
    tables: SpinLock<Tables>,
    guid_counter: SpinLock<u32>,
    guid_limit: u32,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::with_guid_limit(GUID_COUNTER_LIMIT)
    }

    fn with_guid_limit(guid_limit: u32) -> Self {
        Self {
            tables: SpinLock::new(Tables::default()),
            guid_counter: SpinLock::new(0),
            guid_limit,
        }
    }

    #[inline]
    pub(crate) fn with<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> T {
        self.tables.with_lock(f)
    }

    /// Looks up a resource owned by `session` and takes a reference on it.
    ///
    /// # Errors
    /// [`SmError::NotFound`] if the session does not own `guid`.
    pub fn acquire_by_guid(&self, session: &Session, guid: Guid) -> Result<ResourceInfo, SmError> {
        self.with(|t| {
            let resource = t.owned_mut(session.id(), guid).ok_or(SmError::NotFound(guid))?;
            resource.ref_count += 1;
            Ok(resource.info())
        })
    }

    /// Looks up any live resource and takes a reference on it.
    ///
    /// # Errors
    /// [`SmError::NotFound`] if no resource has this GUID.
    pub fn acquire_global(&self, guid: Guid) -> Result<ResourceInfo, SmError> {
        self.with(|t| {
            let resource = t.resources.get_mut(&guid).ok_or(SmError::NotFound(guid))?;
            resource.ref_count += 1;
            Ok(resource.info())
        })
    }

    /// Takes a reference on some resource the session still owns.
    pub fn acquire_first(&self, session: &Session) -> Option<Guid> {
        self.with(|t| {
            let guid = *t.sessions.get(&session.id())?.resources.first()?;
            let resource = t.resources.get_mut(&guid)?;
            resource.ref_count += 1;
            Some(guid)
        })
    }

    /// Snapshot of a live resource without taking a reference.
    #[must_use]
    pub fn info(&self, guid: Guid) -> Option<ResourceInfo> {
        self.with(|t| t.resources.get(&guid).map(Resource::info))
    }

    /// Applies `f` to a live resource.
    pub(crate) fn update<T>(&self, guid: Guid, f: impl FnOnce(&mut Resource) -> T) -> Option<T> {
        self.with(|t| t.resources.get_mut(&guid).map(f))
    }

    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.with(|t| t.resources.len())
    }

    #[must_use]
    pub fn mapping_count(&self) -> usize {
        self.with(|t| t.mappings.len())
    }

    #[must_use]
    pub fn lifecycle(&self) -> LifecycleStats {
        self.with(|t| t.lifecycle)
    }

    /// How often the registry lock was found taken.
    #[must_use]
    pub fn contention_count(&self) -> u64 {
        self.tables.contention_count()
    }

    fn next_guid(&self) -> Guid {
        self.guid_counter.with_lock(|counter| {
            *counter = *counter % (self.guid_limit - 1) + 1;
            Guid(*counter << PAGE_SHIFT)
        })
    }

    /// Assigns a fresh GUID and links the resource into the tables.
    ///
    /// # Errors
    /// [`SmError::OutOfMemory`] if every GUID value is taken.
    pub(crate) fn register(&self, resource: Resource) -> Result<Guid, SmError> {
        let mut pending = Some(resource);
        for _ in 1..self.guid_limit {
            let guid = self.next_guid();
            let placed = self.with(|t| {
                if t.resources.contains_key(&guid) {
                    return false;
                }
                if let Some(mut resource) = pending.take() {
                    resource.guid = guid;
                    match resource.session.and_then(|id| t.sessions.get_mut(&id)) {
                        Some(session) => {
                            session.resources.insert(guid);
                        }
                        None => resource.session = None,
                    }
                    t.resources.insert(guid, resource);
                }
                true
            });
            if placed {
                return Ok(guid);
            }
        }
        Err(SmError::OutOfMemory)
    }

    /// Drops one reference. At zero the resource is unlinked from all tables
    /// and handed back for teardown.
    pub(crate) fn unref(&self, guid: Guid) -> Unref {
        self.with(|t| {
            let Some(resource) = t.resources.get_mut(&guid) else {
                return Unref::Missing;
            };
            resource.ref_count = resource.ref_count.saturating_sub(1);
            if resource.ref_count > 0 {
                return Unref::Referenced(resource.ref_count);
            }

            let Some(mut resource) = t.resources.remove(&guid) else {
                return Unref::Missing;
            };
            if let Some(session) = resource.session.and_then(|id| t.sessions.get_mut(&id)) {
                session.resources.remove(&guid);
            }
            if let Some(handle) = resource.handle
                && t.resources.values().any(|other| other.handle == Some(handle))
            {
                resource.handle = None;
            }
            let mappings = mem::take(&mut resource.mappings)
                .into_iter()
                .filter_map(|key| t.unindex_mapping(key))
                .collect();
            Unref::Detached(Detached { resource, mappings })
        })
    }

    /// Detaches a resource from its session; it lives on until its last
    /// reference is released.
    pub(crate) fn orphan(&self, guid: Guid) {
        self.with(|t| {
            let Some(resource) = t.resources.get_mut(&guid) else {
                return;
            };
            if let Some(id) = resource.session.take()
                && let Some(session) = t.sessions.get_mut(&id)
            {
                session.resources.remove(&guid);
            }
        });
    }

    pub(crate) fn record_deceased(&self, stats: &OpStats, forced: bool) {
        self.with(|t| t.lifecycle.record(stats, forced));
    }

    pub(crate) fn open_session(&self, pid: ProcessId) -> Session {
        self.with(|t| {
            t.next_session += 1;
            let id = SessionId(t.next_session);
            t.sessions.insert(
                id,
                SessionState {
                    pid,
                    resources: BTreeSet::new(),
                    pending: None,
                },
            );
            Session::new(id, pid)
        })
    }

    pub(crate) fn close_session(&self, id: SessionId) {
        self.with(|t| t.sessions.remove(&id));
    }

    /// Stores `action` as the session's pending call.
    ///
    /// Returns the call it displaces, or `Err(action)` if the session is gone.
    pub(crate) fn replace_pending(
        &self,
        id: SessionId,
        action: PendingAction,
    ) -> Result<Option<PendingAction>, PendingAction> {
        self.with(|t| match t.sessions.get_mut(&id) {
            Some(session) => Ok(session.pending.replace(action)),
            None => Err(action),
        })
    }

    pub(crate) fn take_pending(&self, id: SessionId) -> Option<PendingAction> {
        self.with(|t| t.sessions.get_mut(&id).and_then(|s| s.pending.take()))
    }

    /// The call currently awaiting cleanup on a session.
    #[must_use]
    pub fn pending(&self, session: &Session) -> Option<PendingAction> {
        self.with(|t| t.sessions.get(&session.id()).and_then(|s| s.pending))
    }

    /// GUIDs a session currently owns.
    #[must_use]
    pub fn owned(&self, session: &Session) -> Vec<Guid> {
        self.with(|t| {
            t.sessions
                .get(&session.id())
                .map(|s| s.resources.iter().copied().collect())
                .unwrap_or_default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(session: Option<SessionId>, handle: u32) -> Resource {
        Resource {
            guid: Guid::default(),
            session,
            owner: ProcessId(7),
            handle: RemoteHandle::new(handle),
            base: BusAddress::new(0x4000_0000),
            size: 4096,
            cache: CachePolicy::None,
            lock_count: 0,
            ref_count: 1,
            shared: None,
            mappings: Vec::new(),
            stats: OpStats::default(),
            name: ResourceName::new("test"),
        }
    }

    #[test]
    fn guids_are_page_aligned_and_distinct() {
        let registry = Registry::new();
        let a = registry.register(resource(None, 1)).unwrap();
        let b = registry.register(resource(None, 2)).unwrap();
        assert_ne!(a, b);
        assert_ne!(a.as_u32(), 0);
        assert_eq!(a.as_u32() & 0xFFF, 0);
        assert_eq!(Guid::from_page_offset(a.page_offset()), Some(a));
    }

    #[test]
    fn guid_counter_skips_live_guids_after_wrap() {
        let registry = Registry::new();
        let first = registry.register(resource(None, 1)).unwrap();
        *registry.guid_counter.lock() = GUID_COUNTER_LIMIT - 1;
        let wrapped = registry.register(resource(None, 2)).unwrap();
        assert_ne!(wrapped, first);
        assert_ne!(wrapped.as_u32(), 0);
    }

    #[test]
    fn registration_fails_once_every_guid_is_live() {
        let registry = Registry::with_guid_limit(8);
        let live: Vec<_> = (1..8)
            .map(|n| registry.register(resource(None, n)).unwrap())
            .collect();
        assert_eq!(live.len(), 7);
        assert_eq!(
            registry.register(resource(None, 8)),
            Err(SmError::OutOfMemory)
        );
        assert_eq!(registry.resource_count(), 7);

        assert!(matches!(registry.unref(live[3]), Unref::Detached(_)));
        assert_eq!(registry.register(resource(None, 9)), Ok(live[3]));
    }

    #[test]
    fn session_scoped_lookup_hides_foreign_resources() {
        let registry = Registry::new();
        let mine = registry.open_session(ProcessId(7));
        let theirs = registry.open_session(ProcessId(8));
        let guid = registry.register(resource(Some(mine.id()), 1)).unwrap();

        assert_eq!(registry.acquire_by_guid(&mine, guid).map(|r| r.ref_count), Ok(2));
        assert_eq!(
            registry.acquire_by_guid(&theirs, guid),
            Err(SmError::NotFound(guid))
        );
        assert_eq!(registry.acquire_global(guid).map(|r| r.ref_count), Ok(3));
    }

    #[test]
    fn last_unref_detaches_and_keeps_shared_handle() {
        let registry = Registry::new();
        let canonical = registry.register(resource(None, 9)).unwrap();
        let alias = registry.register(resource(None, 9)).unwrap();

        match registry.unref(alias) {
            Unref::Detached(d) => assert_eq!(d.resource.handle, None),
            _ => panic!("alias should be detached"),
        }
        match registry.unref(canonical) {
            Unref::Detached(d) => assert_eq!(d.resource.handle, RemoteHandle::new(9)),
            _ => panic!("canonical should be detached"),
        }
        assert!(matches!(registry.unref(canonical), Unref::Missing));
    }

    #[test]
    fn mapping_lookup_by_inner_address() {
        let registry = Registry::new();
        let guid = registry.register(resource(None, 1)).unwrap();
        let pid = ProcessId(7);
        let key = registry.with(|t| {
            t.add_mapping(Mapping {
                resource: guid,
                pid,
                remote_handle: RemoteHandle::new(1),
                region: VirtualRange::new(VirtualAddress::new(0x10_000), 0x2000),
                attachments: 1,
            })
        });

        registry.with(|t| {
            assert_eq!(t.mapping_at(pid, VirtualAddress::new(0x11_234)).map(|m| m.0), Some(key));
            assert!(t.mapping_at(pid, VirtualAddress::new(0x12_000)).is_none());
            assert!(t.mapping_at(ProcessId(8), VirtualAddress::new(0x10_000)).is_none());
            assert_eq!(t.mapping_of(pid, guid).map(|m| m.0), Some(key));
            assert!(t.remove_mapping(key).is_some());
            assert!(t.by_address.is_empty());
            assert!(t.resources[&guid].mappings.is_empty());
        });
    }

    #[test]
    fn orphaned_resource_leaves_session_list() {
        let registry = Registry::new();
        let session = registry.open_session(ProcessId(7));
        let guid = registry.register(resource(Some(session.id()), 1)).unwrap();
        registry.orphan(guid);
        assert!(registry.owned(&session).is_empty());
        assert!(registry.acquire_first(&session).is_none());
        assert!(registry.info(guid).is_some());
    }
}
