//! # Remote Memory Service
//!
//! Contract between the broker and the client that talks to the coprocessor.
//! Every call is synchronous and returns a [`Transaction`]: the id the remote
//! side assigned to the request plus how it ended.
//!
//! An [`Outcome::Abandoned`] call was interrupted on the host before the reply
//! arrived. The remote side may still act on it, so the broker keeps a
//! [`PendingAction`] and later tells the remote side to clean up.

use crate::addresses::BusAddress;
use crate::name::ResourceName;
use crate::session::ProcessId;
use core::fmt;

/// Handle the remote allocator uses for a block of memory.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RemoteHandle(u32);

impl RemoteHandle {
    /// Wraps a raw handle; zero is the remote side's "no handle".
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Option<Self> {
        if raw == 0 { None } else { Some(Self(raw)) }
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identifier of one remote request.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TransactionId(pub u32);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status code returned by a failed remote call.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct RemoteStatus(pub i32);

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal state of a remote call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Outcome<T> {
    Completed(T),
    Failed(RemoteStatus),
    /// Interrupted before the reply arrived.
    Abandoned,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Transaction<T> {
    pub id: TransactionId,
    pub outcome: Outcome<T>,
}

impl<T> Transaction<T> {
    #[inline]
    pub const fn completed(id: TransactionId, value: T) -> Self {
        Self {
            id,
            outcome: Outcome::Completed(value),
        }
    }

    #[inline]
    pub const fn failed(id: TransactionId, status: RemoteStatus) -> Self {
        Self {
            id,
            outcome: Outcome::Failed(status),
        }
    }

    #[inline]
    pub const fn abandoned(id: TransactionId) -> Self {
        Self {
            id,
            outcome: Outcome::Abandoned,
        }
    }
}

/// Kind of remote request, as needed to clean up after it.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ActionKind {
    Alloc = 0,
    Free = 1,
    Lock = 2,
    Unlock = 3,
    Resize = 4,
}

/// An interrupted remote call awaiting cleanup.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PendingAction {
    pub kind: ActionKind,
    pub transaction: TransactionId,
}

/// Kind of backing memory requested from the remote allocator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AllocKind {
    Cached,
    NonCached,
}

/// Parameters of a remote allocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AllocRequest {
    pub kind: AllocKind,
    /// Bytes per unit, already rounded to the alignment.
    pub base_unit: u32,
    pub num_unit: u32,
    pub alignment: u32,
    /// Host process the memory is allocated for.
    pub allocator: ProcessId,
    pub name: ResourceName,
}

/// Successful allocation reply.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Allocation {
    pub handle: RemoteHandle,
    /// Null if the remote side could not place the memory.
    pub address: BusAddress,
}

/// Successful lock reply.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LockReply {
    /// Where the memory lives now.
    pub address: BusAddress,
    /// Where the remote side believes it lived before.
    pub previous: BusAddress,
}

/// Client of the coprocessor's memory service.
pub trait RemoteMemoryService {
    fn allocate(&self, request: &AllocRequest) -> Transaction<Allocation>;

    fn free(&self, handle: RemoteHandle, address: BusAddress) -> Transaction<()>;

    fn lock(&self, handle: RemoteHandle, address: BusAddress) -> Transaction<LockReply>;

    fn unlock(&self, handle: RemoteHandle, address: BusAddress, wait_reply: bool)
    -> Transaction<()>;

    fn resize(&self, handle: RemoteHandle, address: BusAddress, new_size: u32) -> Transaction<()>;

    /// Tells the remote side to undo whatever an abandoned call did.
    fn clean_up(&self, action: PendingAction);

    /// Asks the remote side to dump its allocation table to its own log.
    ///
    /// # Errors
    /// The remote status if the request could not be delivered.
    fn walk_allocations(&self) -> Result<(), RemoteStatus> {
        Ok(())
    }
}
