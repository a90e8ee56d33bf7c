//! # Sessions
//!
//! A session is one consumer's view of the broker: the resources it owns and
//! at most one remote call that was interrupted and still needs cleanup.
//!
//! Closing a session settles that pending call, then drains every resource it
//! still owns, and finally settles whatever the drain itself left pending.

use core::fmt;
use log::{debug, info, warn};

use crate::cache::CacheMaintenance;
use crate::config::DebugLevel;
use crate::host::HostMemory;
use crate::remote::{ActionKind, PendingAction, RemoteMemoryService, TransactionId};
use crate::{Release, SharedMemory};

/// Host process identity.
///
/// [`ProcessId::KERNEL`] marks resources owned by the kernel itself; those are
/// exempt from per-process permission checks.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProcessId(pub u32);

impl ProcessId {
    pub const KERNEL: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn is_kernel(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_kernel() {
            f.write_str("kernel")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SessionId(pub(crate) u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle held by a consumer between [`SharedMemory::open_session`] and
/// [`SharedMemory::close_session`].
#[derive(Debug, Eq, PartialEq)]
pub struct Session {
    id: SessionId,
    pid: ProcessId,
}

impl Session {
    pub(crate) const fn new(id: SessionId, pid: ProcessId) -> Self {
        Self { id, pid }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Process on whose behalf the session acts.
    #[inline]
    #[must_use]
    pub const fn pid(&self) -> ProcessId {
        self.pid
    }
}

impl<R, H, C> SharedMemory<R, H, C>
where
    R: RemoteMemoryService,
    H: HostMemory,
    C: CacheMaintenance,
{
    /// Opens a session for process `pid`.
    pub fn open_session(&self, pid: ProcessId) -> Session {
        let session = self.registry.open_session(pid);
        info!("session {} opened for process {pid}", session.id());
        session
    }

    /// Closes a session and releases everything it still owns.
    ///
    /// Resources that something outside the session still references (an
    /// alias in another session, or an operation in flight) survive the
    /// close; the last of those references tears them down.
    pub fn close_session(&self, session: Session) {
        self.teardown_session(&session);
        info!("session {} of process {} closed", session.id(), session.pid());
    }

    pub(crate) fn teardown_session(&self, session: &Session) {
        self.settle_pending(session);

        let mut drained = 0_usize;
        while let Some(guid) = self.registry.acquire_first(session) {
            self.release(guid, false);
            if let Release::Referenced(remaining) = self.release(guid, true) {
                warn!("resource {guid} outlives session {} ({remaining} references)", session.id());
                self.registry.orphan(guid);
            }
            drained += 1;
        }
        if drained > 0 && self.verbose(DebugLevel::Min) {
            debug!("session {} drained {drained} resources", session.id());
        }

        self.settle_pending(session);
        self.registry.close_session(session.id());
    }

    /// Issues remote cleanup for the session's interrupted call, if any.
    pub(crate) fn settle_pending(&self, session: &Session) {
        if let Some(action) = self.registry.take_pending(session.id()) {
            if self.verbose(DebugLevel::Intermediate) {
                debug!(
                    "session {}: cleaning up {:?} (transaction {})",
                    session.id(),
                    action.kind,
                    action.transaction
                );
            }
            self.remote.clean_up(action);
        }
    }

    /// Records an interrupted call on the session so it is cleaned up later.
    ///
    /// Without a live session there is nobody to retry the call, so it is
    /// cleaned up right away.
    pub(crate) fn record_interrupted(
        &self,
        session: Option<SessionId>,
        kind: ActionKind,
        transaction: TransactionId,
    ) {
        let action = PendingAction { kind, transaction };
        let Some(session) = session else {
            self.remote.clean_up(action);
            return;
        };
        if self.verbose(DebugLevel::Intermediate) {
            debug!("session {session}: {kind:?} interrupted (transaction {transaction})");
        }
        match self.registry.replace_pending(session, action) {
            Ok(None) => {}
            // Only one call can be retried; the older one is settled now.
            Ok(Some(previous)) | Err(previous) => self.remote.clean_up(previous),
        }
    }
}
