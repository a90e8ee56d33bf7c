use crate::addresses::VirtualAddress;
use crate::registry::Guid;
use crate::remote::{RemoteStatus, TransactionId};
use crate::session::ProcessId;
use vcsm_abi::Status;

/// Errors reported by broker operations.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SmError {
    #[error("no resource {0} visible to the caller")]
    NotFound(Guid),
    #[error("process {caller} may not access resource {guid} owned by {owner}")]
    PermissionDenied {
        guid: Guid,
        owner: ProcessId,
        caller: ProcessId,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("out of memory")]
    OutOfMemory,
    #[error("remote call failed with status {0}")]
    RemoteFailure(RemoteStatus),
    #[error("remote call interrupted (transaction {0})")]
    Interrupted(TransactionId),
    #[error("unresolvable access at {0}")]
    BusFault(VirtualAddress),
}

impl SmError {
    /// Status code reported through the control surface.
    #[must_use]
    pub const fn status(&self) -> Status {
        match self {
            Self::NotFound(_) => Status::NotFound,
            Self::PermissionDenied { .. } => Status::PermissionDenied,
            Self::InvalidArgument(_) => Status::InvalidArgument,
            Self::OutOfMemory => Status::OutOfMemory,
            Self::RemoteFailure(_) => Status::RemoteFailure,
            Self::Interrupted(_) => Status::Interrupted,
            Self::BusFault(_) => Status::BusFault,
        }
    }
}

impl From<SmError> for Status {
    #[inline]
    fn from(value: SmError) -> Self {
        value.status()
    }
}
