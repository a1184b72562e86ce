//! Protocol errors returned to clients.

use thiserror::Error;

use crate::core::namespace::NamespaceError;
use crate::core::selection::SelectionError;
use crate::core::state::{StateError, StateId};
use crate::core::transfer::IoMode;

/// NFSv4 status codes the door produces.
pub mod status {
    pub const NFS4ERR_PERM: u32 = 1;
    pub const NFS4ERR_IO: u32 = 5;
    pub const NFS4ERR_ACCESS: u32 = 13;
    pub const NFS4ERR_NOSPC: u32 = 28;
    pub const NFS4ERR_STALE: u32 = 70;
    pub const NFS4ERR_DELAY: u32 = 10008;
    pub const NFS4ERR_BAD_STATEID: u32 = 10025;
    pub const NFS4ERR_LAYOUTTRYLATER: u32 = 10058;
    pub const NFS4ERR_LAYOUTUNAVAILABLE: u32 = 10059;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NfsError {
    #[error("operation not permitted: {0}")]
    Perm(String),
    #[error("access denied: {0}")]
    Access(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("no space left: {0}")]
    NoSpc(String),
    #[error("stale file handle")]
    Stale,
    #[error("try again later: {0}")]
    Delay(String),
    #[error("bad state id: {0}")]
    BadStateId(StateId),
    #[error("layout not available yet: {0}")]
    LayoutTryLater(String),
    #[error("layout unavailable: {0}")]
    LayoutUnavailable(String),
}

impl NfsError {
    pub fn status(&self) -> u32 {
        match self {
            Self::Perm(_) => status::NFS4ERR_PERM,
            Self::Access(_) => status::NFS4ERR_ACCESS,
            Self::Io(_) => status::NFS4ERR_IO,
            Self::NoSpc(_) => status::NFS4ERR_NOSPC,
            Self::Stale => status::NFS4ERR_STALE,
            Self::Delay(_) => status::NFS4ERR_DELAY,
            Self::BadStateId(_) => status::NFS4ERR_BAD_STATEID,
            Self::LayoutTryLater(_) => status::NFS4ERR_LAYOUTTRYLATER,
            Self::LayoutUnavailable(_) => status::NFS4ERR_LAYOUTUNAVAILABLE,
        }
    }

    /// Whether a client should retry the same request with the same state id.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Delay(_) | Self::LayoutTryLater(_))
    }
}

/// Translate a pool selection failure for a client.
pub fn map_selection_error(err: &SelectionError, mode: IoMode) -> NfsError {
    let msg = err.to_string();
    match err {
        SelectionError::PermissionDenied(_) => NfsError::Access(msg),
        SelectionError::FileInCache(_) | SelectionError::BrokenOnTape(_) => NfsError::Io(msg),
        SelectionError::NoPoolConfigured(_) => match mode {
            IoMode::Read => NfsError::Perm(msg),
            IoMode::ReadWrite => NfsError::NoSpc(msg),
        },
        SelectionError::NoPoolOnline(_)
        | SelectionError::Timeout
        | SelectionError::Interrupted
        | SelectionError::Other { .. } => NfsError::LayoutTryLater(msg),
    }
}

impl From<NamespaceError> for NfsError {
    fn from(err: NamespaceError) -> Self {
        match err {
            NamespaceError::Stale => NfsError::Stale,
            NamespaceError::Lookup(msg) => NfsError::Io(msg),
        }
    }
}

impl From<StateError> for NfsError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::BadStateId(id) => NfsError::BadStateId(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_selection_failures() {
        let read = IoMode::Read;
        let write = IoMode::ReadWrite;

        assert_eq!(
            map_selection_error(&SelectionError::PermissionDenied("x".into()), read).status(),
            status::NFS4ERR_ACCESS
        );
        assert_eq!(
            map_selection_error(&SelectionError::FileInCache("x".into()), read).status(),
            status::NFS4ERR_IO
        );
        assert_eq!(
            map_selection_error(&SelectionError::BrokenOnTape("x".into()), write).status(),
            status::NFS4ERR_IO
        );
    }

    #[test]
    fn no_pool_configured_depends_on_mode() {
        let err = SelectionError::NoPoolConfigured("x".into());
        assert_eq!(
            map_selection_error(&err, IoMode::Read).status(),
            status::NFS4ERR_PERM
        );
        assert_eq!(
            map_selection_error(&err, IoMode::ReadWrite).status(),
            status::NFS4ERR_NOSPC
        );
    }

    #[test]
    fn transient_selection_failures() {
        for err in [
            SelectionError::NoPoolOnline("x".into()),
            SelectionError::Interrupted,
            SelectionError::Timeout,
            SelectionError::Other {
                rc: 666,
                message: "?".into(),
            },
        ] {
            let mapped = map_selection_error(&err, IoMode::ReadWrite);
            assert_eq!(mapped.status(), status::NFS4ERR_LAYOUTTRYLATER);
            assert!(mapped.is_transient());
        }
    }

    #[test]
    fn permanent_errors_are_not_transient() {
        assert!(!NfsError::Io("x".into()).is_transient());
        assert!(!NfsError::Stale.is_transient());
        assert!(NfsError::Delay("x".into()).is_transient());
    }
}
