use thiserror::Error;

use crate::types::PconId;

pub type Result<T> = std::result::Result<T, VcrtcmError>;

/// Coarse classification of a [`VcrtcmError`].
///
/// Collaborators that only need to decide "retry / give up / report" can match on this instead of
/// the full variant set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Busy,
    OutOfMemory,
    Unsupported,
    InvalidArgument,
    Backend,
    Fatal,
}

/// Unified error type for the virtual CRTC manager.
///
/// Handles (`PconId`, PIM names) are carried in the variants so callers can log failures without
/// threading extra context through.
#[derive(Debug, Error)]
pub enum VcrtcmError {
    #[error("pcon {0} does not exist")]
    PconNotFound(PconId),

    #[error("pixel interface module {0:?} is not registered")]
    PimNotFound(String),

    #[error("pcon {0} is not attached")]
    NotAttached(PconId),

    #[error("pcon {0} is busy")]
    Busy(PconId),

    #[error("pcon table is full ({capacity} slots)")]
    TableFull { capacity: usize },

    #[error("out of memory allocating {bytes} bytes")]
    OutOfMemory { bytes: usize },

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A collaborator (GPU or consumer implementation) reported a failure.
    #[error("backend failure: {0}")]
    Backend(String),

    /// A registry invariant no longer holds. Confined to the calling operation.
    #[error("registry invariant violated: {0}")]
    Fatal(String),
}

impl VcrtcmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PconNotFound(_) | Self::PimNotFound(_) | Self::NotAttached(_) => {
                ErrorKind::NotFound
            }
            Self::Busy(_) => ErrorKind::Busy,
            Self::TableFull { .. } | Self::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Backend(_) => ErrorKind::Backend,
            Self::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}
