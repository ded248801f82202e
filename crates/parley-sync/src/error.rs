use thiserror::Error;

use parley_store::StoreError;

/// Failures reported by a remote adapter ([`RemoteStore`] or
/// [`MetadataSource`]).
///
/// [`RemoteStore`]: crate::remote::RemoteStore
/// [`MetadataSource`]: crate::metadata::MetadataSource
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    #[error("Remote store rejected the request: {0}")]
    Rejected(String),
}

#[derive(Error, Debug)]
pub enum SyncError {
    /// A referenced message or conversation is absent.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Local store error: {0}")]
    Store(#[from] StoreError),

    #[error("Remote store error: {0}")]
    Remote(RemoteError),

    /// The session was torn down or its state is unusable.
    #[error("Invariant violation: {0}")]
    Invariant(String),
}

impl From<RemoteError> for SyncError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::NotFound(what) => SyncError::NotFound(what),
            other => SyncError::Remote(other),
        }
    }
}

impl SyncError {
    /// Store and remote failures: worth a retry affordance, never fatal.
    pub fn is_adapter(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Remote(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_not_found_maps_to_not_found() {
        let err: SyncError = RemoteError::NotFound("m1".into()).into();
        assert!(matches!(err, SyncError::NotFound(ref id) if id == "m1"));
        assert!(!err.is_adapter());

        let err: SyncError = RemoteError::Unavailable("offline".into()).into();
        assert!(err.is_adapter());
    }
}
