//! Error type of the sync engine.

use planning_backend::BackendError;
use planning_core::error::CoreError;
use planning_core::item::ItemType;

/// Message used when the server error body carries nothing readable.
pub const GENERIC_FAILURE: &str = "Request to the planning server failed";

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Another session holds the lock.
    #[error("{message}")]
    LockConflict { message: String },

    /// The server rejected the request or could not be reached.
    #[error("{message}")]
    Network {
        /// HTTP status code, when the server answered at all.
        status: Option<u16>,
        message: String,
    },

    /// One half of a two-item lock operation failed. The half that
    /// succeeded stays in effect.
    #[error("{failed} failed while {succeeded} succeeded: {message}")]
    PartialCompositeFailure {
        succeeded: ItemType,
        failed: ItemType,
        message: String,
    },

    /// `init` has not been called on the planning context.
    #[error("Planning context is not initialized")]
    NotInitialized,

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl SyncError {
    /// Classify a backend failure, preferring the server's own message over
    /// `fallback`.
    pub fn from_backend(err: BackendError, fallback: &str) -> Self {
        tracing::debug!(error = %err, "Backend request failed");
        let message = err.user_message().unwrap_or_else(|| fallback.to_string());
        if err.is_lock_conflict() {
            SyncError::LockConflict { message }
        } else {
            SyncError::Network {
                status: err.status(),
                message,
            }
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::Network { status, .. } => *status,
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

impl From<BackendError> for SyncError {
    fn from(err: BackendError) -> Self {
        Self::from_backend(err, GENERIC_FAILURE)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn conflicts_are_classified() {
        let err = SyncError::from_backend(
            BackendError::Api {
                status: 409,
                body: r#"{"_message":"The item was already locked"}"#.into(),
            },
            "Could not lock the item",
        );
        assert_matches!(err, SyncError::LockConflict { ref message } if message == "The item was already locked");
    }

    #[test]
    fn unreadable_body_uses_fallback() {
        let err = SyncError::from_backend(
            BackendError::Api {
                status: 500,
                body: "<html>oops</html>".into(),
            },
            "Could not save the autosave",
        );
        assert_eq!(err.to_string(), "Could not save the autosave");
        assert_eq!(err.status(), Some(500));
    }

    #[test]
    fn not_found_is_detected() {
        let err: SyncError = BackendError::Api {
            status: 404,
            body: String::new(),
        }
        .into();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), GENERIC_FAILURE);
    }
}
