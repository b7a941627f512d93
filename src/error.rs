//! Unified error handling for the location tracker.
//!
//! Every fallible store, source and geocode operation returns one of these
//! typed errors instead of panicking, so the tracking task can decide per
//! category whether to skip a sample, absorb the failure or abort a command.

use thiserror::Error;

/// Session Store and Run-State failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Schema migration failed: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Session {0} not found")]
    SessionNotFound(i64),

    #[error("Session {0} is closed")]
    SessionClosed(i64),

    #[error("An open session already exists ({0})")]
    OpenSessionExists(i64),

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Sampling-source failures (GPS/radio). Logged, never fatal to the task.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("Location unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid fix ({latitude}, {longitude})")]
    InvalidFix { latitude: f64, longitude: f64 },
}

/// Reverse-geocode failures. Always absorbed into a missing address.
#[derive(Debug, Clone, Error)]
pub enum GeocodeError {
    #[error("Lookup failed: {0}")]
    Lookup(String),

    #[error("HTTP error ({status_code:?}): {message}")]
    Http {
        message: String,
        status_code: Option<u16>,
    },
}

/// Failures of a tracking command as a whole.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Tracker services are not installed")]
    NotInstalled,

    #[error("Failed to launch tracking task: {0}")]
    Launch(String),

    #[error("Tracking is active")]
    TrackingActive,
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for tracker commands.
pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        StoreError::LockPoisoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::SessionClosed(42);
        assert_eq!(err.to_string(), "Session 42 is closed");

        let err = SourceError::InvalidFix {
            latitude: 91.0,
            longitude: 0.0,
        };
        assert!(err.to_string().contains("91"));
    }

    #[test]
    fn test_store_error_converts_into_tracker_error() {
        let tracker_err: TrackerError = StoreError::SessionNotFound(3).into();
        assert!(matches!(
            tracker_err,
            TrackerError::Store(StoreError::SessionNotFound(3))
        ));
        assert_eq!(tracker_err.to_string(), "Session 3 not found");
    }

    #[test]
    fn test_poisoned_lock_maps_to_store_error() {
        let lock = std::sync::Mutex::new(());
        let _ = std::panic::catch_unwind(|| {
            let _guard = lock.lock().unwrap();
            panic!("poison");
        });
        let err: StoreError = lock.lock().unwrap_err().into();
        assert!(matches!(err, StoreError::LockPoisoned));
    }
}
