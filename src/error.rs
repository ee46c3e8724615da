//! Unified error handling for the time-attack library.
//!
//! Every fallible operation returns [`TrackerError`]. Validation failures are
//! raised before anything is written; storage failures are propagated as-is
//! and never retried here.

use std::fmt;

use thiserror::Error;

/// Kind of entity an id refers to, used by [`TrackerError::NotFound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Route,
    Checkpoint,
    Run,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Entity::Route => "Route",
            Entity::Checkpoint => "Checkpoint",
            Entity::Run => "Run",
        };
        f.write_str(name)
    }
}

/// Unified error type for tracker operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackerError {
    /// Input rejected before any persistence was attempted
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Operation referenced an id that does not exist
    #[error("{entity} {id} not found")]
    NotFound { entity: Entity, id: i64 },

    /// Operation is not valid in the current run state
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Backend connectivity or query failure
    #[error("Storage error: {message}")]
    Storage { message: String },
}

impl TrackerError {
    pub fn validation(message: impl Into<String>) -> Self {
        TrackerError::Validation {
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        TrackerError::InvalidState {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        TrackerError::Storage {
            message: message.into(),
        }
    }

    pub fn not_found(entity: Entity, id: i64) -> Self {
        TrackerError::NotFound { entity, id }
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for TrackerError {
    fn from(err: rusqlite::Error) -> Self {
        TrackerError::Storage {
            message: err.to_string(),
        }
    }
}

/// Result type alias for tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Extension trait for converting Option to TrackerError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a not-found error.
    fn ok_or_not_found(self, entity: Entity, id: i64) -> Result<T>;

    /// Convert Option to Result with an invalid-state error.
    fn ok_or_invalid_state(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, entity: Entity, id: i64) -> Result<T> {
        self.ok_or(TrackerError::NotFound { entity, id })
    }

    fn ok_or_invalid_state(self, message: &str) -> Result<T> {
        self.ok_or_else(|| TrackerError::invalid_state(message))
    }
}
