//! Error types for standup scheduling and digest composition.

use std::fmt;

/// Top-level error type for the standup digest engine.
#[derive(Debug, thiserror::Error)]
pub enum StandupError {
    /// Timezone name that neither the IANA database nor the friendly-name
    /// table recognises.
    #[error("invalid time zone: {0:?}")]
    InvalidTimeZone(String),

    /// Start-time string that does not match `H:MM am|pm`.
    #[error("malformed start time {0:?}, expected a time like 9:00am")]
    MalformedTimeString(String),

    /// Referenced record does not exist.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Record type (`standup`, `item`, `post`).
        entity: &'static str,
        /// Missing identifier.
        id: i64,
    },

    /// One or more fields of a draft failed validation. Nothing was written.
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    /// SQLite failure.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Store mutex was poisoned by a panicking writer.
    #[error("lock poisoned: {0}")]
    Lock(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Digest delivery failed (reported by the mailer collaborator).
    #[error("delivery error: {0}")]
    Delivery(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StandupError {
    pub(crate) fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, StandupError>;

/// A single failed field check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Field name as exposed to forms (`title`, `start_time_string`, ...).
    pub field: &'static str,
    /// Human-readable message.
    pub message: String,
}

/// All field failures collected from one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(Vec<FieldError>);

impl ValidationErrors {
    /// Record a failure for `field`.
    pub fn add(&mut self, field: &'static str, message: impl Into<String>) {
        self.0.push(FieldError {
            field,
            message: message.into(),
        });
    }

    /// Returns `true` when no failure was recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the recorded failures in the order they were found.
    pub fn errors(&self) -> &[FieldError] {
        &self.0
    }

    /// Returns `true` when `field` has at least one failure.
    pub fn has(&self, field: &str) -> bool {
        self.0.iter().any(|e| e.field == field)
    }

    /// `Ok(())` when empty, otherwise [`StandupError::Validation`].
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(StandupError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{} {}", e.field, e.message)?;
        }
        Ok(())
    }
}
