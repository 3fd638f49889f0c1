//! Error types for stowage.

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Store errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Object not found: {location}/{key}")]
    ObjectNotFound { location: String, key: String },

    #[error("Cache miss: failed to find cached objects among keys {0:?}")]
    CacheMiss(Vec<String>),

    // Archive errors
    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("Unsupported entry type {kind} for {path}")]
    UnsupportedEntry { path: String, kind: String },

    // Local filesystem errors
    #[error("IO error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // A failure that was followed by a failing cleanup step.
    #[error("{primary}: {stage}: {cleanup}")]
    Chained {
        primary: Box<Error>,
        stage: String,
        cleanup: Box<Error>,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap a local IO failure with the stage and path involved.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap a local IO failure that concerns a single path.
    pub fn io_at(action: &str, path: &Path, source: std::io::Error) -> Self {
        Error::io(format!("failed to {} {}", action, path.display()), source)
    }

    pub fn not_found(location: &str, key: &str) -> Self {
        Error::ObjectNotFound {
            location: location.to_string(),
            key: key.to_string(),
        }
    }

    /// True for the benign "no such object" outcome, looking through chains.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ObjectNotFound { .. } => true,
            Error::Chained { primary, .. } => primary.is_not_found(),
            _ => false,
        }
    }

    /// The error that started a failure, skipping any appended cleanup errors.
    pub fn primary(&self) -> &Error {
        match self {
            Error::Chained { primary, .. } => primary.primary(),
            other => other,
        }
    }

    /// Append the outcome of a cleanup step to this error.
    ///
    /// A successful cleanup leaves the error untouched; a failed one is chained
    /// behind it so neither failure is lost.
    pub fn with_cleanup(self, stage: &str, cleanup: Result<()>) -> Self {
        match cleanup {
            Ok(()) => self,
            Err(err) => Error::Chained {
                primary: Box::new(self),
                stage: stage.to_string(),
                cleanup: Box::new(err),
            },
        }
    }
}

/// Fold the result of closing a resource into the result of the work done with it.
///
/// If the body failed, a close failure is chained onto the body's error. If the
/// body succeeded, a close failure becomes the outcome.
pub fn combine<T>(body: Result<T>, stage: &str, close: Result<()>) -> Result<T> {
    match (body, close) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), close) => Err(err.with_cleanup(stage, close)),
    }
}
