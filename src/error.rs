// src/error.rs

use std::path::PathBuf;

use thiserror::Error;

use crate::annotations::{AuthorId, CommentId};
use crate::stem::StemId;

/// Failures of a single stem engine. Never fatal to the session.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to open audio source {location}: {reason}")]
    Open { location: String, reason: String },

    #[error("output device error: {0}")]
    Device(String),

    #[error("engine command rejected: {0}")]
    Command(String),

    #[error("engine was unloaded")]
    Unloaded,
}

/// Errors raised by a comment store collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("comment store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("comment store data is malformed: {0}")]
    Format(#[from] serde_json::Error),

    #[error("comment store rejected the request: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error("{requester} may not delete comment {comment} (author: {author})")]
    PermissionDenied {
        comment: CommentId,
        requester: AuthorId,
        author: AuthorId,
    },

    #[error("timestamp {timestamp:.3}s is outside the stem range [0, {duration:.3}]")]
    InvalidTimestamp { timestamp: f64, duration: f64 },

    #[error("duration of stem {0} is not known yet")]
    DurationUnknown(StemId),

    #[error("comment content is empty")]
    EmptyContent,

    #[error("unknown stem {0}")]
    UnknownStem(StemId),

    #[error("comment {0} not found")]
    NotFound(CommentId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
