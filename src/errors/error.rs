use std::fmt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domains::export::types::SessionState;

/// Rejections of a request or chunk. A validation error never changes data
/// that was already accepted.
#[derive(Debug, Error, Clone, PartialEq, Serialize)]
pub enum ValidationError {
    #[error("Chunk index {index} is outside [0, {total})")]
    ChunkIndexOutOfRange {
        index: u32,
        total: u32,
    },

    #[error("Chunk {index} was already received")]
    DuplicateChunk {
        index: u32,
    },

    #[error("Chunk {index} has is_last={is_last} but the export declares {total} chunks")]
    LastChunkMismatch {
        index: u32,
        is_last: bool,
        total: u32,
    },

    #[error("Export no longer accepts chunks (state: {state})")]
    IngestionClosed {
        state: SessionState,
    },

    #[error("Row in chunk {chunk_index} does not match the header: expected [{}], found [{}]", .expected.join(", "), .found.join(", "))]
    SchemaMismatch {
        chunk_index: u32,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("Column '{column}' in chunk {chunk_index} holds a non-scalar value")]
    NonScalarValue {
        chunk_index: u32,
        column: String,
    },

    #[error("Export exceeds the record limit of {limit}")]
    RecordLimitExceeded {
        limit: u64,
    },

    #[error("Invalid request: field '{field}' {reason}")]
    InvalidRequest {
        field: String,
        reason: String,
    },
}

impl ValidationError {
    pub fn invalid_request(field: &str, reason: &str) -> Self {
        Self::InvalidRequest {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the offending input was already partly consumed, which leaves
    /// the export unusable.
    pub fn fails_session(&self) -> bool {
        matches!(
            self,
            ValidationError::SchemaMismatch { .. }
                | ValidationError::NonScalarValue { .. }
                | ValidationError::RecordLimitExceeded { .. }
        )
    }
}

/// Coarse classification recorded in a failed session's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    OutOfOrderOverflow,
    Write,
    ArchiveBuild,
    Source,
    Timeout,
    Cancelled,
    NotFound,
    NotReady,
    Capacity,
    Configuration,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Validation => "validation",
            FailureKind::OutOfOrderOverflow => "out_of_order_overflow",
            FailureKind::Write => "write",
            FailureKind::ArchiveBuild => "archive_build",
            FailureKind::Source => "source",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
            FailureKind::NotFound => "not_found",
            FailureKind::NotReady => "not_ready",
            FailureKind::Capacity => "capacity",
            FailureKind::Configuration => "configuration",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by the export pipeline
#[derive(Debug, Error, Clone, Serialize)]
pub enum ExportError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Export capacity exceeded: {limit} concurrent exports")]
    CapacityExceeded {
        limit: usize,
    },

    #[error("Reorder buffer overflow: chunk {index} arrived while {buffered} chunks wait for chunk {expected} (limit {limit})")]
    OutOfOrderOverflow {
        index: u32,
        expected: u32,
        buffered: usize,
        limit: usize,
    },

    #[error("Write error: {0}")]
    Write(String),

    #[error("Archive build error: {0}")]
    ArchiveBuild(String),

    #[error("Data source error: {0}")]
    Source(String),

    #[error("Export not found")]
    NotFound,

    #[error("Export not ready (state: {state})")]
    NotReady {
        state: SessionState,
    },

    #[error("Export cancelled: {0}")]
    Cancelled(String),

    #[error("No chunk received for {idle_secs} seconds")]
    Timeout {
        idle_secs: i64,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Terminal failure of an export, as seen by someone waiting on it.
    #[error("Export failed ({kind}): {message}")]
    Failed {
        kind: FailureKind,
        message: String,
    },
}

impl ExportError {
    pub fn write<E: fmt::Display>(err: E) -> Self {
        ExportError::Write(err.to_string())
    }

    pub fn archive<E: fmt::Display>(err: E) -> Self {
        ExportError::ArchiveBuild(err.to_string())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            ExportError::Validation(_) => FailureKind::Validation,
            ExportError::CapacityExceeded { .. } => FailureKind::Capacity,
            ExportError::OutOfOrderOverflow { .. } => FailureKind::OutOfOrderOverflow,
            ExportError::Write(_) => FailureKind::Write,
            ExportError::ArchiveBuild(_) => FailureKind::ArchiveBuild,
            ExportError::Source(_) => FailureKind::Source,
            ExportError::NotFound => FailureKind::NotFound,
            ExportError::NotReady { .. } => FailureKind::NotReady,
            ExportError::Cancelled(_) => FailureKind::Cancelled,
            ExportError::Timeout { .. } => FailureKind::Timeout,
            ExportError::InvalidConfig(_) => FailureKind::Configuration,
            ExportError::Failed { kind, .. } => *kind,
        }
    }

    /// Whether this error, raised while handling a chunk, moves the session
    /// to `failed`.
    pub fn fails_session(&self) -> bool {
        match self {
            ExportError::Validation(v) => v.fails_session(),
            ExportError::OutOfOrderOverflow { .. }
            | ExportError::Write(_)
            | ExportError::ArchiveBuild(_)
            | ExportError::Source(_) => true,
            _ => false,
        }
    }

    /// Suggested HTTP status for the route layer.
    pub fn http_status(&self) -> u16 {
        match self {
            ExportError::Validation(ValidationError::DuplicateChunk { .. })
            | ExportError::Validation(ValidationError::IngestionClosed { .. }) => 409,
            ExportError::Validation(ValidationError::RecordLimitExceeded { .. }) => 413,
            ExportError::Validation(_) => 400,
            ExportError::CapacityExceeded { .. } => 429,
            ExportError::NotFound => 404,
            ExportError::NotReady { .. } => 409,
            ExportError::Cancelled(_) => 409,
            ExportError::Timeout { .. } => 408,
            ExportError::OutOfOrderOverflow { .. } => 422,
            ExportError::Write(_)
            | ExportError::ArchiveBuild(_)
            | ExportError::Source(_)
            | ExportError::InvalidConfig(_)
            | ExportError::Failed { .. } => 500,
        }
    }
}

impl From<std::io::Error> for ExportError {
    fn from(error: std::io::Error) -> Self {
        ExportError::Write(error.to_string())
    }
}

impl From<csv::Error> for ExportError {
    fn from(error: csv::Error) -> Self {
        ExportError::Write(format!("CSV encoding failed: {}", error))
    }
}

impl From<zip::result::ZipError> for ExportError {
    fn from(error: zip::result::ZipError) -> Self {
        ExportError::ArchiveBuild(error.to_string())
    }
}

impl From<tokio::task::JoinError> for ExportError {
    fn from(error: tokio::task::JoinError) -> Self {
        ExportError::Write(format!("background task failed: {}", error))
    }
}

/// Failure detail kept on a failed session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&ExportError> for FailureDetail {
    fn from(error: &ExportError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl From<FailureDetail> for ExportError {
    fn from(detail: FailureDetail) -> Self {
        ExportError::Failed {
            kind: detail.kind,
            message: detail.message,
        }
    }
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
