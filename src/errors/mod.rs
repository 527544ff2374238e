mod error;

pub use error::{ExportError, FailureDetail, FailureKind, ValidationError};

/// Result type for export pipeline operations
pub type ExportResult<T> = Result<T, ExportError>;
