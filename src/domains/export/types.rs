use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::{FailureDetail, ValidationError};

/// Opaque identifier handed to callers for every export
pub type ExportId = Uuid;

/// One exported row: column name to scalar value, in the caller's column order
pub type RowRecord = serde_json::Map<String, serde_json::Value>;

const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// What is being exported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportType {
    Participants,
    Payments,
    Ambassadors,
}

impl ExportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportType::Participants => "participants",
            ExportType::Payments => "payments",
            ExportType::Ambassadors => "ambassadors",
        }
    }
}

impl fmt::Display for ExportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "participants" => Ok(ExportType::Participants),
            "payments" => Ok(ExportType::Payments),
            "ambassadors" => Ok(ExportType::Ambassadors),
            _ => Err(ValidationError::invalid_request(
                "export_type",
                "must be one of participants, payments, ambassadors",
            )),
        }
    }
}

/// Output formats supported by the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Csv,
    Excel,
}

impl ExportFormat {
    /// Get file extension for this format
    pub fn file_extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Excel => "xlsx",
        }
    }

    pub fn mime_type(&self) -> mime::Mime {
        match self {
            ExportFormat::Csv => mime::TEXT_CSV,
            ExportFormat::Excel => XLSX_MIME.parse().unwrap_or(mime::APPLICATION_OCTET_STREAM),
        }
    }

    /// Largest number of data rows one file of this format can hold.
    pub fn row_ceiling(&self) -> Option<u64> {
        match self {
            ExportFormat::Csv => None,
            // 1,048,576 sheet rows minus the header
            ExportFormat::Excel => Some(1_048_575),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "excel" | "xlsx" => Ok(ExportFormat::Excel),
            _ => Err(ValidationError::invalid_request("format", "must be csv or excel")),
        }
    }
}

/// How the export is laid out on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ExportStrategy {
    SingleFile,
    MultiFile { rows_per_shard: u64 },
}

impl ExportStrategy {
    pub fn is_multi_file(&self) -> bool {
        matches!(self, ExportStrategy::MultiFile { .. })
    }

    pub fn rows_per_shard(&self) -> Option<u64> {
        match self {
            ExportStrategy::SingleFile => None,
            ExportStrategy::MultiFile { rows_per_shard } => Some(*rows_per_shard),
        }
    }
}

/// Lifecycle of an export session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Accumulating,
    Finalizing,
    Ready,
    Expired,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Expired | SessionState::Failed)
    }

    pub fn accepts_chunks(&self) -> bool {
        matches!(self, SessionState::Created | SessionState::Accumulating)
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Created, Accumulating) => true,
            (Accumulating, Finalizing) => true,
            (Finalizing, Ready) => true,
            (Ready, Expired) => true,
            (Expired, _) => false,
            (Failed, Expired) => true,
            (Failed, _) => false,
            (_, Failed) => true,
            (_, Expired) => true,
            _ => false,
        }
    }

    pub(crate) fn as_u8(&self) -> u8 {
        match self {
            SessionState::Created => 0,
            SessionState::Accumulating => 1,
            SessionState::Finalizing => 2,
            SessionState::Ready => 3,
            SessionState::Expired => 4,
            SessionState::Failed => 5,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Created,
            1 => SessionState::Accumulating,
            2 => SessionState::Finalizing,
            3 => SessionState::Ready,
            4 => SessionState::Expired,
            _ => SessionState::Failed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Accumulating => "accumulating",
            SessionState::Finalizing => "finalizing",
            SessionState::Ready => "ready",
            SessionState::Expired => "expired",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Parameters for a new export session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateExportRequest {
    pub export_type: ExportType,
    pub format: ExportFormat,
    pub total_chunks: u32,
    pub expected_records: u64,
    /// Average encoded bytes per record, when the caller knows it.
    #[serde(default)]
    pub avg_record_width: Option<u64>,
    /// File name stem; defaults to `<type>_export_<timestamp>`.
    #[serde(default)]
    pub base_name: Option<String>,
}

impl CreateExportRequest {
    pub fn new(export_type: ExportType, format: ExportFormat, total_chunks: u32, expected_records: u64) -> Self {
        Self {
            export_type,
            format,
            total_chunks,
            expected_records,
            avg_record_width: None,
            base_name: None,
        }
    }

    pub fn with_record_width(mut self, width: u64) -> Self {
        self.avg_record_width = Some(width);
        self
    }

    pub fn with_base_name(mut self, base_name: impl Into<String>) -> Self {
        self.base_name = Some(base_name.into());
        self
    }
}

/// One physical file produced by an export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub shard_index: u32,
    pub path: PathBuf,
    pub format: ExportFormat,
    pub size_bytes: u64,
    pub row_count: u64,
    /// Hex-encoded SHA-256 of the file contents
    pub checksum: Option<String>,
}

impl OutputFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// One shard inside an archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMember {
    pub name: String,
    pub shard_index: u32,
    pub size_bytes: u64,
    pub row_count: u64,
    pub checksum: Option<String>,
}

/// Compressed container for a multi-file export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archive {
    pub export_id: ExportId,
    pub path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
    pub members: Vec<ArchiveMember>,
}

/// Finished output of a ready session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ExportOutputs {
    Single { file: OutputFile, file_name: String },
    Archive(Archive),
}

/// What a download returns alongside the bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentDescriptor {
    pub mime_type: String,
    pub filename: String,
    pub size: u64,
}

/// Bytes plus their content descriptor
#[derive(Debug, Clone)]
pub struct ExportDownload {
    pub bytes: Vec<u8>,
    pub content: ContentDescriptor,
}

/// File listed in a ready session's status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub filename: String,
    pub size_bytes: u64,
    pub row_count: u64,
    pub shard_index: Option<u32>,
    pub checksum: Option<String>,
}

/// Status record returned to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportStatus {
    pub export_id: ExportId,
    pub export_type: ExportType,
    pub format: ExportFormat,
    pub state: SessionState,
    pub strategy: ExportStrategy,
    pub total_chunks: u32,
    pub chunks_received: u32,
    pub record_count: u64,
    pub expected_records: u64,
    pub bytes_written: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub error: Option<FailureDetail>,
    pub files: Vec<FileDescriptor>,
}

/// Outcome of a chunk submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkAck {
    /// Written, together with any buffered chunks it unblocked.
    Applied,
    /// Held in the reorder buffer until lower indices arrive.
    Buffered,
    /// Every chunk is in; finalization has started.
    Complete,
}

/// Returned to the caller of `submit_chunk`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkReceipt {
    pub export_id: ExportId,
    pub chunk_index: u32,
    pub ack: ChunkAck,
    pub chunks_received: u32,
    pub records_written: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use SessionState::*;
        assert!(Created.can_transition_to(Accumulating));
        assert!(Accumulating.can_transition_to(Finalizing));
        assert!(Finalizing.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Expired));
        assert!(Accumulating.can_transition_to(Failed));
        assert!(!Created.can_transition_to(Ready));
        assert!(!Failed.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Accumulating));
    }

    #[test]
    fn test_state_round_trips_through_u8() {
        for state in [
            SessionState::Created,
            SessionState::Accumulating,
            SessionState::Finalizing,
            SessionState::Ready,
            SessionState::Expired,
            SessionState::Failed,
        ] {
            assert_eq!(SessionState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn test_parse_type_and_format() {
        assert_eq!("Payments".parse::<ExportType>().unwrap(), ExportType::Payments);
        assert_eq!("xlsx".parse::<ExportFormat>().unwrap(), ExportFormat::Excel);
        assert!("pdf".parse::<ExportFormat>().is_err());
        assert_eq!(ExportFormat::Excel.file_extension(), "xlsx");
        assert_eq!(ExportFormat::Csv.mime_type(), mime::TEXT_CSV);
    }
}
