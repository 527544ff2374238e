use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::domains::export::accumulator::ChunkAccumulator;
use crate::domains::export::types::{
    ExportFormat, ExportId, ExportOutputs, ExportStatus, ExportStrategy, ExportType, FileDescriptor, SessionState,
};
use crate::errors::{ExportError, ExportResult, FailureDetail, FailureKind, ValidationError};

/// Snapshot broadcast to everyone watching a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionProgress {
    pub state: SessionState,
    pub error: Option<FailureDetail>,
}

/// One export and everything it owns.
pub struct ExportSession {
    pub id: ExportId,
    pub export_type: ExportType,
    pub format: ExportFormat,
    pub total_chunks: u32,
    pub expected_records: u64,
    pub base_name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    state: SessionState,
    strategy: ExportStrategy,
    error: Option<FailureDetail>,
    accumulator: Option<ChunkAccumulator>,
    outputs: Option<ExportOutputs>,
    chunks_received: u32,
    records_written: u64,
    bytes_written: u64,
    progress: watch::Sender<SessionProgress>,
}

impl ExportSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ExportId,
        export_type: ExportType,
        format: ExportFormat,
        total_chunks: u32,
        expected_records: u64,
        base_name: String,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        accumulator: ChunkAccumulator,
    ) -> Self {
        let (progress, _) = watch::channel(SessionProgress {
            state: SessionState::Created,
            error: None,
        });
        Self {
            id,
            export_type,
            format,
            total_chunks,
            expected_records,
            base_name,
            created_at,
            expires_at,
            last_activity: created_at,
            ready_at: None,
            state: SessionState::Created,
            strategy: accumulator.strategy(),
            error: None,
            accumulator: Some(accumulator),
            outputs: None,
            chunks_received: 0,
            records_written: 0,
            bytes_written: 0,
            progress,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn strategy(&self) -> ExportStrategy {
        self.strategy
    }

    pub fn error(&self) -> Option<&FailureDetail> {
        self.error.as_ref()
    }

    pub fn outputs(&self) -> Option<&ExportOutputs> {
        self.outputs.as_ref()
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub(crate) fn accumulator_mut(&mut self) -> ExportResult<&mut ChunkAccumulator> {
        let state = self.state;
        self.accumulator
            .as_mut()
            .ok_or(ExportError::Validation(ValidationError::IngestionClosed { state }))
    }

    pub(crate) fn take_accumulator(&mut self) -> Option<ChunkAccumulator> {
        self.accumulator.take()
    }

    /// Copy counters from the accumulator so status keeps them after it is
    /// taken for finalization.
    pub(crate) fn sync_progress(&mut self) {
        if let Some(acc) = &self.accumulator {
            self.chunks_received = acc.chunks_received();
            self.records_written = acc.records_written();
            self.bytes_written = acc.bytes_written();
            self.strategy = acc.strategy();
        }
    }

    /// Record activity. An unfinished session stays alive for `keep_alive`
    /// past its latest chunk.
    pub(crate) fn touch(&mut self, now: DateTime<Utc>, keep_alive: chrono::Duration) {
        self.last_activity = now;
        if !self.state.is_terminal() {
            let deadline = now.checked_add_signed(keep_alive).unwrap_or(DateTime::<Utc>::MAX_UTC);
            self.expires_at = self.expires_at.max(deadline);
        }
    }

    /// Restart the expiry window at `now`.
    pub(crate) fn expire_after(&mut self, now: DateTime<Utc>, window: chrono::Duration) {
        self.expires_at = now.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    /// Move to `next`, refusing transitions the lifecycle does not allow.
    pub(crate) fn transition(&mut self, next: SessionState) -> ExportResult<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(ExportError::NotReady { state: self.state });
        }
        log::debug!("Export {}: {} -> {}", self.id, self.state, next);
        self.state = next;
        self.publish();
        Ok(())
    }

    /// Record a terminal failure. A session that already reached a terminal
    /// state keeps it.
    pub(crate) fn fail(&mut self, error: &ExportError) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        log::warn!("Export {} failed in state {}: {}", self.id, self.state, error);
        self.error = Some(FailureDetail::from(error));
        self.state = SessionState::Failed;
        self.publish();
        true
    }

    /// Store the finished outputs and extend the expiry window from now.
    pub(crate) fn mark_ready(
        &mut self,
        outputs: ExportOutputs,
        strategy: ExportStrategy,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> ExportResult<()> {
        if self.state != SessionState::Finalizing {
            return Err(ExportError::NotReady { state: self.state });
        }
        self.bytes_written = match &outputs {
            ExportOutputs::Single { file, .. } => file.size_bytes,
            ExportOutputs::Archive(archive) => archive.members.iter().map(|m| m.size_bytes).sum(),
        };
        self.outputs = Some(outputs);
        self.strategy = strategy;
        self.ready_at = Some(now);
        self.expire_after(now, ttl);
        self.transition(SessionState::Ready)
    }

    pub fn subscribe(&self) -> ExportHandle {
        ExportHandle {
            id: self.id,
            progress: self.progress.subscribe(),
        }
    }

    fn publish(&self) {
        self.progress.send_replace(SessionProgress {
            state: self.state,
            error: self.error.clone(),
        });
    }

    pub fn files(&self) -> Vec<FileDescriptor> {
        match &self.outputs {
            None => Vec::new(),
            Some(ExportOutputs::Single { file, file_name }) => vec![FileDescriptor {
                filename: file_name.clone(),
                size_bytes: file.size_bytes,
                row_count: file.row_count,
                shard_index: Some(file.shard_index),
                checksum: file.checksum.clone(),
            }],
            Some(ExportOutputs::Archive(archive)) => archive
                .members
                .iter()
                .map(|m| FileDescriptor {
                    filename: m.name.clone(),
                    size_bytes: m.size_bytes,
                    row_count: m.row_count,
                    shard_index: Some(m.shard_index),
                    checksum: m.checksum.clone(),
                })
                .chain(std::iter::once(FileDescriptor {
                    filename: archive.file_name.clone(),
                    size_bytes: archive.size_bytes,
                    row_count: archive.members.iter().map(|m| m.row_count).sum(),
                    shard_index: None,
                    checksum: None,
                }))
                .collect(),
        }
    }

    pub fn status(&self) -> ExportStatus {
        ExportStatus {
            export_id: self.id,
            export_type: self.export_type,
            format: self.format,
            state: self.state,
            strategy: self.strategy,
            total_chunks: self.total_chunks,
            chunks_received: self.chunks_received,
            record_count: self.records_written,
            expected_records: self.expected_records,
            bytes_written: self.bytes_written,
            created_at: self.created_at,
            expires_at: self.expires_at,
            error: self.error.clone(),
            files: self.files(),
        }
    }

    /// Release writers and buffered chunks. Files on disk are removed by the
    /// store together with the session directory.
    pub(crate) async fn release(&mut self) {
        if let Some(mut acc) = self.accumulator.take() {
            acc.abort().await;
        }
    }
}

/// Handle for waiting on an export to finish
pub struct ExportHandle {
    pub id: ExportId,
    progress: watch::Receiver<SessionProgress>,
}

impl ExportHandle {
    /// Resolve once the export is ready, or with its failure. An export that
    /// disappears first resolves to `NotFound`.
    pub async fn wait_for_completion(&mut self) -> ExportResult<()> {
        loop {
            {
                let current = self.progress.borrow_and_update();
                match current.state {
                    SessionState::Ready => return Ok(()),
                    SessionState::Failed => {
                        return Err(current
                            .error
                            .clone()
                            .map(ExportError::from)
                            .unwrap_or(ExportError::Failed {
                                kind: FailureKind::Write,
                                message: "export failed".to_string(),
                            }))
                    }
                    SessionState::Expired => return Err(ExportError::NotFound),
                    _ => {}
                }
            }
            self.progress.changed().await.map_err(|_| ExportError::NotFound)?;
        }
    }

    pub fn state(&self) -> SessionState {
        self.progress.borrow().state
    }
}
