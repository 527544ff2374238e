use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::task;
use uuid::Uuid;

use crate::config::ExportConfig;
use crate::domains::export::accumulator::ChunkAccumulator;
use crate::domains::export::archive::ArchiveBuilder;
use crate::domains::export::estimator::SizeEstimator;
use crate::domains::export::session::{ExportHandle, ExportSession};
use crate::domains::export::storage::{sanitize_component, ExportStorage};
use crate::domains::export::store::{ExportStore, StoreStats};
use crate::domains::export::types::{
    ChunkAck, ChunkReceipt, ContentDescriptor, CreateExportRequest, ExportDownload, ExportFormat, ExportId,
    ExportOutputs, ExportStatus, ExportStrategy, OutputFile, RowRecord, SessionState,
};
use crate::errors::{ExportError, ExportResult, ValidationError};

const ARCHIVE_MIME: &str = "application/zip";

/// Operations the HTTP layer and producers call.
#[async_trait]
pub trait ExportSessionService: Send + Sync {
    /// Register a new export. Returns immediately with its initial status.
    async fn create_session(&self, request: CreateExportRequest) -> ExportResult<ExportStatus>;

    async fn submit_chunk(
        &self,
        export_id: ExportId,
        chunk_index: u32,
        rows: Vec<RowRecord>,
        is_last: bool,
    ) -> ExportResult<ChunkReceipt>;

    async fn status(&self, export_id: ExportId) -> ExportResult<ExportStatus>;

    /// The single file, or the archive of a multi-file export.
    async fn download(&self, export_id: ExportId) -> ExportResult<ExportDownload>;

    /// One shard by 0-based index.
    async fn download_shard(&self, export_id: ExportId, shard_index: u32) -> ExportResult<ExportDownload>;

    async fn download_archive(&self, export_id: ExportId) -> ExportResult<ExportDownload>;

    /// Abort an unfinished export. It stays visible as failed until its TTL.
    async fn cancel(&self, export_id: ExportId, reason: &str) -> ExportResult<ExportStatus>;

    /// Fail an unfinished export with `error` and release its files.
    async fn abort(&self, export_id: ExportId, error: ExportError) -> ExportResult<ExportStatus>;

    /// Remove an export and its files now.
    async fn cleanup(&self, export_id: ExportId) -> ExportResult<()>;

    async fn subscribe(&self, export_id: ExportId) -> ExportResult<ExportHandle>;
}

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub timed_out: usize,
}

/// Owns the lifecycle of every export: creation, chunk ingestion,
/// finalization, downloads and eviction.
#[derive(Clone)]
pub struct ExportSessionController {
    config: Arc<ExportConfig>,
    store: Arc<ExportStore>,
}

impl std::fmt::Debug for ExportSessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportSessionController")
            .field("storage_dir", &self.config.storage_dir)
            .field("max_concurrent_exports", &self.config.max_concurrent_exports)
            .finish()
    }
}

impl ExportSessionController {
    pub fn new(config: ExportConfig) -> ExportResult<Self> {
        config.validate()?;
        let storage = ExportStorage::new(&config.storage_dir).map_err(|e| {
            ExportError::InvalidConfig(format!(
                "storage directory {} is unusable: {}",
                config.storage_dir.display(),
                e
            ))
        })?;
        let store = ExportStore::new(storage, config.max_concurrent_exports, config.reclaim_completed_on_pressure);
        Ok(Self {
            config: Arc::new(config),
            store: Arc::new(store),
        })
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    pub fn storage(&self) -> &ExportStorage {
        self.store.storage()
    }

    pub async fn stats(&self) -> StoreStats {
        self.store.stats().await
    }

    fn resolve_base_name(request: &CreateExportRequest, now: DateTime<Utc>) -> ExportResult<String> {
        match &request.base_name {
            Some(name) => sanitize_component(name).ok_or_else(|| {
                ValidationError::invalid_request("base_name", "must contain at least one letter or digit").into()
            }),
            None => Ok(format!(
                "{}_export_{}",
                request.export_type,
                now.format("%Y%m%d_%H%M%S")
            )),
        }
    }

    fn validate_request(&self, request: &CreateExportRequest) -> ExportResult<()> {
        if request.total_chunks == 0 {
            return Err(ValidationError::invalid_request("total_chunks", "must be at least 1").into());
        }
        if request.avg_record_width == Some(0) {
            return Err(ValidationError::invalid_request("avg_record_width", "must be greater than zero").into());
        }
        if request.expected_records > self.config.max_records_per_export {
            return Err(ValidationError::RecordLimitExceeded {
                limit: self.config.max_records_per_export,
            }
            .into());
        }
        Ok(())
    }

    /// Evict expired sessions and fail the ones idle past the inactivity
    /// window.
    pub async fn sweep(&self) -> ExportResult<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> ExportResult<SweepReport> {
        let window = self.config.inactivity_chrono();
        let mut report = SweepReport::default();

        for id in self.store.list_inactive(now, window).await {
            let Ok(mut guard) = self.store.lock_at(id, now).await else {
                continue;
            };
            let idle = now - guard.last_activity;
            if !guard.state().accepts_chunks() || idle < window {
                continue;
            }
            guard.sync_progress();
            if guard.fail(&ExportError::Timeout {
                idle_secs: idle.num_seconds(),
            }) {
                guard.expire_after(now, self.config.ttl_chrono());
                guard.release().await;
                drop(guard);
                self.release_storage(id).await;
                report.timed_out += 1;
            }
        }

        report.expired = self.store.sweep(now).await;

        match self.store.storage().purge_tombstones().await {
            Ok(0) => {}
            Ok(n) => log::info!("Purged {} leftover export directories", n),
            Err(e) => log::warn!("Failed to purge leftover export directories: {}", e),
        }

        if report.expired > 0 || report.timed_out > 0 {
            log::info!(
                "Export sweep: {} expired, {} timed out",
                report.expired,
                report.timed_out
            );
        }
        Ok(report)
    }

    async fn release_storage(&self, id: ExportId) {
        if let Err(e) = self.store.storage().remove_session_dir(id).await {
            log::error!("Failed to remove files of export {}: {}", id, e);
        }
    }

    async fn finalize(store: Arc<ExportStore>, config: Arc<ExportConfig>, id: ExportId) {
        let (mut accumulator, base_name) = {
            let mut guard = match store.lock(id).await {
                Ok(guard) => guard,
                Err(_) => return,
            };
            if guard.state() != SessionState::Finalizing {
                return;
            }
            match guard.take_accumulator() {
                Some(acc) => (acc, guard.base_name.clone()),
                None => return,
            }
        };

        let outcome = match accumulator.finish().await {
            Ok(files) => {
                let strategy = accumulator.strategy();
                Self::package(store.storage(), id, &base_name, files, strategy)
                    .await
                    .map(|outputs| (outputs, strategy))
            }
            Err(e) => {
                accumulator.abort().await;
                Err(e)
            }
        };

        let stale = match store.lock(id).await {
            Ok(mut guard) => match outcome {
                Ok((outputs, strategy)) if guard.state() == SessionState::Finalizing => {
                    match guard.mark_ready(outputs, strategy, Utc::now(), config.ttl_chrono()) {
                        Ok(()) => {
                            log::info!(
                                "Export {} ready: {} records, {} files",
                                id,
                                guard.records_written(),
                                guard.files().len()
                            );
                            false
                        }
                        Err(e) => {
                            if guard.fail(&e) {
                                guard.expire_after(Utc::now(), config.ttl_chrono());
                            }
                            true
                        }
                    }
                }
                Ok(_) => true,
                Err(e) => {
                    if guard.fail(&e) {
                        guard.expire_after(Utc::now(), config.ttl_chrono());
                    }
                    true
                }
            },
            Err(_) => true,
        };

        if stale {
            if let Err(e) = store.storage().remove_session_dir(id).await {
                log::error!("Failed to remove files of export {}: {}", id, e);
            }
        }
    }

    async fn package(
        storage: &ExportStorage,
        id: ExportId,
        base_name: &str,
        files: Vec<OutputFile>,
        strategy: ExportStrategy,
    ) -> ExportResult<ExportOutputs> {
        if !strategy.is_multi_file() && files.len() == 1 {
            let file = files.into_iter().next().ok_or_else(|| ExportError::write("no output file"))?;
            let file_name = format!("{}.{}", base_name, file.format.file_extension());
            return Ok(ExportOutputs::Single { file, file_name });
        }

        let destination = ExportStorage::archive_path(&storage.session_dir(id));
        let builder = ArchiveBuilder::new(base_name);
        let shard_paths: Vec<_> = files.iter().map(|f| f.path.clone()).collect();
        let archive = task::spawn_blocking(move || builder.build(id, &files, &destination)).await??;

        // Shards are served out of the archive from here on.
        for path in shard_paths {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                log::warn!("Failed to remove archived shard {}: {}", path.display(), e);
            }
        }
        Ok(ExportOutputs::Archive(archive))
    }

    /// Outputs of a ready session, or `NotReady` with its current state.
    async fn ready_outputs(&self, id: ExportId) -> ExportResult<ExportOutputs> {
        let guard = self.store.lock(id).await?;
        match (guard.state(), guard.outputs()) {
            (SessionState::Ready, Some(outputs)) => Ok(outputs.clone()),
            (state, _) => Err(ExportError::NotReady { state }),
        }
    }
}

async fn read_output(path: &std::path::Path) -> ExportResult<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ExportError::NotFound,
        _ => ExportError::write(e),
    })
}

fn descriptor(mime_type: String, filename: String, bytes: &[u8]) -> ContentDescriptor {
    ContentDescriptor {
        mime_type,
        filename,
        size: bytes.len() as u64,
    }
}

fn archive_mime() -> String {
    ARCHIVE_MIME
        .parse::<mime::Mime>()
        .unwrap_or(mime::APPLICATION_OCTET_STREAM)
        .to_string()
}

#[async_trait]
impl ExportSessionService for ExportSessionController {
    async fn create_session(&self, request: CreateExportRequest) -> ExportResult<ExportStatus> {
        self.validate_request(&request)?;

        let now = Utc::now();
        let base_name = Self::resolve_base_name(&request, now)?;
        let width = request.avg_record_width.unwrap_or(self.config.default_record_width);
        let estimate = SizeEstimator::for_format(&self.config, request.format).estimate(request.expected_records, width);

        let id = Uuid::new_v4();
        let accumulator = ChunkAccumulator::new(
            id,
            request.format,
            request.total_chunks,
            request.expected_records,
            estimate.strategy,
            request.avg_record_width.is_some(),
            self.store.storage().clone(),
            self.config.clone(),
        );
        let expires_at = now
            .checked_add_signed(self.config.keep_alive_chrono())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let session = ExportSession::new(
            id,
            request.export_type,
            request.format,
            request.total_chunks,
            request.expected_records,
            base_name,
            now,
            expires_at,
            accumulator,
        );

        let guard = self.store.create(session, now).await?;
        log::info!(
            "Created {} export {} ({:?}, {} chunks, ~{} records, ~{} bytes, {:?})",
            request.export_type,
            id,
            request.format,
            request.total_chunks,
            request.expected_records,
            estimate.predicted_bytes,
            estimate.strategy
        );
        Ok(guard.status())
    }

    async fn submit_chunk(
        &self,
        export_id: ExportId,
        chunk_index: u32,
        rows: Vec<RowRecord>,
        is_last: bool,
    ) -> ExportResult<ChunkReceipt> {
        let mut guard = self.store.lock(export_id).await?;
        let state = guard.state();
        if !state.accepts_chunks() {
            return Err(ValidationError::IngestionClosed { state }.into());
        }

        let row_count = rows.len();
        let result = guard.accumulator_mut()?.submit(chunk_index, rows, is_last).await;
        guard.sync_progress();

        match result {
            Ok(ack) => {
                guard.touch(Utc::now(), self.config.keep_alive_chrono());
                guard.transition(SessionState::Accumulating)?;
                log::debug!(
                    "Export {}: chunk {} ({} rows) {:?}",
                    export_id,
                    chunk_index,
                    row_count,
                    ack
                );

                if ack == ChunkAck::Complete {
                    guard.transition(SessionState::Finalizing)?;
                    task::spawn(Self::finalize(self.store.clone(), self.config.clone(), export_id));
                }

                let status = guard.status();
                Ok(ChunkReceipt {
                    export_id,
                    chunk_index,
                    ack,
                    chunks_received: status.chunks_received,
                    records_written: status.record_count,
                })
            }
            Err(e) if e.fails_session() => {
                if guard.fail(&e) {
                    guard.expire_after(Utc::now(), self.config.ttl_chrono());
                }
                guard.release().await;
                drop(guard);
                self.release_storage(export_id).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn status(&self, export_id: ExportId) -> ExportResult<ExportStatus> {
        let guard = self.store.lock(export_id).await?;
        Ok(guard.status())
    }

    async fn download(&self, export_id: ExportId) -> ExportResult<ExportDownload> {
        match self.ready_outputs(export_id).await? {
            ExportOutputs::Single { file, file_name } => {
                let bytes = read_output(&file.path).await?;
                let content = descriptor(file.format.mime_type().to_string(), file_name, &bytes);
                Ok(ExportDownload { bytes, content })
            }
            ExportOutputs::Archive(archive) => {
                let bytes = read_output(&archive.path).await?;
                let content = descriptor(archive_mime(), archive.file_name.clone(), &bytes);
                Ok(ExportDownload { bytes, content })
            }
        }
    }

    async fn download_shard(&self, export_id: ExportId, shard_index: u32) -> ExportResult<ExportDownload> {
        match self.ready_outputs(export_id).await? {
            ExportOutputs::Single { file, file_name } => {
                if shard_index != file.shard_index {
                    return Err(ExportError::NotFound);
                }
                let bytes = read_output(&file.path).await?;
                let content = descriptor(file.format.mime_type().to_string(), file_name, &bytes);
                Ok(ExportDownload { bytes, content })
            }
            ExportOutputs::Archive(archive) => {
                let member = archive
                    .members
                    .iter()
                    .find(|m| m.shard_index == shard_index)
                    .cloned()
                    .ok_or(ExportError::NotFound)?;
                let format = archive_member_format(&member.name);
                let bytes = task::spawn_blocking(move || ArchiveBuilder::extract(&archive, shard_index)).await??;
                let content = descriptor(format.mime_type().to_string(), member.name, &bytes);
                Ok(ExportDownload { bytes, content })
            }
        }
    }

    async fn download_archive(&self, export_id: ExportId) -> ExportResult<ExportDownload> {
        match self.ready_outputs(export_id).await? {
            ExportOutputs::Single { .. } => Err(ExportError::NotFound),
            ExportOutputs::Archive(archive) => {
                let bytes = read_output(&archive.path).await?;
                let content = descriptor(archive_mime(), archive.file_name.clone(), &bytes);
                Ok(ExportDownload { bytes, content })
            }
        }
    }

    async fn cancel(&self, export_id: ExportId, reason: &str) -> ExportResult<ExportStatus> {
        let status = self.abort(export_id, ExportError::Cancelled(reason.to_string())).await?;
        log::info!("Cancelled export {}: {}", export_id, reason);
        Ok(status)
    }

    async fn abort(&self, export_id: ExportId, error: ExportError) -> ExportResult<ExportStatus> {
        let mut guard = self.store.lock(export_id).await?;
        if guard.state().is_terminal() {
            return Ok(guard.status());
        }

        guard.sync_progress();
        if guard.fail(&error) {
            guard.expire_after(Utc::now(), self.config.ttl_chrono());
        }
        guard.release().await;
        let status = guard.status();
        drop(guard);

        self.release_storage(export_id).await;
        Ok(status)
    }

    async fn cleanup(&self, export_id: ExportId) -> ExportResult<()> {
        self.store.delete(export_id).await
    }

    async fn subscribe(&self, export_id: ExportId) -> ExportResult<ExportHandle> {
        let guard = self.store.lock(export_id).await?;
        Ok(guard.subscribe())
    }
}

fn archive_member_format(name: &str) -> ExportFormat {
    if name.ends_with(ExportFormat::Excel.file_extension()) {
        ExportFormat::Excel
    } else {
        ExportFormat::Csv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::types::ExportType;
    use crate::errors::FailureKind;
    use serde_json::json;
    use std::io::Read;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> ExportConfig {
        ExportConfig {
            storage_dir: dir.path().join("exports"),
            csv_bom: false,
            ..ExportConfig::default()
        }
    }

    fn rows(names: &[&str]) -> Vec<RowRecord> {
        names
            .iter()
            .map(|n| json!({ "id": n, "amount": 10 }).as_object().cloned().unwrap())
            .collect()
    }

    async fn wait_ready(controller: &ExportSessionController, id: ExportId) {
        let mut handle = controller.subscribe(id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), handle.wait_for_completion())
            .await
            .expect("finalization timed out")
            .unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_end_to_end() {
        let dir = TempDir::new().unwrap();
        let controller = ExportSessionController::new(config(&dir)).unwrap();
        let status = controller
            .create_session(CreateExportRequest::new(ExportType::Payments, ExportFormat::Csv, 3, 6).with_base_name("payments"))
            .await
            .unwrap();
        let id = status.export_id;
        assert_eq!(status.state, SessionState::Created);

        let receipt = controller.submit_chunk(id, 1, rows(&["A", "B"]), false).await.unwrap();
        assert_eq!(receipt.ack, ChunkAck::Buffered);
        assert_eq!(controller.status(id).await.unwrap().state, SessionState::Accumulating);

        controller.submit_chunk(id, 0, rows(&["C", "D"]), false).await.unwrap();
        let receipt = controller.submit_chunk(id, 2, rows(&["E", "F"]), true).await.unwrap();
        assert_eq!(receipt.ack, ChunkAck::Complete);
        assert_eq!(receipt.records_written, 6);

        wait_ready(&controller, id).await;

        let download = controller.download(id).await.unwrap();
        assert_eq!(download.content.filename, "payments.csv");
        assert_eq!(download.content.mime_type, "text/csv");
        assert_eq!(
            String::from_utf8(download.bytes).unwrap(),
            "id,amount\nC,10\nD,10\nA,10\nB,10\nE,10\nF,10\n"
        );

        let status = controller.status(id).await.unwrap();
        assert_eq!(status.state, SessionState::Ready);
        assert_eq!(status.record_count, 6);
        assert_eq!(status.chunks_received, 3);
        assert!(matches!(controller.download_archive(id).await, Err(ExportError::NotFound)));
        assert!(controller.download_shard(id, 0).await.is_ok());
        assert!(matches!(controller.download_shard(id, 1).await, Err(ExportError::NotFound)));
    }

    #[tokio::test]
    async fn test_in_order_and_out_of_order_outputs_match() {
        let dir = TempDir::new().unwrap();
        let controller = ExportSessionController::new(config(&dir)).unwrap();
        let chunks = [rows(&["A", "B"]), rows(&["C"]), rows(&["D", "E"])];

        let mut outputs = Vec::new();
        for order in [[0u32, 1, 2], [2, 0, 1]] {
            let id = controller
                .create_session(CreateExportRequest::new(ExportType::Participants, ExportFormat::Csv, 3, 5).with_base_name("p"))
                .await
                .unwrap()
                .export_id;
            for index in order {
                controller
                    .submit_chunk(id, index, chunks[index as usize].clone(), index == 2)
                    .await
                    .unwrap();
            }
            wait_ready(&controller, id).await;
            outputs.push(controller.download(id).await.unwrap().bytes);
        }
        assert_eq!(outputs[0], outputs[1]);
    }

    #[tokio::test]
    async fn test_download_before_ready_is_not_ready() {
        let dir = TempDir::new().unwrap();
        let controller = ExportSessionController::new(config(&dir)).unwrap();
        let id = controller
            .create_session(CreateExportRequest::new(ExportType::Ambassadors, ExportFormat::Csv, 2, 2))
            .await
            .unwrap()
            .export_id;

        assert!(matches!(
            controller.download(id).await,
            Err(ExportError::NotReady { state: SessionState::Created })
        ));
        controller.submit_chunk(id, 0, rows(&["A"]), false).await.unwrap();
        assert!(matches!(
            controller.download_shard(id, 0).await,
            Err(ExportError::NotReady { state: SessionState::Accumulating })
        ));
        assert!(matches!(controller.download(Uuid::new_v4()).await, Err(ExportError::NotFound)));
    }

    #[tokio::test]
    async fn test_duplicate_chunk_keeps_session_alive() {
        let dir = TempDir::new().unwrap();
        let controller = ExportSessionController::new(config(&dir)).unwrap();
        let id = controller
            .create_session(CreateExportRequest::new(ExportType::Payments, ExportFormat::Csv, 2, 2))
            .await
            .unwrap()
            .export_id;

        controller.submit_chunk(id, 0, rows(&["A"]), false).await.unwrap();
        let err = controller.submit_chunk(id, 0, rows(&["X"]), false).await.unwrap_err();
        assert!(matches!(err, ExportError::Validation(ValidationError::DuplicateChunk { index: 0 })));
        assert_eq!(err.http_status(), 409);

        controller.submit_chunk(id, 1, rows(&["B"]), true).await.unwrap();
        wait_ready(&controller, id).await;
        let body = String::from_utf8(controller.download(id).await.unwrap().bytes).unwrap();
        assert_eq!(body, "id,amount\nA,10\nB,10\n");
    }

    #[tokio::test]
    async fn test_schema_mismatch_fails_session_and_frees_files() {
        let dir = TempDir::new().unwrap();
        let controller = ExportSessionController::new(config(&dir)).unwrap();
        let id = controller
            .create_session(CreateExportRequest::new(ExportType::Payments, ExportFormat::Csv, 2, 2))
            .await
            .unwrap()
            .export_id;

        controller.submit_chunk(id, 0, rows(&["A"]), false).await.unwrap();
        assert!(controller.storage().exists(id).await);
        let bad = vec![json!({"other": 1}).as_object().cloned().unwrap()];
        controller.submit_chunk(id, 1, bad, true).await.unwrap_err();

        let status = controller.status(id).await.unwrap();
        assert_eq!(status.state, SessionState::Failed);
        assert_eq!(status.error.unwrap().kind, FailureKind::Validation);
        assert!(!controller.storage().exists(id).await);
        assert!(matches!(
            controller.download(id).await,
            Err(ExportError::NotReady { state: SessionState::Failed })
        ));
        assert!(matches!(
            controller.submit_chunk(id, 1, rows(&["B"]), true).await,
            Err(ExportError::Validation(ValidationError::IngestionClosed { state: SessionState::Failed }))
        ));
    }

    #[tokio::test]
    async fn test_multi_file_archive_and_shards() {
        let dir = TempDir::new().unwrap();
        let controller = ExportSessionController::new(ExportConfig {
            max_rows_per_shard: 2,
            ..config(&dir)
        })
        .unwrap();
        let id = controller
            .create_session(
                CreateExportRequest::new(ExportType::Participants, ExportFormat::Csv, 2, 5)
                    .with_record_width(10)
                    .with_base_name("people"),
            )
            .await
            .unwrap()
            .export_id;

        controller.submit_chunk(id, 0, rows(&["A", "B", "C"]), false).await.unwrap();
        controller.submit_chunk(id, 1, rows(&["D", "E"]), true).await.unwrap();
        wait_ready(&controller, id).await;

        let status = controller.status(id).await.unwrap();
        assert_eq!(status.strategy, ExportStrategy::MultiFile { rows_per_shard: 2 });
        assert_eq!(status.files.len(), 4);

        let archive = controller.download_archive(id).await.unwrap();
        assert_eq!(archive.content.filename, "people.zip");
        assert_eq!(archive.content.mime_type, "application/zip");
        let mut zip = zip::ZipArchive::new(std::io::Cursor::new(archive.bytes)).unwrap();
        let mut last = String::new();
        zip.by_name("people_part3of3.csv").unwrap().read_to_string(&mut last).unwrap();
        assert_eq!(last, "id,amount\nE,10\n");

        let shard = controller.download_shard(id, 1).await.unwrap();
        assert_eq!(shard.content.filename, "people_part2of3.csv");
        assert_eq!(String::from_utf8(shard.bytes).unwrap(), "id,amount\nC,10\nD,10\n");
        assert!(matches!(controller.download_shard(id, 3).await, Err(ExportError::NotFound)));

        let whole = controller.download(id).await.unwrap();
        assert_eq!(whole.content.filename, "people.zip");
    }

    #[tokio::test]
    async fn test_expired_export_is_not_found_and_released() {
        let dir = TempDir::new().unwrap();
        let controller = ExportSessionController::new(config(&dir)).unwrap();
        let id = controller
            .create_session(CreateExportRequest::new(ExportType::Payments, ExportFormat::Csv, 1, 1))
            .await
            .unwrap()
            .export_id;
        controller.submit_chunk(id, 0, rows(&["A"]), true).await.unwrap();
        wait_ready(&controller, id).await;
        assert!(controller.storage().exists(id).await);

        let report = controller.sweep_at(Utc::now() + chrono::Duration::hours(2)).await.unwrap();
        assert_eq!(report.expired, 1);
        assert!(matches!(controller.status(id).await, Err(ExportError::NotFound)));
        assert!(matches!(controller.download(id).await, Err(ExportError::NotFound)));
        assert!(!controller.storage().exists(id).await);
    }

    #[tokio::test]
    async fn test_ttl_counts_from_completion_not_creation() {
        let dir = TempDir::new().unwrap();
        let controller = ExportSessionController::new(ExportConfig {
            ttl: Duration::from_millis(300),
            ..config(&dir)
        })
        .unwrap();
        let request = CreateExportRequest::new(ExportType::Payments, ExportFormat::Csv, 3, 3);
        let created = controller.create_session(request.clone()).await.unwrap();
        let id = created.export_id;
        let idle = controller.create_session(request).await.unwrap().export_id;

        controller.submit_chunk(id, 0, rows(&["A"]), false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        controller.submit_chunk(id, 1, rows(&["B"]), false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Past the TTL, but still receiving chunks.
        let status = controller.status(id).await.unwrap();
        assert_eq!(status.state, SessionState::Accumulating);
        assert!(status.expires_at > created.created_at + chrono::Duration::minutes(5));
        assert_eq!(controller.status(idle).await.unwrap().state, SessionState::Created);

        controller.submit_chunk(id, 2, rows(&["C"]), true).await.unwrap();
        wait_ready(&controller, id).await;
        let status = controller.status(id).await.unwrap();
        assert_eq!(status.state, SessionState::Ready);
        assert!(status.expires_at <= Utc::now() + chrono::Duration::milliseconds(300));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(matches!(controller.status(id).await, Err(ExportError::NotFound)));
        assert!(matches!(controller.download(id).await, Err(ExportError::NotFound)));
        assert!(!controller.storage().exists(id).await);
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let dir = TempDir::new().unwrap();
        let controller = ExportSessionController::new(ExportConfig {
            max_concurrent_exports: 2,
            ..config(&dir)
        })
        .unwrap();
        let request = CreateExportRequest::new(ExportType::Payments, ExportFormat::Csv, 1, 1);

        controller.create_session(request.clone()).await.unwrap();
        controller.create_session(request.clone()).await.unwrap();
        let err = controller.create_session(request).await.unwrap_err();
        assert!(matches!(err, ExportError::CapacityExceeded { limit: 2 }));
        assert_eq!(err.http_status(), 429);
    }

    #[tokio::test]
    async fn test_cancel_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let controller = ExportSessionController::new(config(&dir)).unwrap();
        let request = CreateExportRequest::new(ExportType::Payments, ExportFormat::Csv, 2, 2);

        let id = controller.create_session(request.clone()).await.unwrap().export_id;
        controller.submit_chunk(id, 0, rows(&["A"]), false).await.unwrap();
        let status = controller.cancel(id, "user request").await.unwrap();
        assert_eq!(status.state, SessionState::Failed);
        assert_eq!(status.error.unwrap().kind, FailureKind::Cancelled);
        assert!(!controller.storage().exists(id).await);

        let other = controller.create_session(request).await.unwrap().export_id;
        controller.cleanup(other).await.unwrap();
        assert!(matches!(controller.status(other).await, Err(ExportError::NotFound)));
        assert!(matches!(controller.cleanup(other).await, Err(ExportError::NotFound)));
    }

    #[tokio::test]
    async fn test_inactive_session_times_out() {
        let dir = TempDir::new().unwrap();
        let controller = ExportSessionController::new(config(&dir)).unwrap();
        let id = controller
            .create_session(CreateExportRequest::new(ExportType::Payments, ExportFormat::Csv, 2, 2))
            .await
            .unwrap()
            .export_id;
        controller.submit_chunk(id, 0, rows(&["A"]), false).await.unwrap();

        let report = controller
            .sweep_at(Utc::now() + chrono::Duration::minutes(11))
            .await
            .unwrap();
        assert_eq!(report.timed_out, 1);
        let status = controller.status(id).await.unwrap();
        assert_eq!(status.state, SessionState::Failed);
        assert_eq!(status.error.unwrap().kind, FailureKind::Timeout);
    }

    #[tokio::test]
    async fn test_excel_single_file() {
        let dir = TempDir::new().unwrap();
        let controller = ExportSessionController::new(config(&dir)).unwrap();
        let id = controller
            .create_session(CreateExportRequest::new(ExportType::Ambassadors, ExportFormat::Excel, 1, 2).with_base_name("amb"))
            .await
            .unwrap()
            .export_id;
        controller.submit_chunk(id, 0, rows(&["A", "B"]), true).await.unwrap();
        wait_ready(&controller, id).await;

        let download = controller.download(id).await.unwrap();
        assert_eq!(download.content.filename, "amb.xlsx");
        assert_eq!(
            download.content.mime_type,
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
        );
        let mut book = zip::ZipArchive::new(std::io::Cursor::new(download.bytes)).unwrap();
        assert!(book.by_name("xl/worksheets/sheet1.xml").is_ok());
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let dir = TempDir::new().unwrap();
        let controller = ExportSessionController::new(ExportConfig {
            max_records_per_export: 10,
            ..config(&dir)
        })
        .unwrap();

        let zero = CreateExportRequest::new(ExportType::Payments, ExportFormat::Csv, 0, 1);
        assert!(matches!(
            controller.create_session(zero).await,
            Err(ExportError::Validation(ValidationError::InvalidRequest { .. }))
        ));
        let huge = CreateExportRequest::new(ExportType::Payments, ExportFormat::Csv, 1, 11);
        assert_eq!(controller.create_session(huge).await.unwrap_err().http_status(), 413);
        let unnamed = CreateExportRequest::new(ExportType::Payments, ExportFormat::Csv, 1, 1).with_base_name("///");
        assert!(controller.create_session(unnamed).await.is_err());
        assert_eq!(controller.stats().await.active, 0);
    }

    #[tokio::test]
    async fn test_byte_ceiling_packages_under_estimated_export() {
        let dir = TempDir::new().unwrap();
        let controller = ExportSessionController::new(ExportConfig {
            max_bytes_per_shard: 1_000,
            ..config(&dir)
        })
        .unwrap();
        let id = controller
            .create_session(
                CreateExportRequest::new(ExportType::Payments, ExportFormat::Csv, 1, 50)
                    .with_record_width(10)
                    .with_base_name("payments"),
            )
            .await
            .unwrap()
            .export_id;
        assert_eq!(controller.status(id).await.unwrap().strategy, ExportStrategy::SingleFile);

        let names: Vec<String> = (0..50).map(|i| format!("{:0>100}", i)).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        controller.submit_chunk(id, 0, rows(&names), true).await.unwrap();
        wait_ready(&controller, id).await;

        let status = controller.status(id).await.unwrap();
        assert!(status.strategy.is_multi_file());
        let shards: Vec<_> = status.files.iter().filter(|f| f.shard_index.is_some()).collect();
        assert!(shards.len() > 1);
        assert_eq!(shards.iter().map(|f| f.row_count).sum::<u64>(), 50);

        let archive = controller.download(id).await.unwrap();
        assert_eq!(archive.content.filename, "payments.zip");
        let first = controller.download_shard(id, 0).await.unwrap();
        assert!(first.bytes.len() < 1_000 + 110);
    }

    #[tokio::test]
    async fn test_write_failure_during_finalize_fails_export() {
        let dir = TempDir::new().unwrap();
        let controller = ExportSessionController::new(config(&dir)).unwrap();
        let id = controller
            .create_session(CreateExportRequest::new(ExportType::Payments, ExportFormat::Csv, 2, 2))
            .await
            .unwrap()
            .export_id;

        controller.submit_chunk(id, 0, rows(&["A"]), false).await.unwrap();
        std::fs::remove_dir_all(controller.storage().session_dir(id)).unwrap();
        controller.submit_chunk(id, 1, rows(&["B"]), true).await.unwrap();

        let mut handle = controller.subscribe(id).await.unwrap();
        let err = tokio::time::timeout(Duration::from_secs(10), handle.wait_for_completion())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Write);

        let status = controller.status(id).await.unwrap();
        assert_eq!(status.state, SessionState::Failed);
        assert_eq!(status.error.unwrap().kind, FailureKind::Write);
        assert!(status.files.is_empty());
        assert!(matches!(
            controller.download(id).await,
            Err(ExportError::NotReady { state: SessionState::Failed })
        ));
        assert!(!controller.storage().exists(id).await);
    }

    #[tokio::test]
    async fn test_damaged_shard_fails_archive_build() {
        let dir = TempDir::new().unwrap();
        let controller = ExportSessionController::new(ExportConfig {
            max_rows_per_shard: 2,
            ..config(&dir)
        })
        .unwrap();
        let id = controller
            .create_session(
                CreateExportRequest::new(ExportType::Participants, ExportFormat::Csv, 2, 3).with_record_width(10),
            )
            .await
            .unwrap()
            .export_id;

        controller.submit_chunk(id, 0, rows(&["A", "B"]), false).await.unwrap();
        let first_shard = ExportStorage::shard_path(&controller.storage().session_dir(id), 0, ExportFormat::Csv);
        assert!(first_shard.exists());
        std::fs::write(&first_shard, b"").unwrap();
        controller.submit_chunk(id, 1, rows(&["C"]), true).await.unwrap();

        let mut handle = controller.subscribe(id).await.unwrap();
        let err = tokio::time::timeout(Duration::from_secs(10), handle.wait_for_completion())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::ArchiveBuild);

        let status = controller.status(id).await.unwrap();
        assert_eq!(status.state, SessionState::Failed);
        assert_eq!(status.error.unwrap().kind, FailureKind::ArchiveBuild);
        assert!(matches!(
            controller.download_archive(id).await,
            Err(ExportError::NotReady { state: SessionState::Failed })
        ));
        assert!(!controller.storage().exists(id).await);
    }

    #[tokio::test]
    async fn test_reorder_overflow_fails_session_and_frees_files() {
        let dir = TempDir::new().unwrap();
        let controller = ExportSessionController::new(ExportConfig {
            reorder_buffer_chunks: 1,
            ..config(&dir)
        })
        .unwrap();
        let id = controller
            .create_session(CreateExportRequest::new(ExportType::Payments, ExportFormat::Csv, 4, 4))
            .await
            .unwrap()
            .export_id;

        controller.submit_chunk(id, 0, rows(&["A"]), false).await.unwrap();
        assert!(controller.storage().exists(id).await);
        let receipt = controller.submit_chunk(id, 2, rows(&["C"]), false).await.unwrap();
        assert_eq!(receipt.ack, ChunkAck::Buffered);

        let err = controller.submit_chunk(id, 3, rows(&["D"]), true).await.unwrap_err();
        assert!(matches!(err, ExportError::OutOfOrderOverflow { index: 3, expected: 1, .. }));

        let status = controller.status(id).await.unwrap();
        assert_eq!(status.state, SessionState::Failed);
        assert_eq!(status.error.unwrap().kind, FailureKind::OutOfOrderOverflow);
        assert!(!controller.storage().exists(id).await);
        assert!(matches!(
            controller.submit_chunk(id, 1, rows(&["B"]), false).await,
            Err(ExportError::Validation(ValidationError::IngestionClosed { state: SessionState::Failed }))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions_match_sequential_output() {
        let dir = TempDir::new().unwrap();
        let controller = ExportSessionController::new(config(&dir)).unwrap();
        let chunk = |index: u32| {
            let first = format!("{}a", index);
            let second = format!("{}b", index);
            rows(&[first.as_str(), second.as_str()])
        };
        let request = CreateExportRequest::new(ExportType::Participants, ExportFormat::Csv, 8, 16);

        let sequential = controller.create_session(request.clone()).await.unwrap().export_id;
        for index in 0..8 {
            controller
                .submit_chunk(sequential, index, chunk(index), index == 7)
                .await
                .unwrap();
        }

        let concurrent = controller.create_session(request).await.unwrap().export_id;
        let tasks = [5u32, 2, 7, 0, 3, 6, 1, 4].into_iter().map(|index| {
            let controller = controller.clone();
            let rows = chunk(index);
            tokio::spawn(async move { controller.submit_chunk(concurrent, index, rows, index == 7).await })
        });
        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        wait_ready(&controller, sequential).await;
        wait_ready(&controller, concurrent).await;
        let expected = controller.download(sequential).await.unwrap().bytes;
        let actual = controller.download(concurrent).await.unwrap().bytes;
        assert_eq!(actual, expected);
        assert_eq!(controller.status(concurrent).await.unwrap().record_count, 16);
    }
}
