use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::ExportConfig;
use crate::domains::export::estimator::SizeEstimator;
use crate::domains::export::schema::RowSchema;
use crate::domains::export::storage::ExportStorage;
use crate::domains::export::types::{ChunkAck, ExportFormat, ExportId, ExportStrategy, OutputFile, RowRecord, SessionState};
use crate::domains::export::writer::{FormatWriter, WriterFactory};
use crate::errors::{ExportError, ExportResult, ValidationError};

/// Writes rows into numbered shard files, rolling over to a new file every
/// `rows_per_shard` rows or once a file reaches `max_bytes_per_shard`.
pub(crate) struct ShardSink {
    export_id: ExportId,
    format: ExportFormat,
    storage: ExportStorage,
    config: Arc<ExportConfig>,
    dir: Option<PathBuf>,
    schema: RowSchema,
    rows_per_shard: Option<u64>,
    max_bytes_per_shard: u64,
    current: Option<Box<dyn FormatWriter>>,
    current_bytes: u64,
    next_shard: u32,
    closed: Vec<OutputFile>,
}

impl ShardSink {
    pub(crate) fn new(export_id: ExportId, format: ExportFormat, storage: ExportStorage, config: Arc<ExportConfig>) -> Self {
        Self {
            export_id,
            format,
            storage,
            max_bytes_per_shard: config.max_bytes_per_shard.max(1),
            config,
            dir: None,
            schema: RowSchema::empty(),
            rows_per_shard: format.row_ceiling(),
            current: None,
            current_bytes: 0,
            next_shard: 0,
            closed: Vec::new(),
        }
    }

    /// Fix the layout before the first byte is written.
    pub(crate) fn configure(&mut self, schema: RowSchema, strategy: ExportStrategy) {
        self.schema = schema;
        self.rows_per_shard = match (strategy.rows_per_shard(), self.format.row_ceiling()) {
            (Some(rows), Some(ceiling)) => Some(rows.min(ceiling)),
            (Some(rows), None) => Some(rows),
            (None, ceiling) => ceiling,
        };
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.closed.iter().map(|f| f.size_bytes).sum::<u64>() + self.current_bytes
    }

    async fn open_next(&mut self) -> ExportResult<()> {
        let dir = match &self.dir {
            Some(dir) => dir.clone(),
            None => {
                let dir = self.storage.create_session_dir(self.export_id).await?;
                self.dir = Some(dir.clone());
                dir
            }
        };

        let shard_index = self.next_shard;
        let destination = ExportStorage::shard_path(&dir, shard_index, self.format);
        let writer = WriterFactory::open(self.format, &destination, shard_index, &self.schema, &self.config).await?;
        log::debug!("Export {}: opened shard {}", self.export_id, shard_index);

        self.current = Some(writer);
        self.current_bytes = 0;
        self.next_shard += 1;
        Ok(())
    }

    async fn close_current(&mut self) -> ExportResult<()> {
        if let Some(writer) = self.current.take() {
            let file = writer.close().await?;
            self.current_bytes = 0;
            self.closed.push(file);
        }
        Ok(())
    }

    fn current_rows(&self) -> u64 {
        self.current.as_ref().map_or(0, |w| w.rows_written())
    }

    /// Rows that still fit in the open shard. The byte budget is sized from
    /// the shard's average row so far, so a fresh shard takes one row first.
    fn room(&self) -> u64 {
        let rows = self.current_rows();
        let by_rows = self
            .rows_per_shard
            .map_or(u64::MAX, |limit| limit.saturating_sub(rows));
        let by_bytes = match rows {
            0 => 1,
            _ => {
                let average = (self.current_bytes / rows).max(1);
                self.max_bytes_per_shard.saturating_sub(self.current_bytes) / average
            }
        };
        by_rows.min(by_bytes).max(1)
    }

    fn is_full(&self) -> bool {
        let rows_full = self
            .rows_per_shard
            .map_or(false, |limit| self.current_rows() >= limit);
        rows_full || self.current_bytes >= self.max_bytes_per_shard
    }

    pub(crate) async fn write(&mut self, rows: &[RowRecord]) -> ExportResult<()> {
        let mut remaining = rows;
        while !remaining.is_empty() {
            if self.current.is_none() {
                self.open_next().await?;
            }
            let take = usize::try_from(self.room()).unwrap_or(usize::MAX).min(remaining.len());
            let (batch, rest) = remaining.split_at(take);

            let Some(writer) = self.current.as_mut() else {
                return Err(ExportError::Write("shard writer is not open".to_string()));
            };
            self.current_bytes = writer.append(batch).await?;
            remaining = rest;

            if self.is_full() {
                self.close_current().await?;
            }
        }
        Ok(())
    }

    /// Close the open shard and return every file in shard order. An export
    /// without rows still yields one (header-only) file.
    pub(crate) async fn finish(&mut self) -> ExportResult<Vec<OutputFile>> {
        self.close_current().await?;
        if self.closed.is_empty() {
            self.open_next().await?;
            self.close_current().await?;
        }
        Ok(std::mem::take(&mut self.closed))
    }

    pub(crate) async fn abort(&mut self) {
        if let Some(writer) = self.current.take() {
            writer.abort().await;
        }
        self.current_bytes = 0;
    }
}

/// Assembles the chunks of one export in index order.
///
/// Chunks ahead of the next expected index wait in a bounded reorder buffer;
/// everything else goes straight to the shard sink.
pub struct ChunkAccumulator {
    export_id: ExportId,
    total_chunks: u32,
    expected_records: u64,
    next_index: u32,
    pending: BTreeMap<u32, Vec<RowRecord>>,
    reorder_limit: usize,
    record_limit: u64,
    records_accepted: u64,
    records_written: u64,
    estimator: SizeEstimator,
    strategy: ExportStrategy,
    strategy_locked: bool,
    schema: Option<RowSchema>,
    sink: ShardSink,
}

impl ChunkAccumulator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        export_id: ExportId,
        format: ExportFormat,
        total_chunks: u32,
        expected_records: u64,
        strategy: ExportStrategy,
        strategy_locked: bool,
        storage: ExportStorage,
        config: Arc<ExportConfig>,
    ) -> Self {
        Self {
            export_id,
            total_chunks,
            expected_records,
            next_index: 0,
            pending: BTreeMap::new(),
            reorder_limit: config.reorder_buffer_chunks,
            record_limit: config.max_records_per_export,
            records_accepted: 0,
            records_written: 0,
            estimator: SizeEstimator::for_format(&config, format),
            strategy,
            strategy_locked,
            schema: None,
            sink: ShardSink::new(export_id, format, storage, config),
        }
    }

    pub fn strategy(&self) -> ExportStrategy {
        self.strategy
    }

    /// Chunks accepted so far, buffered ones included.
    pub fn chunks_received(&self) -> u32 {
        self.next_index + self.pending.len() as u32
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.sink.bytes_written()
    }

    pub fn buffered_chunks(&self) -> usize {
        self.pending.len()
    }

    pub fn is_complete(&self) -> bool {
        self.next_index >= self.total_chunks
    }

    pub fn schema(&self) -> Option<&RowSchema> {
        self.schema.as_ref()
    }

    fn is_duplicate(&self, index: u32) -> bool {
        index < self.next_index || self.pending.contains_key(&index)
    }

    /// Accept one chunk. Rejections that leave the export intact come back
    /// as validation errors with `fails_session() == false`.
    pub async fn submit(&mut self, index: u32, rows: Vec<RowRecord>, is_last: bool) -> ExportResult<ChunkAck> {
        if self.is_complete() {
            return Err(ValidationError::IngestionClosed {
                state: SessionState::Finalizing,
            }
            .into());
        }
        if index >= self.total_chunks {
            return Err(ValidationError::ChunkIndexOutOfRange {
                index,
                total: self.total_chunks,
            }
            .into());
        }
        if is_last != (index + 1 == self.total_chunks) {
            return Err(ValidationError::LastChunkMismatch {
                index,
                is_last,
                total: self.total_chunks,
            }
            .into());
        }
        if self.is_duplicate(index) {
            return Err(ValidationError::DuplicateChunk { index }.into());
        }

        if let Some(schema) = &self.schema {
            schema.validate_chunk(&rows, index)?;
        }
        let accepted = self.records_accepted.saturating_add(rows.len() as u64);
        if accepted > self.record_limit {
            return Err(ValidationError::RecordLimitExceeded {
                limit: self.record_limit,
            }
            .into());
        }

        if index != self.next_index {
            if self.pending.len() >= self.reorder_limit {
                return Err(ExportError::OutOfOrderOverflow {
                    index,
                    expected: self.next_index,
                    buffered: self.pending.len(),
                    limit: self.reorder_limit,
                });
            }
            self.records_accepted = accepted;
            self.pending.insert(index, rows);
            log::debug!(
                "Export {}: buffered chunk {} while waiting for {} ({} buffered)",
                self.export_id,
                index,
                self.next_index,
                self.pending.len()
            );
            return Ok(ChunkAck::Buffered);
        }

        self.records_accepted = accepted;
        self.apply(index, rows).await?;
        while let Some(rows) = self.pending.remove(&self.next_index) {
            self.apply(self.next_index, rows).await?;
        }

        if self.is_complete() {
            Ok(ChunkAck::Complete)
        } else {
            Ok(ChunkAck::Applied)
        }
    }

    async fn apply(&mut self, index: u32, rows: Vec<RowRecord>) -> ExportResult<()> {
        if !rows.is_empty() {
            if self.schema.is_none() {
                let schema = RowSchema::from_row(&rows[0]);
                self.refine_strategy(&rows);
                self.sink.configure(schema.clone(), self.strategy);
                self.schema = Some(schema);
            }
            if let Some(schema) = &self.schema {
                schema.validate_chunk(&rows, index)?;
            }
            self.sink.write(&rows).await?;
            self.records_written += rows.len() as u64;
        }
        self.next_index = index + 1;
        Ok(())
    }

    fn refine_strategy(&mut self, sample: &[RowRecord]) {
        if self.strategy_locked {
            return;
        }
        if let Some(width) = SizeEstimator::sample_width(sample) {
            let estimate = self.estimator.estimate(self.expected_records, width);
            if estimate.strategy != self.strategy {
                log::info!(
                    "Export {}: sampled width {} bytes, strategy {:?} -> {:?}",
                    self.export_id,
                    width,
                    self.strategy,
                    estimate.strategy
                );
            }
            self.strategy = estimate.strategy;
        }
        self.strategy_locked = true;
    }

    /// Close the writers once every chunk is in. Returns the shard files in
    /// order. A single-file export that outgrew the byte ceiling or its
    /// format's row ceiling comes back as several files and is promoted to
    /// multi-file.
    pub async fn finish(&mut self) -> ExportResult<Vec<OutputFile>> {
        if !self.is_complete() {
            return Err(ExportError::NotReady {
                state: SessionState::Accumulating,
            });
        }
        if self.schema.is_none() {
            self.sink.configure(RowSchema::empty(), self.strategy);
        }
        let files = self.sink.finish().await?;
        if files.len() > 1 && !self.strategy.is_multi_file() {
            let rows_per_shard = files.first().map(|f| f.row_count).unwrap_or(1).max(1);
            log::info!(
                "Export {}: output split into {} files, switching to multi-file",
                self.export_id,
                files.len()
            );
            self.strategy = ExportStrategy::MultiFile { rows_per_shard };
        }
        Ok(files)
    }

    /// Drop buffered chunks and discard the open shard.
    pub async fn abort(&mut self) {
        self.pending.clear();
        self.sink.abort().await;
    }
}
