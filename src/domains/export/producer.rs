use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::domains::export::service::ExportSessionService;
use crate::domains::export::types::{CreateExportRequest, ExportFormat, ExportId, ExportStatus, ExportType, RowRecord};
use crate::errors::{ExportError, ExportResult};

/// Where a producer pulls rows from
#[async_trait]
pub trait ExportDataSource: Send + Sync {
    fn total_records(&self) -> u64;

    fn total_chunks(&self) -> u32;

    /// Rows of chunk `index`. Called once per index, in ascending order.
    async fn fetch_chunk(&self, index: u32) -> ExportResult<Vec<RowRecord>>;

    /// Average encoded row width, when the source knows it up front.
    fn record_width_hint(&self) -> Option<u64> {
        None
    }
}

/// Rows already in memory, split into fixed-size chunks
pub struct VecDataSource {
    rows: Vec<RowRecord>,
    chunk_size: usize,
}

impl VecDataSource {
    pub fn new(rows: Vec<RowRecord>, chunk_size: usize) -> Self {
        Self {
            rows,
            chunk_size: chunk_size.max(1),
        }
    }
}

#[async_trait]
impl ExportDataSource for VecDataSource {
    fn total_records(&self) -> u64 {
        self.rows.len() as u64
    }

    fn total_chunks(&self) -> u32 {
        (self.rows.len().div_ceil(self.chunk_size)).max(1) as u32
    }

    async fn fetch_chunk(&self, index: u32) -> ExportResult<Vec<RowRecord>> {
        let start = index as usize * self.chunk_size;
        if start >= self.rows.len() {
            return Ok(Vec::new());
        }
        let end = (start + self.chunk_size).min(self.rows.len());
        Ok(self.rows[start..end].to_vec())
    }
}

/// Chunks arriving from a stream, with totals declared up front
pub struct StreamDataSource {
    total_records: u64,
    total_chunks: u32,
    inner: Mutex<StreamState>,
}

struct StreamState {
    stream: BoxStream<'static, ExportResult<Vec<RowRecord>>>,
    next_index: u32,
}

impl StreamDataSource {
    pub fn new(
        stream: BoxStream<'static, ExportResult<Vec<RowRecord>>>,
        total_records: u64,
        total_chunks: u32,
    ) -> Self {
        Self {
            total_records,
            total_chunks,
            inner: Mutex::new(StreamState { stream, next_index: 0 }),
        }
    }
}

#[async_trait]
impl ExportDataSource for StreamDataSource {
    fn total_records(&self) -> u64 {
        self.total_records
    }

    fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    async fn fetch_chunk(&self, index: u32) -> ExportResult<Vec<RowRecord>> {
        let mut state = self.inner.lock().await;
        if index != state.next_index {
            return Err(ExportError::Source(format!(
                "stream can only serve chunk {}, asked for {}",
                state.next_index, index
            )));
        }
        let chunk = state
            .stream
            .next()
            .await
            .ok_or_else(|| ExportError::Source(format!("stream ended before chunk {}", index)))??;
        state.next_index += 1;
        Ok(chunk)
    }
}

/// Producer started for one export
pub struct ProducerRun {
    pub status: ExportStatus,
    /// Resolves to the number of rows pushed.
    pub task: JoinHandle<ExportResult<u64>>,
}

/// Drives a data source through the regular session contract, so the
/// single-shot export path and the chunked path behave the same.
#[derive(Clone)]
pub struct ExportProducer {
    service: Arc<dyn ExportSessionService>,
}

impl ExportProducer {
    pub fn new(service: Arc<dyn ExportSessionService>) -> Self {
        Self { service }
    }

    /// Create a session sized from `source` and push its chunks in the
    /// background.
    pub async fn start(
        &self,
        export_type: ExportType,
        format: ExportFormat,
        base_name: Option<String>,
        source: Arc<dyn ExportDataSource>,
    ) -> ExportResult<ProducerRun> {
        let mut request = CreateExportRequest::new(export_type, format, source.total_chunks(), source.total_records());
        request.base_name = base_name;
        request.avg_record_width = source.record_width_hint();

        let status = self.service.create_session(request).await?;
        let service = self.service.clone();
        let task = tokio::spawn(pump(service, status.export_id, source));

        Ok(ProducerRun { status, task })
    }
}

async fn pump(
    service: Arc<dyn ExportSessionService>,
    export_id: ExportId,
    source: Arc<dyn ExportDataSource>,
) -> ExportResult<u64> {
    let total = source.total_chunks();
    let mut pushed = 0u64;

    for index in 0..total {
        let rows = match source.fetch_chunk(index).await {
            Ok(rows) => rows,
            Err(e) => {
                let error = match e {
                    ExportError::Source(_) => e,
                    other => ExportError::Source(other.to_string()),
                };
                log::error!("Export {}: data source failed at chunk {}: {}", export_id, index, error);
                if let Err(abort_err) = service.abort(export_id, error.clone()).await {
                    log::warn!("Export {}: could not abort after source failure: {}", export_id, abort_err);
                }
                return Err(error);
            }
        };

        let count = rows.len() as u64;
        service.submit_chunk(export_id, index, rows, index + 1 == total).await?;
        pushed += count;
    }

    log::debug!("Export {}: producer pushed {} rows in {} chunks", export_id, pushed, total);
    Ok(pushed)
}
