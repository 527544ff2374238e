use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::config::ExportConfig;
use crate::domains::export::schema::RowSchema;
use crate::domains::export::types::{ExportFormat, OutputFile, RowRecord};
use crate::domains::export::writer::{FormatWriter, PartialFile};
use crate::errors::{ExportError, ExportResult};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Streaming CSV writer. Rows are encoded into a bounded buffer and flushed
/// to disk whenever it grows past the configured size.
pub struct StreamingCsvWriter {
    inner: BufWriter<File>,
    partial: PartialFile,
    shard_index: u32,
    schema: RowSchema,
    delimiter: u8,
    flush_bytes: usize,
    buffer: Vec<u8>,
    hasher: Sha256,
    bytes_encoded: u64,
    rows_written: u64,
}

impl StreamingCsvWriter {
    pub async fn create(
        destination: &Path,
        shard_index: u32,
        schema: RowSchema,
        config: &ExportConfig,
    ) -> ExportResult<Self> {
        let partial = PartialFile::new(destination);
        let file = File::create(partial.path())
            .await
            .map_err(|e| ExportError::Write(format!("Failed to create CSV file {}: {}", partial.path().display(), e)))?;

        let mut writer = Self {
            inner: BufWriter::new(file),
            partial,
            shard_index,
            schema,
            delimiter: config.csv_delimiter,
            flush_bytes: config.writer_flush_bytes,
            buffer: Vec::with_capacity(config.writer_flush_bytes),
            hasher: Sha256::new(),
            bytes_encoded: 0,
            rows_written: 0,
        };

        // Add UTF-8 BOM for Excel compatibility
        if config.csv_bom {
            writer.buffer.extend_from_slice(UTF8_BOM);
            writer.bytes_encoded += UTF8_BOM.len() as u64;
        }
        if !writer.schema.is_empty() {
            let headers: Vec<String> = writer.schema.columns().to_vec();
            writer.encode_record(headers)?;
        }

        Ok(writer)
    }

    fn encode_record<I>(&mut self, fields: I) -> ExportResult<()>
    where
        I: IntoIterator<Item = String>,
    {
        let before = self.buffer.len();
        {
            let mut wtr = csv::WriterBuilder::new()
                .delimiter(self.delimiter)
                .has_headers(false)
                .from_writer(&mut self.buffer);
            wtr.write_record(fields.into_iter())?;
            wtr.flush()?;
        }
        self.bytes_encoded += (self.buffer.len() - before) as u64;
        Ok(())
    }

    async fn drain_buffer(&mut self) -> ExportResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.hasher.update(&self.buffer);
        self.inner
            .write_all(&self.buffer)
            .await
            .map_err(|e| ExportError::Write(format!("CSV write failed: {}", e)))?;
        self.buffer.clear();
        Ok(())
    }
}

#[async_trait]
impl FormatWriter for StreamingCsvWriter {
    async fn append(&mut self, rows: &[RowRecord]) -> ExportResult<u64> {
        for row in rows {
            let fields: Vec<String> = self
                .schema
                .project(row)
                .map_err(|e| ExportError::Write(format!("Row does not fit the CSV header: {}", e)))?
                .iter()
                .map(|cell| cell.to_text())
                .collect();
            self.encode_record(fields)?;
            self.rows_written += 1;

            if self.buffer.len() >= self.flush_bytes {
                self.drain_buffer().await?;
            }
        }

        Ok(self.bytes_encoded)
    }

    async fn flush(&mut self) -> ExportResult<()> {
        self.drain_buffer().await?;
        self.inner
            .flush()
            .await
            .map_err(|e| ExportError::Write(format!("CSV flush failed: {}", e)))?;
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> ExportResult<OutputFile> {
        self.flush().await?;
        self.inner.get_ref().sync_all().await?;

        let StreamingCsvWriter {
            inner,
            partial,
            shard_index,
            hasher,
            rows_written,
            ..
        } = *self;
        drop(inner);

        let path = partial.commit().await?;
        let size_bytes = tokio::fs::metadata(&path).await?.len();

        log::debug!("CSV shard {} closed: {} rows, {} bytes", shard_index, rows_written, size_bytes);

        Ok(OutputFile {
            shard_index,
            path,
            format: ExportFormat::Csv,
            size_bytes,
            row_count: rows_written,
            checksum: Some(hex::encode(hasher.finalize())),
        })
    }

    async fn abort(self: Box<Self>) {
        log::debug!("Aborting CSV shard {} at {}", self.shard_index, self.partial.destination().display());
    }

    fn format(&self) -> ExportFormat {
        ExportFormat::Csv
    }

    fn rows_written(&self) -> u64 {
        self.rows_written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn rows(values: serde_json::Value) -> Vec<RowRecord> {
        values
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    fn config(bom: bool) -> ExportConfig {
        ExportConfig {
            csv_bom: bom,
            writer_flush_bytes: 16,
            ..ExportConfig::default()
        }
    }

    #[tokio::test]
    async fn test_writes_header_and_rows_in_schema_order() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("shard_0000.csv");
        let data = rows(json!([
            {"id": 1, "name": "Ada, Countess", "active": true},
            {"name": "Bob", "id": 2, "active": null}
        ]));
        let schema = RowSchema::from_row(&data[0]);

        let mut writer = StreamingCsvWriter::create(&dest, 0, schema, &config(false)).await.unwrap();
        let bytes = writer.append(&data).await.unwrap();
        assert!(bytes > 0);
        assert!(!dest.exists());

        let output = Box::new(writer).close().await.unwrap();
        let contents = std::fs::read_to_string(&dest).unwrap();
        assert_eq!(contents, "id,name,active\n1,\"Ada, Countess\",true\n2,Bob,\n");
        assert_eq!(output.row_count, 2);
        assert_eq!(output.size_bytes, contents.len() as u64);
        assert_eq!(output.checksum.as_deref().map(str::len), Some(64));
    }

    #[tokio::test]
    async fn test_bom_prefix() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.csv");
        let data = rows(json!([{"a": "x"}]));
        let mut writer = StreamingCsvWriter::create(&dest, 0, RowSchema::from_row(&data[0]), &config(true))
            .await
            .unwrap();
        writer.append(&data).await.unwrap();
        Box::new(writer).close().await.unwrap();

        let bytes = std::fs::read(&dest).unwrap();
        assert!(bytes.starts_with(UTF8_BOM));
    }

    #[tokio::test]
    async fn test_text_is_written_as_given() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.csv");
        let data = rows(json!([{"note": "1\u{00A0}000 \u{2028}next"}]));
        let mut writer = StreamingCsvWriter::create(&dest, 0, RowSchema::from_row(&data[0]), &config(false))
            .await
            .unwrap();
        writer.append(&data).await.unwrap();
        Box::new(writer).close().await.unwrap();

        let contents = std::fs::read_to_string(&dest).unwrap();
        assert_eq!(contents, "note\n1\u{00A0}000 \u{2028}next\n");
    }

    #[tokio::test]
    async fn test_abort_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.csv");
        let data = rows(json!([{"a": 1}, {"a": 2}]));
        let mut writer = StreamingCsvWriter::create(&dest, 0, RowSchema::from_row(&data[0]), &config(false))
            .await
            .unwrap();
        writer.append(&data).await.unwrap();
        Box::new(writer).abort().await;

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_mismatched_row_is_a_write_error() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.csv");
        let schema = RowSchema::from_row(&rows(json!([{"a": 1}]))[0]);
        let mut writer = StreamingCsvWriter::create(&dest, 0, schema, &config(false)).await.unwrap();

        let err = writer.append(&rows(json!([{"b": 1}]))).await.unwrap_err();
        assert!(matches!(err, ExportError::Write(_)));
    }
}
