use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::config::ExportConfig;
use crate::domains::export::schema::RowSchema;
use crate::domains::export::types::{ExportFormat, OutputFile, RowRecord};
use crate::domains::export::writers::{StreamingCsvWriter, StreamingXlsxWriter};
use crate::errors::ExportResult;

/// Incremental writer for one output file
#[async_trait]
pub trait FormatWriter: Send {
    /// Append rows in order. Returns the cumulative number of bytes produced
    /// so far.
    async fn append(&mut self, rows: &[RowRecord]) -> ExportResult<u64>;

    /// Flush any buffered data
    async fn flush(&mut self) -> ExportResult<()>;

    /// Finish the file and move it to its destination
    async fn close(self: Box<Self>) -> ExportResult<OutputFile>;

    /// Drop the file without producing output
    async fn abort(self: Box<Self>);

    fn format(&self) -> ExportFormat;

    fn rows_written(&self) -> u64;
}

/// Writer factory for creating format-specific writers
pub struct WriterFactory;

impl WriterFactory {
    pub async fn open(
        format: ExportFormat,
        destination: &Path,
        shard_index: u32,
        schema: &RowSchema,
        config: &ExportConfig,
    ) -> ExportResult<Box<dyn FormatWriter>> {
        match format {
            ExportFormat::Csv => {
                let writer = StreamingCsvWriter::create(destination, shard_index, schema.clone(), config).await?;
                Ok(Box::new(writer))
            }
            ExportFormat::Excel => {
                let writer = StreamingXlsxWriter::create(destination, shard_index, schema.clone(), config).await?;
                Ok(Box::new(writer))
            }
        }
    }
}

/// In-progress destination file. Data goes to `<destination>.partial` and
/// only reaches `destination` through `commit`; any other exit removes it.
pub(crate) struct PartialFile {
    partial: PathBuf,
    destination: PathBuf,
    committed: bool,
}

impl PartialFile {
    pub(crate) fn new(destination: &Path) -> Self {
        let mut partial = destination.as_os_str().to_owned();
        partial.push(".partial");
        Self {
            partial: PathBuf::from(partial),
            destination: destination.to_path_buf(),
            committed: false,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.partial
    }

    pub(crate) fn destination(&self) -> &Path {
        &self.destination
    }

    pub(crate) async fn commit(mut self) -> std::io::Result<PathBuf> {
        tokio::fs::rename(&self.partial, &self.destination).await?;
        self.committed = true;
        Ok(self.destination.clone())
    }

    pub(crate) fn commit_blocking(mut self) -> std::io::Result<PathBuf> {
        std::fs::rename(&self.partial, &self.destination)?;
        self.committed = true;
        Ok(self.destination.clone())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = std::fs::remove_file(&self.partial) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Failed to remove partial file {}: {}", self.partial.display(), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_partial_file_removed_unless_committed() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.csv");

        let partial = PartialFile::new(&dest);
        tokio::fs::write(partial.path(), b"abc").await.unwrap();
        let partial_path = partial.path().to_path_buf();
        drop(partial);
        assert!(!partial_path.exists());
        assert!(!dest.exists());

        let partial = PartialFile::new(&dest);
        tokio::fs::write(partial.path(), b"abc").await.unwrap();
        let committed = partial.commit().await.unwrap();
        assert_eq!(committed, dest);
        assert_eq!(std::fs::read(&dest).unwrap(), b"abc");
    }
}
