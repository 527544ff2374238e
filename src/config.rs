use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{ExportError, ExportResult};

/// Runtime limits and defaults for the export pipeline
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Root directory holding one sub-directory per export.
    pub storage_dir: PathBuf,
    /// How long a ready or failed export is kept.
    pub ttl: Duration,
    /// A session without a chunk for this long is failed by the sweeper.
    pub inactivity_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_concurrent_exports: usize,
    /// Chunks that may wait for a lower index before the session fails.
    pub reorder_buffer_chunks: usize,
    pub max_bytes_per_shard: u64,
    pub max_rows_per_shard: u64,
    /// Record width assumed until the first chunk has been sampled.
    pub default_record_width: u64,
    pub max_records_per_export: u64,
    /// When at capacity, evict the oldest ready/failed session instead of
    /// refusing the new one.
    pub reclaim_completed_on_pressure: bool,
    pub csv_delimiter: u8,
    /// Prefix CSV files with a UTF-8 BOM so Excel picks the right encoding.
    pub csv_bom: bool,
    pub writer_flush_bytes: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            storage_dir: env::temp_dir().join("chunked_exports"),
            ttl: Duration::from_secs(60 * 60),
            inactivity_timeout: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(60),
            max_concurrent_exports: 32,
            reorder_buffer_chunks: 16,
            max_bytes_per_shard: 50_000_000,
            max_rows_per_shard: 1_000_000,
            default_record_width: 256,
            max_records_per_export: 10_000_000,
            reclaim_completed_on_pressure: false,
            csv_delimiter: b',',
            csv_bom: true,
            writer_flush_bytes: 64 * 1024,
        }
    }
}

impl ExportConfig {
    /// Build a config from `EXPORT_*` environment variables, reading a `.env`
    /// file first when one is present. Unset variables keep their defaults.
    pub fn from_env() -> ExportResult<Self> {
        dotenv::dotenv().ok();

        let mut config = Self::default();

        if let Ok(dir) = env::var("EXPORT_STORAGE_DIR") {
            config.storage_dir = PathBuf::from(dir);
        }
        if let Some(secs) = read_var::<u64>("EXPORT_TTL_SECS")? {
            config.ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = read_var::<u64>("EXPORT_INACTIVITY_TIMEOUT_SECS")? {
            config.inactivity_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = read_var::<u64>("EXPORT_SWEEP_INTERVAL_SECS")? {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(v) = read_var("EXPORT_MAX_CONCURRENT")? {
            config.max_concurrent_exports = v;
        }
        if let Some(v) = read_var("EXPORT_REORDER_BUFFER")? {
            config.reorder_buffer_chunks = v;
        }
        if let Some(v) = read_var("EXPORT_MAX_BYTES_PER_SHARD")? {
            config.max_bytes_per_shard = v;
        }
        if let Some(v) = read_var("EXPORT_MAX_ROWS_PER_SHARD")? {
            config.max_rows_per_shard = v;
        }
        if let Some(v) = read_var("EXPORT_DEFAULT_RECORD_WIDTH")? {
            config.default_record_width = v;
        }
        if let Some(v) = read_var("EXPORT_MAX_RECORDS")? {
            config.max_records_per_export = v;
        }
        if let Some(v) = read_var("EXPORT_RECLAIM_COMPLETED")? {
            config.reclaim_completed_on_pressure = v;
        }
        if let Some(v) = read_var("EXPORT_CSV_BOM")? {
            config.csv_bom = v;
        }
        if let Some(v) = read_var("EXPORT_WRITER_FLUSH_BYTES")? {
            config.writer_flush_bytes = v;
        }
        if let Ok(delimiter) = env::var("EXPORT_CSV_DELIMITER") {
            config.csv_delimiter = match delimiter.as_bytes() {
                [b] if b.is_ascii() => *b,
                _ => {
                    return Err(ExportError::InvalidConfig(format!(
                        "EXPORT_CSV_DELIMITER must be a single ASCII character, got '{}'",
                        delimiter
                    )))
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ExportResult<()> {
        let checks: [(&str, bool); 6] = [
            ("max_concurrent_exports", self.max_concurrent_exports == 0),
            ("reorder_buffer_chunks", self.reorder_buffer_chunks == 0),
            ("max_bytes_per_shard", self.max_bytes_per_shard == 0),
            ("max_rows_per_shard", self.max_rows_per_shard == 0),
            ("max_records_per_export", self.max_records_per_export == 0),
            ("writer_flush_bytes", self.writer_flush_bytes == 0),
        ];
        if let Some((field, _)) = checks.iter().find(|(_, is_zero)| *is_zero) {
            return Err(ExportError::InvalidConfig(format!("{} must be greater than zero", field)));
        }
        if matches!(self.csv_delimiter, b'"' | b'\n' | b'\r') {
            return Err(ExportError::InvalidConfig("csv_delimiter cannot be a quote or newline".to_string()));
        }
        Ok(())
    }

    pub fn ttl_chrono(&self) -> chrono::Duration {
        to_chrono(self.ttl)
    }

    pub fn inactivity_chrono(&self) -> chrono::Duration {
        to_chrono(self.inactivity_timeout)
    }

    /// Lifetime of an unfinished export past its last activity.
    pub fn keep_alive_chrono(&self) -> chrono::Duration {
        self.ttl_chrono().max(self.inactivity_chrono())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

fn read_var<T: FromStr>(name: &str) -> ExportResult<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ExportError::InvalidConfig(format!("{} has an invalid value: '{}'", name, raw))),
        Err(_) => Ok(None),
    }
}
