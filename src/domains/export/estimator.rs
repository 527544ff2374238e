use serde::{Deserialize, Serialize};

use crate::config::ExportConfig;
use crate::domains::export::schema::encoded_width;
use crate::domains::export::types::{ExportFormat, ExportStrategy, RowRecord};

/// Predicted output size and the layout recommended for it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeEstimate {
    pub predicted_bytes: u64,
    pub strategy: ExportStrategy,
    pub shard_count: u64,
}

/// Decides between single-file and multi-file output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeEstimator {
    max_bytes_per_shard: u64,
    max_rows_per_shard: u64,
}

impl SizeEstimator {
    pub fn new(max_bytes_per_shard: u64, max_rows_per_shard: u64) -> Self {
        Self {
            max_bytes_per_shard: max_bytes_per_shard.max(1),
            max_rows_per_shard: max_rows_per_shard.max(1),
        }
    }

    /// Estimator whose row ceiling also respects the format's own limit.
    pub fn for_format(config: &ExportConfig, format: ExportFormat) -> Self {
        let rows = match format.row_ceiling() {
            Some(ceiling) => config.max_rows_per_shard.min(ceiling),
            None => config.max_rows_per_shard,
        };
        Self::new(config.max_bytes_per_shard, rows)
    }

    pub fn estimate(&self, total_records: u64, avg_record_width_bytes: u64) -> SizeEstimate {
        let predicted_bytes = total_records.saturating_mul(avg_record_width_bytes);

        if predicted_bytes <= self.max_bytes_per_shard && total_records <= self.max_rows_per_shard {
            return SizeEstimate {
                predicted_bytes,
                strategy: ExportStrategy::SingleFile,
                shard_count: 1,
            };
        }

        let shards_by_bytes = div_ceil(predicted_bytes, self.max_bytes_per_shard).max(1);
        let rows_per_shard = self
            .max_rows_per_shard
            .min(div_ceil(total_records, shards_by_bytes))
            .max(1);

        SizeEstimate {
            predicted_bytes,
            strategy: ExportStrategy::MultiFile { rows_per_shard },
            shard_count: div_ceil(total_records, rows_per_shard),
        }
    }

    /// Average encoded width of a sample of rows, or `None` for an empty
    /// sample.
    pub fn sample_width(rows: &[RowRecord]) -> Option<u64> {
        if rows.is_empty() {
            return None;
        }
        let total: u64 = rows.iter().map(encoded_width).sum();
        Some(div_ceil(total, rows.len() as u64))
    }
}

fn div_ceil(value: u64, divisor: u64) -> u64 {
    if divisor == 0 {
        return value;
    }
    value / divisor + u64::from(value % divisor != 0)
}
