pub mod accumulator;
pub mod archive;
pub mod estimator;
pub mod producer;
pub mod schema;
pub mod service;
pub mod session;
pub mod storage;
pub mod store;
pub mod types;
pub mod worker;
pub mod writer;
pub mod writers;

pub use accumulator::ChunkAccumulator;
pub use archive::ArchiveBuilder;
pub use estimator::{SizeEstimate, SizeEstimator};
pub use producer::{ExportDataSource, ExportProducer, ProducerRun, StreamDataSource, VecDataSource};
pub use schema::RowSchema;
pub use service::{ExportSessionController, ExportSessionService, SweepReport};
pub use session::{ExportHandle, SessionProgress};
pub use storage::ExportStorage;
pub use store::{ExportStore, StoreStats};
pub use types::*;
pub use worker::ExportSweeper;
pub use writer::{FormatWriter, WriterFactory};
pub use writers::{StreamingCsvWriter, StreamingXlsxWriter};
