// Public modules
pub mod config;
pub mod domains;
pub mod errors;
pub mod globals;

pub use config::ExportConfig;
pub use domains::export::{
    CreateExportRequest, ExportDataSource, ExportFormat, ExportHandle, ExportId, ExportProducer, ExportSessionController,
    ExportSessionService, ExportStatus, ExportType, RowRecord, SessionState,
};
pub use errors::{ExportError, ExportResult};

/// Set up `env_logger`, defaulting `RUST_LOG` to `debug` in debug builds and
/// `info` otherwise. Does nothing if a logger is already installed.
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        #[cfg(debug_assertions)]
        std::env::set_var("RUST_LOG", "debug");
        #[cfg(not(debug_assertions))]
        std::env::set_var("RUST_LOG", "info");
    }

    let _ = env_logger::try_init();
}

/// Initialize logging and the export pipeline from `EXPORT_*` environment
/// variables (and `.env`, when present).
pub async fn initialize_from_env() -> ExportResult<()> {
    init_logging();
    let config = ExportConfig::from_env()?;
    log::debug!("Export storage directory: {}", config.storage_dir.display());
    globals::initialize(config).await
}
