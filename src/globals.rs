use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::ExportConfig;
use crate::domains::export::service::ExportSessionController;
use crate::domains::export::worker::ExportSweeper;
use crate::errors::{ExportError, ExportResult};

struct SweeperHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<ExportResult<()>>,
}

// Global state definitions
static INIT_MUTEX: Lazy<tokio::sync::Mutex<()>> = Lazy::new(|| tokio::sync::Mutex::new(()));
static INITIALIZED: AtomicBool = AtomicBool::new(false);

static EXPORT_CONTROLLER: Lazy<Mutex<Option<Arc<ExportSessionController>>>> = Lazy::new(|| Mutex::new(None));
static SWEEPER: Lazy<Mutex<Option<SweeperHandle>>> = Lazy::new(|| Mutex::new(None));

/// Build the export controller and start its sweeper. Safe to call more
/// than once; later calls are no-ops. Must run inside a Tokio runtime.
pub async fn initialize(config: ExportConfig) -> ExportResult<()> {
    // Acquire the async mutex to ensure single initialization
    let _guard = INIT_MUTEX.lock().await;

    if INITIALIZED.load(Ordering::Acquire) {
        return Ok(());
    }

    let controller = Arc::new(ExportSessionController::new(config)?);
    match controller.storage().purge_tombstones().await {
        Ok(0) => {}
        Ok(n) => log::info!("Removed {} export directories left from a previous run", n),
        Err(e) => log::warn!("Could not clean export storage on startup: {}", e),
    }

    let (shutdown, receiver) = oneshot::channel();
    let sweeper = ExportSweeper::new(controller.clone()).with_shutdown_signal(receiver);
    let task = tokio::spawn(async move {
        let result = sweeper.start().await;
        if let Err(e) = &result {
            log::error!("Export sweeper exited: {:?}", e);
        }
        result
    });

    *EXPORT_CONTROLLER
        .lock()
        .map_err(|_| ExportError::InvalidConfig("EXPORT_CONTROLLER lock poisoned".to_string()))? = Some(controller);
    *SWEEPER
        .lock()
        .map_err(|_| ExportError::InvalidConfig("SWEEPER lock poisoned".to_string()))? = Some(SweeperHandle { shutdown, task });

    INITIALIZED.store(true, Ordering::Release);
    log::info!("Export pipeline initialized");
    Ok(())
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

pub fn get_export_controller() -> ExportResult<Arc<ExportSessionController>> {
    EXPORT_CONTROLLER
        .lock()
        .map_err(|_| ExportError::InvalidConfig("EXPORT_CONTROLLER lock poisoned".to_string()))?
        .clone()
        .ok_or_else(|| ExportError::InvalidConfig("Export controller not initialized".to_string()))
}

/// Stop the sweeper and drop the controller. Exports in flight keep their
/// files until the next `initialize` cleans the storage directory.
pub async fn shutdown() -> ExportResult<()> {
    let _guard = INIT_MUTEX.lock().await;

    let sweeper = SWEEPER
        .lock()
        .map_err(|_| ExportError::InvalidConfig("SWEEPER lock poisoned".to_string()))?
        .take();
    if let Some(SweeperHandle { shutdown, task }) = sweeper {
        let _ = shutdown.send(());
        match task.await {
            Ok(result) => result?,
            Err(e) => log::warn!("Export sweeper task ended abnormally: {}", e),
        }
    }

    EXPORT_CONTROLLER
        .lock()
        .map_err(|_| ExportError::InvalidConfig("EXPORT_CONTROLLER lock poisoned".to_string()))?
        .take();
    INITIALIZED.store(false, Ordering::Release);
    log::info!("Export pipeline shut down");
    Ok(())
}
