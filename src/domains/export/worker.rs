use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time;

use crate::domains::export::service::ExportSessionController;
use crate::errors::ExportResult;

/// Background task that expires old exports and fails idle ones
pub struct ExportSweeper {
    controller: Arc<ExportSessionController>,
    period: Duration,
    shutdown_signal: Option<oneshot::Receiver<()>>,
}

impl ExportSweeper {
    pub fn new(controller: Arc<ExportSessionController>) -> Self {
        let period = controller.config().sweep_interval;
        Self {
            controller,
            period,
            shutdown_signal: None,
        }
    }

    /// Set shutdown signal receiver
    pub fn with_shutdown_signal(mut self, receiver: oneshot::Receiver<()>) -> Self {
        self.shutdown_signal = Some(receiver);
        self
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Start the sweep loop
    pub async fn start(mut self) -> ExportResult<()> {
        log::info!("Starting export sweeper (every {:?})", self.period);

        let mut interval = time::interval(self.period.max(Duration::from_millis(10)));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        let mut shutdown = self.shutdown_signal.take();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.controller.sweep().await {
                        log::error!("Export sweep failed: {:?}", e);
                    }
                }
                _ = async {
                    match shutdown.as_mut() {
                        Some(signal) => {
                            let _ = signal.await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    log::info!("Received shutdown signal, stopping export sweeper");
                    break;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExportConfig;
    use crate::domains::export::service::ExportSessionService;
    use crate::domains::export::types::{CreateExportRequest, ExportFormat, ExportType};
    use crate::errors::ExportError;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sweeper_evicts_and_stops_on_signal() {
        let dir = TempDir::new().unwrap();
        let controller = Arc::new(
            ExportSessionController::new(ExportConfig {
                storage_dir: dir.path().to_path_buf(),
                ttl: Duration::from_millis(20),
                ..ExportConfig::default()
            })
            .unwrap(),
        );
        let id = controller
            .create_session(CreateExportRequest::new(ExportType::Payments, ExportFormat::Csv, 1, 1))
            .await
            .unwrap()
            .export_id;
        let row = serde_json::json!({"id": 1}).as_object().cloned().unwrap();
        controller.submit_chunk(id, 0, vec![row], true).await.unwrap();
        let mut handle = controller.subscribe(id).await.unwrap();
        handle.wait_for_completion().await.unwrap();

        let (tx, rx) = oneshot::channel();
        let sweeper = ExportSweeper::new(controller.clone())
            .with_period(Duration::from_millis(20))
            .with_shutdown_signal(rx);
        let handle = tokio::spawn(sweeper.start());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(controller.stats().await.active, 0);
        assert!(matches!(controller.status(id).await, Err(ExportError::NotFound)));

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
