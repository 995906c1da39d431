//! Background task that drains the queue when nudged or when backoff expires.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::engine::SyncEngine;

pub struct SyncWorker {
    engine: Arc<SyncEngine>,
    notify: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SyncWorker {
    /// Spawn the worker on the current tokio runtime. It makes one drain
    /// attempt right away, as a page load would.
    pub fn spawn(engine: Arc<SyncEngine>) -> Self {
        let notify = Arc::new(Notify::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        notify.notify_one();
        let handle = tokio::spawn(run(engine.clone(), notify.clone(), shutdown_rx));
        Self {
            engine,
            notify,
            shutdown,
            handle,
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Ask for an opportunistic drain. Coalesces with any pending nudge.
    pub fn nudge(&self) {
        self.notify.notify_one();
    }

    /// Connectivity came back: forget the backoff and drain right away.
    pub async fn network_recovered(&self) {
        info!("Network recovered, retrying pending operations");
        self.engine.reset_backoff().await;
        self.nudge();
    }

    /// Stop the worker, letting a drain in progress finish first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Sync worker ended abnormally");
        }
    }
}

async fn run(engine: Arc<SyncEngine>, notify: Arc<Notify>, mut shutdown: watch::Receiver<bool>) {
    debug!("Sync worker started");
    loop {
        let wait = async {
            match engine.retry_after().await {
                Some(at) => {
                    let delay = (at - Utc::now()).to_std().unwrap_or_default();
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => notify.notified().await,
            }
        };

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = wait => {}
        }

        match engine.trigger().await {
            Ok(report) => {
                if !report.delivered.is_empty() || !report.purged.is_empty() {
                    debug!(
                        delivered = report.delivered.len(),
                        purged = report.purged.len(),
                        "Background drain finished"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Background drain failed"),
        }
    }
    debug!("Sync worker stopped");
}
