//! Periodic purge of expired trash.
//!
//! Started once at boot and owned by `main`; `shutdown` cancels the loop and
//! waits for an in-flight sweep to finish.

use crate::services::{drive_service::DriveService, trash::PurgeSummary};
use chrono::Utc;
use std::time::Duration;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct ExpirySweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ExpirySweeper {
    /// Spawn the sweep loop. The first sweep runs immediately.
    pub fn spawn(service: DriveService, every: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        run_once(&service).await;
                    }
                }
            }
            info!("expiry sweeper stopped");
        });

        info!("expiry sweeper started, interval {:?}", every);
        Self { cancel, handle }
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            error!("expiry sweeper task failed: {}", err);
        }
    }
}

async fn run_once(service: &DriveService) -> Option<PurgeSummary> {
    match service.trash().sweep_expired(Utc::now()).await {
        Ok(summary) => {
            if summary.files_purged > 0 || summary.folders_purged > 0 {
                info!(
                    "sweep purged {} files and {} folders, reclaimed {} bytes",
                    summary.files_purged, summary.folders_purged, summary.bytes_reclaimed
                );
            }
            Some(summary)
        }
        Err(err) => {
            error!("expired trash sweep failed: {}", err);
            None
        }
    }
}
