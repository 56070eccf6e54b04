//! Expiry sweeper: flips due items to expired so `surplus.expired` always
//! follows `surplus.posted` for items nobody claimed.

use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use foodmesh_core::claim::ClaimService;

pub async fn run_expiry_sweeper(
    claims: Arc<ClaimService>,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(interval_secs = interval.as_secs(), "expiry sweeper started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
        if let Err(err) = claims.expire_due(Uuid::new_v4()).await {
            tracing::error!(error = %err, "expiry sweep failed");
        }
    }
    tracing::info!("expiry sweeper stopped");
}
