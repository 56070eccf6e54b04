//! Broker consumers for the geo-fanout notifier: the `SURPLUS.posted`
//! subscription and the `MATCHING.rematch` retry path.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::watch;

use foodmesh_core::claim::ClaimService;
use foodmesh_core::fanout::FanoutNotifier;
use foodmesh_core::types::{OutboxEvent, RematchPayload, SurplusPostedPayload};

use crate::broker::NatsBroker;

pub async fn run_posted_consumer(
    broker: NatsBroker,
    fanout: Arc<FanoutNotifier>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut subscriber = match broker.subscribe("SURPLUS.posted").await {
        Ok(sub) => sub,
        Err(err) => {
            tracing::error!(error = %err, "posted consumer failed to subscribe");
            return;
        }
    };
    tracing::info!("surplus notifier started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            message = subscriber.next() => {
                let Some(message) = message else { break };
                let event: OutboxEvent = match serde_json::from_slice(&message.payload) {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::error!(error = %err, "malformed event on SURPLUS.posted");
                        continue;
                    }
                };
                let posted: SurplusPostedPayload = match serde_json::from_value(event.payload) {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::error!(event_id = %event.id, error = %err, "malformed posted payload");
                        continue;
                    }
                };
                if let Err(err) = fanout
                    .handle_posted(&posted, event.correlation_id, &[])
                    .await
                {
                    tracing::error!(surplus_id = %posted.surplus_id, error = %err, "fanout failed");
                }
            }
        }
    }
    tracing::info!("surplus notifier stopped");
}

/// Re-runs the fan-out for a surplus whose primary recipients were
/// unreachable, excluding them.
pub async fn run_rematch_consumer(
    broker: NatsBroker,
    claims: Arc<ClaimService>,
    fanout: Arc<FanoutNotifier>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut subscriber = match broker.subscribe("MATCHING.rematch").await {
        Ok(sub) => sub,
        Err(err) => {
            tracing::error!(error = %err, "rematch consumer failed to subscribe");
            return;
        }
    };
    tracing::info!("rematch worker started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            message = subscriber.next() => {
                let Some(message) = message else { break };
                let event: OutboxEvent = match serde_json::from_slice(&message.payload) {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::error!(error = %err, "malformed event on MATCHING.rematch");
                        continue;
                    }
                };
                let rematch: RematchPayload = match serde_json::from_value(event.payload) {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::error!(event_id = %event.id, error = %err, "malformed rematch payload");
                        continue;
                    }
                };

                // Re-read the aggregate rather than trusting the payload
                // for item state; only still-available items are re-fanned.
                let item = match claims.get(rematch.surplus_id).await {
                    Ok(item) => item,
                    Err(err) => {
                        tracing::warn!(surplus_id = %rematch.surplus_id, error = %err, "rematch skipped");
                        continue;
                    }
                };
                if item.status != foodmesh_core::types::SurplusStatus::Available {
                    tracing::debug!(surplus_id = %item.id, "rematch skipped: no longer available");
                    continue;
                }

                let posted = SurplusPostedPayload {
                    surplus_id: item.id,
                    provider_id: item.provider_id.clone(),
                    lat: item.location.lat,
                    lon: item.location.lon,
                    quantity_kg: item.quantity_kg,
                    category: item.category,
                    expiry_time: item.expiry_time,
                };
                if let Err(err) = fanout
                    .handle_posted(&posted, event.correlation_id, &rematch.excluded_recipients)
                    .await
                {
                    tracing::error!(surplus_id = %item.id, error = %err, "rematch fanout failed");
                }
            }
        }
    }
    tracing::info!("rematch worker stopped");
}
