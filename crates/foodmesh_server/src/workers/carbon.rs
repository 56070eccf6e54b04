//! Carbon worker: consumes `DELIVERY.completed` and appends the impact
//! entry to the hash-chained ledger.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::watch;

use foodmesh_core::ledger::LedgerService;
use foodmesh_core::types::{DeliveryCompletedPayload, OutboxEvent};

use crate::broker::NatsBroker;

pub async fn run_carbon_consumer(
    broker: NatsBroker,
    ledger: Arc<LedgerService>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut subscriber = match broker.subscribe("DELIVERY.completed").await {
        Ok(sub) => sub,
        Err(err) => {
            tracing::error!(error = %err, "carbon consumer failed to subscribe");
            return;
        }
    };
    tracing::info!("carbon ledger worker started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            message = subscriber.next() => {
                let Some(message) = message else { break };
                let event: OutboxEvent = match serde_json::from_slice(&message.payload) {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::error!(error = %err, "malformed event on DELIVERY.completed");
                        continue;
                    }
                };
                let completed: DeliveryCompletedPayload = match serde_json::from_value(event.payload) {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::error!(event_id = %event.id, error = %err, "malformed delivery payload");
                        continue;
                    }
                };

                match ledger
                    .record(
                        &completed.vendor_id,
                        completed.order_id,
                        completed.category,
                        completed.weight_kg,
                    )
                    .await
                {
                    Ok(hash) => {
                        tracing::info!(
                            order_id = %completed.order_id,
                            vendor = completed.vendor_id,
                            hash,
                            "carbon impact recorded"
                        );
                    }
                    Err(err) => {
                        tracing::error!(order_id = %completed.order_id, error = %err, "ledger append failed");
                    }
                }
            }
        }
    }
    tracing::info!("carbon ledger worker stopped");
}
