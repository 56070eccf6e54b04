//! Dispatch workers: the `SURPLUS.claimed` consumer that creates delivery
//! orders, the 30 s batch ticker, and the per-order escalation timers that
//! guarantee no order starves.

use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::watch;

use foodmesh_core::dispatch::{DispatchEngine, OrderDraft};
use foodmesh_core::types::{
    DeliveryOrder, FulfillmentMethod, OutboxEvent, SlaTier, SurplusClaimedPayload,
};

use crate::broker::NatsBroker;

/// Arm the anti-starvation timer for an order. EXPRESS and CRITICAL skip
/// the wait and dispatch immediately; STANDARD/HEMAT get the five-minute
/// window to be picked up by a batch cycle first. `force_dispatch` is a
/// no-op for orders that were batched in the meantime, so firing late or
/// twice is harmless.
pub fn arm_escalation(engine: Arc<DispatchEngine>, order: &DeliveryOrder) {
    let order_id = order.id;
    let immediate = matches!(
        order.effective_tier,
        SlaTier::Express | SlaTier::Critical
    );
    let deadline = engine.escalation_deadline(order);

    tokio::spawn(async move {
        if !immediate {
            let wait = (deadline - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            tokio::time::sleep(wait).await;
        }
        match engine.force_dispatch(order_id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(order_id = %order_id, "escalation timer fired, nothing to do");
            }
            Err(err) => {
                tracing::error!(order_id = %order_id, error = %err, "force dispatch failed");
            }
        }
    });
}

/// Re-arm escalation timers for orders that were pending when the process
/// last stopped. Already-due orders force-dispatch on the spot.
pub async fn rearm_pending(engine: Arc<DispatchEngine>) {
    match engine.pending_orders().await {
        Ok(pending) => {
            let count = pending.len();
            for order in pending {
                arm_escalation(Arc::clone(&engine), &order);
            }
            if count > 0 {
                tracing::info!(count, "escalation timers re-armed after restart");
            }
        }
        Err(err) => {
            tracing::error!(error = %err, "pending-order scan failed on startup");
        }
    }
}

/// Consume `SURPLUS.claimed` and enqueue delivery orders for courier
/// fulfillments. Self-pickups need no dispatch.
pub async fn run_claimed_consumer(
    broker: NatsBroker,
    engine: Arc<DispatchEngine>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut subscriber = match broker.subscribe("SURPLUS.claimed").await {
        Ok(sub) => sub,
        Err(err) => {
            tracing::error!(error = %err, "claimed consumer failed to subscribe");
            return;
        }
    };
    tracing::info!("dispatch order consumer started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            message = subscriber.next() => {
                let Some(message) = message else { break };
                let event: OutboxEvent = match serde_json::from_slice(&message.payload) {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::error!(error = %err, "malformed event on SURPLUS.claimed");
                        continue;
                    }
                };
                let claimed: SurplusClaimedPayload = match serde_json::from_value(event.payload) {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::error!(event_id = %event.id, error = %err, "malformed claimed payload");
                        continue;
                    }
                };
                if claimed.method != FulfillmentMethod::Courier {
                    continue;
                }

                let draft = OrderDraft {
                    item_id: claimed.surplus_id,
                    pickup: claimed.pickup,
                    dropoff: claimed.dropoff,
                    expiry_time: claimed.expiry_time,
                    requested_tier: claimed.sla_tier,
                    quantity_kg: claimed.quantity_kg,
                };
                match engine.create_order(draft).await {
                    Ok(order) => arm_escalation(Arc::clone(&engine), &order),
                    Err(err) => {
                        tracing::error!(surplus_id = %claimed.surplus_id, error = %err, "order creation failed");
                    }
                }
            }
        }
    }
    tracing::info!("dispatch order consumer stopped");
}

/// Run the periodic batch cycle.
pub async fn run_ticker(
    engine: Arc<DispatchEngine>,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(interval_secs = interval.as_secs(), "batch ticker started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
        match engine.run_batch_cycle().await {
            Ok(0) => {}
            Ok(count) => tracing::info!(count, "batch cycle dispatched"),
            Err(err) => tracing::error!(error = %err, "batch cycle failed"),
        }
    }
    tracing::info!("batch ticker stopped");
}
