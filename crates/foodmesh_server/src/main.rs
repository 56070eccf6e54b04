//! foodmesh server entry point.
//!
//! Reads config from env vars (see `config.rs`), wires the Postgres
//! stores, the NATS broker and the in-process geo/courier indexes into
//! the core services, spawns the background workers and serves the HTTP
//! surface. Exits non-zero on any startup failure.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio::sync::watch;

use foodmesh_core::breaker::{CircuitBreaker, ResilientDistanceOracle};
use foodmesh_core::claim::{ClaimConfig, ClaimService};
use foodmesh_core::dispatch::{DispatchConfig, DispatchEngine};
use foodmesh_core::fanout::{FanoutConfig, FanoutNotifier};
use foodmesh_core::ledger::LedgerService;
use foodmesh_core::ports::{
    CourierDirectory, DistanceOracle, EventSink, GeoIndex, OutboxStore, PushGateway, SurplusStore,
};
use foodmesh_core::shed::LoadShedder;
use foodmesh_postgres::PgStores;
use foodmesh_server::broker::{NatsBroker, NatsRoutingOracle};
use foodmesh_server::config::Config;
use foodmesh_server::couriers::MemoryCourierDirectory;
use foodmesh_server::geo_index::MemoryGeoIndex;
use foodmesh_server::propagator::{Propagator, PropagatorConfig};
use foodmesh_server::router::build_router;
use foodmesh_server::state::AppState;
use foodmesh_server::workers;

/// Push gateway publishing per-recipient notification subjects on the
/// broker; the mobile edge fans them out to devices.
struct BrokerPushGateway {
    broker: NatsBroker,
}

#[async_trait::async_trait]
impl PushGateway for BrokerPushGateway {
    async fn push(
        &self,
        recipient_id: &str,
        title: &str,
        body: &str,
    ) -> foodmesh_core::ports::Result<()> {
        let payload = serde_json::json!({ "title": title, "body": body });
        let bytes = bytes::Bytes::from(
            serde_json::to_vec(&payload).map_err(|e| anyhow::anyhow!(e))?,
        );
        self.broker
            .client()
            .publish(format!("PUSH.{recipient_id}"), bytes)
            .await
            .map_err(|e| {
                foodmesh_core::CoreError::UpstreamUnavailable(format!("push publish: {e}"))
            })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,foodmesh_server=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    tracing::info!("connected to database");

    let broker = NatsBroker::connect(&config.nats_url, "foodmesh-server").await?;

    // Port implementations. Outbox and surplus stores are shared between
    // the HTTP services and the background loops.
    let stores = PgStores::new(pool.clone());
    let surplus: Arc<dyn SurplusStore> = Arc::new(stores.surplus);
    let outbox: Arc<dyn OutboxStore> = Arc::new(stores.outbox);
    let dispatch_store = Arc::new(stores.dispatch);
    let ledger_store = Arc::new(stores.ledger);

    let geo: Arc<dyn GeoIndex> = Arc::new(MemoryGeoIndex::default());
    let couriers: Arc<dyn CourierDirectory> = Arc::new(MemoryCourierDirectory::new());
    let sink: Arc<dyn EventSink> = Arc::new(broker.clone());
    let push: Arc<dyn PushGateway> = Arc::new(BrokerPushGateway {
        broker: broker.clone(),
    });

    // External routing behind the breaker; haversine when it misbehaves.
    let routing: Arc<dyn DistanceOracle> = Arc::new(ResilientDistanceOracle::new(
        Arc::new(NatsRoutingOracle::new(broker.client().clone())),
        Arc::new(CircuitBreaker::new(3, std::time::Duration::from_secs(10))),
    ));

    // Core services.
    let claims = Arc::new(ClaimService::new(
        Arc::clone(&surplus),
        Arc::clone(&routing),
        ClaimConfig::default(),
    ));
    let dispatch = Arc::new(DispatchEngine::new(
        dispatch_store,
        Arc::clone(&couriers),
        DispatchConfig::default(),
    ));
    let ledger = Arc::new(LedgerService::new(ledger_store));
    let shedder = Arc::new(LoadShedder::new(config.shed_threshold));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Fan-out notifier and its consumers.
    let fanout = Arc::new(FanoutNotifier::new(
        Arc::clone(&geo),
        push,
        Arc::clone(&outbox),
        FanoutConfig {
            radius_m: config.fanout_radius_m,
            ..FanoutConfig::default()
        },
        shutdown_rx.clone(),
    ));

    // Outbox propagator.
    let propagator = Propagator::new(
        Arc::clone(&outbox),
        sink,
        PropagatorConfig {
            interval: config.propagator_interval,
            batch_size: config.propagator_batch_size,
            ..PropagatorConfig::default()
        },
    );
    tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { propagator.run(shutdown).await }
    });

    tokio::spawn(workers::notifier::run_posted_consumer(
        broker.clone(),
        Arc::clone(&fanout),
        shutdown_rx.clone(),
    ));
    tokio::spawn(workers::notifier::run_rematch_consumer(
        broker.clone(),
        Arc::clone(&claims),
        Arc::clone(&fanout),
        shutdown_rx.clone(),
    ));
    tokio::spawn(workers::dispatch::run_claimed_consumer(
        broker.clone(),
        Arc::clone(&dispatch),
        shutdown_rx.clone(),
    ));
    tokio::spawn(workers::dispatch::run_ticker(
        Arc::clone(&dispatch),
        config.dispatch_tick,
        shutdown_rx.clone(),
    ));
    tokio::spawn(workers::carbon::run_carbon_consumer(
        broker.clone(),
        Arc::clone(&ledger),
        shutdown_rx.clone(),
    ));
    tokio::spawn(workers::sweeper::run_expiry_sweeper(
        Arc::clone(&claims),
        config.dispatch_tick,
        shutdown_rx.clone(),
    ));

    // Escalation timers for orders that were pending at last shutdown.
    workers::dispatch::rearm_pending(Arc::clone(&dispatch)).await;

    let state = AppState {
        claims,
        dispatch,
        ledger,
        geo,
        couriers,
        shedder,
        db: Some(pool),
    };
    let app = build_router(state);

    let listener = TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = config.bind_addr, "foodmesh server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    Ok(())
}
