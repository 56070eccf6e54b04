//! NATS integration: JetStream-backed event sink for the propagator plus
//! plain subscriptions for the worker consumers, and the broker-side
//! routing oracle.

use async_nats::jetstream::{self, stream};
use async_nats::ConnectOptions;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

use foodmesh_core::geo::GeoPoint;
use foodmesh_core::ports::{DistanceOracle, EventSink, Result};
use foodmesh_core::CoreError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const STREAM_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Streams provisioned at startup, one per subject family.
const STREAMS: &[&str] = &["SURPLUS", "MATCHING", "DELIVERY", "AUTH", "ESCROW"];

#[derive(Clone)]
pub struct NatsBroker {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl NatsBroker {
    /// Connect and idempotently provision the event streams: 24 h
    /// retention, file-backed, work-queue semantics.
    pub async fn connect(url: &str, name: &str) -> anyhow::Result<Self> {
        tracing::info!(url, "connecting to NATS");
        let client = ConnectOptions::new()
            .name(name)
            .connection_timeout(CONNECT_TIMEOUT)
            .connect(url)
            .await?;
        let jetstream = jetstream::new(client.clone());

        for stream_name in STREAMS {
            jetstream
                .get_or_create_stream(stream::Config {
                    name: (*stream_name).to_string(),
                    subjects: vec![format!("{stream_name}.*")],
                    max_age: STREAM_MAX_AGE,
                    storage: stream::StorageType::File,
                    retention: stream::RetentionPolicy::WorkQueue,
                    ..Default::default()
                })
                .await
                .map_err(|e| anyhow::anyhow!("stream {stream_name} provisioning failed: {e}"))?;
        }
        tracing::info!("NATS streams provisioned");

        Ok(Self { client, jetstream })
    }

    pub async fn subscribe(&self, subject: &str) -> Result<async_nats::Subscriber> {
        self.client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| CoreError::UpstreamUnavailable(format!("subscribe {subject}: {e}")))
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }
}

#[async_trait]
impl EventSink for NatsBroker {
    async fn publish(&self, subject: &str, correlation_id: Uuid, payload: Bytes) -> Result<()> {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("correlation-id", correlation_id.to_string());

        let ack = self
            .jetstream
            .publish_with_headers(subject.to_string(), headers, payload)
            .await
            .map_err(|e| CoreError::UpstreamUnavailable(format!("publish {subject}: {e}")))?;
        ack.await
            .map_err(|e| CoreError::UpstreamUnavailable(format!("ack {subject}: {e}")))?;
        Ok(())
    }
}

// ── Routing oracle ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TravelTimeReply {
    distance_km: f64,
}

/// External routing collaborator reached over the broker's
/// request/response plane. Wrapped by `ResilientDistanceOracle`, which
/// owns the 200 ms deadline and the haversine fallback.
pub struct NatsRoutingOracle {
    client: async_nats::Client,
}

impl NatsRoutingOracle {
    pub const SUBJECT: &'static str = "ROUTING.travel_time";

    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DistanceOracle for NatsRoutingOracle {
    async fn distance_km(&self, from: GeoPoint, to: GeoPoint) -> Result<f64> {
        let request = serde_json::json!({
            "from": { "lat": from.lat, "lon": from.lon },
            "to": { "lat": to.lat, "lon": to.lon },
        });
        let payload = Bytes::from(serde_json::to_vec(&request).map_err(|e| anyhow::anyhow!(e))?);
        let reply = self
            .client
            .request(Self::SUBJECT.to_string(), payload)
            .await
            .map_err(|e| CoreError::UpstreamUnavailable(format!("routing request: {e}")))?;
        let reply: TravelTimeReply = serde_json::from_slice(&reply.payload)
            .map_err(|e| CoreError::UpstreamUnavailable(format!("routing reply: {e}")))?;
        Ok(reply.distance_km)
    }
}
