//! Environment-driven configuration. Startup fails (non-zero exit) when a
//! required variable is missing or malformed.

use std::time::Duration;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub nats_url: String,
    pub bind_addr: String,
    pub propagator_interval: Duration,
    pub propagator_batch_size: i64,
    pub dispatch_tick: Duration,
    pub fanout_radius_m: f64,
    pub shed_threshold: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("FOODMESH_DATABASE_URL")
            .context("FOODMESH_DATABASE_URL must be set")?;
        let nats_url =
            std::env::var("FOODMESH_NATS_URL").context("FOODMESH_NATS_URL must be set")?;
        let bind_addr =
            std::env::var("FOODMESH_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into());

        let propagator_interval = Duration::from_millis(parse_or(
            "FOODMESH_PROPAGATOR_INTERVAL_MS",
            1_000,
        )?);
        let propagator_batch_size = parse_or("FOODMESH_PROPAGATOR_BATCH_SIZE", 50)? as i64;
        let dispatch_tick = Duration::from_secs(parse_or("FOODMESH_DISPATCH_TICK_SECS", 30)?);
        let fanout_radius_m = parse_or("FOODMESH_FANOUT_RADIUS_M", 500)? as f64;
        let shed_threshold =
            Duration::from_millis(parse_or("FOODMESH_SHED_THRESHOLD_MS", 500)?);

        if fanout_radius_m < 0.0 {
            bail!("FOODMESH_FANOUT_RADIUS_M must be non-negative");
        }

        Ok(Self {
            database_url,
            nats_url,
            bind_addr,
            propagator_interval,
            propagator_batch_size,
            dispatch_tick,
            fanout_radius_m,
            shed_threshold,
        })
    }
}

fn parse_or(var: &str, default: u64) -> Result<u64> {
    match std::env::var(var) {
        Ok(value) => value
            .parse::<u64>()
            .with_context(|| format!("{var} must be a non-negative integer, got {value:?}")),
        Err(_) => Ok(default),
    }
}
