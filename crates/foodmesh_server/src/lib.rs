//! foodmesh_server — HTTP surface, NATS integration and background
//! workers for the foodmesh marketplace engine.

pub mod broker;
pub mod config;
pub mod couriers;
pub mod error;
pub mod geo_index;
pub mod handlers;
pub mod middleware;
pub mod propagator;
pub mod router;
pub mod state;
pub mod workers;
