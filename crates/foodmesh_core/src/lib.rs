//! foodmesh_core — domain types, capability ports and subsystem logic for
//! the foodmesh marketplace engine.
//!
//! Everything here is storage- and transport-agnostic: the Postgres
//! adapters live in `foodmesh_postgres`, the HTTP/broker surface in
//! `foodmesh_server`. Components receive their stores, publishers and
//! oracles as constructor-injected trait objects; there are no hidden
//! singletons.

pub mod breaker;
pub mod claim;
pub mod dispatch;
pub mod error;
pub mod fanout;
pub mod geo;
pub mod ledger;
pub mod ports;
pub mod shed;
pub mod types;

pub use error::CoreError;
