//! Core library for fleetcache.
//!
//! Loads the managed-device fleet of a tenant, enriches it with compliance
//! detail and owner locations, and keeps it in a two-tier cache so that
//! warm starts are instant.
//!
//! Modules:
//! - `auth`: single-flight credential broker, OAuth flows, encrypted token cache
//! - `api`: the `DeviceGateway` port and its Graph client
//! - `enrich`: bounded-concurrency enrichment and country normalization
//! - `cache`: memory + disk cache with 24 hour expiry
//! - `sync`: the orchestrator and its service context
//! - `models`: device records and derived datasets
//! - `config`: configuration file and environment overrides

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod enrich;
pub mod models;
pub mod sync;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use sync::{
    Confirmer, DataSource, LoadOutcome, RemediationOutcome, ServiceContext, SyncError,
    SyncOrchestrator, SyncProgress, SyncState, ViewData,
};
