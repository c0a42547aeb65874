//! Sync engine: cache-first loading, refresh pipeline and remediation.
//!
//! - `SyncOrchestrator`: the caller-facing state machine
//! - `ServiceContext`: explicit wiring of token provider, gateway, cache and
//!   confirmer
//! - `SyncError`: failures reported to the presentation layer

pub mod context;
pub mod error;
pub mod orchestrator;
pub mod state;

pub use context::{Confirmer, ServiceContext};
pub use error::SyncError;
pub use orchestrator::{DataSource, LoadOutcome, RemediationOutcome, SyncOrchestrator, ViewData};
pub use state::{SyncProgress, SyncState};
