//! Secondary lookups that complete a freshly listed device set.
//!
//! - `EnrichmentPipeline`: compliance detail and owner location under a
//!   bounded worker pool
//! - `normalize_country`: canonical English country names

pub mod country;
pub mod pipeline;

pub use country::normalize_country;
pub use pipeline::{EnrichmentPipeline, EnrichmentReport, DEFAULT_CONCURRENCY, LOCATION_ERROR_PREFIX};
