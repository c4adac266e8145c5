//! Sentora - off-chain sentiment oracle pipeline.
//!
//! Harvests public text from social and news sources, scores it into
//! per-asset sentiment with calibrated confidence, screens for coordinated
//! manipulation, and commits the surviving scores to an EVM oracle contract
//! under nonce, rate-limit, and circuit-breaker discipline.

pub mod chain;
pub mod collect;
pub mod config;
pub mod error;
pub mod ledger;
pub mod manipulation;
pub mod metrics;
pub mod pipeline;
pub mod score;
pub mod types;

// Re-export the main types for convenience
pub use config::{CohortConfig, Credentials, PipelineConfig};
pub use error::PipelineError;
pub use types::{Asset, AssetSample, Item, ScoredItem, Source, SubmissionJob};
