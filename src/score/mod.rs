//! Sentiment scoring: ensemble model plus per-asset aggregation.

pub mod aggregate;
pub mod lexicon;
pub mod scorer;

pub use aggregate::Aggregator;
pub use lexicon::LexiconModel;
pub use scorer::{EnsembleScorer, ModelPrediction, RemoteClassifier, SentimentModel};
