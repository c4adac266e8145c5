//! Ensemble sentiment scorer.
//!
//! Fuses an opaque primary classifier (served over HTTP) with the
//! deterministic lexicon fallback. When the primary fails, the fallback
//! carries the item alone at reduced confidence; the cycle never stalls on
//! model availability.

use crate::score::lexicon::LexiconModel;
use crate::types::{Item, ScoredItem};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Confidence multiplier applied when the primary model is unavailable.
const DEGRADED_CONFIDENCE_FACTOR: f64 = 0.6;

/// Raw prediction from a single model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrediction {
    /// Polarity in [-1, 1].
    pub polarity: f64,
    /// Confidence in [0, 1].
    pub confidence: f64,
}

/// An opaque sentiment model. The pipeline treats the primary as a black
/// box: text in, (polarity, confidence) out, errors mean degraded mode.
#[async_trait]
pub trait SentimentModel: Send + Sync {
    fn name(&self) -> &str;
    async fn predict(&self, text: &str) -> anyhow::Result<ModelPrediction>;
}

/// HTTP client for a served transformer classifier.
pub struct RemoteClassifier {
    client: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct InferenceRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct InferenceResponse {
    /// "positive" | "negative" | "neutral"
    label: String,
    /// Model confidence in [0, 1].
    score: f64,
}

impl RemoteClassifier {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self { client, url: url.into() }
    }
}

#[async_trait]
impl SentimentModel for RemoteClassifier {
    fn name(&self) -> &str {
        "transformer-remote"
    }

    async fn predict(&self, text: &str) -> anyhow::Result<ModelPrediction> {
        let response = self
            .client
            .post(&self.url)
            .timeout(Duration::from_secs(5))
            .json(&InferenceRequest { text })
            .send()
            .await?
            .error_for_status()?;
        let parsed: InferenceResponse = response.json().await?;
        let confidence = parsed.score.clamp(0.0, 1.0);
        let polarity = match parsed.label.as_str() {
            "positive" => confidence,
            "negative" => -confidence,
            _ => 0.0,
        };
        Ok(ModelPrediction { polarity, confidence })
    }
}

/// Ensemble of primary classifier and lexicon fallback.
pub struct EnsembleScorer {
    primary: Option<Arc<dyn SentimentModel>>,
    fallback: LexiconModel,
    primary_weight: f64,
    degraded_count: AtomicU64,
}

impl EnsembleScorer {
    pub fn new(primary: Option<Arc<dyn SentimentModel>>, primary_weight: f64) -> Self {
        Self {
            primary,
            fallback: LexiconModel::new(),
            primary_weight: primary_weight.clamp(0.0, 1.0),
            degraded_count: AtomicU64::new(0),
        }
    }

    /// Items scored without the primary model since startup.
    pub fn degraded_count(&self) -> u64 {
        self.degraded_count.load(Ordering::Relaxed)
    }

    /// Score one text. Returns the fused prediction and whether the primary
    /// was unavailable for it.
    #[instrument(skip(self, text))]
    pub async fn score(&self, text: &str) -> (ModelPrediction, bool) {
        let fallback = self.fallback.score(text);

        let primary = match &self.primary {
            Some(model) => match model.predict(text).await {
                Ok(prediction) => Some(prediction),
                Err(e) => {
                    warn!(model = model.name(), error = %e, "primary scorer unavailable for item");
                    None
                }
            },
            None => None,
        };

        match primary {
            Some(p) => {
                let w = self.primary_weight;
                let fused = ModelPrediction {
                    polarity: (w * p.polarity + (1.0 - w) * fallback.polarity).clamp(-1.0, 1.0),
                    confidence: (w * p.confidence + (1.0 - w) * fallback.confidence)
                        .clamp(0.0, 1.0),
                };
                (fused, false)
            }
            None => {
                self.degraded_count.fetch_add(1, Ordering::Relaxed);
                debug!("scoring in degraded mode");
                let degraded = ModelPrediction {
                    polarity: fallback.polarity,
                    confidence: (fallback.confidence * DEGRADED_CONFIDENCE_FACTOR).clamp(0.0, 1.0),
                };
                (degraded, true)
            }
        }
    }

    /// Score a full item; infallible by construction.
    pub async fn score_item(&self, item: Item) -> (ScoredItem, bool) {
        let (prediction, degraded) = self.score(&item.text).await;
        (
            ScoredItem { item, polarity: prediction.polarity, confidence: prediction.confidence },
            degraded,
        )
    }
}
