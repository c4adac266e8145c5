//! Per-asset aggregation of scored items into fixed-point samples.
//!
//! The fold is commutative over items once weights are fixed, so item order
//! within a cycle is unobservable downstream.

use crate::types::{Asset, AssetSample, ScoredItem, MAX_CONFIDENCE_BP, SCORE_SCALE};
use tracing::debug;

/// Weights below this sum mean no meaningful signal; the sample is dropped.
const MIN_WEIGHT_SUM: f64 = 1e-9;

pub struct Aggregator {
    /// Reference sample size at which confidence saturates.
    n_ref: f64,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self { n_ref: 1000.0 }
    }
}

impl Aggregator {
    pub fn new(n_ref: u32) -> Self {
        Self { n_ref: f64::from(n_ref.max(1)) }
    }

    /// Fold one asset's scored items into a sample. Returns `None` when the
    /// asset produced nothing usable this window (expected, not an error).
    pub fn aggregate(
        &self,
        asset: Asset,
        window_end_ts: i64,
        items: &[ScoredItem],
    ) -> Option<AssetSample> {
        if items.is_empty() {
            return None;
        }

        let mut weight_sum = 0.0;
        let mut weighted_polarity = 0.0;
        let mut confidence_sum = 0.0;
        for scored in items {
            let weight = scored.item.author_weight * scored.confidence;
            weight_sum += weight;
            weighted_polarity += weight * scored.polarity;
            confidence_sum += scored.confidence;
        }

        if weight_sum < MIN_WEIGHT_SUM {
            debug!(asset = %asset, "aggregate dropped: weight sum below threshold");
            return None;
        }

        let n = items.len() as f64;
        let score = (weighted_polarity / weight_sum).clamp(-1.0, 1.0);
        let confidence =
            ((confidence_sum / n) * ((1.0 + n).ln() / (1.0 + self.n_ref).ln())).clamp(0.0, 1.0);

        let score_fp = ((score * SCORE_SCALE as f64).round() as i128)
            .clamp(-SCORE_SCALE, SCORE_SCALE);
        let confidence_bp =
            ((confidence * f64::from(MAX_CONFIDENCE_BP)).round() as u16).min(MAX_CONFIDENCE_BP);

        Some(AssetSample {
            asset,
            score_fp,
            confidence_bp,
            sample_size: items.len() as u32,
            window_end_ts,
            manipulation_score: 0.0,
        })
    }
}
