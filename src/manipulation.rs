//! Coordinated-manipulation screening.
//!
//! Combines five per-asset signals over the current and recent cycles into
//! a score in [0, 1]. Samples above the threshold are vetoed: counted,
//! logged with their signal breakdown, and never submitted. A veto is an
//! expected outcome, not an operational error.

use crate::types::{Asset, AssetSample, ScoredItem};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// Cycles of history kept per asset for the volume-spike baseline.
const HISTORY_CYCLES: usize = 3;

/// Pairwise Jaccard similarity above this marks two texts as near-duplicates.
const SIMILARITY_THRESHOLD: f64 = 0.85;

/// Character n-gram width for text similarity.
const NGRAM_WIDTH: usize = 5;

/// Authors at or below this weight count toward bot density.
const BOT_WEIGHT_CEILING: f64 = 0.2;

/// Per-source polarity spread must exceed this before divergence contributes.
const DIVERGENCE_GATE: f64 = 0.6;

/// Neighbor window per item for the similarity scan, keeping the pass
/// deterministic and bounded at large batch sizes.
const SIMILARITY_NEIGHBORS: usize = 50;

/// Minimum items for the burstiness signal to activate.
const BURSTINESS_MIN_ITEMS: usize = 5;

/// Per-signal contributions; `None` means the signal had too little data to
/// activate this cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalBreakdown {
    pub volume_spike: Option<f64>,
    pub content_similarity: Option<f64>,
    pub bot_density: Option<f64>,
    pub cross_source_divergence: Option<f64>,
    pub temporal_burstiness: Option<f64>,
}

impl SignalBreakdown {
    /// Simple mean of active contributions.
    pub fn combined(&self) -> f64 {
        let active: Vec<f64> = [
            self.volume_spike,
            self.content_similarity,
            self.bot_density,
            self.cross_source_divergence,
            self.temporal_burstiness,
        ]
        .into_iter()
        .flatten()
        .collect();
        if active.is_empty() {
            return 0.0;
        }
        (active.iter().sum::<f64>() / active.len() as f64).clamp(0.0, 1.0)
    }

    pub fn describe(&self) -> String {
        let fmt = |v: &Option<f64>| match v {
            Some(x) => format!("{x:.3}"),
            None => "-".to_string(),
        };
        format!(
            "volume={} similarity={} bots={} divergence={} burstiness={}",
            fmt(&self.volume_spike),
            fmt(&self.content_similarity),
            fmt(&self.bot_density),
            fmt(&self.cross_source_divergence),
            fmt(&self.temporal_burstiness),
        )
    }
}

#[derive(Debug, Clone)]
pub struct Verdict {
    pub score: f64,
    pub vetoed: bool,
    pub breakdown: SignalBreakdown,
}

pub struct ManipulationDetector {
    threshold: f64,
    /// Rolling per-asset sample sizes from the last few cycles.
    volume_history: Mutex<HashMap<Asset, VecDeque<u32>>>,
}

impl ManipulationDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold: threshold.clamp(0.0, 1.0), volume_history: Mutex::new(HashMap::new()) }
    }

    /// Assess one asset's batch and record its volume into the history.
    #[instrument(skip(self, items, sample), fields(asset = %sample.asset))]
    pub async fn assess(&self, items: &[ScoredItem], sample: &AssetSample) -> Verdict {
        let breakdown = SignalBreakdown {
            volume_spike: self.volume_spike(sample.asset, sample.sample_size).await,
            content_similarity: content_similarity(items),
            bot_density: bot_density(items),
            cross_source_divergence: cross_source_divergence(items),
            temporal_burstiness: temporal_burstiness(items),
        };

        let score = breakdown.combined();
        let vetoed = score > self.threshold;
        if vetoed {
            info!(
                asset = %sample.asset,
                score = format!("{score:.3}"),
                breakdown = breakdown.describe(),
                "sample vetoed by manipulation gate"
            );
        } else {
            debug!(asset = %sample.asset, score = format!("{score:.3}"), "manipulation check passed");
        }

        Verdict { score, vetoed, breakdown }
    }

    /// Z-score of the current sample size against the rolling baseline,
    /// squashed through a sigmoid centered at z = 3.
    async fn volume_spike(&self, asset: Asset, sample_size: u32) -> Option<f64> {
        let mut history = self.volume_history.lock().await;
        let window = history.entry(asset).or_default();

        let contribution = if window.len() >= 2 {
            let n = window.len() as f64;
            let mean = window.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
            let variance =
                window.iter().map(|&v| (f64::from(v) - mean).powi(2)).sum::<f64>() / n;
            let std = variance.sqrt();
            if std > f64::EPSILON {
                let z = (f64::from(sample_size) - mean) / std;
                Some(sigmoid((z - 3.0) / 1.5))
            } else if f64::from(sample_size) > mean * 3.0 {
                // Flat baseline with a sudden jump is still a spike.
                Some(1.0)
            } else {
                Some(0.0)
            }
        } else {
            None
        };

        window.push_back(sample_size);
        while window.len() > HISTORY_CYCLES {
            window.pop_front();
        }

        contribution
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Fraction of items whose text is a near-duplicate of at least one other
/// item in the batch. Each item is compared against a bounded window of
/// neighbors so the pass stays O(n).
fn content_similarity(items: &[ScoredItem]) -> Option<f64> {
    if items.len() < 2 {
        return None;
    }

    let grams: Vec<HashSet<&str>> =
        items.iter().map(|s| char_ngrams(&s.item.text)).collect();
    let mut near_duplicate = vec![false; items.len()];

    for i in 0..items.len() {
        let upper = (i + 1 + SIMILARITY_NEIGHBORS).min(items.len());
        for j in (i + 1)..upper {
            if near_duplicate[i] && near_duplicate[j] {
                continue;
            }
            if jaccard(&grams[i], &grams[j]) > SIMILARITY_THRESHOLD {
                near_duplicate[i] = true;
                near_duplicate[j] = true;
            }
        }
    }

    let count = near_duplicate.iter().filter(|&&d| d).count();
    Some(count as f64 / items.len() as f64)
}

fn char_ngrams(text: &str) -> HashSet<&str> {
    let mut grams = HashSet::new();
    let indices: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    if indices.len() < NGRAM_WIDTH {
        if !text.is_empty() {
            grams.insert(text);
        }
        return grams;
    }
    for w in indices.windows(NGRAM_WIDTH) {
        let start = w[0];
        let end = w[NGRAM_WIDTH - 1]
            + text[w[NGRAM_WIDTH - 1]..].chars().next().map_or(1, char::len_utf8);
        grams.insert(&text[start..end]);
    }
    grams
}

fn jaccard(a: &HashSet<&str>, b: &HashSet<&str>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Share of items from authors at or below the bot weight ceiling.
fn bot_density(items: &[ScoredItem]) -> Option<f64> {
    if items.is_empty() {
        return None;
    }
    let bots = items.iter().filter(|s| s.item.author_weight <= BOT_WEIGHT_CEILING).count();
    Some(bots as f64 / items.len() as f64)
}

/// Spread between per-source mean polarities, contributing only past the
/// gate. Inactive with fewer than two sources represented.
fn cross_source_divergence(items: &[ScoredItem]) -> Option<f64> {
    let mut by_source: HashMap<crate::types::Source, (f64, usize)> = HashMap::new();
    for scored in items {
        let entry = by_source.entry(scored.item.source).or_insert((0.0, 0));
        entry.0 += scored.polarity;
        entry.1 += 1;
    }
    if by_source.len() < 2 {
        return None;
    }
    let means: Vec<f64> = by_source.values().map(|(sum, n)| sum / *n as f64).collect();
    let max = means.iter().cloned().fold(f64::MIN, f64::max);
    let min = means.iter().cloned().fold(f64::MAX, f64::min);
    let spread = max - min;
    if spread > DIVERGENCE_GATE {
        Some((spread / 2.0).clamp(0.0, 1.0))
    } else {
        Some(0.0)
    }
}

/// Regularity of inter-arrival gaps. Coordinated posting shows machine-like
/// spacing (low coefficient of variation); organic activity is irregular.
fn temporal_burstiness(items: &[ScoredItem]) -> Option<f64> {
    if items.len() < BURSTINESS_MIN_ITEMS {
        return None;
    }
    let mut timestamps: Vec<i64> = items.iter().map(|s| s.item.created_at).collect();
    timestamps.sort_unstable();

    let gaps: Vec<f64> =
        timestamps.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
    let n = gaps.len() as f64;
    let mean = gaps.iter().sum::<f64>() / n;
    if mean <= f64::EPSILON {
        // Everything landed in the same second.
        return Some(1.0);
    }
    let variance = gaps.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / n;
    let cv = variance.sqrt() / mean;

    Some(if cv < 0.3 {
        0.9
    } else if cv < 0.5 {
        0.6
    } else if cv > 2.0 {
        0.4
    } else {
        0.2
    })
}
