//! Cycle orchestration.
//!
//! One cohort runs one cycle at a time: fan out to collectors, deduplicate,
//! score through a bounded worker pool, aggregate per asset, screen for
//! manipulation, submit survivors. Late cycles coalesce; a new cycle starts
//! at the next period boundary even if the previous one failed. The cycle
//! deadline propagates into every blocking call.

use crate::collect::{collect_with_retries, CollectError, CollectWindow, Collector, Deduplicator};
use crate::config::{CohortConfig, PipelineConfig};
use crate::error::PipelineError;
use crate::ledger::Ledger;
use crate::manipulation::{ManipulationDetector, SignalBreakdown};
use crate::metrics::MetricsCollector;
use crate::score::{Aggregator, EnsembleScorer};
use crate::chain::{SubmitOutcome, Submitter};
use crate::types::{Asset, AssetSample, ScoredItem, SubmissionJob};
use futures::stream::StreamExt;
use nonempty::NonEmpty;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// A sample the manipulation gate suppressed, kept for observability.
#[derive(Debug, Clone)]
pub struct VetoedSample {
    pub sample: AssetSample,
    pub breakdown: SignalBreakdown,
}

/// What one cycle did, for logs and tests.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub cohort: String,
    pub collected: usize,
    pub duplicates_dropped: usize,
    pub scored: usize,
    pub dropped_unscored: usize,
    pub samples: usize,
    pub survivors: Vec<AssetSample>,
    pub vetoed: Vec<VetoedSample>,
    pub submit: Option<SubmitOutcome>,
}

pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    collectors: Vec<Arc<dyn Collector>>,
    dedup: Arc<Deduplicator>,
    scorer: Arc<EnsembleScorer>,
    aggregator: Aggregator,
    detector: Arc<ManipulationDetector>,
    submitter: Arc<Submitter>,
    metrics: Arc<MetricsCollector>,
    ledger: Option<Arc<Ledger>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<PipelineConfig>,
        collectors: Vec<Arc<dyn Collector>>,
        dedup: Arc<Deduplicator>,
        scorer: Arc<EnsembleScorer>,
        detector: Arc<ManipulationDetector>,
        submitter: Arc<Submitter>,
        metrics: Arc<MetricsCollector>,
        ledger: Option<Arc<Ledger>>,
    ) -> Self {
        Self {
            config,
            collectors,
            dedup,
            scorer,
            aggregator: Aggregator::default(),
            detector,
            submitter,
            metrics,
            ledger,
        }
    }

    /// Drive one cohort until shutdown. Cycles fire at period boundaries;
    /// missed ticks are skipped, never queued.
    pub async fn run_cohort(
        self: Arc<Self>,
        cohort: CohortConfig,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let period = Duration::from_secs(self.config.cycle_period_s);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(cohort = %cohort.name, period_s = self.config.cycle_period_s, "cohort loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_cycle(&cohort).await {
                        Ok(report) => {
                            info!(
                                cohort = %cohort.name,
                                collected = report.collected,
                                duplicates = report.duplicates_dropped,
                                scored = report.scored,
                                samples = report.samples,
                                vetoed = report.vetoed.len(),
                                "cycle complete"
                            );
                        }
                        Err(e) => {
                            self.metrics.increment(e.counter_name()).await;
                            warn!(cohort = %cohort.name, error = %e, "cycle failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(cohort = %cohort.name, "cohort loop stopping");
                        break;
                    }
                }
            }
        }
    }

    /// One end-to-end cycle for a cohort.
    #[instrument(skip(self, cohort), fields(cohort = %cohort.name))]
    pub async fn run_cycle(&self, cohort: &CohortConfig) -> Result<CycleReport, PipelineError> {
        let started = Instant::now();
        self.metrics.increment("cycles_total").await;

        let now_ts = chrono::Utc::now().timestamp();
        let period = self.config.cycle_period_s;
        let deadline = started + Duration::from_secs(period - self.config.cycle_jitter_s);
        let window = CollectWindow { start: now_ts - period as i64, end: now_ts };

        let mut report = CycleReport { cohort: cohort.name.clone(), ..CycleReport::default() };

        // 1. Fan out to all collectors in parallel.
        let collections = futures::future::join_all(self.collectors.iter().map(|collector| {
            let collector = collector.clone();
            let assets = cohort.assets.clone();
            let item_cap = self.config.collector_item_cap;
            async move {
                let source = collector.source();
                let result =
                    collect_with_retries(collector.as_ref(), window, &assets, deadline, item_cap)
                        .await;
                (source, result)
            }
        }))
        .await;

        let mut items = Vec::new();
        for (source, result) in collections {
            match result {
                Ok(batch) => {
                    debug!(source = %source, count = batch.len(), "source collected");
                    items.extend(batch);
                }
                Err(CollectError::Terminal(reason)) => {
                    self.metrics.increment("source_error_terminal_total").await;
                    warn!(source = %source, reason, "source skipped for cycle (terminal)");
                }
                Err(CollectError::Transient(reason)) => {
                    self.metrics.increment("source_error_transient_total").await;
                    warn!(source = %source, reason, "source skipped for cycle (retries exhausted)");
                }
                Err(CollectError::Cancelled) => {
                    self.metrics.increment("source_error_transient_total").await;
                    warn!(source = %source, "source cancelled at deadline");
                }
            }
        }
        report.collected = items.len();
        self.metrics.add("items_collected_total", items.len() as u64).await;

        // 2. Deduplicate and persist the newly seen ids.
        let (fresh, recorded) = self.dedup.filter_batch(items, now_ts).await;
        report.duplicates_dropped = report.collected - fresh.len();
        self.metrics.add("items_deduplicated_total", report.duplicates_dropped as u64).await;
        if let Some(ledger) = &self.ledger {
            if let Err(e) = ledger.record_seen(&recorded).await {
                warn!(error = %e, "failed to persist seen items");
            }
        }

        // 3. Score through a bounded worker pool; items still unscored at
        // the deadline are dropped and the cycle proceeds with what landed.
        let fresh_count = fresh.len();
        let (scored_tx, mut scored_rx) =
            mpsc::channel::<(ScoredItem, bool)>(self.config.stage_queue_slots);
        let scorer = self.scorer.clone();
        let workers = self.config.scoring_workers();
        tokio::spawn(async move {
            futures::stream::iter(fresh)
                .for_each_concurrent(workers, |item| {
                    let scorer = scorer.clone();
                    let scored_tx = scored_tx.clone();
                    async move {
                        let scored = scorer.score_item(item).await;
                        let _ = scored_tx.send(scored).await;
                    }
                })
                .await;
        });

        let mut per_asset: HashMap<Asset, Vec<ScoredItem>> = HashMap::new();
        loop {
            match tokio::time::timeout_at(deadline, scored_rx.recv()).await {
                Ok(Some((scored, degraded))) => {
                    report.scored += 1;
                    if degraded {
                        self.metrics.increment("scorer_degraded_total").await;
                    }
                    for asset in &scored.item.asset_tags {
                        if cohort.assets.contains(asset) {
                            per_asset.entry(*asset).or_default().push(scored.clone());
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    report.dropped_unscored = fresh_count - report.scored;
                    self.metrics
                        .add("items_dropped_unscored_total", report.dropped_unscored as u64)
                        .await;
                    warn!(dropped = report.dropped_unscored, "deadline hit mid-scoring; proceeding");
                    break;
                }
            }
        }
        self.metrics.add("items_scored_total", report.scored as u64).await;

        // 4. Aggregate per asset (serial), then the manipulation gate.
        let mut assets: Vec<Asset> = per_asset.keys().copied().collect();
        assets.sort();
        let mut survivors = Vec::new();
        for asset in assets {
            let asset_items = &per_asset[&asset];
            match self.aggregator.aggregate(asset, window.end, asset_items) {
                None => {
                    self.metrics.increment("aggregate_empty_total").await;
                }
                Some(mut sample) => {
                    self.metrics.increment("samples_aggregated_total").await;
                    let verdict = self.detector.assess(asset_items, &sample).await;
                    sample.manipulation_score = verdict.score;
                    if verdict.vetoed {
                        self.metrics.increment("manipulation_veto_total").await;
                        report.vetoed.push(VetoedSample { sample, breakdown: verdict.breakdown });
                    } else {
                        survivors.push(sample);
                    }
                }
            }
        }
        report.samples = survivors.len();
        report.survivors = survivors.clone();

        // 5. Hand all survivors to the submitter as one job.
        if let Some(samples) = NonEmpty::from_vec(survivors) {
            let job = SubmissionJob {
                samples,
                contract: self.config.contract,
                chain_id: self.config.chain_id,
                gas_ceiling_wei: self.config.gas_ceiling_wei,
                deadline,
            };
            report.submit = Some(self.submitter.submit(job).await?);
        } else {
            debug!("no survivors this cycle; nothing to submit");
        }

        // Housekeeping: drop ledger entries past the dedup horizon.
        if let Some(ledger) = &self.ledger {
            let cutoff = now_ts - self.config.dedup_horizon_s as i64;
            if let Err(e) = ledger.prune_seen(cutoff).await {
                warn!(error = %e, "seen-item prune failed");
            }
        }

        self.metrics.record_cycle_duration(started.elapsed()).await;
        Ok(report)
    }
}
