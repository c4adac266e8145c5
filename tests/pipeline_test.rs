//! End-to-end pipeline scenarios: static collectors, a fixed inference
//! model, and a scripted chain, driven through full orchestrator cycles.

use async_trait::async_trait;
use sentora::chain::{ChainRpc, LocalSigner, RpcError, Submitter, SubmitterConfig, TxReceipt};
use sentora::collect::{CollectError, CollectWindow, CollectedBatch, Collector, Deduplicator};
use sentora::config::{CohortConfig, PipelineConfig};
use sentora::manipulation::ManipulationDetector;
use sentora::metrics::MetricsCollector;
use sentora::pipeline::Orchestrator;
use sentora::score::{EnsembleScorer, ModelPrediction, SentimentModel};
use sentora::types::{Asset, Item, Source, SCORE_SCALE};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const TEST_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

fn asset_a() -> Asset {
    Asset([0xaa; 20])
}

fn contract() -> Asset {
    Asset([0xcc; 20])
}

// --- test doubles ---

struct StaticCollector {
    source: Source,
    items: Vec<Item>,
}

#[async_trait]
impl Collector for StaticCollector {
    fn source(&self) -> Source {
        self.source
    }

    async fn collect(
        &self,
        _window: CollectWindow,
        _assets: &[Asset],
        _deadline: Instant,
    ) -> Result<CollectedBatch, CollectError> {
        Ok(CollectedBatch { items: self.items.clone(), next_cursor: None })
    }
}

struct FixedModel {
    prediction: ModelPrediction,
}

#[async_trait]
impl SentimentModel for FixedModel {
    fn name(&self) -> &str {
        "fixed-test-model"
    }
    async fn predict(&self, _text: &str) -> anyhow::Result<ModelPrediction> {
        Ok(self.prediction)
    }
}

#[derive(Default)]
struct ChainState {
    pending_nonce: u64,
    head: u64,
    broadcasts: Vec<Vec<u8>>,
    receipts: HashMap<String, TxReceipt>,
}

struct ScriptedChain {
    state: Mutex<ChainState>,
}

impl ScriptedChain {
    fn new() -> Self {
        Self { state: Mutex::new(ChainState { pending_nonce: 7, head: 1000, ..Default::default() }) }
    }

    async fn broadcast_count(&self) -> usize {
        self.state.lock().await.broadcasts.len()
    }
}

#[async_trait]
impl ChainRpc for ScriptedChain {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        Ok(137)
    }
    async fn transaction_count(&self, _address: &str, _tag: &str) -> Result<u64, RpcError> {
        Ok(self.state.lock().await.pending_nonce)
    }
    async fn gas_price(&self) -> Result<u128, RpcError> {
        Ok(25_000_000_000)
    }
    async fn estimate_gas(&self, _from: &str, _to: &Asset, _data: &[u8]) -> Result<u64, RpcError> {
        Ok(180_000)
    }
    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<String, RpcError> {
        let mut state = self.state.lock().await;
        let tx_hash = format!("0x{}", hex::encode(&sentora::chain::encode::keccak256(raw)));
        state.broadcasts.push(raw.to_vec());
        state.pending_nonce += 1;
        let block_number = state.head;
        state.head += 5;
        state
            .receipts
            .insert(tx_hash.clone(), TxReceipt { status_ok: true, block_number, gas_used: 90_000 });
        Ok(tx_hash)
    }
    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, RpcError> {
        Ok(self.state.lock().await.receipts.get(tx_hash).cloned())
    }
    async fn block_number(&self) -> Result<u64, RpcError> {
        Ok(self.state.lock().await.head)
    }
    async fn call(&self, _to: &Asset, _data: &[u8]) -> Result<Vec<u8>, RpcError> {
        Ok(vec![])
    }
}

// --- harness ---

struct Harness {
    orchestrator: Arc<Orchestrator>,
    submitter: Arc<Submitter>,
    chain: Arc<ScriptedChain>,
    metrics: Arc<MetricsCollector>,
    cohort: CohortConfig,
}

fn build_harness(items: Vec<Item>, prediction: ModelPrediction) -> Harness {
    let config = Arc::new(PipelineConfig {
        contract: contract(),
        scorer_primary_weight: 1.0,
        cohorts: vec![CohortConfig { name: "test".into(), assets: vec![asset_a()] }],
        ..PipelineConfig::default()
    });
    let cohort = config.cohorts[0].clone();

    let collectors: Vec<Arc<dyn Collector>> =
        vec![Arc::new(StaticCollector { source: Source::Microblog, items })];
    let dedup = Arc::new(Deduplicator::new(10_000, Duration::from_secs(86_400)));
    let scorer = Arc::new(EnsembleScorer::new(Some(Arc::new(FixedModel { prediction })), 1.0));
    let detector = Arc::new(ManipulationDetector::new(config.manipulation_threshold));
    let metrics = Arc::new(MetricsCollector::new());
    let chain = Arc::new(ScriptedChain::new());
    let submitter = Arc::new(Submitter::new(
        chain.clone(),
        Arc::new(LocalSigner::from_hex(TEST_KEY).unwrap()),
        SubmitterConfig {
            chain_id: 137,
            contract: contract(),
            batch_size: config.submit_batch_size,
            min_interval_s: config.submit_min_interval_s,
            max_score_change_fp: config.submit_max_score_change_fp,
            confirmations: config.submit_confirmations,
            gas_multiplier: config.gas_multiplier,
            gas_ceiling_wei: u128::MAX,
        },
        metrics.clone(),
        None,
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        config,
        collectors,
        dedup,
        scorer,
        detector,
        submitter.clone(),
        metrics.clone(),
        None,
    ));
    Harness { orchestrator, submitter, chain, metrics, cohort }
}

/// Items with organic texture: distinct texts, irregular spacing, sane
/// authors. Gap pattern keeps up to 100 items inside one 300 s window.
fn organic_items(n: usize, weight: f64) -> Vec<Item> {
    let now = chrono::Utc::now().timestamp();
    let gaps = [1i64, 4, 1, 7, 2, 1, 5, 1, 3, 1];
    let mut ts = now - 270;
    (0..n)
        .map(|i| {
            ts += gaps[i % gaps.len()];
            Item::new(
                format!("item-{i}"),
                Source::Microblog,
                format!("take number {i}: thoughts about asset fundamentals {}", i * 31),
                format!("author-{i}"),
                weight,
                ts.min(now - 1),
                vec![asset_a()],
            )
        })
        .collect()
}

// --- scenarios ---

#[tokio::test]
async fn happy_update_end_to_end() {
    // Ten positive items, author_weight 0.5, model says (0.6, 0.9).
    let harness = build_harness(
        organic_items(10, 0.5),
        ModelPrediction { polarity: 0.6, confidence: 0.9 },
    );
    let report = harness.orchestrator.run_cycle(&harness.cohort).await.unwrap();

    assert_eq!(report.collected, 10);
    assert_eq!(report.duplicates_dropped, 0);
    assert_eq!(report.scored, 10);
    assert_eq!(report.samples, 1);
    assert!(report.vetoed.is_empty());

    let sample = &report.survivors[0];
    assert_eq!(sample.asset, asset_a());
    // 0.6 in fixed point and ~3124 bp, modulo f64 rounding in the fold.
    assert!((sample.score_fp - 6 * SCORE_SCALE / 10).abs() < 1_000);
    assert!((i32::from(sample.confidence_bp) - 3124).abs() <= 1);
    assert_eq!(sample.sample_size, 10);
    assert!(sample.manipulation_score < 0.3);

    let outcome = report.submit.unwrap();
    assert_eq!(outcome.tx_hashes.len(), 1);
    assert_eq!(outcome.confirmed, 1);
    assert_eq!(harness.chain.broadcast_count().await, 1);

    // Round-trip: the broadcast calldata carries exactly the submitted
    // values (single-sample chunks use the single-update selector).
    let raw = harness.chain.state.lock().await.broadcasts[0].clone();
    let calldata = sentora::chain::encode::encode_update_sentiment(sample);
    assert!(
        raw.windows(calldata.len()).any(|w| w == calldata.as_slice()),
        "raw transaction must embed the sample's calldata"
    );
}

#[tokio::test]
async fn duplicate_flood_collapses_to_one_pass() {
    // The same 100 items repeated five times within one cycle.
    let base = organic_items(100, 0.5);
    let mut flood = Vec::new();
    for _ in 0..5 {
        flood.extend(base.clone());
    }
    let harness =
        build_harness(flood, ModelPrediction { polarity: 0.6, confidence: 0.9 });
    let report = harness.orchestrator.run_cycle(&harness.cohort).await.unwrap();

    assert_eq!(report.collected, 500);
    assert_eq!(report.duplicates_dropped, 400);
    assert_eq!(report.scored, 100);
    assert_eq!(report.survivors[0].sample_size, 100);

    // Identical to processing 100 distinct items once.
    let control = build_harness(base, ModelPrediction { polarity: 0.6, confidence: 0.9 });
    let control_report = control.orchestrator.run_cycle(&control.cohort).await.unwrap();
    assert_eq!(report.survivors[0].score_fp, control_report.survivors[0].score_fp);
    assert_eq!(report.survivors[0].confidence_bp, control_report.survivors[0].confidence_bp);
}

#[tokio::test]
async fn replayed_cycle_is_idempotent_past_dedup() {
    let items = organic_items(50, 0.5);
    let harness = build_harness(items, ModelPrediction { polarity: 0.5, confidence: 0.8 });

    let first = harness.orchestrator.run_cycle(&harness.cohort).await.unwrap();
    assert_eq!(first.scored, 50);
    assert_eq!(harness.chain.broadcast_count().await, 1);

    // Same id-identical item set again: everything dies at the dedup.
    let second = harness.orchestrator.run_cycle(&harness.cohort).await.unwrap();
    assert_eq!(second.collected, 50);
    assert_eq!(second.duplicates_dropped, 50);
    assert_eq!(second.scored, 0);
    assert_eq!(second.samples, 0);
    assert!(second.submit.is_none());
    assert_eq!(harness.chain.broadcast_count().await, 1, "no second broadcast");
}

#[tokio::test]
async fn rate_limit_window_skips_without_broadcast() {
    // Asset last accepted 200 s ago; the contract would revert, so the
    // submitter's pre-check skips it locally.
    let harness =
        build_harness(organic_items(10, 0.5), ModelPrediction { polarity: 0.6, confidence: 0.9 });
    let now = chrono::Utc::now().timestamp() as u64;
    harness.submitter.seed_mirror(asset_a(), now - 200, 500).await;

    let report = harness.orchestrator.run_cycle(&harness.cohort).await.unwrap();
    assert_eq!(report.samples, 1, "sample still aggregates");
    let outcome = report.submit.unwrap();
    assert!(outcome.tx_hashes.is_empty());
    assert_eq!(outcome.skipped.len(), 1);
    assert_eq!(harness.chain.broadcast_count().await, 0, "no revert-bound broadcast");
    assert_eq!(harness.metrics.counter("submit_skipped_min_interval_total").await, 1);
}

#[tokio::test]
async fn circuit_breaker_precheck_counts_skip() {
    // Previous on-chain score 5e17; this cycle aggregates to 1e17 — a 4e17
    // move against a 2e17 limit.
    let harness =
        build_harness(organic_items(10, 0.5), ModelPrediction { polarity: 0.1, confidence: 0.9 });
    let now = chrono::Utc::now().timestamp() as u64;
    harness.submitter.seed_mirror(asset_a(), now - 1000, 5 * SCORE_SCALE / 10).await;

    let report = harness.orchestrator.run_cycle(&harness.cohort).await.unwrap();
    assert!((report.survivors[0].score_fp - SCORE_SCALE / 10).abs() < 1_000);

    let outcome = report.submit.unwrap();
    assert!(outcome.tx_hashes.is_empty());
    assert_eq!(harness.chain.broadcast_count().await, 0);
    assert_eq!(harness.metrics.counter("submit_skipped_circuit_breaker_total").await, 1);
}

#[tokio::test]
async fn coordinated_spam_is_vetoed_with_zero_broadcasts() {
    // 500 items: 90% near-identical text, every author a throwaway.
    let now = chrono::Utc::now().timestamp();
    let mut items = Vec::new();
    for i in 0..500 {
        let text = if i % 10 == 0 {
            format!("an actual independent thought about markets, number {i}")
        } else {
            "BUY NOW 100x guaranteed massive pump do not miss this rocket".to_string()
        };
        items.push(Item::new(
            format!("spam-{i}"),
            Source::Microblog,
            text,
            format!("bot-{i}"),
            0.1,
            now - 250 + (i as i64 / 10),
            vec![asset_a()],
        ));
    }
    let harness = build_harness(items, ModelPrediction { polarity: 0.9, confidence: 0.95 });

    let report = harness.orchestrator.run_cycle(&harness.cohort).await.unwrap();
    assert_eq!(report.samples, 0, "spam sample must not survive");
    assert_eq!(report.vetoed.len(), 1);
    let vetoed = &report.vetoed[0];
    assert!(vetoed.sample.manipulation_score > 0.7);
    assert!(vetoed.breakdown.content_similarity.unwrap() > 0.8);
    assert_eq!(vetoed.breakdown.bot_density, Some(1.0));

    assert!(report.submit.is_none());
    assert_eq!(harness.chain.broadcast_count().await, 0);
    assert_eq!(harness.metrics.counter("manipulation_veto_total").await, 1);
}

#[tokio::test]
async fn degraded_scoring_still_submits() {
    struct DownModel;
    #[async_trait]
    impl SentimentModel for DownModel {
        fn name(&self) -> &str {
            "down"
        }
        async fn predict(&self, _text: &str) -> anyhow::Result<ModelPrediction> {
            anyhow::bail!("connection refused")
        }
    }

    // Build manually to inject the failing primary.
    let config = Arc::new(PipelineConfig {
        contract: contract(),
        cohorts: vec![CohortConfig { name: "test".into(), assets: vec![asset_a()] }],
        ..PipelineConfig::default()
    });
    let cohort = config.cohorts[0].clone();
    let now = chrono::Utc::now().timestamp();
    let items: Vec<Item> = (0..10i64)
        .map(|i| {
            Item::new(
                format!("deg-{i}"),
                Source::Microblog,
                format!("very bullish on this, thought number {}", i * 17),
                format!("author-{i}"),
                0.5,
                now - 200 + i * 13 % 50,
                vec![asset_a()],
            )
        })
        .collect();
    let metrics = Arc::new(MetricsCollector::new());
    let chain = Arc::new(ScriptedChain::new());
    let submitter = Arc::new(Submitter::new(
        chain.clone(),
        Arc::new(LocalSigner::from_hex(TEST_KEY).unwrap()),
        SubmitterConfig {
            chain_id: 137,
            contract: contract(),
            batch_size: 50,
            min_interval_s: 240,
            max_score_change_fp: SCORE_SCALE / 5,
            confirmations: 2,
            gas_multiplier: 1.2,
            gas_ceiling_wei: u128::MAX,
        },
        metrics.clone(),
        None,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        config,
        vec![Arc::new(StaticCollector { source: Source::Microblog, items })],
        Arc::new(Deduplicator::new(10_000, Duration::from_secs(86_400))),
        Arc::new(EnsembleScorer::new(Some(Arc::new(DownModel)), 0.7)),
        Arc::new(ManipulationDetector::new(0.7)),
        submitter,
        metrics.clone(),
        None,
    ));

    let report = orchestrator.run_cycle(&cohort).await.unwrap();
    assert_eq!(report.scored, 10);
    assert_eq!(metrics.counter("scorer_degraded_total").await, 10);
    // Lexicon catches "bullish"; the cycle still produces and submits a sample.
    assert_eq!(report.samples, 1);
    assert!(report.survivors[0].score_fp > 0);
    assert_eq!(chain.broadcast_count().await, 1);
}
