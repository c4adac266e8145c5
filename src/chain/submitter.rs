//! On-chain submission: batching, nonce discipline, gas policy, pre-checks,
//! broadcast, and confirmation tracking.
//!
//! The submitter is the only writer of `NonceState`; sign-and-broadcast runs
//! under the nonce lock so no two in-flight transactions can share a nonce
//! and only one signer call runs at a time per signer address. Local
//! pre-checks mirror the contract's update-interval and circuit-breaker
//! rules so doomed elements never cost gas.

use crate::chain::encode::{encode_batch_update_sentiment, encode_update_sentiment, LegacyTx};
use crate::chain::rpc::{ChainRpc, RpcError};
use crate::chain::signer::{Signer, SignerError};
use crate::error::PipelineError;
use crate::ledger::Ledger;
use crate::metrics::MetricsCollector;
use crate::types::{Asset, AssetSample, SubmissionJob};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Receipt poll cadence while waiting for confirmations.
const CONFIRM_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Gas bump applied when replacing a dropped or underpriced transaction.
const GAS_BUMP_NUMERATOR: u128 = 110;

/// Fallback gas when estimation fails: base plus a per-element allowance.
const GAS_FALLBACK_BASE: u64 = 50_000;
const GAS_FALLBACK_PER_ELEMENT: u64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    PendingSign,
    PendingBroadcast,
    PendingConfirm,
    Confirmed,
    Reverted,
    Dropped,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::PendingSign => "pending_sign",
            TxStatus::PendingBroadcast => "pending_broadcast",
            TxStatus::PendingConfirm => "pending_confirm",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Reverted => "reverted",
            TxStatus::Dropped => "dropped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Last accepted update is newer than now − MIN_UPDATE_INTERVAL.
    MinInterval,
    /// Score change from the last accepted score exceeds MAX_SCORE_CHANGE.
    CircuitBreaker,
}

#[derive(Debug, Clone)]
pub struct SubmitterConfig {
    pub chain_id: u64,
    pub contract: Asset,
    pub batch_size: usize,
    pub min_interval_s: u64,
    pub max_score_change_fp: i128,
    pub confirmations: u64,
    pub gas_multiplier: f64,
    pub gas_ceiling_wei: u128,
}

#[derive(Debug, Default)]
struct NonceState {
    next: u64,
    initialized: bool,
}

/// Last accepted (timestamp, score) per asset, learned from confirmations.
#[derive(Debug, Clone, Copy)]
struct MirrorEntry {
    last_ts: u64,
    last_score: i128,
}

/// A broadcast transaction we have not yet resolved. Carries enough to
/// rebuild the identical payload at a bumped gas price.
#[derive(Debug, Clone)]
struct InFlightTx {
    tx_hash: String,
    nonce: u64,
    gas_price: u128,
    gas_limit: u64,
    data: Vec<u8>,
    samples: Vec<AssetSample>,
}

#[derive(Debug, Default)]
pub struct SubmitOutcome {
    pub tx_hashes: Vec<String>,
    pub confirmed: usize,
    pub reverted: usize,
    pub skipped: Vec<(Asset, SkipReason)>,
    pub timed_out: bool,
}

pub struct Submitter {
    rpc: Arc<dyn ChainRpc>,
    signer: Arc<dyn Signer>,
    config: SubmitterConfig,
    metrics: Arc<MetricsCollector>,
    ledger: Option<Arc<Ledger>>,
    nonce: Mutex<NonceState>,
    mirror: Mutex<HashMap<Asset, MirrorEntry>>,
    in_flight: Mutex<Vec<InFlightTx>>,
}

impl Submitter {
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        signer: Arc<dyn Signer>,
        config: SubmitterConfig,
        metrics: Arc<MetricsCollector>,
        ledger: Option<Arc<Ledger>>,
    ) -> Self {
        Self {
            rpc,
            signer,
            config,
            metrics,
            ledger,
            nonce: Mutex::new(NonceState::default()),
            mirror: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    /// Seed the local mirror, e.g. from on-chain reads at startup.
    pub async fn seed_mirror(&self, asset: Asset, last_ts: u64, last_score: i128) {
        self.mirror.lock().await.insert(asset, MirrorEntry { last_ts, last_score });
    }

    /// Local pre-check mirroring the contract rules. `None` means the sample
    /// is worth gas.
    pub async fn admit(&self, sample: &AssetSample, now: u64) -> Option<SkipReason> {
        let mirror = self.mirror.lock().await;
        let entry = mirror.get(&sample.asset)?;
        if now < entry.last_ts + self.config.min_interval_s {
            return Some(SkipReason::MinInterval);
        }
        if entry.last_score != 0
            && (sample.score_fp - entry.last_score).abs() > self.config.max_score_change_fp
        {
            return Some(SkipReason::CircuitBreaker);
        }
        None
    }

    /// Submit a cycle's surviving samples. Broadcasts happen in chunks of at
    /// most `batch_size`; already-broadcast transactions are allowed to
    /// complete past the deadline and are reconciled next cycle.
    #[instrument(skip(self, job), fields(samples = job.samples.len()))]
    pub async fn submit(&self, job: SubmissionJob) -> Result<SubmitOutcome, PipelineError> {
        let mut outcome = SubmitOutcome::default();
        let now = chrono::Utc::now().timestamp() as u64;

        // Resolve anything left over from the previous cycle first; it holds
        // nonces we must not reuse.
        self.reconcile(job.deadline).await;

        let mut eligible = Vec::new();
        for sample in job.samples.iter() {
            match self.admit(sample, now).await {
                None => eligible.push(sample.clone()),
                Some(reason) => {
                    let counter = match reason {
                        SkipReason::MinInterval => "submit_skipped_min_interval_total",
                        SkipReason::CircuitBreaker => "submit_skipped_circuit_breaker_total",
                    };
                    self.metrics.increment(counter).await;
                    debug!(asset = %sample.asset, ?reason, "sample skipped by local pre-check");
                    outcome.skipped.push((sample.asset, reason));
                }
            }
        }

        if eligible.is_empty() {
            debug!("no eligible samples after pre-checks; nothing to broadcast");
            return Ok(outcome);
        }

        for chunk in eligible.chunks(self.config.batch_size) {
            if Instant::now() >= job.deadline {
                warn!("cycle deadline reached before all chunks broadcast");
                outcome.timed_out = true;
                break;
            }
            match self.send_chunk(chunk, job.deadline).await {
                Ok(tx_hash) => outcome.tx_hashes.push(tx_hash),
                Err(e @ PipelineError::SignerUnavailable(_)) => return Err(e),
                Err(PipelineError::RpcUnavailable(msg)) => {
                    self.metrics.increment("rpc_unavailable_total").await;
                    warn!(error = %msg, "rpc unavailable; abandoning remaining chunks for cycle");
                    outcome.timed_out = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let (confirmed, reverted, timed_out) = self.await_confirmations(job.deadline).await;
        outcome.confirmed = confirmed;
        outcome.reverted = reverted;
        outcome.timed_out |= timed_out;
        Ok(outcome)
    }

    /// Build, sign, and broadcast one chunk. Runs entirely under the nonce
    /// lock: the nonce advances only once the broadcast is accepted.
    async fn send_chunk(
        &self,
        samples: &[AssetSample],
        deadline: Instant,
    ) -> Result<String, PipelineError> {
        let data = if samples.len() == 1 {
            encode_update_sentiment(&samples[0])
        } else {
            encode_batch_update_sentiment(samples)
        };
        let from = self.signer.address().to_string();

        let gas_limit = match retry_transport(deadline, || {
            self.rpc.estimate_gas(&from, &self.config.contract, &data)
        })
        .await
        {
            Ok(estimate) => (estimate as f64 * self.config.gas_multiplier) as u64,
            Err(RpcError::Node { message, .. }) => {
                warn!(error = %message, "gas estimation failed; using fallback estimate");
                GAS_FALLBACK_BASE + GAS_FALLBACK_PER_ELEMENT * samples.len() as u64
            }
            Err(RpcError::Transport(msg)) => return Err(PipelineError::RpcUnavailable(msg)),
        };

        let mut gas_price = retry_transport(deadline, || self.rpc.gas_price())
            .await
            .map_err(|e| PipelineError::RpcUnavailable(e.to_string()))?;

        // Hard per-transaction cost ceiling.
        let max_price = self.config.gas_ceiling_wei / u128::from(gas_limit.max(1));
        if gas_price > max_price {
            warn!(gas_price, max_price, "gas price clamped to per-transaction ceiling");
            gas_price = max_price;
        }

        let mut nonce_state = self.nonce.lock().await;
        if !nonce_state.initialized {
            let pending = retry_transport(deadline, || self.rpc.transaction_count(&from, "pending"))
                .await
                .map_err(|e| PipelineError::RpcUnavailable(e.to_string()))?;
            nonce_state.next = pending;
            nonce_state.initialized = true;
            info!(nonce = pending, "nonce state initialized from chain");
        }

        let mut nonce = nonce_state.next;
        let mut attempts = 0u32;
        let tx_hash = loop {
            attempts += 1;
            let tx = LegacyTx {
                nonce,
                gas_price,
                gas_limit,
                to: self.config.contract,
                value: 0,
                data: data.clone(),
            };
            let digest = tx.signing_digest(self.config.chain_id);
            let signature = self.signer.sign_digest(digest).await.map_err(|e| match e {
                SignerError::Unavailable(msg) => PipelineError::SignerUnavailable(msg),
                SignerError::Rejected(msg) => PipelineError::SignerUnavailable(msg),
            })?;
            let raw = tx.encode_signed(self.config.chain_id, &signature);

            match retry_transport(deadline, || self.rpc.send_raw_transaction(&raw)).await {
                Ok(tx_hash) => break tx_hash,
                Err(e) if e.is_underpriced() && attempts < 5 => {
                    gas_price = bump_gas(gas_price);
                    debug!(nonce, gas_price, "underpriced; bumping gas and resubmitting");
                    continue;
                }
                Err(e) if e.is_nonce_error() && attempts < 5 => {
                    let chain_pending =
                        retry_transport(deadline, || self.rpc.transaction_count(&from, "pending"))
                            .await
                            .map_err(|e| PipelineError::RpcUnavailable(e.to_string()))?;
                    self.metrics.increment("nonce_gap_total").await;
                    self.metrics.increment("nonce_resync_total").await;
                    warn!(local = nonce, chain = chain_pending, "nonce desync; resynchronized");
                    nonce = chain_pending;
                    nonce_state.next = chain_pending;
                    continue;
                }
                Err(e) if e.is_already_known() => {
                    // The pool already has this exact transaction; treat the
                    // local hash as authoritative.
                    break format!("0x{}", hex::encode(crate::chain::encode::keccak256(&raw)));
                }
                Err(RpcError::Transport(msg)) => return Err(PipelineError::RpcUnavailable(msg)),
                Err(e) => return Err(PipelineError::TxReverted(e.to_string())),
            }
        };
        nonce_state.next = nonce + 1;
        drop(nonce_state);

        info!(tx_hash, nonce, count = samples.len(), "chunk broadcast");
        self.metrics.increment("tx_submitted_total").await;

        let entry = InFlightTx {
            tx_hash: tx_hash.clone(),
            nonce,
            gas_price,
            gas_limit,
            data,
            samples: samples.to_vec(),
        };
        self.record_status(&entry, TxStatus::PendingConfirm).await;
        self.in_flight.lock().await.push(entry);
        Ok(tx_hash)
    }

    /// Poll receipts until every in-flight transaction resolves or the
    /// deadline passes. Returns (confirmed, reverted, timed_out).
    async fn await_confirmations(&self, deadline: Instant) -> (usize, usize, bool) {
        let mut confirmed = 0;
        let mut reverted = 0;

        loop {
            if self.in_flight.lock().await.is_empty() {
                return (confirmed, reverted, false);
            }
            if Instant::now() >= deadline {
                let remaining = self.in_flight.lock().await.len();
                warn!(remaining, "confirmation wait hit cycle deadline");
                self.metrics.increment("cycle_timeout_total").await;
                return (confirmed, reverted, true);
            }

            let pending: Vec<InFlightTx> = self.in_flight.lock().await.clone();
            for tx in pending {
                let (did_confirm, did_revert) = self.check_one(&tx).await;
                confirmed += usize::from(did_confirm);
                reverted += usize::from(did_revert);
            }

            if self.in_flight.lock().await.is_empty() {
                return (confirmed, reverted, false);
            }
            let wake = Instant::now() + CONFIRM_POLL_INTERVAL;
            tokio::time::sleep_until(wake.min(deadline)).await;
        }
    }

    /// Check one in-flight transaction; resolve it if its receipt is deep
    /// enough. Returns (confirmed, reverted) flags.
    async fn check_one(&self, tx: &InFlightTx) -> (bool, bool) {
        let receipt = match self.rpc.transaction_receipt(&tx.tx_hash).await {
            Ok(receipt) => receipt,
            Err(e) => {
                debug!(tx_hash = %tx.tx_hash, error = %e, "receipt poll failed");
                return (false, false);
            }
        };
        let Some(receipt) = receipt else { return (false, false) };
        let head = match self.rpc.block_number().await {
            Ok(head) => head,
            Err(_) => return (false, false),
        };
        let confirmations = head.saturating_sub(receipt.block_number) + 1;
        if confirmations < self.config.confirmations {
            return (false, false);
        }

        self.in_flight.lock().await.retain(|t| t.tx_hash != tx.tx_hash);

        if receipt.status_ok {
            let now = chrono::Utc::now().timestamp() as u64;
            let mut mirror = self.mirror.lock().await;
            for sample in &tx.samples {
                mirror.insert(
                    sample.asset,
                    MirrorEntry { last_ts: now, last_score: sample.score_fp },
                );
            }
            drop(mirror);
            info!(tx_hash = %tx.tx_hash, nonce = tx.nonce, "transaction confirmed");
            self.metrics.increment("tx_confirmed_total").await;
            self.record_status(tx, TxStatus::Confirmed).await;
            (true, false)
        } else {
            warn!(tx_hash = %tx.tx_hash, nonce = tx.nonce, "transaction reverted");
            self.metrics.increment("tx_reverted_total").await;
            self.record_status(tx, TxStatus::Reverted).await;
            (false, true)
        }
    }

    /// Resolve transactions left over from a previous cycle. Ones with
    /// receipts go back to the confirmation path; for the receipt-less, the
    /// lowest nonce is replaced at bumped gas and the rest rebroadcast
    /// identically, keeping the nonce sequence dense.
    pub async fn reconcile(&self, deadline: Instant) {
        let mut leftover: Vec<InFlightTx> = {
            let mut in_flight = self.in_flight.lock().await;
            std::mem::take(&mut *in_flight)
        };
        if leftover.is_empty() {
            return;
        }
        info!(count = leftover.len(), "reconciling transactions from previous cycle");
        leftover.sort_by_key(|tx| tx.nonce);

        // Only the lowest receipt-less nonce gets a gas bump; the ones
        // behind it were merely blocked and go back out unchanged.
        let mut bumped_head = false;
        for mut tx in leftover {
            match self.rpc.transaction_receipt(&tx.tx_hash).await {
                Ok(Some(_)) => {
                    // Deep enough or not, hand it back to the confirmation path.
                    self.in_flight.lock().await.push(tx);
                    continue;
                }
                Ok(None) => {
                    if !bumped_head {
                        bumped_head = true;
                        self.record_status(&tx, TxStatus::Dropped).await;
                        tx.gas_price = bump_gas(tx.gas_price);
                        self.metrics.increment("tx_replaced_total").await;
                    }
                    let rebuilt = LegacyTx {
                        nonce: tx.nonce,
                        gas_price: tx.gas_price,
                        gas_limit: tx.gas_limit,
                        to: self.config.contract,
                        value: 0,
                        data: tx.data.clone(),
                    };
                    let digest = rebuilt.signing_digest(self.config.chain_id);
                    let Ok(signature) = self.signer.sign_digest(digest).await else {
                        warn!(nonce = tx.nonce, "signer unavailable during reconcile; deferring");
                        self.in_flight.lock().await.push(tx);
                        continue;
                    };
                    let raw = rebuilt.encode_signed(self.config.chain_id, &signature);
                    match retry_transport(deadline, || self.rpc.send_raw_transaction(&raw)).await {
                        Ok(new_hash) => {
                            info!(nonce = tx.nonce, old = %tx.tx_hash, new = %new_hash,
                                  "rebroadcast unresolved transaction");
                            tx.tx_hash = new_hash;
                            self.record_status(&tx, TxStatus::PendingConfirm).await;
                            self.in_flight.lock().await.push(tx);
                        }
                        Err(e) if e.is_already_known() => {
                            // Still sitting in the pool under its old hash.
                            self.in_flight.lock().await.push(tx);
                        }
                        Err(e) => {
                            warn!(nonce = tx.nonce, error = %e, "rebroadcast failed; deferring");
                            self.in_flight.lock().await.push(tx);
                        }
                    }
                }
                Err(e) => {
                    debug!(error = %e, "receipt lookup failed during reconcile; deferring");
                    self.in_flight.lock().await.push(tx);
                }
            }
        }
    }

    async fn record_status(&self, tx: &InFlightTx, status: TxStatus) {
        if let Some(ledger) = &self.ledger {
            let assets: Vec<Asset> = tx.samples.iter().map(|s| s.asset).collect();
            let source_hashes: Vec<String> =
                tx.samples.iter().map(|s| hex::encode(s.source_hash())).collect();
            let ts = chrono::Utc::now().timestamp();
            if let Err(e) = ledger
                .record_submission(&tx.tx_hash, tx.nonce, status.as_str(), ts, &assets, &source_hashes)
                .await
            {
                warn!(error = %e, "submission ledger write failed");
            }
        }
    }

    /// Count of transactions awaiting resolution.
    pub async fn in_flight_len(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

fn bump_gas(gas_price: u128) -> u128 {
    gas_price * GAS_BUMP_NUMERATOR / 100
}

/// Retry transport-level RPC failures with doubling, jittered backoff until
/// the deadline; node-level errors return immediately.
async fn retry_transport<T, F, Fut>(deadline: Instant, mut call: F) -> Result<T, RpcError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    use rand::Rng;

    let mut delay = Duration::from_millis(500);
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(RpcError::Transport(msg)) => {
                if Instant::now() + delay >= deadline {
                    return Err(RpcError::Transport(msg));
                }
                debug!(error = %msg, "rpc transport failure; backing off");
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                tokio::time::sleep(delay + jitter).await;
                delay = (delay * 2).min(Duration::from_secs(30));
            }
            Err(e) => return Err(e),
        }
    }
}
