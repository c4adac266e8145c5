//! Pipeline configuration.
//!
//! All knobs carry defaults matching production cadence; `validate` runs at
//! startup and any violation is fatal. Credential material is loaded
//! separately from the environment so the config struct itself stays
//! loggable.

use crate::error::PipelineError;
use crate::types::{Asset, Source, MAX_BATCH_SIZE, SCORE_SCALE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Token-bucket quota for one source credential: `tokens` requests per
/// `refill_s` seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateQuota {
    pub tokens: u32,
    pub refill_s: u64,
}

/// A set of assets sharing collection and submission cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortConfig {
    pub name: String,
    pub assets: Vec<Asset>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignerKind {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Orchestrator period P in seconds.
    pub cycle_period_s: u64,
    /// Epsilon subtracted from the period to form the cycle deadline.
    pub cycle_jitter_s: u64,
    /// Dedup horizon H in seconds.
    pub dedup_horizon_s: u64,
    /// Dedup LRU capacity.
    pub dedup_capacity: u64,
    /// Ensemble weight w for the primary model.
    pub scorer_primary_weight: f64,
    /// Veto threshold T.
    pub manipulation_threshold: f64,
    /// Max samples per on-chain batch call.
    pub submit_batch_size: usize,
    /// Mirrors the contract MIN_UPDATE_INTERVAL.
    pub submit_min_interval_s: u64,
    /// Mirrors the contract MAX_SCORE_CHANGE.
    pub submit_max_score_change_fp: i128,
    /// Confirmations N before a transaction counts as committed.
    pub submit_confirmations: u64,
    /// Multiplier applied to eth_estimateGas.
    pub gas_multiplier: f64,
    /// Hard per-transaction gas-cost ceiling in wei.
    pub gas_ceiling_wei: u128,
    /// Per-source per-cycle item cap.
    pub collector_item_cap: usize,
    /// Scoring worker pool upper bound; effective size is min(cpus, this).
    pub max_scoring_workers: usize,
    /// Bounded queue slots between stages.
    pub stage_queue_slots: usize,
    pub rpc_url: String,
    pub chain_id: u64,
    pub contract: Asset,
    pub signer_kind: SignerKind,
    pub per_source_rate: HashMap<Source, RateQuota>,
    pub cohorts: Vec<CohortConfig>,
    /// SQLite file for the dedup index and submission log.
    pub ledger_path: String,
    /// Inference endpoint for the primary classifier; None runs
    /// lexicon-only (permanently degraded).
    pub primary_model_url: Option<String>,
    /// Prometheus listen address, e.g. "127.0.0.1:9184".
    pub metrics_http_listen: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut per_source_rate = HashMap::new();
        per_source_rate.insert(Source::Newswire, RateQuota { tokens: 30, refill_s: 60 });
        per_source_rate.insert(Source::Microblog, RateQuota { tokens: 450, refill_s: 900 });
        per_source_rate.insert(Source::ChatA, RateQuota { tokens: 60, refill_s: 60 });
        per_source_rate.insert(Source::ChatB, RateQuota { tokens: 20, refill_s: 60 });

        Self {
            cycle_period_s: 300,
            cycle_jitter_s: 10,
            dedup_horizon_s: 86_400,
            dedup_capacity: 1_000_000,
            scorer_primary_weight: 0.7,
            manipulation_threshold: 0.7,
            submit_batch_size: 50,
            submit_min_interval_s: 240,
            submit_max_score_change_fp: SCORE_SCALE / 5,
            submit_confirmations: 2,
            gas_multiplier: 1.2,
            gas_ceiling_wei: 500_000_000_000_000_000, // 0.5 native token
            collector_item_cap: 10_000,
            max_scoring_workers: 8,
            stage_queue_slots: 1024,
            rpc_url: "http://127.0.0.1:8545".to_string(),
            chain_id: 137,
            contract: Asset::ZERO,
            signer_kind: SignerKind::Local,
            per_source_rate,
            cohorts: Vec::new(),
            ledger_path: "./sentora.db".to_string(),
            primary_model_url: None,
            metrics_http_listen: None,
        }
    }
}

impl PipelineConfig {
    /// Fail-fast validation; called once at startup.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let fail = |msg: String| Err(PipelineError::ConfigInvalid(msg));

        if self.cycle_period_s == 0 {
            return fail("cycle_period_s must be positive".into());
        }
        if self.cycle_jitter_s >= self.cycle_period_s {
            return fail(format!(
                "cycle_jitter_s {} must be below cycle_period_s {}",
                self.cycle_jitter_s, self.cycle_period_s
            ));
        }
        if !(0.0..=1.0).contains(&self.scorer_primary_weight) {
            return fail(format!("scorer_primary_weight {} outside [0,1]", self.scorer_primary_weight));
        }
        if !(0.0..=1.0).contains(&self.manipulation_threshold) {
            return fail(format!("manipulation_threshold {} outside [0,1]", self.manipulation_threshold));
        }
        if self.submit_batch_size == 0 || self.submit_batch_size > MAX_BATCH_SIZE {
            return fail(format!(
                "submit_batch_size {} outside 1..={}",
                self.submit_batch_size, MAX_BATCH_SIZE
            ));
        }
        if self.submit_max_score_change_fp <= 0 || self.submit_max_score_change_fp > 2 * SCORE_SCALE {
            return fail("submit_max_score_change_fp outside (0, 2*SCORE_SCALE]".into());
        }
        if self.gas_multiplier < 1.0 {
            return fail(format!("gas_multiplier {} below 1.0", self.gas_multiplier));
        }
        if self.rpc_url.is_empty() {
            return fail("rpc_url is empty".into());
        }
        if self.contract.is_zero() {
            return fail("oracle contract address is unset".into());
        }
        for (source, quota) in &self.per_source_rate {
            if quota.tokens == 0 || quota.refill_s == 0 {
                return fail(format!("rate quota for {} must be positive", source));
            }
        }
        for cohort in &self.cohorts {
            if cohort.assets.is_empty() {
                return fail(format!("cohort {} has no assets", cohort.name));
            }
            if cohort.assets.iter().any(Asset::is_zero) {
                return fail(format!("cohort {} contains the zero asset", cohort.name));
            }
        }
        if self.max_scoring_workers == 0 {
            return fail("max_scoring_workers must be positive".into());
        }
        if self.stage_queue_slots == 0 {
            return fail("stage_queue_slots must be positive".into());
        }
        Ok(())
    }

    /// Effective scoring pool size for this host.
    pub fn scoring_workers(&self) -> usize {
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        self.max_scoring_workers.min(cpus).max(1)
    }
}

/// Secret material, kept out of the main config so it never lands in logs
/// or serialized snapshots. Loaded from the environment at init; callers
/// may reload on a SIGHUP-like signal.
pub struct Credentials {
    pub newswire_api_key: Option<String>,
    pub microblog_bearer: Option<String>,
    pub chat_a_token: Option<String>,
    pub chat_b_token: Option<String>,
    /// Hex-encoded secp256k1 key for the local signer.
    pub signer_private_key: Option<String>,
    /// Remote signing service endpoint.
    pub remote_signer_url: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        let get = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            newswire_api_key: get("SENTORA_NEWSWIRE_API_KEY"),
            microblog_bearer: get("SENTORA_MICROBLOG_BEARER"),
            chat_a_token: get("SENTORA_CHAT_A_TOKEN"),
            chat_b_token: get("SENTORA_CHAT_B_TOKEN"),
            signer_private_key: get("SENTORA_SIGNER_KEY"),
            remote_signer_url: get("SENTORA_REMOTE_SIGNER_URL"),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Presence only; never the material itself.
        f.debug_struct("Credentials")
            .field("newswire_api_key", &self.newswire_api_key.is_some())
            .field("microblog_bearer", &self.microblog_bearer.is_some())
            .field("chat_a_token", &self.chat_a_token.is_some())
            .field("chat_b_token", &self.chat_b_token.is_some())
            .field("signer_private_key", &self.signer_private_key.is_some())
            .field("remote_signer_url", &self.remote_signer_url.is_some())
            .finish()
    }
}
