//! Binary entry point: wire the pipeline together and run cohort loops
//! until shutdown.

use anyhow::{Context, Result};
use sentora::chain::{HttpRpc, LocalSigner, RemoteSigner, Signer, Submitter, SubmitterConfig};
use sentora::collect::{
    chat::ChatCollector, microblog::MicroblogCollector, newswire::NewswireCollector, Collector,
    Deduplicator, RateLimiterRegistry,
};
use sentora::config::SignerKind;
use sentora::ledger::Ledger;
use sentora::manipulation::ManipulationDetector;
use sentora::metrics::MetricsCollector;
use sentora::pipeline::Orchestrator;
use sentora::score::{EnsembleScorer, RemoteClassifier, SentimentModel};
use sentora::types::{Asset, Source};
use sentora::{Credentials, PipelineConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let config = Arc::new(load_config()?);
    config.validate().map_err(|e| anyhow::anyhow!(e))?;
    let credentials = Credentials::from_env();
    info!(cohorts = config.cohorts.len(), "starting sentiment oracle pipeline");

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .context("failed to build http client")?;

    // Durable state: dedup index and submission log.
    let ledger = Arc::new(Ledger::open(&config.ledger_path).await?);
    let dedup = Arc::new(Deduplicator::new(
        config.dedup_capacity,
        Duration::from_secs(config.dedup_horizon_s),
    ));
    let horizon_cutoff = chrono::Utc::now().timestamp() - config.dedup_horizon_s as i64;
    let warm_entries = ledger.load_seen_since(horizon_cutoff).await.unwrap_or_default();
    dedup.warm(warm_entries).await;

    let metrics = Arc::new(MetricsCollector::new());
    if let Some(listen) = config.metrics_http_listen.clone() {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics.serve(&listen).await {
                warn!(error = %e, "metrics endpoint failed");
            }
        });
    }

    // Collectors, gated per source credential.
    let limiters = RateLimiterRegistry::new(&config.per_source_rate);
    let symbols = asset_symbols(&config);
    let mut collectors: Vec<Arc<dyn Collector>> = Vec::new();

    if let Some(api_key) = &credentials.newswire_api_key {
        collectors.push(Arc::new(NewswireCollector::new(
            http_client.clone(),
            env_or("SENTORA_NEWSWIRE_URL", "https://newsapi.org"),
            api_key.clone(),
            symbols.clone(),
            limiters.for_source(Source::Newswire),
        )));
        info!("newswire collector enabled");
    }
    if let Some(bearer) = &credentials.microblog_bearer {
        collectors.push(Arc::new(MicroblogCollector::new(
            http_client.clone(),
            env_or("SENTORA_MICROBLOG_URL", "https://api.x.com"),
            bearer.clone(),
            symbols.clone(),
            limiters.for_source(Source::Microblog),
        )));
        info!("microblog collector enabled");
    }
    for (variant, token_opt, url_var, rooms_var) in [
        (Source::ChatA, &credentials.chat_a_token, "SENTORA_CHAT_A_URL", "SENTORA_CHAT_A_ROOMS"),
        (Source::ChatB, &credentials.chat_b_token, "SENTORA_CHAT_B_URL", "SENTORA_CHAT_B_ROOMS"),
    ] {
        if let Some(token) = token_opt {
            let rooms: Vec<String> = std::env::var(rooms_var)
                .unwrap_or_default()
                .split(',')
                .filter(|r| !r.is_empty())
                .map(String::from)
                .collect();
            if rooms.is_empty() {
                warn!(source = %variant, "chat credential present but no rooms configured");
                continue;
            }
            collectors.push(Arc::new(ChatCollector::new(
                http_client.clone(),
                env_or(url_var, "http://127.0.0.1:8090"),
                token.clone(),
                variant,
                rooms,
                symbols.clone(),
                limiters.for_source(variant),
            )));
            info!(source = %variant, "chat collector enabled");
        }
    }
    if collectors.is_empty() {
        warn!("no collectors enabled; cycles will produce nothing");
    }

    // Scoring ensemble.
    let primary: Option<Arc<dyn SentimentModel>> = config
        .primary_model_url
        .as_ref()
        .map(|url| {
            Arc::new(RemoteClassifier::new(http_client.clone(), url.clone()))
                as Arc<dyn SentimentModel>
        });
    if primary.is_none() {
        warn!("no primary model configured; scoring runs lexicon-only (degraded)");
    }
    let scorer = Arc::new(EnsembleScorer::new(primary, config.scorer_primary_weight));

    let detector = Arc::new(ManipulationDetector::new(config.manipulation_threshold));

    // Chain surface.
    let rpc = Arc::new(HttpRpc::new(http_client.clone(), config.rpc_url.clone()));
    let signer: Arc<dyn Signer> = match config.signer_kind {
        SignerKind::Local => {
            let key = credentials
                .signer_private_key
                .as_ref()
                .context("SENTORA_SIGNER_KEY required for local signer")?;
            Arc::new(LocalSigner::from_hex(key)?)
        }
        SignerKind::Remote => {
            let url = credentials
                .remote_signer_url
                .as_ref()
                .context("SENTORA_REMOTE_SIGNER_URL required for remote signer")?;
            let address = Asset::from_hex(
                &std::env::var("SENTORA_SIGNER_ADDRESS")
                    .context("SENTORA_SIGNER_ADDRESS required for remote signer")?,
            )?;
            Arc::new(RemoteSigner::new(http_client.clone(), url.clone(), address))
        }
    };

    let submitter = Arc::new(Submitter::new(
        rpc,
        signer,
        SubmitterConfig {
            chain_id: config.chain_id,
            contract: config.contract,
            batch_size: config.submit_batch_size,
            min_interval_s: config.submit_min_interval_s,
            max_score_change_fp: config.submit_max_score_change_fp,
            confirmations: config.submit_confirmations,
            gas_multiplier: config.gas_multiplier,
            gas_ceiling_wei: config.gas_ceiling_wei,
        },
        metrics.clone(),
        Some(ledger.clone()),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        collectors,
        dedup,
        scorer,
        detector,
        submitter,
        metrics,
        Some(ledger),
    ));

    // One independent loop per cohort.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();
    for cohort in config.cohorts.clone() {
        let orchestrator = orchestrator.clone();
        let shutdown_rx = shutdown_rx.clone();
        handles.push(tokio::spawn(orchestrator.run_cohort(cohort, shutdown_rx)));
    }

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
    info!("pipeline stopped");
    Ok(())
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Config comes from a JSON file when SENTORA_CONFIG is set, defaults
/// otherwise. Credentials always come from the environment.
fn load_config() -> Result<PipelineConfig> {
    match std::env::var("SENTORA_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file {path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("failed to parse config {path}"))
        }
        Err(_) => Ok(PipelineConfig::default()),
    }
}

/// Asset -> ticker symbol map for query building, from cohort config
/// metadata (SENTORA_SYMBOLS as "0xaddr=SYM,0xaddr=SYM").
fn asset_symbols(config: &PipelineConfig) -> HashMap<Asset, String> {
    let mut symbols = HashMap::new();
    if let Ok(raw) = std::env::var("SENTORA_SYMBOLS") {
        for pair in raw.split(',') {
            if let Some((addr, symbol)) = pair.split_once('=') {
                if let Ok(asset) = Asset::from_hex(addr.trim()) {
                    symbols.insert(asset, symbol.trim().to_string());
                }
            }
        }
    }
    // Assets without a configured symbol still get tagged by address match.
    for cohort in &config.cohorts {
        for asset in &cohort.assets {
            symbols.entry(*asset).or_insert_with(|| asset.to_string());
        }
    }
    symbols
}
