//! Pipeline error taxonomy.
//!
//! Every fallible cross-stage call returns one of these kinds; each maps to
//! a monotonic counter so operators can observe failure behavior without
//! log scraping. `AggregateEmpty` is the only kind swallowed silently — an
//! asset with no items is expected under normal operation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Retried within the source with backoff; never fails the cycle.
    #[error("transient source failure ({source_name}): {reason}")]
    TransientSource { source_name: &'static str, reason: String },

    /// Source skipped for the cycle; remaining sources proceed.
    #[error("terminal source failure ({source_name}): {reason}")]
    TerminalSource { source_name: &'static str, reason: String },

    /// Primary model unavailable; the fallback carries the cycle at reduced
    /// confidence.
    #[error("primary scorer degraded: {0}")]
    ScorerDegraded(String),

    /// Asset produced no sample this cycle.
    #[error("no sample aggregated for asset")]
    AggregateEmpty,

    /// Sample suppressed by the manipulation gate. Not an error in the
    /// operational sense; counted and recorded.
    #[error("sample vetoed by manipulation detector (score {0:.3})")]
    ManipulationVeto(f64),

    #[error("chain rpc unavailable: {0}")]
    RpcUnavailable(String),

    #[error("transaction reverted: {0}")]
    TxReverted(String),

    #[error("nonce gap: expected {expected}, chain reports {found}")]
    NonceGap { expected: u64, found: u64 },

    /// Cycle fatal; the next cycle retries.
    #[error("signer unavailable: {0}")]
    SignerUnavailable(String),

    /// Fail-fast at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Submission did not confirm before the cycle deadline; reconciled on
    /// the next cycle.
    #[error("cycle deadline exceeded")]
    CycleTimeout,
}

impl PipelineError {
    /// Counter name for the metrics collector.
    pub fn counter_name(&self) -> &'static str {
        match self {
            PipelineError::TransientSource { .. } => "source_error_transient_total",
            PipelineError::TerminalSource { .. } => "source_error_terminal_total",
            PipelineError::ScorerDegraded(_) => "scorer_degraded_total",
            PipelineError::AggregateEmpty => "aggregate_empty_total",
            PipelineError::ManipulationVeto(_) => "manipulation_veto_total",
            PipelineError::RpcUnavailable(_) => "rpc_unavailable_total",
            PipelineError::TxReverted(_) => "tx_reverted_total",
            PipelineError::NonceGap { .. } => "nonce_gap_total",
            PipelineError::SignerUnavailable(_) => "signer_unavailable_total",
            PipelineError::ConfigInvalid(_) => "config_invalid_total",
            PipelineError::CycleTimeout => "cycle_timeout_total",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_names_are_distinct() {
        let kinds = [
            PipelineError::TransientSource { source_name: "newswire", reason: String::new() },
            PipelineError::TerminalSource { source_name: "newswire", reason: String::new() },
            PipelineError::ScorerDegraded(String::new()),
            PipelineError::AggregateEmpty,
            PipelineError::ManipulationVeto(0.9),
            PipelineError::RpcUnavailable(String::new()),
            PipelineError::TxReverted(String::new()),
            PipelineError::NonceGap { expected: 1, found: 0 },
            PipelineError::SignerUnavailable(String::new()),
            PipelineError::ConfigInvalid(String::new()),
            PipelineError::CycleTimeout,
        ];
        let mut names: Vec<_> = kinds.iter().map(|k| k.counter_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), kinds.len());
    }
}
