//! Per-credential token-bucket gate, built on governor.
//!
//! Every outbound collector request passes through here. When the bucket is
//! empty the caller suspends until a token frees up or the cycle deadline
//! passes, whichever comes first.

use crate::config::RateQuota;
use crate::types::Source;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Token bucket for one (source, credential) pair.
pub struct SourceRateLimiter {
    source: Source,
    limiter: DefaultDirectRateLimiter,
}

impl SourceRateLimiter {
    pub fn new(source: Source, quota: RateQuota) -> Self {
        let tokens = NonZeroU32::new(quota.tokens.max(1)).expect("max(1) is nonzero");
        let period = Duration::from_secs_f64(quota.refill_s.max(1) as f64 / f64::from(tokens.get()));
        let quota = Quota::with_period(period)
            .expect("positive period")
            .allow_burst(tokens);
        Self { source, limiter: RateLimiter::direct(quota) }
    }

    /// Take a token, suspending until one is available. Returns `false` if
    /// the deadline arrives first; the caller abandons the request.
    pub async fn acquire(&self, deadline: Instant) -> bool {
        match tokio::time::timeout_at(deadline, self.limiter.until_ready()).await {
            Ok(()) => true,
            Err(_) => {
                debug!(source = %self.source, "rate limit wait abandoned at cycle deadline");
                false
            }
        }
    }

    /// Non-blocking probe, used by health checks.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn source(&self) -> Source {
        self.source
    }
}

/// Limiters for every configured source, built once at startup.
pub struct RateLimiterRegistry {
    limiters: HashMap<Source, Arc<SourceRateLimiter>>,
}

impl RateLimiterRegistry {
    pub fn new(quotas: &HashMap<Source, RateQuota>) -> Self {
        let limiters = quotas
            .iter()
            .map(|(source, quota)| (*source, Arc::new(SourceRateLimiter::new(*source, *quota))))
            .collect();
        Self { limiters }
    }

    pub fn for_source(&self, source: Source) -> Arc<SourceRateLimiter> {
        self.limiters
            .get(&source)
            .cloned()
            // A source without a configured quota gets a conservative default.
            .unwrap_or_else(|| {
                Arc::new(SourceRateLimiter::new(source, RateQuota { tokens: 10, refill_s: 60 }))
            })
    }
}
