//! Oracle contract write-path semantics.
//!
//! In-process model of the on-chain oracle: the same invariants, circular
//! history, and events the deployed contract enforces. It serves two
//! masters — the reference semantics under test, and the submitter's local
//! mirror for pre-checking updates before spending gas.

use crate::types::{Asset, HISTORY_CAPACITY, MAX_BATCH_SIZE, MAX_CONFIDENCE_BP, SCORE_SCALE};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

/// Defaults mirrored by the deployed contract.
pub const MIN_UPDATE_INTERVAL: u64 = 240;
pub const DEFAULT_MAX_SCORE_CHANGE: i128 = SCORE_SCALE / 5;

/// One accepted update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OracleEntry {
    pub score: i128,
    pub timestamp: u64,
    pub sample_size: u32,
    pub confidence: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleEvent {
    SentimentUpdated {
        asset: Asset,
        score: i128,
        timestamp: u64,
        confidence: u16,
        sample_size: u32,
    },
    CircuitBreakerTriggered {
        asset: Asset,
        reason_code: u8,
    },
    TokenWhitelisted {
        asset: Asset,
        status: bool,
    },
}

/// Reason codes for `CircuitBreakerTriggered`.
pub const BREAKER_REASON_SCORE_CHANGE: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    #[error("contract is paused")]
    Paused,
    #[error("zero asset address")]
    ZeroAsset,
    #[error("caller lacks operator capability")]
    NotOperator,
    #[error("caller is not the owner")]
    NotOwner,
    #[error("asset not whitelisted")]
    NotWhitelisted,
    #[error("score out of range")]
    ScoreOutOfRange,
    #[error("confidence out of range")]
    ConfidenceOutOfRange,
    #[error("sample size must be at least 1")]
    EmptySample,
    #[error("update too soon: {remaining}s remain")]
    UpdateTooSoon { remaining: u64 },
    #[error("circuit breaker: score change {delta} exceeds limit")]
    CircuitBreaker { delta: i128 },
    #[error("batch of {len} exceeds maximum {max}")]
    BatchTooLarge { len: usize, max: usize },
}

#[derive(Debug, Default)]
struct AssetRecord {
    latest: Option<OracleEntry>,
    history: VecDeque<OracleEntry>,
    total_updates: u64,
}

/// Per-element outcome of a batch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchElementOutcome {
    Accepted,
    SkippedIneligible,
    SkippedBounds,
    SkippedTooSoon,
    SkippedCircuitBreaker,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub outcomes: Vec<BatchElementOutcome>,
}

impl BatchOutcome {
    pub fn accepted(&self) -> usize {
        self.outcomes.iter().filter(|o| matches!(o, BatchElementOutcome::Accepted)).count()
    }
}

/// The contract state machine.
pub struct OracleState {
    owner: Asset,
    operators: HashSet<Asset>,
    whitelist: HashSet<Asset>,
    whitelist_enabled: bool,
    paused: bool,
    circuit_breaker_enabled: bool,
    max_score_change: i128,
    min_update_interval: u64,
    records: HashMap<Asset, AssetRecord>,
    events: Vec<OracleEvent>,
}

impl OracleState {
    /// Deploy: the owner starts as the sole operator.
    pub fn new(owner: Asset) -> Self {
        let mut operators = HashSet::new();
        operators.insert(owner);
        Self {
            owner,
            operators,
            whitelist: HashSet::new(),
            whitelist_enabled: false,
            paused: false,
            circuit_breaker_enabled: true,
            max_score_change: DEFAULT_MAX_SCORE_CHANGE,
            min_update_interval: MIN_UPDATE_INTERVAL,
            records: HashMap::new(),
            events: Vec::new(),
        }
    }

    // --- write path ---

    pub fn update_sentiment(
        &mut self,
        caller: Asset,
        now: u64,
        asset: Asset,
        score: i128,
        sample_size: u32,
        confidence: u16,
    ) -> Result<(), OracleError> {
        if self.paused {
            return Err(OracleError::Paused);
        }
        if asset.is_zero() {
            return Err(OracleError::ZeroAsset);
        }
        if !self.operators.contains(&caller) {
            return Err(OracleError::NotOperator);
        }
        if self.whitelist_enabled && !self.whitelist.contains(&asset) {
            return Err(OracleError::NotWhitelisted);
        }
        self.check_bounds(score, sample_size, confidence)?;

        if let Some(remaining) = self.interval_remaining(asset, now) {
            return Err(OracleError::UpdateTooSoon { remaining });
        }
        if let Some(delta) = self.breaker_violation(asset, score) {
            self.events.push(OracleEvent::CircuitBreakerTriggered {
                asset,
                reason_code: BREAKER_REASON_SCORE_CHANGE,
            });
            return Err(OracleError::CircuitBreaker { delta });
        }

        self.commit(asset, now, score, sample_size, confidence);
        Ok(())
    }

    /// Batch write. Per-element rule violations skip the element; only
    /// caller/size/shape problems revert the whole call.
    pub fn batch_update_sentiment(
        &mut self,
        caller: Asset,
        now: u64,
        updates: &[(Asset, i128, u32, u16)],
    ) -> Result<BatchOutcome, OracleError> {
        if self.paused {
            return Err(OracleError::Paused);
        }
        if !self.operators.contains(&caller) {
            return Err(OracleError::NotOperator);
        }
        if updates.len() > MAX_BATCH_SIZE {
            return Err(OracleError::BatchTooLarge { len: updates.len(), max: MAX_BATCH_SIZE });
        }

        let mut outcomes = Vec::with_capacity(updates.len());
        for &(asset, score, sample_size, confidence) in updates {
            if asset.is_zero()
                || (self.whitelist_enabled && !self.whitelist.contains(&asset))
            {
                outcomes.push(BatchElementOutcome::SkippedIneligible);
                continue;
            }
            if self.check_bounds(score, sample_size, confidence).is_err() {
                outcomes.push(BatchElementOutcome::SkippedBounds);
                continue;
            }
            if self.interval_remaining(asset, now).is_some() {
                outcomes.push(BatchElementOutcome::SkippedTooSoon);
                continue;
            }
            if let Some(_delta) = self.breaker_violation(asset, score) {
                self.events.push(OracleEvent::CircuitBreakerTriggered {
                    asset,
                    reason_code: BREAKER_REASON_SCORE_CHANGE,
                });
                outcomes.push(BatchElementOutcome::SkippedCircuitBreaker);
                continue;
            }
            self.commit(asset, now, score, sample_size, confidence);
            outcomes.push(BatchElementOutcome::Accepted);
        }
        Ok(BatchOutcome { outcomes })
    }

    fn check_bounds(&self, score: i128, sample_size: u32, confidence: u16) -> Result<(), OracleError> {
        if score.abs() > SCORE_SCALE {
            return Err(OracleError::ScoreOutOfRange);
        }
        if confidence > MAX_CONFIDENCE_BP {
            return Err(OracleError::ConfidenceOutOfRange);
        }
        if sample_size < 1 {
            return Err(OracleError::EmptySample);
        }
        Ok(())
    }

    /// Seconds remaining before `asset` may be updated, if inside the window.
    fn interval_remaining(&self, asset: Asset, now: u64) -> Option<u64> {
        let last = self.records.get(&asset)?.latest?;
        let next_allowed = last.timestamp + self.min_update_interval;
        if now < next_allowed {
            Some(next_allowed - now)
        } else {
            None
        }
    }

    /// Circuit breaker applies only once an asset has a nonzero last score;
    /// first updates always pass.
    fn breaker_violation(&self, asset: Asset, score: i128) -> Option<i128> {
        if !self.circuit_breaker_enabled {
            return None;
        }
        let last = self.records.get(&asset)?.latest?;
        if last.score == 0 {
            return None;
        }
        let delta = (score - last.score).abs();
        if delta > self.max_score_change {
            Some(delta)
        } else {
            None
        }
    }

    fn commit(&mut self, asset: Asset, now: u64, score: i128, sample_size: u32, confidence: u16) {
        let entry = OracleEntry { score, timestamp: now, sample_size, confidence };
        let record = self.records.entry(asset).or_default();
        record.latest = Some(entry);
        if record.history.len() == HISTORY_CAPACITY {
            record.history.pop_front();
        }
        record.history.push_back(entry);
        record.total_updates += 1;
        self.events.push(OracleEvent::SentimentUpdated {
            asset,
            score,
            timestamp: now,
            confidence,
            sample_size,
        });
    }

    // --- reads ---

    pub fn latest(&self, asset: Asset) -> Option<OracleEntry> {
        self.records.get(&asset)?.latest
    }

    /// Up to `n` history entries, newest first.
    pub fn history(&self, asset: Asset, n: usize) -> Vec<OracleEntry> {
        let Some(record) = self.records.get(&asset) else { return Vec::new() };
        record.history.iter().rev().take(n.min(HISTORY_CAPACITY)).copied().collect()
    }

    pub fn history_len(&self, asset: Asset) -> usize {
        self.records.get(&asset).map_or(0, |r| r.history.len())
    }

    pub fn total_updates(&self, asset: Asset) -> u64 {
        self.records.get(&asset).map_or(0, |r| r.total_updates)
    }

    pub fn is_stale(&self, asset: Asset, now: u64, max_age: u64) -> bool {
        match self.latest(asset) {
            Some(entry) => now.saturating_sub(entry.timestamp) > max_age,
            None => true,
        }
    }

    /// Drain emitted events, oldest first.
    pub fn take_events(&mut self) -> Vec<OracleEvent> {
        std::mem::take(&mut self.events)
    }

    // --- admin surface (owner-gated, outside the hot path) ---

    fn require_owner(&self, caller: Asset) -> Result<(), OracleError> {
        if caller != self.owner {
            return Err(OracleError::NotOwner);
        }
        Ok(())
    }

    pub fn set_circuit_breaker(&mut self, caller: Asset, enabled: bool) -> Result<(), OracleError> {
        self.require_owner(caller)?;
        self.circuit_breaker_enabled = enabled;
        Ok(())
    }

    pub fn set_max_score_change(&mut self, caller: Asset, limit: i128) -> Result<(), OracleError> {
        self.require_owner(caller)?;
        self.max_score_change = limit;
        Ok(())
    }

    pub fn set_whitelist_enabled(&mut self, caller: Asset, enabled: bool) -> Result<(), OracleError> {
        self.require_owner(caller)?;
        self.whitelist_enabled = enabled;
        Ok(())
    }

    pub fn set_whitelisted(
        &mut self,
        caller: Asset,
        asset: Asset,
        status: bool,
    ) -> Result<(), OracleError> {
        self.require_owner(caller)?;
        if status {
            self.whitelist.insert(asset);
        } else {
            self.whitelist.remove(&asset);
        }
        self.events.push(OracleEvent::TokenWhitelisted { asset, status });
        Ok(())
    }

    pub fn set_paused(&mut self, caller: Asset, paused: bool) -> Result<(), OracleError> {
        self.require_owner(caller)?;
        self.paused = paused;
        Ok(())
    }

    pub fn grant_operator(&mut self, caller: Asset, operator: Asset) -> Result<(), OracleError> {
        self.require_owner(caller)?;
        self.operators.insert(operator);
        Ok(())
    }

    pub fn revoke_operator(&mut self, caller: Asset, operator: Asset) -> Result<(), OracleError> {
        self.require_owner(caller)?;
        self.operators.remove(&operator);
        Ok(())
    }

    pub fn min_update_interval(&self) -> u64 {
        self.min_update_interval
    }

    pub fn max_score_change(&self) -> i128 {
        self.max_score_change
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> Asset {
        Asset([2u8; 20])
    }

    #[test]
    fn happy_update_round_trips() {
        let owner = Asset([1u8; 20]);
        let mut oracle = OracleState::new(owner);
        oracle.update_sentiment(owner, 1000, token(), 42, 7, 9000).unwrap();
        let latest = oracle.latest(token()).unwrap();
        assert_eq!(latest.score, 42);
        assert_eq!(latest.sample_size, 7);
        assert_eq!(latest.confidence, 9000);
        assert_eq!(oracle.total_updates(token()), 1);

        let events = oracle.take_events();
        assert!(matches!(events.as_slice(), [OracleEvent::SentimentUpdated { score: 42, .. }]));
    }

    #[test]
    fn non_operator_rejected() {
        let owner = Asset([1u8; 20]);
        let mut oracle = OracleState::new(owner);
        let stranger = Asset([9u8; 20]);
        assert_eq!(
            oracle.update_sentiment(stranger, 0, token(), 1, 1, 1),
            Err(OracleError::NotOperator)
        );
    }

    #[test]
    fn min_interval_boundary() {
        let owner = Asset([1u8; 20]);
        let mut oracle = OracleState::new(owner);
        oracle.update_sentiment(owner, 1000, token(), 10, 1, 1).unwrap();
        // 239 seconds later: rejected.
        assert_eq!(
            oracle.update_sentiment(owner, 1239, token(), 20, 1, 1),
            Err(OracleError::UpdateTooSoon { remaining: 1 })
        );
        // Exactly 240 seconds later: accepted.
        oracle.update_sentiment(owner, 1240, token(), 20, 1, 1).unwrap();
    }

    #[test]
    fn circuit_breaker_bypasses_first_update_and_zero_last() {
        let owner = Asset([1u8; 20]);
        let mut oracle = OracleState::new(owner);
        // First update: any magnitude passes.
        oracle.update_sentiment(owner, 0, token(), SCORE_SCALE, 1, 1).unwrap();
        // Change of a full scale trips the breaker.
        let err = oracle.update_sentiment(owner, 1000, token(), -SCORE_SCALE, 1, 1);
        assert!(matches!(err, Err(OracleError::CircuitBreaker { .. })));
        let events = oracle.take_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, OracleEvent::CircuitBreakerTriggered { reason_code: 1, .. })));
    }

    #[test]
    fn circuit_breaker_can_be_disabled() {
        let owner = Asset([1u8; 20]);
        let mut oracle = OracleState::new(owner);
        oracle.update_sentiment(owner, 0, token(), SCORE_SCALE, 1, 1).unwrap();
        oracle.set_circuit_breaker(owner, false).unwrap();
        oracle.update_sentiment(owner, 1000, token(), -SCORE_SCALE, 1, 1).unwrap();
    }

    #[test]
    fn history_ring_never_exceeds_capacity() {
        let owner = Asset([1u8; 20]);
        let mut oracle = OracleState::new(owner);
        oracle.set_circuit_breaker(owner, false).unwrap();
        let mut now = 0u64;
        for i in 0..(HISTORY_CAPACITY as i128 + 10) {
            oracle.update_sentiment(owner, now, token(), i, 1, 1).unwrap();
            now += MIN_UPDATE_INTERVAL;
        }
        assert_eq!(oracle.history_len(token()), HISTORY_CAPACITY);
        // Newest first; oldest entries overwritten.
        let history = oracle.history(token(), HISTORY_CAPACITY);
        assert_eq!(history[0].score, HISTORY_CAPACITY as i128 + 9);
        assert_eq!(history.last().unwrap().score, 10);
        assert_eq!(oracle.total_updates(token()), HISTORY_CAPACITY as u64 + 10);
    }

    #[test]
    fn batch_skips_rule_violations_per_element() {
        let owner = Asset([1u8; 20]);
        let mut oracle = OracleState::new(owner);
        let a = Asset([2u8; 20]);
        let b = Asset([3u8; 20]);
        // Seed `a` so its second update is too soon.
        oracle.update_sentiment(owner, 1000, a, 10, 1, 1).unwrap();

        let updates = vec![
            (a, 20, 1, 1u16),               // too soon
            (b, 30, 1, 1u16),               // fine
            (Asset::ZERO, 1, 1, 1u16),      // zero asset, skipped
            (Asset([4u8; 20]), 1, 0, 1u16), // empty sample, skipped
        ];
        let outcome = oracle.batch_update_sentiment(owner, 1100, &updates).unwrap();
        assert_eq!(
            outcome.outcomes,
            vec![
                BatchElementOutcome::SkippedTooSoon,
                BatchElementOutcome::Accepted,
                BatchElementOutcome::SkippedIneligible,
                BatchElementOutcome::SkippedBounds,
            ]
        );
        assert_eq!(outcome.accepted(), 1);
        assert_eq!(oracle.latest(b).unwrap().score, 30);
        assert_eq!(oracle.latest(a).unwrap().score, 10);
    }

    #[test]
    fn batch_size_boundary() {
        let owner = Asset([1u8; 20]);
        let mut oracle = OracleState::new(owner);

        let make = |n: usize| -> Vec<(Asset, i128, u32, u16)> {
            (0..n)
                .map(|i| {
                    let mut addr = [0u8; 20];
                    addr[0] = 0x10;
                    addr[12..20].copy_from_slice(&(i as u64 + 1).to_be_bytes());
                    (Asset(addr), 1i128, 1u32, 1u16)
                })
                .collect()
        };

        let fifty = make(50);
        let outcome = oracle.batch_update_sentiment(owner, 0, &fifty).unwrap();
        assert_eq!(outcome.accepted(), 50);

        let fifty_one = make(51);
        assert_eq!(
            oracle.batch_update_sentiment(owner, 1000, &fifty_one),
            Err(OracleError::BatchTooLarge { len: 51, max: 50 })
        );
    }

    #[test]
    fn score_and_confidence_boundaries() {
        let owner = Asset([1u8; 20]);
        let mut oracle = OracleState::new(owner);
        oracle.set_circuit_breaker(owner, false).unwrap();
        let mut now = 0;
        // Extremes are legal.
        for (score, confidence) in
            [(SCORE_SCALE, 0u16), (-SCORE_SCALE, MAX_CONFIDENCE_BP), (0, 5000)]
        {
            oracle.update_sentiment(owner, now, token(), score, 1, confidence).unwrap();
            now += MIN_UPDATE_INTERVAL;
        }
        // One past the edge is not.
        assert_eq!(
            oracle.update_sentiment(owner, now, token(), SCORE_SCALE + 1, 1, 1),
            Err(OracleError::ScoreOutOfRange)
        );
        assert_eq!(
            oracle.update_sentiment(owner, now, token(), 0, 1, MAX_CONFIDENCE_BP + 1),
            Err(OracleError::ConfidenceOutOfRange)
        );
    }

    #[test]
    fn whitelist_gates_when_enabled() {
        let owner = Asset([1u8; 20]);
        let mut oracle = OracleState::new(owner);
        oracle.set_whitelist_enabled(owner, true).unwrap();
        assert_eq!(
            oracle.update_sentiment(owner, 0, token(), 1, 1, 1),
            Err(OracleError::NotWhitelisted)
        );
        oracle.set_whitelisted(owner, token(), true).unwrap();
        oracle.update_sentiment(owner, 0, token(), 1, 1, 1).unwrap();
        let events = oracle.take_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, OracleEvent::TokenWhitelisted { status: true, .. })));
    }

    #[test]
    fn pause_blocks_writes() {
        let owner = Asset([1u8; 20]);
        let mut oracle = OracleState::new(owner);
        oracle.set_paused(owner, true).unwrap();
        assert_eq!(oracle.update_sentiment(owner, 0, token(), 1, 1, 1), Err(OracleError::Paused));
        assert_eq!(
            oracle.batch_update_sentiment(owner, 0, &[(token(), 1, 1, 1)]),
            Err(OracleError::Paused)
        );
        oracle.set_paused(owner, false).unwrap();
        oracle.update_sentiment(owner, 0, token(), 1, 1, 1).unwrap();
    }

    #[test]
    fn operator_grant_and_revoke() {
        let owner = Asset([1u8; 20]);
        let mut oracle = OracleState::new(owner);
        let bot = Asset([8u8; 20]);
        oracle.grant_operator(owner, bot).unwrap();
        oracle.update_sentiment(bot, 0, token(), 1, 1, 1).unwrap();
        oracle.revoke_operator(owner, bot).unwrap();
        assert_eq!(
            oracle.update_sentiment(bot, 1000, token(), 2, 1, 1),
            Err(OracleError::NotOperator)
        );
        // Admin calls themselves are owner-only.
        assert_eq!(oracle.grant_operator(bot, bot), Err(OracleError::NotOwner));
    }

    #[test]
    fn last_update_is_monotone() {
        let owner = Asset([1u8; 20]);
        let mut oracle = OracleState::new(owner);
        oracle.set_circuit_breaker(owner, false).unwrap();
        let mut last_ts = 0;
        let mut now = 0;
        for i in 0..10 {
            oracle.update_sentiment(owner, now, token(), i, 1, 1).unwrap();
            let ts = oracle.latest(token()).unwrap().timestamp;
            assert!(ts >= last_ts);
            last_ts = ts;
            now += MIN_UPDATE_INTERVAL + 1;
        }
    }

    #[test]
    fn staleness_check() {
        let owner = Asset([1u8; 20]);
        let mut oracle = OracleState::new(owner);
        assert!(oracle.is_stale(token(), 0, 600));
        oracle.update_sentiment(owner, 1000, token(), 1, 1, 1).unwrap();
        assert!(!oracle.is_stale(token(), 1500, 600));
        assert!(oracle.is_stale(token(), 1601, 600));
    }
}
