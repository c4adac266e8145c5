//! Collection stage: source abstraction, rate discipline, deduplication.
//!
//! Collectors are pure sources. They fetch a bounded batch of items for a
//! time window, never score, never persist. Transient failures retry with
//! exponential backoff inside the source; terminal failures skip the source
//! for the cycle.

pub mod chat;
pub mod dedup;
pub mod microblog;
pub mod newswire;
pub mod rate_limit;

pub use dedup::Deduplicator;
pub use rate_limit::{RateLimiterRegistry, SourceRateLimiter};

use crate::types::{Asset, Item, Source};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use tracing::{debug, warn};

/// Closed-open collection window in unix seconds: [start, end).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectWindow {
    pub start: i64,
    pub end: i64,
}

impl CollectWindow {
    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// Result of one collection call.
#[derive(Debug, Default)]
pub struct CollectedBatch {
    pub items: Vec<Item>,
    /// Opaque continuation token for sources that paginate past the cap.
    pub next_cursor: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    /// Worth retrying within the cycle: timeouts, 429s, 5xx.
    #[error("transient: {0}")]
    Transient(String),
    /// Not worth retrying: bad credentials, malformed request, revoked access.
    #[error("terminal: {0}")]
    Terminal(String),
    /// Cycle deadline reached mid-collection.
    #[error("cancelled at cycle deadline")]
    Cancelled,
}

impl CollectError {
    /// Map an HTTP failure to the retry taxonomy.
    pub fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        if status.as_u16() == 429 || status.is_server_error() {
            CollectError::Transient(format!("{status}: {body}"))
        } else {
            CollectError::Terminal(format!("{status}: {body}"))
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            CollectError::Transient(err.to_string())
        } else {
            CollectError::Terminal(err.to_string())
        }
    }
}

/// A bounded, window-scoped item source.
///
/// Implementations must return items in stable `created_at` order and must
/// include ids such that replaying the same window yields a deterministic
/// superset.
#[async_trait]
pub trait Collector: Send + Sync {
    fn source(&self) -> Source;

    async fn collect(
        &self,
        window: CollectWindow,
        assets: &[Asset],
        deadline: Instant,
    ) -> Result<CollectedBatch, CollectError>;
}

/// Backoff schedule for transient source errors: 500 ms base, doubling,
/// capped at 30 s, five attempts total.
fn transient_backoff() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(2)
        .factor(250)
        .max_delay(Duration::from_secs(30))
        .take(4)
}

/// Collect with the standard retry discipline. Items are re-sorted by
/// `created_at` and capped so a misbehaving source cannot flood the cycle.
pub async fn collect_with_retries(
    collector: &dyn Collector,
    window: CollectWindow,
    assets: &[Asset],
    deadline: Instant,
    item_cap: usize,
) -> Result<Vec<Item>, CollectError> {
    let source = collector.source();
    let result = RetryIf::spawn(
        transient_backoff(),
        || collector.collect(window, assets, deadline),
        |err: &CollectError| {
            let retry = matches!(err, CollectError::Transient(_)) && Instant::now() < deadline;
            if retry {
                debug!(source = %source, error = %err, "retrying transient collector failure");
            }
            retry
        },
    )
    .await;

    match result {
        Ok(batch) => {
            let mut items = batch.items;
            if items.len() > item_cap {
                warn!(source = %source, dropped = items.len() - item_cap, "collector exceeded item cap");
                items.truncate(item_cap);
            }
            items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
            items.retain(|item| window.contains(item.created_at));
            Ok(items)
        }
        Err(err) => Err(err),
    }
}

/// Tag an item's text with every asset whose cashtag, bare symbol, or hex
/// address appears in it. Collectors share this so tagging stays uniform
/// across sources.
pub(crate) fn tag_assets(text: &str, symbols: &[(Asset, String)]) -> Vec<Asset> {
    let lower = text.to_lowercase();
    let mut tags = Vec::new();
    for (asset, symbol) in symbols {
        let sym = symbol.to_lowercase();
        let cashtag = format!("${sym}");
        let address = asset.to_string();
        if lower.contains(&cashtag)
            || lower.contains(&address)
            || contains_word(&lower, &sym)
        {
            tags.push(*asset);
        }
    }
    tags
}

/// Whole-word containment so "sol" does not match "solution".
fn contains_word(haystack: &str, word: &str) -> bool {
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(word) {
        let abs = start + pos;
        let before_ok = abs == 0
            || !haystack[..abs].chars().next_back().map_or(false, |c| c.is_alphanumeric());
        let after = abs + word.len();
        let after_ok =
            after >= haystack.len() || !haystack[after..].chars().next().map_or(false, |c| c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        start = abs + word.len();
        if start >= haystack.len() {
            break;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyCollector {
        attempts: AtomicU32,
        fail_first: u32,
        terminal: bool,
    }

    #[async_trait]
    impl Collector for FlakyCollector {
        fn source(&self) -> Source {
            Source::Newswire
        }

        async fn collect(
            &self,
            window: CollectWindow,
            _assets: &[Asset],
            _deadline: Instant,
        ) -> Result<CollectedBatch, CollectError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                if self.terminal {
                    return Err(CollectError::Terminal("revoked".into()));
                }
                return Err(CollectError::Transient("flaky".into()));
            }
            let items = vec![
                Item::new("b", Source::Newswire, "later", "a1", 0.5, window.start + 2, vec![]),
                Item::new("a", Source::Newswire, "earlier", "a2", 0.5, window.start + 1, vec![]),
                Item::new("late", Source::Newswire, "outside", "a3", 0.5, window.end + 5, vec![]),
            ];
            Ok(CollectedBatch { items, next_cursor: None })
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(300)
    }

    #[tokio::test]
    async fn retries_transient_then_sorts_and_windows() {
        let collector =
            FlakyCollector { attempts: AtomicU32::new(0), fail_first: 2, terminal: false };
        let window = CollectWindow { start: 100, end: 400 };
        let items = collect_with_retries(&collector, window, &[], far_deadline(), 100)
            .await
            .unwrap();
        // Out-of-window item dropped, remainder ordered by created_at.
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "a");
        assert_eq!(items[1].id, "b");
        assert_eq!(collector.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_errors_do_not_retry() {
        let collector =
            FlakyCollector { attempts: AtomicU32::new(0), fail_first: 1, terminal: true };
        let window = CollectWindow { start: 0, end: 10 };
        let err = collect_with_retries(&collector, window, &[], far_deadline(), 100)
            .await
            .unwrap_err();
        assert!(matches!(err, CollectError::Terminal(_)));
        assert_eq!(collector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn item_cap_truncates() {
        struct Flood;
        #[async_trait]
        impl Collector for Flood {
            fn source(&self) -> Source {
                Source::ChatA
            }
            async fn collect(
                &self,
                window: CollectWindow,
                _assets: &[Asset],
                _deadline: Instant,
            ) -> Result<CollectedBatch, CollectError> {
                let items = (0..50)
                    .map(|i| {
                        Item::new(
                            format!("id-{i}"),
                            Source::ChatA,
                            "x",
                            "a",
                            0.5,
                            window.start + i,
                            vec![],
                        )
                    })
                    .collect();
                Ok(CollectedBatch { items, next_cursor: None })
            }
        }
        let window = CollectWindow { start: 0, end: 100 };
        let items = collect_with_retries(&Flood, window, &[], far_deadline(), 10).await.unwrap();
        assert_eq!(items.len(), 10);
    }

    #[test]
    fn tagging_matches_cashtag_symbol_and_address() {
        let eth = Asset([0xaa; 20]);
        let sol = Asset([0xbb; 20]);
        let symbols = vec![(eth, "ETH".to_string()), (sol, "SOL".to_string())];

        assert_eq!(tag_assets("loading up on $eth today", &symbols), vec![eth]);
        assert_eq!(tag_assets("ETH looks strong", &symbols), vec![eth]);
        assert_eq!(
            tag_assets(&format!("watch {}", Asset([0xbb; 20])), &symbols),
            vec![sol]
        );
        // Substring of a longer word must not match.
        assert!(tag_assets("no solution here", &symbols).is_empty());
        // Multi-tag items contribute to both assets.
        assert_eq!(tag_assets("$eth flipping $sol", &symbols), vec![eth, sol]);
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            CollectError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, String::new()),
            CollectError::Transient(_)
        ));
        assert!(matches!(
            CollectError::from_status(reqwest::StatusCode::BAD_GATEWAY, String::new()),
            CollectError::Transient(_)
        ));
        assert!(matches!(
            CollectError::from_status(reqwest::StatusCode::UNAUTHORIZED, String::new()),
            CollectError::Terminal(_)
        ));
    }
}
