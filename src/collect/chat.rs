//! Chat-room collector.
//!
//! Covers both chat sources; each instance is bound to one platform variant
//! with its own credential, room list, and rate budget. Room history is
//! fetched per room over the window and merged.

use super::rate_limit::SourceRateLimiter;
use super::{tag_assets, CollectError, CollectedBatch, CollectWindow, Collector};
use crate::types::{Asset, Item, Source};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

pub struct ChatCollector {
    client: reqwest::Client,
    base_url: String,
    token: String,
    variant: Source,
    rooms: Vec<String>,
    symbols: Vec<(Asset, String)>,
    limiter: Arc<SourceRateLimiter>,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    id: String,
    text: String,
    ts: i64,
    sender: Sender,
}

#[derive(Debug, Deserialize)]
struct Sender {
    id: String,
    #[serde(default)]
    role: Option<String>,
    /// Unix seconds the sender joined the room.
    #[serde(default)]
    joined_at: Option<i64>,
}

impl ChatCollector {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        token: impl Into<String>,
        variant: Source,
        rooms: Vec<String>,
        symbols: HashMap<Asset, String>,
        limiter: Arc<SourceRateLimiter>,
    ) -> Self {
        debug_assert!(matches!(variant, Source::ChatA | Source::ChatB));
        let mut symbols: Vec<_> = symbols.into_iter().collect();
        symbols.sort_by(|a, b| a.1.cmp(&b.1));
        Self {
            client,
            base_url: base_url.into(),
            token: token.into(),
            variant,
            rooms,
            symbols,
            limiter,
        }
    }

    /// Moderators and long-tenured members carry more weight; fresh joins
    /// carry very little.
    fn sender_weight(sender: &Sender, now: i64) -> f64 {
        if matches!(sender.role.as_deref(), Some("admin") | Some("moderator")) {
            return 0.8;
        }
        match sender.joined_at {
            Some(joined) => {
                let tenure_days = (now - joined) / 86_400;
                if tenure_days >= 180 {
                    0.6
                } else if tenure_days < 7 {
                    0.2
                } else {
                    0.5
                }
            }
            None => 0.5,
        }
    }
}

#[async_trait]
impl Collector for ChatCollector {
    fn source(&self) -> Source {
        self.variant
    }

    #[instrument(skip(self, _assets), fields(source = %self.variant))]
    async fn collect(
        &self,
        window: CollectWindow,
        _assets: &[Asset],
        deadline: Instant,
    ) -> Result<CollectedBatch, CollectError> {
        let mut items = Vec::new();

        for room in &self.rooms {
            if Instant::now() >= deadline {
                return Err(CollectError::Cancelled);
            }
            if !self.limiter.acquire(deadline).await {
                return Err(CollectError::Cancelled);
            }

            let response = self
                .client
                .get(format!("{}/rooms/{}/messages", self.base_url, room))
                .bearer_auth(&self.token)
                .query(&[
                    ("after_ts", window.start.to_string()),
                    ("before_ts", window.end.to_string()),
                    ("limit", "1000".to_string()),
                ])
                .send()
                .await
                .map_err(CollectError::from_reqwest)?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let err = CollectError::from_status(status, body);
                // One bad room should not sink the other rooms in the cycle.
                if matches!(err, CollectError::Terminal(_)) {
                    warn!(room, error = %err, "skipping chat room for cycle");
                    continue;
                }
                return Err(err);
            }

            let page: HistoryResponse =
                response.json().await.map_err(|e| CollectError::Terminal(e.to_string()))?;

            for message in &page.messages {
                let asset_tags = tag_assets(&message.text, &self.symbols);
                if asset_tags.is_empty() {
                    continue;
                }
                items.push(Item::new(
                    format!("{}:{}:{}", self.variant, room, message.id),
                    self.variant,
                    message.text.clone(),
                    message.sender.id.clone(),
                    Self::sender_weight(&message.sender, window.end),
                    message.ts,
                    asset_tags,
                ));
            }
        }

        debug!(count = items.len(), "chat collection complete");
        Ok(CollectedBatch { items, next_cursor: None })
    }
}
