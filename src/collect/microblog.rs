//! Microblog (tweet-style) collector.
//!
//! Talks to a v2-style recent-search API: bearer auth, cashtag queries,
//! cursor pagination, author metrics for quality weighting.

use super::rate_limit::SourceRateLimiter;
use super::{tag_assets, CollectError, CollectedBatch, CollectWindow, Collector};
use crate::types::{Asset, Item, Source};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, instrument};

const PAGE_SIZE: usize = 100;

pub struct MicroblogCollector {
    client: reqwest::Client,
    base_url: String,
    bearer_token: String,
    /// Asset -> cashtag symbol, used for query building and tagging.
    symbols: Vec<(Asset, String)>,
    limiter: Arc<SourceRateLimiter>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<Post>,
    #[serde(default)]
    includes: Includes,
    #[serde(default)]
    meta: Meta,
}

#[derive(Debug, Deserialize)]
struct Post {
    id: String,
    text: String,
    author_id: String,
    created_at: String,
}

#[derive(Debug, Default, Deserialize)]
struct Includes {
    #[serde(default)]
    users: Vec<Author>,
}

#[derive(Debug, Deserialize)]
struct Author {
    id: String,
    #[serde(default)]
    verified: bool,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    public_metrics: AuthorMetrics,
}

#[derive(Debug, Default, Deserialize)]
struct AuthorMetrics {
    #[serde(default)]
    followers_count: u64,
}

#[derive(Debug, Default, Deserialize)]
struct Meta {
    #[serde(default)]
    next_token: Option<String>,
}

impl MicroblogCollector {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        bearer_token: impl Into<String>,
        symbols: HashMap<Asset, String>,
        limiter: Arc<SourceRateLimiter>,
    ) -> Self {
        let mut symbols: Vec<_> = symbols.into_iter().collect();
        symbols.sort_by(|a, b| a.1.cmp(&b.1));
        Self {
            client,
            base_url: base_url.into(),
            bearer_token: bearer_token.into(),
            symbols,
            limiter,
        }
    }

    fn query_for(&self, assets: &[Asset]) -> String {
        let terms: Vec<String> = self
            .symbols
            .iter()
            .filter(|(asset, _)| assets.contains(asset))
            .map(|(_, symbol)| format!("${symbol}"))
            .collect();
        format!("({}) -is:retweet", terms.join(" OR "))
    }

    /// Quality weight from author metrics. Defaults to 0.5 when the author
    /// record is missing from the includes block.
    fn author_weight(author: Option<&Author>, window_end: i64) -> f64 {
        let Some(author) = author else { return 0.5 };
        let mut weight: f64 = 0.5;
        if author.verified {
            weight += 0.3;
        }
        if author.public_metrics.followers_count > 10_000 {
            weight += 0.1;
        } else if author.public_metrics.followers_count < 50 {
            weight -= 0.3;
        }
        let account_age_days = author
            .created_at
            .as_deref()
            .and_then(parse_rfc3339)
            .map(|created| (window_end - created) / 86_400)
            .unwrap_or(i64::MAX);
        if account_age_days < 30 {
            weight *= 0.5;
        }
        weight.clamp(0.0, 1.0)
    }
}

fn parse_rfc3339(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp())
}

fn to_rfc3339(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now).to_rfc3339()
}

#[async_trait]
impl Collector for MicroblogCollector {
    fn source(&self) -> Source {
        Source::Microblog
    }

    #[instrument(skip(self, assets), fields(source = "microblog"))]
    async fn collect(
        &self,
        window: CollectWindow,
        assets: &[Asset],
        deadline: Instant,
    ) -> Result<CollectedBatch, CollectError> {
        let query = self.query_for(assets);
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            if !self.limiter.acquire(deadline).await {
                return Err(CollectError::Cancelled);
            }

            let mut request = self
                .client
                .get(format!("{}/2/tweets/search/recent", self.base_url))
                .bearer_auth(&self.bearer_token)
                .query(&[
                    ("query", query.clone()),
                    ("start_time", to_rfc3339(window.start)),
                    ("end_time", to_rfc3339(window.end)),
                    ("max_results", PAGE_SIZE.to_string()),
                    ("tweet.fields", "created_at,author_id".to_string()),
                    ("expansions", "author_id".to_string()),
                    ("user.fields", "verified,created_at,public_metrics".to_string()),
                ]);
            if let Some(token) = &cursor {
                request = request.query(&[("next_token", token.clone())]);
            }

            let response = request.send().await.map_err(CollectError::from_reqwest)?;
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(CollectError::from_status(status, body));
            }

            let page: SearchResponse =
                response.json().await.map_err(|e| CollectError::Terminal(e.to_string()))?;

            let authors: HashMap<&str, &Author> =
                page.includes.users.iter().map(|u| (u.id.as_str(), u)).collect();

            for post in &page.data {
                let Some(created_at) = parse_rfc3339(&post.created_at) else {
                    continue;
                };
                let asset_tags = tag_assets(&post.text, &self.symbols);
                if asset_tags.is_empty() {
                    continue;
                }
                let weight =
                    Self::author_weight(authors.get(post.author_id.as_str()).copied(), window.end);
                items.push(Item::new(
                    format!("microblog:{}", post.id),
                    Source::Microblog,
                    post.text.clone(),
                    post.author_id.clone(),
                    weight,
                    created_at,
                    asset_tags,
                ));
            }

            cursor = page.meta.next_token;
            if cursor.is_none() || Instant::now() >= deadline {
                break;
            }
        }

        debug!(count = items.len(), "microblog collection complete");
        Ok(CollectedBatch { items, next_cursor: cursor })
    }
}
