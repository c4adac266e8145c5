//! Newswire collector.
//!
//! Pulls articles from a keyword-search news API. Article ids come from the
//! canonical URL; author weight comes from the outlet reliability score the
//! API exposes, defaulting to neutral when absent.

use super::rate_limit::SourceRateLimiter;
use super::{tag_assets, CollectError, CollectedBatch, CollectWindow, Collector};
use crate::types::{Asset, Item, Source};
use async_trait::async_trait;
use chrono::DateTime;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, instrument};

pub struct NewswireCollector {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    symbols: Vec<(Asset, String)>,
    limiter: Arc<SourceRateLimiter>,
}

#[derive(Debug, Deserialize)]
struct ArticlesResponse {
    status: String,
    #[serde(default)]
    articles: Vec<Article>,
}

#[derive(Debug, Deserialize)]
struct Article {
    #[serde(default)]
    source: Outlet,
    #[serde(default)]
    author: Option<String>,
    title: String,
    #[serde(default)]
    description: Option<String>,
    url: String,
    #[serde(rename = "publishedAt")]
    published_at: String,
}

#[derive(Debug, Default, Deserialize)]
struct Outlet {
    #[serde(default)]
    name: String,
    /// Editorial reliability in [0, 1], when the tier includes it.
    #[serde(default)]
    reliability: Option<f64>,
}

impl NewswireCollector {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        symbols: HashMap<Asset, String>,
        limiter: Arc<SourceRateLimiter>,
    ) -> Self {
        let mut symbols: Vec<_> = symbols.into_iter().collect();
        symbols.sort_by(|a, b| a.1.cmp(&b.1));
        Self { client, base_url: base_url.into(), api_key: api_key.into(), symbols, limiter }
    }

    fn query_for(&self, assets: &[Asset]) -> String {
        self.symbols
            .iter()
            .filter(|(asset, _)| assets.contains(asset))
            .map(|(_, symbol)| symbol.clone())
            .collect::<Vec<_>>()
            .join(" OR ")
    }

    fn outlet_weight(outlet: &Outlet) -> f64 {
        outlet.reliability.map(|r| r.clamp(0.0, 1.0)).unwrap_or(0.5)
    }
}

#[async_trait]
impl Collector for NewswireCollector {
    fn source(&self) -> Source {
        Source::Newswire
    }

    #[instrument(skip(self, assets), fields(source = "newswire"))]
    async fn collect(
        &self,
        window: CollectWindow,
        assets: &[Asset],
        deadline: Instant,
    ) -> Result<CollectedBatch, CollectError> {
        if !self.limiter.acquire(deadline).await {
            return Err(CollectError::Cancelled);
        }

        let response = self
            .client
            .get(format!("{}/v2/everything", self.base_url))
            .query(&[
                ("q", self.query_for(assets)),
                ("from", window.start.to_string()),
                ("to", window.end.to_string()),
                ("sortBy", "publishedAt".to_string()),
                ("apiKey", self.api_key.clone()),
            ])
            .send()
            .await
            .map_err(CollectError::from_reqwest)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CollectError::from_status(status, body));
        }

        let page: ArticlesResponse =
            response.json().await.map_err(|e| CollectError::Terminal(e.to_string()))?;
        if page.status != "ok" {
            return Err(CollectError::Terminal(format!("newswire status {}", page.status)));
        }

        let mut items = Vec::new();
        for article in &page.articles {
            let Some(created_at) =
                DateTime::parse_from_rfc3339(&article.published_at).ok().map(|dt| dt.timestamp())
            else {
                continue;
            };
            let text = match &article.description {
                Some(desc) if !desc.is_empty() => format!("{}. {}", article.title, desc),
                _ => article.title.clone(),
            };
            let asset_tags = tag_assets(&text, &self.symbols);
            if asset_tags.is_empty() {
                continue;
            }
            let author = article
                .author
                .clone()
                .unwrap_or_else(|| article.source.name.clone());
            items.push(Item::new(
                format!("newswire:{}", article.url),
                Source::Newswire,
                text,
                author,
                Self::outlet_weight(&article.source),
                created_at,
                asset_tags,
            ));
        }

        debug!(count = items.len(), "newswire collection complete");
        Ok(CollectedBatch { items, next_cursor: None })
    }
}
