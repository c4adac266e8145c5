//! Durable off-chain state.
//!
//! The pipeline is nearly stateless; only the dedup index and the
//! submission log survive restarts. Both live in one SQLite file and both
//! tolerate truncation: lost seen-items are re-observed next cycle, lost
//! submission rows are re-learned from the chain during reconciliation.

use crate::types::Asset;
use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};
use tracing::{debug, info};

pub struct Ledger {
    pool: Pool<Sqlite>,
}

/// One row of the submission log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRow {
    pub tx_hash: String,
    pub nonce: u64,
    pub status: String,
    pub ts: i64,
    pub assets: Vec<Asset>,
    /// Hex provenance digests, one per asset in the batch.
    pub source_hashes: Vec<String>,
}

impl Ledger {
    /// Open (or create) the ledger at `path`. Pass `sqlite::memory:` for
    /// ephemeral use in tests.
    pub async fn open(path: &str) -> Result<Self> {
        let url = if path == "sqlite::memory:" {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .context("failed to open ledger database")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS seen_items (
                item_id       TEXT PRIMARY KEY,
                first_seen_ts INTEGER NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create seen_items table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS submissions (
                tx_hash       TEXT PRIMARY KEY,
                nonce         INTEGER NOT NULL,
                status        TEXT NOT NULL,
                ts            INTEGER NOT NULL,
                assets        TEXT NOT NULL,
                source_hashes TEXT NOT NULL DEFAULT '[]'
            );
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create submissions table")?;

        info!("ledger opened at {}", path);
        Ok(Self { pool })
    }

    // --- dedup index ---

    pub async fn record_seen(&self, entries: &[(String, i64)]) -> Result<()> {
        for (item_id, first_seen_ts) in entries {
            sqlx::query(
                "INSERT OR IGNORE INTO seen_items (item_id, first_seen_ts) VALUES (?, ?)",
            )
            .bind(item_id)
            .bind(first_seen_ts)
            .execute(&self.pool)
            .await
            .context("failed to record seen item")?;
        }
        debug!(count = entries.len(), "seen items recorded");
        Ok(())
    }

    /// Entries first seen at or after `cutoff`, for warming the dedup index.
    pub async fn load_seen_since(&self, cutoff: i64) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT item_id, first_seen_ts FROM seen_items WHERE first_seen_ts >= ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("failed to load seen items")?;
        Ok(rows)
    }

    /// Remove entries past the horizon. Returns the number pruned.
    pub async fn prune_seen(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM seen_items WHERE first_seen_ts < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("failed to prune seen items")?;
        Ok(result.rows_affected())
    }

    // --- submission log ---

    pub async fn record_submission(
        &self,
        tx_hash: &str,
        nonce: u64,
        status: &str,
        ts: i64,
        assets: &[Asset],
        source_hashes: &[String],
    ) -> Result<()> {
        let assets_json = serde_json::to_string(assets)?;
        let hashes_json = serde_json::to_string(source_hashes)?;
        sqlx::query(
            r#"
            INSERT INTO submissions (tx_hash, nonce, status, ts, assets, source_hashes)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(tx_hash) DO UPDATE SET status = excluded.status, ts = excluded.ts
            "#,
        )
        .bind(tx_hash)
        .bind(nonce as i64)
        .bind(status)
        .bind(ts)
        .bind(assets_json)
        .bind(hashes_json)
        .execute(&self.pool)
        .await
        .context("failed to record submission")?;
        Ok(())
    }

    /// Rows not yet in a terminal state, oldest nonce first.
    pub async fn pending_submissions(&self) -> Result<Vec<SubmissionRow>> {
        let rows: Vec<(String, i64, String, i64, String, String)> = sqlx::query_as(
            r#"
            SELECT tx_hash, nonce, status, ts, assets, source_hashes FROM submissions
            WHERE status NOT IN ('confirmed', 'reverted')
            ORDER BY nonce ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to load pending submissions")?;

        rows.into_iter()
            .map(|(tx_hash, nonce, status, ts, assets_json, hashes_json)| {
                let assets: Vec<Asset> = serde_json::from_str(&assets_json)
                    .context("corrupt assets column in submissions row")?;
                let source_hashes: Vec<String> = serde_json::from_str(&hashes_json)
                    .context("corrupt source_hashes column in submissions row")?;
                Ok(SubmissionRow { tx_hash, nonce: nonce as u64, status, ts, assets, source_hashes })
            })
            .collect()
    }

    pub async fn submission_status(&self, tx_hash: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM submissions WHERE tx_hash = ?")
                .bind(tx_hash)
                .fetch_optional(&self.pool)
                .await
                .context("failed to read submission status")?;
        Ok(row.map(|(status,)| status))
    }
}
