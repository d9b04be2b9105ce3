use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::metering::pricing;

/// Hard limits on what an untrusted caller can hand us.
pub const MAX_BATCH_EVENTS: usize = 50;
pub const MAX_METADATA_BYTES: usize = 2048;
pub const MAX_ERROR_MESSAGE_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MessageSent,
    CompletionReceived,
}

/// One client-side usage event. Everything is optional beyond the kind;
/// the payload comes from unauthenticated callers and is low-trust.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub kind: EventKind,
    pub occurred_at: Option<DateTime<Utc>>,
    pub model_id: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub generation_ms: Option<i64>,
}

/// Error report from an anonymous client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub client_hash: String,
    pub model_id: Option<String>,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
}

/// What a successful batch ingestion folded in.
#[derive(Debug, Clone)]
pub struct IngestReceipt {
    pub date: NaiveDate,
    pub messages_sent: u32,
    pub completions: u32,
}

/// Folds batched anonymous usage events into daily aggregates.
///
/// Writes only aggregate tables keyed by the caller-supplied opaque hash,
/// never per-event detail. A rejected batch has no partial effect: the whole
/// batch is applied in one transaction or not at all.
pub struct EventAggregator {
    pool: SqlitePool,
}

impl EventAggregator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ingest_usage_events(
        &self,
        client_hash: &str,
        events: &[UsageEvent],
    ) -> Result<IngestReceipt> {
        if client_hash.trim().is_empty() {
            return Err(Error::validation("missing_client_hash"));
        }
        if events.is_empty() {
            return Err(Error::validation("empty_batch"));
        }
        if events.len() > MAX_BATCH_EVENTS {
            return Err(Error::validation("batch_too_large"));
        }
        for event in events {
            if event.prompt_tokens.unwrap_or(0) < 0
                || event.completion_tokens.unwrap_or(0) < 0
                || event.generation_ms.unwrap_or(0) < 0
            {
                return Err(Error::validation("negative_quantity"));
            }
        }

        // The whole batch belongs to one UTC calendar day, taken from the
        // first event's clock (the caller's clock is indicative, not load
        // bearing), falling back to the server's date.
        let date = events[0]
            .occurred_at
            .map(|ts| ts.date_naive())
            .unwrap_or_else(|| Utc::now().date_naive());

        let mut messages_sent = 0u32;
        let mut completions = 0u32;

        let mut tx = self.pool.begin().await?;

        for event in events {
            match event.kind {
                EventKind::MessageSent => {
                    messages_sent += 1;
                    sqlx::query(
                        r#"
                        INSERT INTO anon_usage_daily (client_hash, usage_date, messages_sent)
                        VALUES (?, ?, 1)
                        ON CONFLICT(client_hash, usage_date) DO UPDATE SET
                            messages_sent = messages_sent + 1,
                            updated_at = unixepoch()
                        "#,
                    )
                    .bind(client_hash)
                    .bind(date.to_string())
                    .execute(&mut *tx)
                    .await?;
                }
                EventKind::CompletionReceived => {
                    completions += 1;
                    let prompt_tokens = event.prompt_tokens.unwrap_or(0);
                    let completion_tokens = event.completion_tokens.unwrap_or(0);
                    let generation_ms = event.generation_ms.unwrap_or(0);

                    // Prices are snapshotted at ingestion time so later
                    // catalog changes never rewrite historical estimates.
                    let snapshot =
                        pricing::resolve_pricing(&self.pool, event.model_id.as_deref()).await?;
                    let estimated_micros =
                        pricing::component_micros(prompt_tokens, snapshot.prompt_price)?
                            + pricing::component_micros(
                                completion_tokens,
                                snapshot.completion_price,
                            )?;

                    sqlx::query(
                        r#"
                        INSERT INTO anon_usage_daily (
                            client_hash, usage_date, messages_received, prompt_tokens,
                            completion_tokens, generation_ms, estimated_cost_micros
                        ) VALUES (?, ?, 1, ?, ?, ?, ?)
                        ON CONFLICT(client_hash, usage_date) DO UPDATE SET
                            messages_received = messages_received + 1,
                            prompt_tokens = prompt_tokens + excluded.prompt_tokens,
                            completion_tokens = completion_tokens + excluded.completion_tokens,
                            generation_ms = generation_ms + excluded.generation_ms,
                            estimated_cost_micros = estimated_cost_micros + excluded.estimated_cost_micros,
                            updated_at = unixepoch()
                        "#,
                    )
                    .bind(client_hash)
                    .bind(date.to_string())
                    .bind(prompt_tokens)
                    .bind(completion_tokens)
                    .bind(generation_ms)
                    .bind(estimated_micros)
                    .execute(&mut *tx)
                    .await?;

                    if let Some(model_id) = &event.model_id {
                        sqlx::query(
                            r#"
                            INSERT INTO anon_model_usage_daily (
                                model_id, usage_date, messages_received, prompt_tokens,
                                completion_tokens, estimated_cost_micros
                            ) VALUES (?, ?, 1, ?, ?, ?)
                            ON CONFLICT(model_id, usage_date) DO UPDATE SET
                                messages_received = messages_received + 1,
                                prompt_tokens = prompt_tokens + excluded.prompt_tokens,
                                completion_tokens = completion_tokens + excluded.completion_tokens,
                                estimated_cost_micros = estimated_cost_micros + excluded.estimated_cost_micros,
                                updated_at = unixepoch()
                            "#,
                        )
                        .bind(model_id)
                        .bind(date.to_string())
                        .bind(prompt_tokens)
                        .bind(completion_tokens)
                        .bind(estimated_micros)
                        .execute(&mut *tx)
                        .await?;
                    }
                }
            }
        }

        tx.commit().await?;

        info!(
            "Ingested anonymous batch: hash={}, date={}, sent={}, completions={}",
            client_hash, date, messages_sent, completions
        );
        Ok(IngestReceipt {
            date,
            messages_sent,
            completions,
        })
    }

    /// Store one error report. Append-only; message and metadata are capped
    /// before storage, oversized metadata is replaced with a truncation
    /// marker rather than rejecting the report.
    pub async fn ingest_error_event(&self, report: &ErrorReport) -> Result<()> {
        if report.client_hash.trim().is_empty() {
            return Err(Error::validation("missing_client_hash"));
        }
        if report.message.trim().is_empty() {
            return Err(Error::validation("missing_message"));
        }

        let message: String = report.message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect();

        let metadata = match &report.metadata {
            Some(value) => {
                let serialized = serde_json::to_string(value)?;
                if serialized.len() > MAX_METADATA_BYTES {
                    debug!(
                        "Error report metadata over {} bytes, storing truncation marker",
                        MAX_METADATA_BYTES
                    );
                    Some(r#"{"truncated":true}"#.to_string())
                } else {
                    Some(serialized)
                }
            }
            None => None,
        };

        sqlx::query(
            "INSERT INTO anon_error_events (client_hash, model_id, message, metadata) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&report.client_hash)
        .bind(&report.model_id)
        .bind(&message)
        .bind(&metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Retention policy for individual error events; aggregates are kept.
    pub async fn cleanup_error_events(&self, days_to_keep: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(days_to_keep as i64);

        let deleted = sqlx::query("DELETE FROM anon_error_events WHERE created_at < ?")
            .bind(cutoff.timestamp())
            .execute(&self.pool)
            .await?
            .rows_affected();

        info!(
            "Cleaned up {} anonymous error events older than {} days",
            deleted, days_to_keep
        );
        Ok(deleted)
    }
}
