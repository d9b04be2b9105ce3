use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::catalog::ModelFeedRecord;
use crate::error::{Error, Result};

/// Outcome of one reconciliation invocation. Failures during the pass are
/// reported here rather than raised: the run record carries the error and the
/// catalog itself is rolled back untouched.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub success: bool,
    pub sync_run_id: i64,
    pub models_seen: u32,
    pub added: u32,
    pub updated: u32,
    pub marked_inactive: u32,
    pub reactivated: u32,
    pub duration_ms: i64,
    pub error: Option<String>,
}

/// One row of append-only sync history.
#[derive(Debug, Clone)]
pub struct SyncRun {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub models_seen: u32,
    pub added: u32,
    pub updated: u32,
    pub marked_inactive: u32,
    pub reactivated: u32,
    pub status: String,
    pub duration_ms: Option<i64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub attributed_to: Option<String>,
}

#[derive(Debug, Default)]
struct PassCounts {
    added: u32,
    updated: u32,
    marked_inactive: u32,
    reactivated: u32,
}

/// Reconciles a full provider snapshot against the local catalog.
///
/// The whole pass runs in one transaction so a mid-run failure cannot leave
/// the catalog half-updated. Tier-access flags and the `disabled` status are
/// administrator-owned and never written here.
pub struct CatalogReconciler {
    pool: SqlitePool,
}

impl CatalogReconciler {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run one reconciliation pass over a full snapshot.
    ///
    /// `attributed_to` records which operator (or scheduler identity)
    /// triggered the run; `external_start` attributes wall-clock duration
    /// correctly when the feed fetch itself took meaningful time.
    pub async fn sync_catalog(
        &self,
        models: &[ModelFeedRecord],
        attributed_to: Option<&str>,
        external_start: Option<DateTime<Utc>>,
    ) -> Result<SyncReport> {
        let started_at = external_start.unwrap_or_else(Utc::now);
        let models_seen = models.len() as u32;

        info!(
            "Starting catalog sync: {} models in snapshot, attributed_to={:?}",
            models_seen, attributed_to
        );

        // The run record is opened outside the pass transaction so a failed
        // pass still leaves an observable 'failed' row behind.
        let sync_run_id = sqlx::query(
            r#"
            INSERT INTO sync_runs (started_at, models_seen, status, attributed_to)
            VALUES (?, ?, 'running', ?)
            "#,
        )
        .bind(started_at.timestamp())
        .bind(models_seen as i64)
        .bind(attributed_to)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        match self.run_pass(models).await {
            Ok(counts) => {
                let finished_at = Utc::now();
                let duration_ms = (finished_at - started_at).num_milliseconds();

                sqlx::query(
                    r#"
                    UPDATE sync_runs
                    SET status = 'completed', finished_at = ?, duration_ms = ?,
                        added = ?, updated = ?, marked_inactive = ?, reactivated = ?
                    WHERE id = ?
                    "#,
                )
                .bind(finished_at.timestamp())
                .bind(duration_ms)
                .bind(counts.added as i64)
                .bind(counts.updated as i64)
                .bind(counts.marked_inactive as i64)
                .bind(counts.reactivated as i64)
                .bind(sync_run_id)
                .execute(&self.pool)
                .await?;

                info!(
                    "Catalog sync completed: run={}, added={}, updated={}, inactive={}, reactivated={}, {}ms",
                    sync_run_id,
                    counts.added,
                    counts.updated,
                    counts.marked_inactive,
                    counts.reactivated,
                    duration_ms
                );

                Ok(SyncReport {
                    success: true,
                    sync_run_id,
                    models_seen,
                    added: counts.added,
                    updated: counts.updated,
                    marked_inactive: counts.marked_inactive,
                    reactivated: counts.reactivated,
                    duration_ms,
                    error: None,
                })
            }
            Err(e) => {
                let finished_at = Utc::now();
                let duration_ms = (finished_at - started_at).num_milliseconds();

                warn!("Catalog sync failed: run={}, error={}", sync_run_id, e);

                sqlx::query(
                    r#"
                    UPDATE sync_runs
                    SET status = 'failed', finished_at = ?, duration_ms = ?,
                        error_code = ?, error_message = ?
                    WHERE id = ?
                    "#,
                )
                .bind(finished_at.timestamp())
                .bind(duration_ms)
                .bind(e.code())
                .bind(e.to_string())
                .bind(sync_run_id)
                .execute(&self.pool)
                .await?;

                Ok(SyncReport {
                    success: false,
                    sync_run_id,
                    models_seen,
                    added: 0,
                    updated: 0,
                    marked_inactive: 0,
                    reactivated: 0,
                    duration_ms,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    /// The reconciliation pass proper: everything here commits or rolls back
    /// as one unit.
    async fn run_pass(&self, models: &[ModelFeedRecord]) -> Result<PassCounts> {
        let mut counts = PassCounts::default();
        let mut tx = self.pool.begin().await?;

        for record in models {
            if record.id.is_empty() {
                return Err(Error::sync("feed record with empty model id"));
            }

            let existing_status: Option<String> =
                sqlx::query_scalar("SELECT status FROM model_catalog WHERE model_id = ?")
                    .bind(&record.id)
                    .fetch_optional(&mut *tx)
                    .await?;

            match existing_status {
                Some(status) => {
                    // Status transition rule: a delisted model that returns
                    // comes back as 'new' (not 'active'); an administrator
                    // 'disabled' stays put; anything else is unchanged.
                    let new_status = match status.as_str() {
                        "inactive" => {
                            counts.reactivated += 1;
                            "new"
                        }
                        other => other,
                    };

                    sqlx::query(
                        r#"
                        UPDATE model_catalog
                        SET display_name = ?, description = ?, context_window = ?,
                            prompt_price = ?, completion_price = ?, input_image_price = ?,
                            output_image_price = ?, web_search_price = ?,
                            status = ?, last_seen_at = unixepoch(), updated_at = unixepoch()
                        WHERE model_id = ?
                        "#,
                    )
                    .bind(&record.display_name)
                    .bind(&record.description)
                    .bind(record.context_window)
                    .bind(price_str(record.prompt_price))
                    .bind(price_str(record.completion_price))
                    .bind(price_str(record.input_image_price))
                    .bind(price_str(record.output_image_price))
                    .bind(price_str(record.web_search_price))
                    .bind(new_status)
                    .bind(&record.id)
                    .execute(&mut *tx)
                    .await?;

                    counts.updated += 1;
                    debug!("Updated catalog entry: {} (status {})", record.id, new_status);
                }
                None => {
                    // First sighting: status 'new', no tier access granted.
                    sqlx::query(
                        r#"
                        INSERT INTO model_catalog (
                            model_id, display_name, description, context_window,
                            prompt_price, completion_price, input_image_price,
                            output_image_price, web_search_price, status,
                            free_tier, pro_tier, enterprise_tier
                        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'new', 0, 0, 0)
                        "#,
                    )
                    .bind(&record.id)
                    .bind(&record.display_name)
                    .bind(&record.description)
                    .bind(record.context_window)
                    .bind(price_str(record.prompt_price))
                    .bind(price_str(record.completion_price))
                    .bind(price_str(record.input_image_price))
                    .bind(price_str(record.output_image_price))
                    .bind(price_str(record.web_search_price))
                    .execute(&mut *tx)
                    .await?;

                    counts.added += 1;
                    debug!("Added catalog entry: {}", record.id);
                }
            }
        }

        // Full-snapshot diff: anything the feed no longer lists goes
        // inactive, except entries already inactive and sticky disables.
        let mark_inactive_sql = if models.is_empty() {
            "UPDATE model_catalog SET status = 'inactive', updated_at = unixepoch() \
             WHERE status NOT IN ('inactive', 'disabled')"
                .to_string()
        } else {
            let placeholders = vec!["?"; models.len()].join(",");
            format!(
                "UPDATE model_catalog SET status = 'inactive', updated_at = unixepoch() \
                 WHERE status NOT IN ('inactive', 'disabled') AND model_id NOT IN ({})",
                placeholders
            )
        };

        let mut mark_query = sqlx::query(&mark_inactive_sql);
        for record in models {
            mark_query = mark_query.bind(&record.id);
        }
        counts.marked_inactive = mark_query.execute(&mut *tx).await?.rows_affected() as u32;

        tx.commit().await?;
        Ok(counts)
    }

    /// List recent sync runs, newest first.
    pub async fn list_sync_runs(&self, limit: u32) -> Result<Vec<SyncRun>> {
        let rows = sqlx::query(
            r#"
            SELECT id, started_at, finished_at, models_seen, added, updated,
                   marked_inactive, reactivated, status, duration_ms,
                   error_code, error_message, attributed_to
            FROM sync_runs
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut runs = Vec::new();
        for row in rows {
            let started_unix: i64 = row.get("started_at");
            let finished_unix: Option<i64> = row.get("finished_at");
            runs.push(SyncRun {
                id: row.get("id"),
                started_at: DateTime::from_timestamp(started_unix, 0).unwrap_or_else(Utc::now),
                finished_at: finished_unix.and_then(|ts| DateTime::from_timestamp(ts, 0)),
                models_seen: row.get::<i64, _>("models_seen") as u32,
                added: row.get::<i64, _>("added") as u32,
                updated: row.get::<i64, _>("updated") as u32,
                marked_inactive: row.get::<i64, _>("marked_inactive") as u32,
                reactivated: row.get::<i64, _>("reactivated") as u32,
                status: row.get("status"),
                duration_ms: row.get("duration_ms"),
                error_code: row.get("error_code"),
                error_message: row.get("error_message"),
                attributed_to: row.get("attributed_to"),
            });
        }
        Ok(runs)
    }
}

fn price_str(price: Option<Decimal>) -> Option<String> {
    price.map(|p| p.to_string())
}
