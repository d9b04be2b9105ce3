use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::error::Result;
use crate::storage::database::money;

/// Apply a cost delta to a user's daily rollup inside the caller's
/// transaction. Insert-or-add in a single statement: concurrent turns for the
/// same (user, date) cannot lose updates.
///
/// The delta is computed once per recomputation of a cost record, so applying
/// the same absolute record state twice nets to zero here.
pub(crate) async fn apply_user_daily_delta(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    user_id: &str,
    date: NaiveDate,
    delta_micros: i64,
) -> Result<()> {
    if delta_micros == 0 {
        return Ok(());
    }

    sqlx::query(
        r#"
        INSERT INTO daily_usage (user_id, usage_date, total_cost_micros)
        VALUES (?, ?, ?)
        ON CONFLICT(user_id, usage_date) DO UPDATE SET
            total_cost_micros = total_cost_micros + excluded.total_cost_micros,
            updated_at = unixepoch()
        "#,
    )
    .bind(user_id)
    .bind(date.to_string())
    .bind(delta_micros)
    .execute(&mut **tx)
    .await?;

    debug!(
        "Applied daily delta: user={}, date={}, delta_micros={}",
        user_id, date, delta_micros
    );
    Ok(())
}

/// Ledger reads plus the non-delta writers: session statistics (recomputed in
/// full, cheap and drift-free) and the batch path that derives the per-model
/// daily rollup from cost records.
pub struct UsageLedger {
    pool: SqlitePool,
}

impl UsageLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Current daily total for a user, zero if no aggregate row exists.
    pub async fn user_daily_total(&self, user_id: &str, date: NaiveDate) -> Result<Decimal> {
        let micros: Option<i64> = sqlx::query_scalar(
            "SELECT total_cost_micros FROM daily_usage WHERE user_id = ? AND usage_date = ?",
        )
        .bind(user_id)
        .bind(date.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(money::micros_to_decimal(micros.unwrap_or(0)))
    }

    /// Independent full re-sum of cost records for a (user, date). This is
    /// the correctness oracle for the delta path, not a production update.
    pub async fn resum_user_daily(&self, user_id: &str, date: NaiveDate) -> Result<Decimal> {
        let micros: Option<i64> = sqlx::query_scalar(
            "SELECT SUM(total_cost_micros) FROM message_costs WHERE user_id = ? AND usage_date = ?",
        )
        .bind(user_id)
        .bind(date.to_string())
        .fetch_optional(&self.pool)
        .await?
        .flatten();

        Ok(money::micros_to_decimal(micros.unwrap_or(0)))
    }

    /// Recompute session statistics from the authoritative turn set.
    ///
    /// Not delta-based: message counts, token sums, last model and last
    /// preview are cheap to recompute and must never drift. Error-flagged
    /// turns are excluded entirely.
    pub async fn refresh_session_stats(&self, session_id: &str) -> Result<()> {
        let stats = sqlx::query(
            r#"
            SELECT COUNT(*) as message_count,
                   COALESCE(SUM(prompt_tokens + completion_tokens), 0) as total_tokens
            FROM chat_turns
            WHERE session_id = ? AND error = 0
            "#,
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;

        let message_count: i64 = stats.get("message_count");
        let total_tokens: i64 = stats.get("total_tokens");

        let last = sqlx::query(
            r#"
            SELECT model_id, content
            FROM chat_turns
            WHERE session_id = ? AND error = 0
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        let (last_model, last_preview) = match last {
            Some(row) => {
                let model: Option<String> = row.get("model_id");
                let content: Option<String> = row.get("content");
                (model, content.map(|c| truncate_preview(&c)))
            }
            None => (None, None),
        };

        sqlx::query(
            r#"
            UPDATE chat_sessions
            SET message_count = ?, total_tokens = ?,
                last_model = COALESCE(?, last_model), last_preview = ?,
                updated_at = unixepoch()
            WHERE id = ?
            "#,
        )
        .bind(message_count)
        .bind(total_tokens)
        .bind(last_model)
        .bind(last_preview)
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        debug!(
            "Refreshed session stats: session={}, messages={}, tokens={}",
            session_id, message_count, total_tokens
        );
        Ok(())
    }

    /// Rebuild the per-model daily rollup for one date from cost records.
    ///
    /// This is a batch/reporting path deliberately decoupled from per-message
    /// cost computation, so a reporting failure cannot block turn completion.
    pub async fn rebuild_model_daily(&self, date: NaiveDate) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM daily_model_usage WHERE usage_date = ?")
            .bind(date.to_string())
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO daily_model_usage (
                model_id, usage_date, message_count, prompt_tokens,
                completion_tokens, total_cost_micros
            )
            SELECT model_id, usage_date, COUNT(*), SUM(prompt_tokens),
                   SUM(completion_tokens), SUM(total_cost_micros)
            FROM message_costs
            WHERE usage_date = ? AND model_id IS NOT NULL
            GROUP BY model_id
            "#,
        )
        .bind(date.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        info!(
            "Rebuilt model daily rollup: date={}, models={}",
            date, inserted
        );
        Ok(inserted)
    }
}

impl UsageLedger {
    /// Retention policy: drop cost records older than the window. Aggregates
    /// are kept; the per-record audit trail is what ages out.
    pub async fn cleanup_cost_records(&self, days_to_keep: u32) -> Result<u64> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(days_to_keep as i64);

        let deleted = sqlx::query("DELETE FROM message_costs WHERE created_at < ?")
            .bind(cutoff.timestamp())
            .execute(&self.pool)
            .await?
            .rows_affected();

        info!("Cleaned up {} cost records older than {} days", deleted, days_to_keep);
        Ok(deleted)
    }
}

fn truncate_preview(content: &str) -> String {
    const PREVIEW_CHARS: usize = 120;
    if content.chars().count() <= PREVIEW_CHARS {
        content.to_string()
    } else {
        content.chars().take(PREVIEW_CHARS).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::AppPaths;
    use crate::storage::Database;
    use tempfile::TempDir;

    async fn create_test_ledger() -> (UsageLedger, SqlitePool, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::with_data_dir(temp_dir.path()).unwrap();
        let db = Database::new(&paths).await.unwrap();
        let pool = db.pool().clone();
        (UsageLedger::new(pool.clone()), pool, temp_dir)
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    async fn apply(pool: &SqlitePool, user: &str, d: NaiveDate, delta: i64) {
        let mut tx = pool.begin().await.unwrap();
        apply_user_daily_delta(&mut tx, user, d, delta).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_delta_creates_then_increments() {
        let (ledger, pool, _temp_dir) = create_test_ledger().await;
        let d = date("2026-08-01");

        apply(&pool, "user-1", d, 6_500_000).await;
        assert_eq!(
            ledger.user_daily_total("user-1", d).await.unwrap(),
            Decimal::new(6_500_000, 6)
        );

        apply(&pool, "user-1", d, 1_000_000).await;
        assert_eq!(
            ledger.user_daily_total("user-1", d).await.unwrap(),
            Decimal::new(7_500_000, 6)
        );
    }

    #[tokio::test]
    async fn test_zero_delta_is_noop() {
        let (ledger, pool, _temp_dir) = create_test_ledger().await;
        let d = date("2026-08-01");

        apply(&pool, "user-1", d, 0).await;

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM daily_usage")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, 0);
        assert_eq!(
            ledger.user_daily_total("user-1", d).await.unwrap(),
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn test_negative_delta_decrements() {
        let (ledger, pool, _temp_dir) = create_test_ledger().await;
        let d = date("2026-08-01");

        apply(&pool, "user-1", d, 5_000_000).await;
        apply(&pool, "user-1", d, -2_000_000).await;
        assert_eq!(
            ledger.user_daily_total("user-1", d).await.unwrap(),
            Decimal::new(3_000_000, 6)
        );
    }

    #[tokio::test]
    async fn test_deltas_commute_across_subjects_and_days() {
        let (ledger, pool, _temp_dir) = create_test_ledger().await;

        apply(&pool, "user-1", date("2026-08-01"), 100).await;
        apply(&pool, "user-2", date("2026-08-01"), 200).await;
        apply(&pool, "user-1", date("2026-08-02"), 300).await;

        assert_eq!(
            ledger
                .user_daily_total("user-1", date("2026-08-01"))
                .await
                .unwrap(),
            Decimal::new(100, 6)
        );
        assert_eq!(
            ledger
                .user_daily_total("user-2", date("2026-08-01"))
                .await
                .unwrap(),
            Decimal::new(200, 6)
        );
        assert_eq!(
            ledger
                .user_daily_total("user-1", date("2026-08-02"))
                .await
                .unwrap(),
            Decimal::new(300, 6)
        );
    }

    #[tokio::test]
    async fn test_session_stats_exclude_errored_turns() {
        let (ledger, pool, _temp_dir) = create_test_ledger().await;

        sqlx::query("INSERT INTO chat_sessions (id, user_id) VALUES ('s1', 'user-1')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            r#"
            INSERT INTO chat_turns (id, session_id, user_id, role, content, prompt_tokens, completion_tokens, model_id, error, created_at)
            VALUES
                ('t1', 's1', 'user-1', 'user', 'hello', 10, 0, NULL, 0, 100),
                ('t2', 's1', 'user-1', 'assistant', 'hi there', 10, 20, 'model-a', 0, 200),
                ('t3', 's1', 'user-1', 'assistant', 'boom', 5, 0, 'model-b', 1, 300)
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        ledger.refresh_session_stats("s1").await.unwrap();

        let row = sqlx::query(
            "SELECT message_count, total_tokens, last_model, last_preview FROM chat_sessions WHERE id = 's1'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        // The errored turn contributes nothing, including to last-*.
        assert_eq!(row.get::<i64, _>("message_count"), 2);
        assert_eq!(row.get::<i64, _>("total_tokens"), 40);
        assert_eq!(row.get::<Option<String>, _>("last_model").as_deref(), Some("model-a"));
        assert_eq!(
            row.get::<Option<String>, _>("last_preview").as_deref(),
            Some("hi there")
        );
    }

    #[tokio::test]
    async fn test_session_stats_recompute_is_idempotent() {
        let (ledger, pool, _temp_dir) = create_test_ledger().await;

        sqlx::query("INSERT INTO chat_sessions (id, user_id) VALUES ('s1', 'user-1')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO chat_turns (id, session_id, user_id, role, content, prompt_tokens, completion_tokens) \
             VALUES ('t1', 's1', 'user-1', 'user', 'hello', 7, 0)",
        )
        .execute(&pool)
        .await
        .unwrap();

        ledger.refresh_session_stats("s1").await.unwrap();
        ledger.refresh_session_stats("s1").await.unwrap();

        let count: i64 =
            sqlx::query_scalar("SELECT message_count FROM chat_sessions WHERE id = 's1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_rebuild_model_daily() {
        let (ledger, pool, _temp_dir) = create_test_ledger().await;

        sqlx::query(
            r#"
            INSERT INTO message_costs (turn_id, user_id, session_id, model_id, prompt_tokens,
                                       completion_tokens, total_cost_micros, pricing_snapshot, usage_date)
            VALUES
                ('t1', 'u1', 's1', 'model-a', 100, 50, 2000, '{}', '2026-08-01'),
                ('t2', 'u2', 's2', 'model-a', 200, 80, 3000, '{}', '2026-08-01'),
                ('t3', 'u1', 's1', 'model-b', 10, 5, 500, '{}', '2026-08-01'),
                ('t4', 'u1', 's1', 'model-a', 1, 1, 99, '{}', '2026-08-02')
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        let rows = ledger.rebuild_model_daily(date("2026-08-01")).await.unwrap();
        assert_eq!(rows, 2);

        let row = sqlx::query(
            "SELECT message_count, prompt_tokens, total_cost_micros FROM daily_model_usage \
             WHERE model_id = 'model-a' AND usage_date = '2026-08-01'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(row.get::<i64, _>("message_count"), 2);
        assert_eq!(row.get::<i64, _>("prompt_tokens"), 300);
        assert_eq!(row.get::<i64, _>("total_cost_micros"), 5_000);

        // Rebuild replaces, never double-counts.
        ledger.rebuild_model_daily(date("2026-08-01")).await.unwrap();
        let total: i64 = sqlx::query_scalar(
            "SELECT total_cost_micros FROM daily_model_usage \
             WHERE model_id = 'model-a' AND usage_date = '2026-08-01'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(total, 5_000);
    }
}
