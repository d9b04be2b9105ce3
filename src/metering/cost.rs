use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::metering::ledger;
use crate::metering::pricing::{
    self, PricingSnapshot, MAX_BILLED_INPUT_IMAGES, MAX_BILLED_WEB_RESULTS,
};
use crate::storage::database::money;

/// What to recompute: either a specific assistant turn, or whichever
/// assistant turn answers a given user turn (most recent wins).
#[derive(Debug, Clone)]
pub enum CostTrigger {
    ByTurn(String),
    ByUserTurn(String),
}

/// Result of one (re)computation, for callers that want the numbers.
#[derive(Debug, Clone)]
pub struct CostOutcome {
    pub turn_id: String,
    pub total_cost: Decimal,
    /// Change against the previously recorded total; zero on a clean
    /// recomputation with unchanged inputs.
    pub delta: Decimal,
}

#[derive(Debug)]
struct ResolvedTurn {
    id: String,
    session_id: String,
    user_id: String,
    user_turn_id: Option<String>,
    model_id: Option<String>,
    prompt_tokens: i64,
    completion_tokens: i64,
    output_image_tokens: i64,
    web_search_used: bool,
    web_search_results: i64,
}

/// Cost Computation Unit.
///
/// Computes the monetary cost of a finalized assistant turn from the current
/// pricing snapshot, upserts the per-turn cost record (exactly one row per
/// turn id), and applies the resulting delta to the user's daily rollup in
/// the same transaction. Safe to call repeatedly for the same turn.
pub struct CostEngine {
    pool: SqlitePool,
}

impl CostEngine {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Recompute the cost record for a turn. Returns `Ok(None)` when no
    /// matching non-errored assistant turn exists yet; the cost will be
    /// computed once the turn is finalized.
    pub async fn recompute(&self, trigger: CostTrigger) -> Result<Option<CostOutcome>> {
        let turn = match self.resolve_turn(&trigger).await? {
            Some(turn) => turn,
            None => {
                debug!("No non-errored assistant turn for {:?}, skipping", trigger);
                return Ok(None);
            }
        };

        let snapshot = pricing::resolve_pricing(&self.pool, turn.model_id.as_deref()).await?;

        let input_images = self.count_ready_attachments(turn.user_turn_id.as_deref()).await?;
        let input_images = input_images.min(MAX_BILLED_INPUT_IMAGES);

        let web_results = if turn.web_search_used {
            turn.web_search_results.min(MAX_BILLED_WEB_RESULTS)
        } else {
            0
        };

        let prompt_micros = pricing::component_micros(turn.prompt_tokens, snapshot.prompt_price)?;
        let completion_micros =
            pricing::component_micros(turn.completion_tokens, snapshot.completion_price)?;
        let input_image_micros =
            pricing::component_micros(input_images, snapshot.input_image_price)?;
        let output_image_micros =
            pricing::component_micros(turn.output_image_tokens, snapshot.output_image_price)?;
        // No search, no cost, whatever the stored result count says.
        let web_search_micros = if turn.web_search_used {
            pricing::component_micros(web_results, snapshot.web_search_price)?
        } else {
            0
        };

        let total_micros = prompt_micros
            + completion_micros
            + input_image_micros
            + output_image_micros
            + web_search_micros;

        let outcome = self
            .upsert_and_apply(&turn, &snapshot, RecordQuantities {
                input_images,
                web_results,
            }, ComponentMicros {
                prompt: prompt_micros,
                completion: completion_micros,
                input_image: input_image_micros,
                output_image: output_image_micros,
                web_search: web_search_micros,
                total: total_micros,
            })
            .await?;

        info!(
            "Computed cost for turn {}: total={}, delta={}",
            outcome.turn_id, outcome.total_cost, outcome.delta
        );
        Ok(Some(outcome))
    }

    async fn resolve_turn(&self, trigger: &CostTrigger) -> Result<Option<ResolvedTurn>> {
        let base = r#"
            SELECT id, session_id, user_id, parent_user_turn_id, model_id,
                   prompt_tokens, completion_tokens, output_image_tokens,
                   web_search_used, web_search_results
            FROM chat_turns
            WHERE role = 'assistant' AND error = 0
        "#;

        let row = match trigger {
            CostTrigger::ByTurn(id) => {
                sqlx::query(&format!("{} AND id = ?", base))
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            // Several assistant turns can answer one user turn (regeneration);
            // the most recent one carries the billable state.
            CostTrigger::ByUserTurn(user_turn_id) => {
                sqlx::query(&format!(
                    "{} AND parent_user_turn_id = ? ORDER BY created_at DESC, id DESC LIMIT 1",
                    base
                ))
                .bind(user_turn_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        Ok(row.map(|row| ResolvedTurn {
            id: row.get("id"),
            session_id: row.get("session_id"),
            user_id: row.get("user_id"),
            user_turn_id: row.get("parent_user_turn_id"),
            model_id: row.get("model_id"),
            prompt_tokens: row.get("prompt_tokens"),
            completion_tokens: row.get("completion_tokens"),
            output_image_tokens: row.get("output_image_tokens"),
            web_search_used: row.get("web_search_used"),
            web_search_results: row.get("web_search_results"),
        }))
    }

    /// Ready (non-deleted) attachments on the originating user turn.
    async fn count_ready_attachments(&self, user_turn_id: Option<&str>) -> Result<i64> {
        let user_turn_id = match user_turn_id {
            Some(id) => id,
            None => return Ok(0),
        };

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM attachments WHERE user_turn_id = ? AND status = 'ready'",
        )
        .bind(user_turn_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn upsert_and_apply(
        &self,
        turn: &ResolvedTurn,
        snapshot: &PricingSnapshot,
        quantities: RecordQuantities,
        costs: ComponentMicros,
    ) -> Result<CostOutcome> {
        let snapshot_json = serde_json::to_string(snapshot)?;
        let today = Utc::now().date_naive();

        let mut tx = self.pool.begin().await?;

        // The record pins its usage date at first computation so later
        // recomputation deltas land on the same aggregate row and the daily
        // total stays equal to the sum of its records.
        let previous = sqlx::query(
            "SELECT total_cost_micros, usage_date FROM message_costs WHERE turn_id = ?",
        )
        .bind(&turn.id)
        .fetch_optional(&mut *tx)
        .await?;

        let (previous_micros, usage_date) = match previous {
            Some(row) => {
                let date_str: String = row.get("usage_date");
                let date: NaiveDate = date_str.parse().map_err(|_| {
                    crate::error::Error::Database(sqlx::Error::Decode(
                        format!("Invalid usage_date '{}'", date_str).into(),
                    ))
                })?;
                (row.get::<i64, _>("total_cost_micros"), date)
            }
            None => (0, today),
        };

        sqlx::query(
            r#"
            INSERT INTO message_costs (
                turn_id, user_id, session_id, user_turn_id, model_id,
                prompt_tokens, completion_tokens, input_images, output_image_tokens,
                web_search_results, prompt_cost_micros, completion_cost_micros,
                input_image_cost_micros, output_image_cost_micros, web_search_cost_micros,
                total_cost_micros, pricing_snapshot, usage_date
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(turn_id) DO UPDATE SET
                user_id = excluded.user_id,
                session_id = excluded.session_id,
                user_turn_id = excluded.user_turn_id,
                model_id = excluded.model_id,
                prompt_tokens = excluded.prompt_tokens,
                completion_tokens = excluded.completion_tokens,
                input_images = excluded.input_images,
                output_image_tokens = excluded.output_image_tokens,
                web_search_results = excluded.web_search_results,
                prompt_cost_micros = excluded.prompt_cost_micros,
                completion_cost_micros = excluded.completion_cost_micros,
                input_image_cost_micros = excluded.input_image_cost_micros,
                output_image_cost_micros = excluded.output_image_cost_micros,
                web_search_cost_micros = excluded.web_search_cost_micros,
                total_cost_micros = excluded.total_cost_micros,
                pricing_snapshot = excluded.pricing_snapshot,
                updated_at = unixepoch()
            "#,
        )
        .bind(&turn.id)
        .bind(&turn.user_id)
        .bind(&turn.session_id)
        .bind(&turn.user_turn_id)
        .bind(&turn.model_id)
        .bind(turn.prompt_tokens)
        .bind(turn.completion_tokens)
        .bind(quantities.input_images)
        .bind(turn.output_image_tokens)
        .bind(quantities.web_results)
        .bind(costs.prompt)
        .bind(costs.completion)
        .bind(costs.input_image)
        .bind(costs.output_image)
        .bind(costs.web_search)
        .bind(costs.total)
        .bind(&snapshot_json)
        .bind(usage_date.to_string())
        .execute(&mut *tx)
        .await?;

        let delta_micros = costs.total - previous_micros;
        ledger::apply_user_daily_delta(&mut tx, &turn.user_id, usage_date, delta_micros).await?;

        tx.commit().await?;

        Ok(CostOutcome {
            turn_id: turn.id.clone(),
            total_cost: money::micros_to_decimal(costs.total),
            delta: money::micros_to_decimal(delta_micros),
        })
    }

    /// Write-path hook: recompute, but never let a metering failure escape
    /// into the chat write. Cost computation degrades gracefully.
    pub async fn notify(&self, trigger: CostTrigger) {
        if let Err(e) = self.recompute(trigger.clone()).await {
            warn!("Cost recomputation failed for {:?}: {}", trigger, e);
        }
    }
}

struct RecordQuantities {
    input_images: i64,
    web_results: i64,
}

struct ComponentMicros {
    prompt: i64,
    completion: i64,
    input_image: i64,
    output_image: i64,
    web_search: i64,
    total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::reconciler::CatalogReconciler;
    use crate::catalog::ModelFeedRecord;
    use crate::metering::ledger::UsageLedger;
    use crate::platform::AppPaths;
    use crate::storage::Database;
    use tempfile::TempDir;

    struct Fixture {
        engine: CostEngine,
        ledger: UsageLedger,
        pool: SqlitePool,
        _temp_dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::with_data_dir(temp_dir.path()).unwrap();
        let db = Database::new(&paths).await.unwrap();
        let pool = db.pool().clone();

        // Catalog entry matching the worked pricing example.
        let reconciler = CatalogReconciler::new(pool.clone());
        reconciler
            .sync_catalog(
                &[ModelFeedRecord {
                    id: "model-a".to_string(),
                    display_name: None,
                    description: None,
                    context_window: None,
                    prompt_price: Some("0.000002".parse().unwrap()),
                    completion_price: Some("0.000008".parse().unwrap()),
                    input_image_price: Some("0.00025".parse().unwrap()),
                    output_image_price: None,
                    web_search_price: Some("0.004".parse().unwrap()),
                }],
                None,
                None,
            )
            .await
            .unwrap();

        sqlx::query("INSERT INTO chat_sessions (id, user_id) VALUES ('s1', 'user-1')")
            .execute(&pool)
            .await
            .unwrap();

        Fixture {
            engine: CostEngine::new(pool.clone()),
            ledger: UsageLedger::new(pool.clone()),
            pool,
            _temp_dir: temp_dir,
        }
    }

    async fn insert_user_turn(pool: &SqlitePool, id: &str) {
        sqlx::query(
            "INSERT INTO chat_turns (id, session_id, user_id, role, content, created_at) \
             VALUES (?, 's1', 'user-1', 'user', 'prompt', 100)",
        )
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_assistant_turn(
        pool: &SqlitePool,
        id: &str,
        parent: Option<&str>,
        prompt_tokens: i64,
        completion_tokens: i64,
        web_search_used: bool,
        web_search_results: i64,
        created_at: i64,
    ) {
        sqlx::query(
            r#"
            INSERT INTO chat_turns (
                id, session_id, user_id, role, parent_user_turn_id, model_id, content,
                prompt_tokens, completion_tokens, web_search_used, web_search_results, created_at
            ) VALUES (?, 's1', 'user-1', 'assistant', ?, 'model-a', 'reply', ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(parent)
        .bind(prompt_tokens)
        .bind(completion_tokens)
        .bind(web_search_used)
        .bind(web_search_results)
        .bind(created_at)
        .execute(pool)
        .await
        .unwrap();
    }

    async fn insert_attachment(pool: &SqlitePool, id: &str, user_turn: &str, status: &str) {
        sqlx::query("INSERT INTO attachments (id, user_turn_id, status) VALUES (?, ?, ?)")
            .bind(id)
            .bind(user_turn)
            .bind(status)
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_worked_cost_example() {
        let f = fixture().await;
        insert_user_turn(&f.pool, "ut1").await;
        insert_assistant_turn(&f.pool, "at1", Some("ut1"), 1000, 500, false, 0, 200).await;
        insert_attachment(&f.pool, "a1", "ut1", "ready").await;
        insert_attachment(&f.pool, "a2", "ut1", "ready").await;

        let outcome = f
            .engine
            .recompute(CostTrigger::ByTurn("at1".to_string()))
            .await
            .unwrap()
            .unwrap();

        // 1000*0.000002 + 500*0.000008 + 2*0.00025 = 0.0065
        assert_eq!(outcome.total_cost, Decimal::new(6_500, 6));
        assert_eq!(outcome.delta, Decimal::new(6_500, 6));

        let row = sqlx::query(
            "SELECT prompt_cost_micros, completion_cost_micros, input_image_cost_micros, \
                    web_search_cost_micros, input_images FROM message_costs WHERE turn_id = 'at1'",
        )
        .fetch_one(&f.pool)
        .await
        .unwrap();
        assert_eq!(row.get::<i64, _>("prompt_cost_micros"), 2_000);
        assert_eq!(row.get::<i64, _>("completion_cost_micros"), 4_000);
        assert_eq!(row.get::<i64, _>("input_image_cost_micros"), 500);
        assert_eq!(row.get::<i64, _>("web_search_cost_micros"), 0);
        assert_eq!(row.get::<i64, _>("input_images"), 2);
    }

    #[tokio::test]
    async fn test_recompute_is_idempotent() {
        let f = fixture().await;
        insert_user_turn(&f.pool, "ut1").await;
        insert_assistant_turn(&f.pool, "at1", Some("ut1"), 1000, 500, false, 0, 200).await;

        let first = f
            .engine
            .recompute(CostTrigger::ByTurn("at1".to_string()))
            .await
            .unwrap()
            .unwrap();
        let second = f
            .engine
            .recompute(CostTrigger::ByTurn("at1".to_string()))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first.total_cost, second.total_cost);
        assert_eq!(second.delta, Decimal::ZERO);

        // Exactly one record, and the aggregate equals the single total.
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM message_costs")
            .fetch_one(&f.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let today = Utc::now().date_naive();
        assert_eq!(
            f.ledger.user_daily_total("user-1", today).await.unwrap(),
            first.total_cost
        );
    }

    #[tokio::test]
    async fn test_web_search_results_are_capped() {
        let f = fixture().await;
        insert_assistant_turn(&f.pool, "at1", None, 0, 0, true, 75, 200).await;

        let outcome = f
            .engine
            .recompute(CostTrigger::ByTurn("at1".to_string()))
            .await
            .unwrap()
            .unwrap();

        // 50 * 0.004, not 75 * 0.004.
        assert_eq!(outcome.total_cost, Decimal::new(200_000, 6));
    }

    #[tokio::test]
    async fn test_web_search_unused_costs_zero() {
        let f = fixture().await;
        // Stale result count but the search flag is off.
        insert_assistant_turn(&f.pool, "at1", None, 0, 0, false, 40, 200).await;

        let outcome = f
            .engine
            .recompute(CostTrigger::ByTurn("at1".to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.total_cost, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_attachments_capped_and_deleted_excluded() {
        let f = fixture().await;
        insert_user_turn(&f.pool, "ut1").await;
        insert_assistant_turn(&f.pool, "at1", Some("ut1"), 0, 0, false, 0, 200).await;
        for i in 0..5 {
            insert_attachment(&f.pool, &format!("a{}", i), "ut1", "ready").await;
        }
        insert_attachment(&f.pool, "deleted", "ut1", "deleted").await;

        let outcome = f
            .engine
            .recompute(CostTrigger::ByTurn("at1".to_string()))
            .await
            .unwrap()
            .unwrap();

        // Capped at 3 * 0.00025.
        assert_eq!(outcome.total_cost, Decimal::new(750, 6));
    }

    #[tokio::test]
    async fn test_late_attachment_adjusts_aggregate_by_delta() {
        let f = fixture().await;
        insert_user_turn(&f.pool, "ut1").await;
        insert_assistant_turn(&f.pool, "at1", Some("ut1"), 1000, 500, false, 0, 200).await;

        f.engine
            .recompute(CostTrigger::ByTurn("at1".to_string()))
            .await
            .unwrap();

        // Attachment arrives after the turn was recorded; the user-turn
        // trigger resolves to the same cost record.
        insert_attachment(&f.pool, "a1", "ut1", "ready").await;
        let outcome = f
            .engine
            .recompute(CostTrigger::ByUserTurn("ut1".to_string()))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.turn_id, "at1");
        assert_eq!(outcome.delta, Decimal::new(250, 6));

        let today = Utc::now().date_naive();
        let total = f.ledger.user_daily_total("user-1", today).await.unwrap();
        assert_eq!(total, Decimal::new(6_250, 6));
        // Independent resum agrees with the delta-maintained aggregate.
        assert_eq!(f.ledger.resum_user_daily("user-1", today).await.unwrap(), total);
    }

    #[tokio::test]
    async fn test_user_turn_trigger_prefers_latest_assistant_turn() {
        let f = fixture().await;
        insert_user_turn(&f.pool, "ut1").await;
        insert_assistant_turn(&f.pool, "old", Some("ut1"), 10, 10, false, 0, 100).await;
        insert_assistant_turn(&f.pool, "new", Some("ut1"), 20, 20, false, 0, 300).await;

        let outcome = f
            .engine
            .recompute(CostTrigger::ByUserTurn("ut1".to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.turn_id, "new");
    }

    #[tokio::test]
    async fn test_missing_or_errored_turn_is_noop() {
        let f = fixture().await;
        assert!(f
            .engine
            .recompute(CostTrigger::ByTurn("nope".to_string()))
            .await
            .unwrap()
            .is_none());

        sqlx::query(
            "INSERT INTO chat_turns (id, session_id, user_id, role, error) \
             VALUES ('errored', 's1', 'user-1', 'assistant', 1)",
        )
        .execute(&f.pool)
        .await
        .unwrap();
        assert!(f
            .engine
            .recompute(CostTrigger::ByTurn("errored".to_string()))
            .await
            .unwrap()
            .is_none());

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM daily_usage")
            .fetch_one(&f.pool)
            .await
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn test_unknown_model_costs_zero_not_error() {
        let f = fixture().await;
        sqlx::query(
            "INSERT INTO chat_turns (id, session_id, user_id, role, model_id, prompt_tokens, completion_tokens) \
             VALUES ('at1', 's1', 'user-1', 'assistant', 'unsynced-model', 1000, 1000)",
        )
        .execute(&f.pool)
        .await
        .unwrap();

        let outcome = f
            .engine
            .recompute(CostTrigger::ByTurn("at1".to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.total_cost, Decimal::ZERO);

        // The record still exists for auditability, with a zero snapshot.
        let snapshot_json: String =
            sqlx::query_scalar("SELECT pricing_snapshot FROM message_costs WHERE turn_id = 'at1'")
                .fetch_one(&f.pool)
                .await
                .unwrap();
        let snapshot: PricingSnapshot = serde_json::from_str(&snapshot_json).unwrap();
        assert_eq!(snapshot.prompt_price, Decimal::ZERO);
    }
}
