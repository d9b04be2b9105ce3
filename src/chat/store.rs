use sqlx::SqlitePool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::metering::{CostEngine, CostTrigger, UsageLedger};

/// A finalized assistant reply, ready to persist and meter.
#[derive(Debug, Clone)]
pub struct NewAssistantTurn {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub parent_user_turn_id: Option<String>,
    pub model_id: Option<String>,
    pub content: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub output_image_tokens: i64,
    pub web_search_used: bool,
    pub web_search_results: i64,
    pub generation_ms: i64,
    pub error: bool,
}

#[derive(Debug, Clone)]
pub struct NewUserTurn {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub content: String,
}

/// Writes sessions, turns and attachments, and fires the metering hooks
/// synchronously after each write. Hook failures are logged and swallowed:
/// chat functionality never blocks on the cost engine.
pub struct ChatStore {
    pool: SqlitePool,
    costs: CostEngine,
    ledger: UsageLedger,
}

impl ChatStore {
    pub fn new(pool: SqlitePool) -> Self {
        let costs = CostEngine::new(pool.clone());
        let ledger = UsageLedger::new(pool.clone());
        Self { pool, costs, ledger }
    }

    pub async fn create_session(&self, user_id: &str, title: Option<&str>) -> Result<String> {
        let session_id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO chat_sessions (id, user_id, title) VALUES (?, ?, ?)")
            .bind(&session_id)
            .bind(user_id)
            .bind(title)
            .execute(&self.pool)
            .await?;

        debug!("Created session {} for user {}", session_id, user_id);
        Ok(session_id)
    }

    pub async fn record_user_turn(&self, turn: &NewUserTurn) -> Result<()> {
        sqlx::query(
            "INSERT INTO chat_turns (id, session_id, user_id, role, content) \
             VALUES (?, ?, ?, 'user', ?)",
        )
        .bind(&turn.id)
        .bind(&turn.session_id)
        .bind(&turn.user_id)
        .bind(&turn.content)
        .execute(&self.pool)
        .await?;

        self.refresh_stats(&turn.session_id).await;
        Ok(())
    }

    /// Persist a finalized assistant turn, then run the metering hooks:
    /// cost computation (skipped for errored turns by the engine itself) and
    /// the session-stat recompute.
    pub async fn finalize_assistant_turn(&self, turn: &NewAssistantTurn) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_turns (
                id, session_id, user_id, role, parent_user_turn_id, model_id, content,
                prompt_tokens, completion_tokens, output_image_tokens,
                web_search_used, web_search_results, generation_ms, error
            ) VALUES (?, ?, ?, 'assistant', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&turn.id)
        .bind(&turn.session_id)
        .bind(&turn.user_id)
        .bind(&turn.parent_user_turn_id)
        .bind(&turn.model_id)
        .bind(&turn.content)
        .bind(turn.prompt_tokens)
        .bind(turn.completion_tokens)
        .bind(turn.output_image_tokens)
        .bind(turn.web_search_used)
        .bind(turn.web_search_results)
        .bind(turn.generation_ms)
        .bind(turn.error)
        .execute(&self.pool)
        .await?;

        self.costs.notify(CostTrigger::ByTurn(turn.id.clone())).await;
        self.refresh_stats(&turn.session_id).await;
        Ok(())
    }

    /// Attach an upload to a user turn. Arriving after the assistant turn was
    /// metered is the normal case; the cost record is recomputed through the
    /// user-turn trigger.
    pub async fn link_attachment(&self, user_turn_id: &str) -> Result<String> {
        let attachment_id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO attachments (id, user_turn_id, status) VALUES (?, ?, 'ready')")
            .bind(&attachment_id)
            .bind(user_turn_id)
            .execute(&self.pool)
            .await?;

        self.costs
            .notify(CostTrigger::ByUserTurn(user_turn_id.to_string()))
            .await;
        Ok(attachment_id)
    }

    pub async fn delete_attachment(&self, attachment_id: &str) -> Result<()> {
        let user_turn_id: Option<String> = sqlx::query_scalar(
            "UPDATE attachments SET status = 'deleted' WHERE id = ? RETURNING user_turn_id",
        )
        .bind(attachment_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(user_turn_id) = user_turn_id {
            self.costs
                .notify(CostTrigger::ByUserTurn(user_turn_id))
                .await;
        }
        Ok(())
    }

    async fn refresh_stats(&self, session_id: &str) {
        if let Err(e) = self.ledger.refresh_session_stats(session_id).await {
            warn!("Session stat refresh failed for {}: {}", session_id, e);
        }
    }
}
