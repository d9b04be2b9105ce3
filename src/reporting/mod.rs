// Reporting surface: consumers of the ledger. Everything here is
// authorization-scoped and read-only.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::{Error, Result};
use crate::storage::database::money;

/// Who is asking. Non-admin callers can only see their own rows; admin-only
/// queries reject everyone else outright rather than silently scoping down.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub admin: bool,
}

impl Caller {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            admin: false,
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            admin: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Day,
    Week,
    Month,
}

impl Granularity {
    /// strftime pattern used to bucket usage dates.
    fn format(&self) -> &'static str {
        match self {
            Granularity::Day => "%Y-%m-%d",
            Granularity::Week => "%Y-W%W",
            Granularity::Month => "%Y-%m",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DailyCostRow {
    pub date: NaiveDate,
    pub total_cost: Decimal,
}

#[derive(Debug, Clone)]
pub struct UsageBucket {
    pub bucket: String,
    pub total_cost: Decimal,
    pub active_users: u64,
}

#[derive(Debug, Clone)]
pub struct ErrorListing {
    pub turn_id: String,
    pub session_id: String,
    pub user_id: String,
    /// Best-effort attribution: the turn's own model, else the cost record's,
    /// else a sibling turn's, else the session's last-known model.
    pub model_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct ReportingService {
    pool: SqlitePool,
}

impl ReportingService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Per-user daily costs over a date range, optionally filtered to one
    /// model. Callers may only query themselves unless they are admins.
    pub async fn user_daily_costs(
        &self,
        caller: &Caller,
        user_id: &str,
        from: NaiveDate,
        to: NaiveDate,
        model_id: Option<&str>,
    ) -> Result<Vec<DailyCostRow>> {
        if !caller.admin && caller.user_id != user_id {
            return Err(Error::InsufficientPrivilege);
        }
        if from > to {
            return Err(Error::validation("invalid_date_range"));
        }

        debug!(
            "User daily costs: user={}, {}..{}, model={:?}",
            user_id, from, to, model_id
        );

        // The aggregate table answers the plain query; a model filter needs
        // the per-record table since aggregates are not model-keyed.
        let rows = match model_id {
            None => {
                sqlx::query(
                    r#"
                    SELECT usage_date, total_cost_micros
                    FROM daily_usage
                    WHERE user_id = ? AND usage_date >= ? AND usage_date <= ?
                    ORDER BY usage_date
                    "#,
                )
                .bind(user_id)
                .bind(from.to_string())
                .bind(to.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            Some(model_id) => {
                sqlx::query(
                    r#"
                    SELECT usage_date, SUM(total_cost_micros) as total_cost_micros
                    FROM message_costs
                    WHERE user_id = ? AND usage_date >= ? AND usage_date <= ? AND model_id = ?
                    GROUP BY usage_date
                    ORDER BY usage_date
                    "#,
                )
                .bind(user_id)
                .bind(from.to_string())
                .bind(to.to_string())
                .bind(model_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter()
            .map(|row| {
                let date_str: String = row.get("usage_date");
                let date = date_str.parse().map_err(|_| {
                    Error::Database(sqlx::Error::Decode(
                        format!("Invalid usage_date '{}'", date_str).into(),
                    ))
                })?;
                Ok(DailyCostRow {
                    date,
                    total_cost: money::micros_to_decimal(row.get("total_cost_micros")),
                })
            })
            .collect()
    }

    /// Global usage buckets by day/week/month. Admin only.
    pub async fn admin_usage(
        &self,
        caller: &Caller,
        granularity: Granularity,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<UsageBucket>> {
        if !caller.admin {
            return Err(Error::InsufficientPrivilege);
        }
        if from > to {
            return Err(Error::validation("invalid_date_range"));
        }

        let rows = sqlx::query(&format!(
            r#"
            SELECT strftime('{}', usage_date) as bucket,
                   SUM(total_cost_micros) as total_cost_micros,
                   COUNT(DISTINCT user_id) as active_users
            FROM daily_usage
            WHERE usage_date >= ? AND usage_date <= ?
            GROUP BY bucket
            ORDER BY bucket
            "#,
            granularity.format()
        ))
        .bind(from.to_string())
        .bind(to.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| UsageBucket {
                bucket: row.get("bucket"),
                total_cost: money::micros_to_decimal(row.get("total_cost_micros")),
                active_users: row.get::<i64, _>("active_users") as u64,
            })
            .collect())
    }

    /// Recent errored turns, newest first, with best-effort model
    /// attribution. Admin only.
    pub async fn recent_errors(&self, caller: &Caller, limit: u32) -> Result<Vec<ErrorListing>> {
        if !caller.admin {
            return Err(Error::InsufficientPrivilege);
        }

        let rows = sqlx::query(
            r#"
            SELECT t.id, t.session_id, t.user_id, t.created_at,
                   COALESCE(
                       t.model_id,
                       (SELECT mc.model_id FROM message_costs mc WHERE mc.turn_id = t.id),
                       (SELECT lt.model_id FROM chat_turns lt
                        WHERE lt.parent_user_turn_id = t.parent_user_turn_id
                          AND t.parent_user_turn_id IS NOT NULL
                          AND lt.id != t.id AND lt.model_id IS NOT NULL
                        ORDER BY lt.created_at DESC LIMIT 1),
                       (SELECT s.last_model FROM chat_sessions s WHERE s.id = t.session_id)
                   ) as model_id
            FROM chat_turns t
            WHERE t.error = 1
            ORDER BY t.created_at DESC, t.id DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let created_unix: i64 = row.get("created_at");
                ErrorListing {
                    turn_id: row.get("id"),
                    session_id: row.get("session_id"),
                    user_id: row.get("user_id"),
                    model_id: row.get("model_id"),
                    created_at: DateTime::from_timestamp(created_unix, 0).unwrap_or_else(Utc::now),
                }
            })
            .collect())
    }
}
