use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::catalog::{CatalogEntry, ModelStatus, Tier};
use crate::error::{Error, Result};
use crate::storage::database::money;

/// Repository for reading catalog entries and applying administrator-owned
/// changes. Provider-owned fields are written only by the reconciler.
pub struct CatalogRepository {
    pool: SqlitePool,
}

impl CatalogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetch a single catalog entry by model id.
    pub async fn get_entry(&self, model_id: &str) -> Result<Option<CatalogEntry>> {
        let row = sqlx::query(
            r#"
            SELECT model_id, display_name, description, context_window,
                   prompt_price, completion_price, input_image_price,
                   output_image_price, web_search_price, status,
                   free_tier, pro_tier, enterprise_tier, first_seen_at, last_seen_at
            FROM model_catalog
            WHERE model_id = ?
            "#,
        )
        .bind(model_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(map_entry).transpose()
    }

    /// List catalog entries, optionally including inactive and disabled ones.
    pub async fn list_entries(&self, include_hidden: bool) -> Result<Vec<CatalogEntry>> {
        let mut query = String::from(
            r#"
            SELECT model_id, display_name, description, context_window,
                   prompt_price, completion_price, input_image_price,
                   output_image_price, web_search_price, status,
                   free_tier, pro_tier, enterprise_tier, first_seen_at, last_seen_at
            FROM model_catalog
            "#,
        );
        if !include_hidden {
            query.push_str(" WHERE status NOT IN ('inactive', 'disabled')");
        }
        query.push_str(" ORDER BY model_id");

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.into_iter().map(map_entry).collect()
    }

    /// Grant or revoke tier access for a model. Administrator operation;
    /// reconciliation never touches these flags.
    pub async fn set_tier_access(&self, model_id: &str, tier: Tier, enabled: bool) -> Result<()> {
        debug!(
            "Setting tier access: model={}, tier={:?}, enabled={}",
            model_id, tier, enabled
        );

        let query = format!(
            "UPDATE model_catalog SET {} = ?, updated_at = unixepoch() WHERE model_id = ?",
            tier.column()
        );
        let rows_affected = sqlx::query(&query)
            .bind(enabled)
            .bind(model_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if rows_affected == 0 {
            return Err(Error::Database(sqlx::Error::RowNotFound));
        }

        info!(
            "Tier access updated: model={}, tier={:?}, enabled={}",
            model_id, tier, enabled
        );
        Ok(())
    }

    /// Promote a `new` model to `active`. The reconciler never does this on
    /// its own; exposure is an explicit administrator decision.
    pub async fn activate(&self, model_id: &str) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE model_catalog SET status = 'active', updated_at = unixepoch() \
             WHERE model_id = ? AND status = 'new'",
        )
        .bind(model_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            let status = self.get_status(model_id).await?;
            return match status {
                None => Err(Error::Database(sqlx::Error::RowNotFound)),
                Some(status) => Err(Error::validation(format!(
                    "cannot activate model in status '{}'",
                    status.as_str()
                ))),
            };
        }

        info!("Model activated: {}", model_id);
        Ok(())
    }

    /// Hide a model regardless of provider status. Sticky: reconciliation
    /// leaves `disabled` untouched whether or not the feed lists the model.
    pub async fn disable(&self, model_id: &str) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE model_catalog SET status = 'disabled', updated_at = unixepoch() \
             WHERE model_id = ?",
        )
        .bind(model_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::Database(sqlx::Error::RowNotFound));
        }

        info!("Model disabled: {}", model_id);
        Ok(())
    }

    /// Lift an administrator disable. The model goes back to `new` so the
    /// next reconciliation pass re-vets it like a fresh sighting.
    pub async fn enable(&self, model_id: &str) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE model_catalog SET status = 'new', updated_at = unixepoch() \
             WHERE model_id = ? AND status = 'disabled'",
        )
        .bind(model_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::validation("model_not_disabled"));
        }

        info!("Model re-enabled: {}", model_id);
        Ok(())
    }

    async fn get_status(&self, model_id: &str) -> Result<Option<ModelStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM model_catalog WHERE model_id = ?")
                .bind(model_id)
                .fetch_optional(&self.pool)
                .await?;
        status.as_deref().map(ModelStatus::parse).transpose()
    }
}

fn map_entry(row: sqlx::sqlite::SqliteRow) -> Result<CatalogEntry> {
    let status_str: String = row.get("status");
    let parse_opt_price = |col: &str| -> Result<Option<rust_decimal::Decimal>> {
        let s: Option<String> = row.get(col);
        s.as_deref().map(money::parse_price).transpose()
    };

    let first_seen_unix: i64 = row.get("first_seen_at");
    let last_seen_unix: i64 = row.get("last_seen_at");

    Ok(CatalogEntry {
        model_id: row.get("model_id"),
        display_name: row.get("display_name"),
        description: row.get("description"),
        context_window: row.get("context_window"),
        prompt_price: parse_opt_price("prompt_price")?,
        completion_price: parse_opt_price("completion_price")?,
        input_image_price: parse_opt_price("input_image_price")?,
        output_image_price: parse_opt_price("output_image_price")?,
        web_search_price: parse_opt_price("web_search_price")?,
        status: ModelStatus::parse(&status_str)?,
        free_tier: row.get("free_tier"),
        pro_tier: row.get("pro_tier"),
        enterprise_tier: row.get("enterprise_tier"),
        first_seen_at: DateTime::from_timestamp(first_seen_unix, 0).unwrap_or_else(Utc::now),
        last_seen_at: DateTime::from_timestamp(last_seen_unix, 0).unwrap_or_else(Utc::now),
    })
}
