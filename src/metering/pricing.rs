use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::Result;
use crate::storage::database::money;

/// Billing caps: attachments beyond three and web results beyond fifty are
/// not charged.
pub const MAX_BILLED_INPUT_IMAGES: i64 = 3;
pub const MAX_BILLED_WEB_RESULTS: i64 = 50;

/// Prices in effect for one model at cost-computation time. Persisted as JSON
/// alongside the cost record so historical costs stay auditable after catalog
/// prices move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingSnapshot {
    pub model_id: Option<String>,
    /// Per prompt token.
    pub prompt_price: Decimal,
    /// Per completion token.
    pub completion_price: Decimal,
    /// Per input image.
    pub input_image_price: Decimal,
    /// Per output image token.
    pub output_image_price: Decimal,
    /// Per web search result.
    pub web_search_price: Decimal,
    pub resolved_at: DateTime<Utc>,
}

impl PricingSnapshot {
    /// All-zero snapshot for turns whose model is unknown to the catalog.
    /// Missing prices cost nothing; they never fail the chat path.
    pub fn zero(model_id: Option<String>) -> Self {
        Self {
            model_id,
            prompt_price: Decimal::ZERO,
            completion_price: Decimal::ZERO,
            input_image_price: Decimal::ZERO,
            output_image_price: Decimal::ZERO,
            web_search_price: Decimal::ZERO,
            resolved_at: Utc::now(),
        }
    }
}

/// A dated, per-model price patch consulted after the catalog lookup.
///
/// Kept as an explicit table rather than inline constants so each patch is
/// auditable and removable once the feed starts publishing the price.
pub struct PriceOverride {
    pub model_id: &'static str,
    /// Per output image token.
    pub output_image_price: &'static str,
    /// Date the patch was introduced.
    pub added: &'static str,
    pub reason: &'static str,
}

pub const PRICE_OVERRIDES: &[PriceOverride] = &[PriceOverride {
    model_id: "gpt-image-1",
    output_image_price: "0.00004",
    added: "2026-07-14",
    reason: "feed does not publish an output image token price for this model yet",
}];

/// Resolve the pricing snapshot for a model from the current catalog entry,
/// then apply any dated override. Unknown models resolve to zero prices.
pub async fn resolve_pricing(pool: &SqlitePool, model_id: Option<&str>) -> Result<PricingSnapshot> {
    let model_id = match model_id {
        Some(id) => id,
        None => return Ok(PricingSnapshot::zero(None)),
    };

    let row = sqlx::query(
        r#"
        SELECT prompt_price, completion_price, input_image_price,
               output_image_price, web_search_price
        FROM model_catalog
        WHERE model_id = ?
        "#,
    )
    .bind(model_id)
    .fetch_optional(pool)
    .await?;

    let mut snapshot = match row {
        Some(row) => {
            let price = |col: &str| -> Result<Decimal> {
                let s: Option<String> = row.get(col);
                Ok(match s {
                    Some(s) => money::parse_price(&s)?,
                    None => Decimal::ZERO,
                })
            };
            PricingSnapshot {
                model_id: Some(model_id.to_string()),
                prompt_price: price("prompt_price")?,
                completion_price: price("completion_price")?,
                input_image_price: price("input_image_price")?,
                output_image_price: price("output_image_price")?,
                web_search_price: price("web_search_price")?,
                resolved_at: Utc::now(),
            }
        }
        None => {
            debug!("No catalog entry for model {}, pricing as zero", model_id);
            PricingSnapshot::zero(Some(model_id.to_string()))
        }
    };

    for patch in PRICE_OVERRIDES {
        if patch.model_id == model_id {
            snapshot.output_image_price = money::parse_price(patch.output_image_price)?;
            debug!(
                "Applied price override for {} (added {}): {}",
                patch.model_id, patch.added, patch.reason
            );
        }
    }

    Ok(snapshot)
}

/// One cost component: quantity times unit price, rounded to 6 decimal
/// places half away from zero, in micro-units.
pub fn component_micros(quantity: i64, unit_price: Decimal) -> Result<i64> {
    let cost = Decimal::from(quantity) * unit_price;
    money::decimal_to_micros(
        cost.round_dp_with_strategy(money::MICROS_SCALE, RoundingStrategy::MidpointAwayFromZero),
    )
}
