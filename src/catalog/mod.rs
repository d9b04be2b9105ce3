// Model catalog: locally cached mirror of the external provider listing,
// reconciled by full-snapshot diff while preserving administrator-owned state.

pub mod feed;
pub mod reconciler;
pub mod store;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lifecycle status of a catalog entry.
///
/// `New`, `Active` and `Inactive` track what the provider feed says;
/// `Disabled` is an administrator override that reconciliation never clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    New,
    Active,
    Inactive,
    Disabled,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::New => "new",
            ModelStatus::Active => "active",
            ModelStatus::Inactive => "inactive",
            ModelStatus::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(ModelStatus::New),
            "active" => Ok(ModelStatus::Active),
            "inactive" => Ok(ModelStatus::Inactive),
            "disabled" => Ok(ModelStatus::Disabled),
            other => Err(Error::sync(format!("unknown model status '{}'", other))),
        }
    }
}

/// Tier-access flags are administrator-owned and orthogonal to sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            Tier::Free => "free_tier",
            Tier::Pro => "pro_tier",
            Tier::Enterprise => "enterprise_tier",
        }
    }
}

/// One locally stored catalog row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub model_id: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub context_window: Option<i64>,
    pub prompt_price: Option<Decimal>,
    pub completion_price: Option<Decimal>,
    pub input_image_price: Option<Decimal>,
    pub output_image_price: Option<Decimal>,
    pub web_search_price: Option<Decimal>,
    pub status: ModelStatus,
    pub free_tier: bool,
    pub pro_tier: bool,
    pub enterprise_tier: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// One model record from the external catalog feed snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelFeedRecord {
    pub id: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub context_window: Option<i64>,
    pub prompt_price: Option<Decimal>,
    pub completion_price: Option<Decimal>,
    pub input_image_price: Option<Decimal>,
    pub output_image_price: Option<Decimal>,
    pub web_search_price: Option<Decimal>,
}

pub use feed::CatalogFeedClient;
pub use reconciler::{CatalogReconciler, SyncReport, SyncRun};
pub use store::CatalogRepository;
