use crate::app::AppConfig;
use crate::catalog::{CatalogFeedClient, CatalogReconciler, CatalogRepository};
use crate::chat::ChatStore;
use crate::error::Result;
use crate::ingest::EventAggregator;
use crate::metering::{CostEngine, UsageLedger};
use crate::platform::AppPaths;
use crate::reporting::ReportingService;
use crate::storage::Database;

/// Composition root: one database, one instance of each engine service.
pub struct AppState {
    pub config: AppConfig,
    pub db: Database,
    pub chat: ChatStore,
    pub costs: CostEngine,
    pub ledger: UsageLedger,
    pub catalog: CatalogRepository,
    pub reconciler: CatalogReconciler,
    pub ingest: EventAggregator,
    pub reporting: ReportingService,
}

impl AppState {
    pub async fn new(config: AppConfig, paths: &AppPaths) -> Result<Self> {
        let db = Database::new(paths).await?;
        let pool = db.pool().clone();

        Ok(Self {
            chat: ChatStore::new(pool.clone()),
            costs: CostEngine::new(pool.clone()),
            ledger: UsageLedger::new(pool.clone()),
            catalog: CatalogRepository::new(pool.clone()),
            reconciler: CatalogReconciler::new(pool.clone()),
            ingest: EventAggregator::new(pool.clone()),
            reporting: ReportingService::new(pool),
            config,
            db,
        })
    }

    pub fn feed_client(&self) -> Result<CatalogFeedClient> {
        CatalogFeedClient::new(
            self.config.catalog.feed_url.clone(),
            self.config.catalog.timeout_seconds,
            self.config.catalog.max_retries,
        )
    }
}
