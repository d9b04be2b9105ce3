use sqlx::{migrate::MigrateDatabase, SqlitePool};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::platform::AppPaths;

/// Migrations are compiled in so the schema travels with the binary and tests
/// never depend on the process working directory.
const MIGRATIONS: &[(i32, &str, &str)] = &[(
    1,
    "001_initial",
    include_str!("../../migrations/001_initial.sql"),
)];

/// Database connection manager with migration support
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection and run migrations
    pub async fn new(paths: &AppPaths) -> Result<Self> {
        let db_path = paths.database_file();

        info!("Initializing database at: {:?}", db_path);

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if !db_path.exists() {
            info!("Database doesn't exist, creating new database");
            sqlx::Sqlite::create_database(&format!("sqlite:{}", db_path.display())).await?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePool::connect(&database_url).await?;

        let db = Self { pool };
        db.run_migrations().await?;

        info!("Database initialized successfully");
        Ok(db)
    }

    /// Run all pending database migrations
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await?;
        debug!("Current schema version: {}", current_version);

        for (version, name, sql) in MIGRATIONS {
            if *version <= current_version {
                debug!("Skipping migration {} (already applied)", name);
                continue;
            }

            info!("Applying migration: {}", name);

            // SQLite executes one statement per call, so split on ';'.
            let mut tx = self.pool.begin().await?;
            for statement in sql.split(';') {
                let statement = statement.trim();
                if statement.is_empty() {
                    continue;
                }
                sqlx::query(statement).execute(&mut *tx).await.map_err(|e| {
                    error!("Failed to apply migration {}: {}", name, e);
                    Error::Database(e)
                })?;
            }
            sqlx::query(
                "INSERT OR REPLACE INTO app_settings (key, value, updated_at) \
                 VALUES ('schema_version', ?, unixepoch())",
            )
            .bind(version.to_string())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            info!("Successfully applied migration: {}", name);
        }

        Ok(())
    }

    /// Get the current schema version
    async fn get_schema_version(&self) -> Result<i32> {
        let table_exists = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type='table' AND name='app_settings'",
        )
        .fetch_optional(&self.pool)
        .await?
        .is_some();

        if !table_exists {
            return Ok(0);
        }

        let version: Option<String> =
            sqlx::query_scalar("SELECT value FROM app_settings WHERE key = 'schema_version'")
                .fetch_optional(&self.pool)
                .await?;

        match version {
            Some(version_str) => version_str.parse().map_err(|e| {
                Error::Database(sqlx::Error::Decode(
                    format!("Invalid schema version: {}", e).into(),
                ))
            }),
            None => Ok(0),
        }
    }

    /// Get the database connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection
    pub async fn close(self) {
        self.pool.close().await;
        info!("Database connection closed");
    }

    /// Vacuum the database to reclaim space
    pub async fn vacuum(&self) -> Result<()> {
        info!("Starting database vacuum operation");
        sqlx::query("VACUUM").execute(&self.pool).await?;
        info!("Database vacuum completed successfully");
        Ok(())
    }

    /// Verify database integrity
    pub async fn verify_integrity(&self) -> Result<bool> {
        let integrity_result: String = sqlx::query_scalar("PRAGMA integrity_check")
            .fetch_one(&self.pool)
            .await?;

        let is_ok = integrity_result == "ok";
        if !is_ok {
            error!("Database integrity check failed: {}", integrity_result);
        }
        Ok(is_ok)
    }
}

/// Helpers for monetary amounts. Costs are persisted as INTEGER micro-units
/// (1e-6 USD): SQL addition on them is exact, and upserts with
/// `x = x + excluded.x` are race-safe without read-modify-write. Decimals
/// appear only at the API boundary.
pub mod money {
    use rust_decimal::prelude::ToPrimitive;
    use rust_decimal::{Decimal, RoundingStrategy};

    use crate::error::{Error, Result};

    pub const MICROS_SCALE: u32 = 6;

    /// Convert a decimal dollar amount to micro-units, rounding half away
    /// from zero to 6 decimal places.
    pub fn decimal_to_micros(amount: Decimal) -> Result<i64> {
        let rounded =
            amount.round_dp_with_strategy(MICROS_SCALE, RoundingStrategy::MidpointAwayFromZero);
        let scaled = rounded
            .checked_mul(Decimal::from(1_000_000u32))
            .ok_or_else(|| Error::validation("amount_overflow"))?;
        scaled
            .trunc()
            .to_i64()
            .ok_or_else(|| Error::validation("amount_overflow"))
    }

    /// Convert stored micro-units back to a decimal dollar amount.
    pub fn micros_to_decimal(micros: i64) -> Decimal {
        Decimal::new(micros, MICROS_SCALE)
    }

    /// Parse a decimal price string from the catalog.
    pub fn parse_price(s: &str) -> Result<Decimal> {
        s.parse().map_err(|e| {
            Error::Database(sqlx::Error::Decode(
                format!("Failed to parse decimal from string '{}': {}", s, e).into(),
            ))
        })
    }
}
