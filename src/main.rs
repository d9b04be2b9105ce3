use anyhow::Context;
use chrono::NaiveDate;
use clap::Parser;
use tracing::info;

use chatledger::app::{AppConfig, AppState};
use chatledger::catalog::{ModelFeedRecord, Tier};
use chatledger::cli::{Cli, Commands, ModelAction};
use chatledger::platform::AppPaths;
use chatledger::reporting::{Caller, Granularity};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "chatledger=debug"
    } else {
        "chatledger=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_directive.parse().unwrap()),
        )
        .init();

    let paths = match &cli.data_dir {
        Some(dir) => AppPaths::with_data_dir(dir)?,
        None => AppPaths::new()?,
    };
    paths.ensure_dirs_exist()?;

    let config = AppConfig::load(&paths).await?;
    let state = AppState::new(config, &paths).await?;

    // Reporting commands run as the operator, which is an admin context.
    let operator = Caller::admin("operator");

    match cli.command {
        Commands::Sync {
            file,
            attributed_to,
        } => {
            let started = chrono::Utc::now();
            let snapshot: Vec<ModelFeedRecord> = match file {
                Some(path) => {
                    let raw = tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("reading snapshot file {}", path))?;
                    serde_json::from_str(&raw).context("parsing snapshot file")?
                }
                None => state.feed_client()?.fetch_snapshot().await?,
            };

            let report = state
                .reconciler
                .sync_catalog(&snapshot, attributed_to.as_deref(), Some(started))
                .await?;

            if report.success {
                println!(
                    "Sync run {} completed: seen={}, added={}, updated={}, inactive={}, reactivated={} ({}ms)",
                    report.sync_run_id,
                    report.models_seen,
                    report.added,
                    report.updated,
                    report.marked_inactive,
                    report.reactivated,
                    report.duration_ms
                );
            } else {
                println!(
                    "Sync run {} FAILED: {}",
                    report.sync_run_id,
                    report.error.unwrap_or_default()
                );
                std::process::exit(1);
            }
        }

        Commands::SyncHistory { limit } => {
            for run in state.reconciler.list_sync_runs(limit).await? {
                println!(
                    "#{} {} {} seen={} added={} updated={} inactive={} reactivated={} {}",
                    run.id,
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.status,
                    run.models_seen,
                    run.added,
                    run.updated,
                    run.marked_inactive,
                    run.reactivated,
                    run.error_message.unwrap_or_default()
                );
            }
        }

        Commands::Models { all } => {
            for entry in state.catalog.list_entries(all).await? {
                println!(
                    "{:<40} {:<8} free={} pro={} ent={}",
                    entry.model_id,
                    entry.status.as_str(),
                    entry.free_tier,
                    entry.pro_tier,
                    entry.enterprise_tier
                );
            }
        }

        Commands::Model { id, action } => match action {
            ModelAction::Tier { tier, revoke } => {
                let tier = parse_tier(&tier)?;
                state.catalog.set_tier_access(&id, tier, !revoke).await?;
                println!("{} tier access {}", id, if revoke { "revoked" } else { "granted" });
            }
            ModelAction::Activate => {
                state.catalog.activate(&id).await?;
                println!("{} activated", id);
            }
            ModelAction::Disable => {
                state.catalog.disable(&id).await?;
                println!("{} disabled", id);
            }
            ModelAction::Enable => {
                state.catalog.enable(&id).await?;
                println!("{} re-enabled (status 'new')", id);
            }
        },

        Commands::Usage {
            user,
            from,
            to,
            model,
        } => {
            let rows = state
                .reporting
                .user_daily_costs(
                    &operator,
                    &user,
                    parse_date(&from)?,
                    parse_date(&to)?,
                    model.as_deref(),
                )
                .await?;
            for row in rows {
                println!("{}  ${}", row.date, row.total_cost);
            }
        }

        Commands::AdminUsage {
            granularity,
            from,
            to,
        } => {
            let granularity = match granularity.as_str() {
                "day" => Granularity::Day,
                "week" => Granularity::Week,
                "month" => Granularity::Month,
                other => anyhow::bail!("unknown granularity '{}'", other),
            };
            let buckets = state
                .reporting
                .admin_usage(&operator, granularity, parse_date(&from)?, parse_date(&to)?)
                .await?;
            for bucket in buckets {
                println!(
                    "{}  ${}  users={}",
                    bucket.bucket, bucket.total_cost, bucket.active_users
                );
            }
        }

        Commands::Errors { limit } => {
            for error in state.reporting.recent_errors(&operator, limit).await? {
                println!(
                    "{} turn={} session={} user={} model={}",
                    error.created_at.format("%Y-%m-%d %H:%M:%S"),
                    error.turn_id,
                    error.session_id,
                    error.user_id,
                    error.model_id.as_deref().unwrap_or("-")
                );
            }
        }

        Commands::RebuildModelDaily { date } => {
            let models = state.ledger.rebuild_model_daily(parse_date(&date)?).await?;
            println!("Rebuilt model rollup for {}: {} models", date, models);
        }

        Commands::Cleanup => {
            let costs = state
                .ledger
                .cleanup_cost_records(state.config.retention.cost_record_days)
                .await?;
            let errors = state
                .ingest
                .cleanup_error_events(state.config.retention.error_event_days)
                .await?;
            state.db.vacuum().await?;
            println!("Removed {} cost records and {} error events", costs, errors);
        }
    }

    info!("Done");
    Ok(())
}

fn parse_date(s: &str) -> anyhow::Result<NaiveDate> {
    s.parse()
        .with_context(|| format!("invalid date '{}', expected YYYY-MM-DD", s))
}

fn parse_tier(s: &str) -> anyhow::Result<Tier> {
    match s {
        "free" => Ok(Tier::Free),
        "pro" => Ok(Tier::Pro),
        "enterprise" => Ok(Tier::Enterprise),
        other => anyhow::bail!("unknown tier '{}'", other),
    }
}
