use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "chatledger")]
#[command(about = "Usage metering and model catalog reconciliation engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Data directory override (defaults to the platform data dir)
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Reconcile the catalog against the provider feed (or a snapshot file)
    Sync {
        /// Read the snapshot from a JSON file instead of the feed URL
        #[arg(short, long)]
        file: Option<String>,

        /// Operator or scheduler identity to attribute the run to
        #[arg(long)]
        attributed_to: Option<String>,
    },

    /// Show recent reconciliation runs
    SyncHistory {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },

    /// List catalog entries
    Models {
        /// Include inactive and disabled entries
        #[arg(short, long)]
        all: bool,
    },

    /// Administer a catalog entry
    Model {
        /// Model id
        id: String,

        #[command(subcommand)]
        action: ModelAction,
    },

    /// Per-user daily cost report
    Usage {
        /// User to report on
        #[arg(short, long)]
        user: String,

        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        from: String,

        /// End date (YYYY-MM-DD)
        #[arg(long)]
        to: String,

        /// Restrict to one model
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Global usage buckets (admin)
    AdminUsage {
        /// day, week or month
        #[arg(short, long, default_value = "day")]
        granularity: String,

        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,
    },

    /// Recent errored turns with model attribution (admin)
    Errors {
        #[arg(short, long, default_value_t = 50)]
        limit: u32,
    },

    /// Rebuild the per-model daily rollup for one date
    RebuildModelDaily {
        /// Date (YYYY-MM-DD)
        date: String,
    },

    /// Apply retention policy to cost records and error events
    Cleanup,
}

#[derive(Subcommand)]
pub enum ModelAction {
    /// Grant or revoke tier access
    Tier {
        /// free, pro or enterprise
        tier: String,

        /// Revoke instead of grant
        #[arg(long)]
        revoke: bool,
    },

    /// Promote a new model to active
    Activate,

    /// Hide the model regardless of provider status
    Disable,

    /// Lift an administrator disable (model returns as 'new')
    Enable,
}
