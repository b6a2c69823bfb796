use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "anomaly-sweeper",
    version,
    about = "Soil sensor anomaly detection and staleness tracking"
)]
pub struct Cli {
    /// Overrides SWEEPER_DATABASE_URL / DATABASE_URL and the setup config.
    #[arg(long, global = true)]
    pub database_url: Option<String>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Create the ledger table and index if missing.
    InitSchema,
    /// Re-score sensors with new observations.
    Detect,
    /// Recompute days since the latest anomaly for every sensor in the ledger.
    Staleness,
    /// Detect, then refresh staleness.
    Sweep,
    /// Run a sweep every SWEEPER_INTERVAL_SECS until interrupted.
    Watch,
    /// Print per-sensor health.
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long)]
    pub sensor_id: Option<String>,
    #[arg(long, default_value_t = false)]
    pub json: bool,
}
