use anomaly_sweeper::cli::{Cli, Commands, StatusArgs};
use anomaly_sweeper::config::Config;
use anomaly_sweeper::ledger::{self, SensorStatus};
use anomaly_sweeper::pipeline::{self, SweepOptions};
use anomaly_sweeper::scorer::HttpScorer;
use anomaly_sweeper::store::{build_pool, LedgerStore, PgStore};
use anomaly_sweeper::telemetry;
use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use tokio::time::MissedTickBehavior;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.database_url.clone())?;
    telemetry::init_tracing(&config)?;

    let result = run(cli.command, &config).await;
    if let Err(err) = &result {
        tracing::error!(error = %format!("{err:#}"), "anomaly-sweeper failed");
    }
    telemetry::shutdown_tracing();
    result
}

async fn run(command: Commands, config: &Config) -> Result<()> {
    let pool = build_pool(&config.database_url, config.db_pool_size)
        .await
        .context("failed to connect to the database")?;
    let store = PgStore::from_config(pool, config);

    match command {
        Commands::InitSchema => {
            store.ensure_schema().await?;
            tracing::info!(ledger_table = %config.ledger_table, "ledger schema ready");
        }
        Commands::Detect => {
            store.ensure_schema().await?;
            let scorer = HttpScorer::from_config(config)?;
            let report = pipeline::run_detection(
                &store,
                &scorer,
                &SweepOptions::from_config(config),
                Utc::now().naive_utc(),
            )
            .await?;
            print_json(&report)?;
        }
        Commands::Staleness => {
            store.ensure_schema().await?;
            let report = pipeline::run_staleness(&store).await?;
            print_json(&report)?;
        }
        Commands::Sweep => {
            store.ensure_schema().await?;
            let scorer = HttpScorer::from_config(config)?;
            let report = pipeline::run_sweep(
                &store,
                &scorer,
                &SweepOptions::from_config(config),
                Utc::now().naive_utc(),
            )
            .await?;
            print_json(&report)?;
        }
        Commands::Watch => watch(&store, config).await?,
        Commands::Status(args) => status(&store, config, args).await?,
    }

    Ok(())
}

async fn watch(store: &PgStore, config: &Config) -> Result<()> {
    store.ensure_schema().await?;
    let scorer = HttpScorer::from_config(config)?;
    let options = SweepOptions::from_config(config);

    let mut ticker = tokio::time::interval(config.sweep_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tracing::info!(
        interval_secs = config.sweep_interval_secs,
        max_concurrent_sensors = options.max_concurrent_sensors,
        granularity = options.granularity.as_str(),
        "watching for new observations"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // An in-flight sweep always runs to completion before shutdown.
                match pipeline::run_sweep(store, &scorer, &options, Utc::now().naive_utc()).await {
                    Ok(report) => tracing::info!(
                        batch_id = %report.detection.batch_id,
                        rescored = report.detection.rescored,
                        staleness_updated = report.staleness.updated,
                        "sweep complete"
                    ),
                    Err(err) => tracing::error!(error = %err, "sweep failed; retrying next interval"),
                }
            }
            result = &mut shutdown => {
                if let Err(err) = result {
                    tracing::warn!(error = %err, "failed to listen for shutdown signal");
                }
                tracing::info!("shutdown requested");
                break;
            }
        }
    }

    Ok(())
}

async fn status(store: &PgStore, config: &Config, args: StatusArgs) -> Result<()> {
    let mut statuses = ledger::sensor_health(store, config.faulty_threshold_days).await?;
    if let Some(sensor_id) = args.sensor_id.as_deref() {
        statuses.retain(|status| status.sensor_id == sensor_id);
        if statuses.is_empty() {
            anyhow::bail!("unknown sensor {sensor_id}");
        }
    }

    if args.json {
        return print_json(&statuses);
    }
    for SensorStatus {
        sensor_id,
        health,
        days_since_anomaly,
        latest_anomaly,
        last_analysed,
    } in &statuses
    {
        println!(
            "{sensor_id:<16} {:<10} days={:<6} latest_anomaly={:<20} last_analysed={}",
            health.as_str(),
            days_since_anomaly.map_or_else(|| "-".to_string(), |d| d.to_string()),
            latest_anomaly.map_or_else(|| "-".to_string(), |t| t.to_string()),
            last_analysed.map_or_else(|| "-".to_string(), |t| t.to_string()),
        );
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
