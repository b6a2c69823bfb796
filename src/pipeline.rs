//! One batch: plan, score every selected sensor, replace its ledger rows,
//! then refresh staleness for everything in the ledger.

use crate::config::Config;
use crate::error::SweepError;
use crate::flagging::{flag_anomalies, ErrorGranularity};
use crate::ledger::{self, ReplaceOutcome, StalenessReport};
use crate::observation::Variable;
use crate::scheduler;
use crate::scorer::{ReconstructionScorer, ScorerError};
use crate::store::{LedgerStore, SeriesStore};
use crate::windowing::build_windows;
use chrono::NaiveDateTime;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::Instrument;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SweepOptions {
    pub max_concurrent_sensors: usize,
    pub granularity: ErrorGranularity,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            max_concurrent_sensors: 1,
            granularity: ErrorGranularity::default(),
        }
    }
}

impl SweepOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_sensors: config.max_concurrent_sensors.max(1),
            granularity: config.error_granularity,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub started_at: NaiveDateTime,
    pub candidates: usize,
    pub selected: usize,
    pub up_to_date: usize,
    pub rescored: usize,
    pub skipped_missing: usize,
    pub skipped_unreadable: usize,
    pub skipped_insufficient: usize,
    /// Sensors whose payload the scorer refused or answered with garbage.
    pub skipped_rejected: usize,
    /// Sensors that hit a scorer or store outage.
    pub failed: usize,
    /// Selected sensors never started because the batch aborted.
    pub not_started: usize,
    pub aborted: bool,
    pub anomalies: BTreeMap<Variable, usize>,
    pub rows_deleted: u64,
    pub rows_inserted: u64,
    pub malformed_rows: usize,
    pub trimmed_rows: usize,
}

impl BatchReport {
    fn new(batch_id: Uuid, started_at: NaiveDateTime) -> Self {
        Self {
            batch_id,
            started_at,
            candidates: 0,
            selected: 0,
            up_to_date: 0,
            rescored: 0,
            skipped_missing: 0,
            skipped_unreadable: 0,
            skipped_insufficient: 0,
            skipped_rejected: 0,
            failed: 0,
            not_started: 0,
            aborted: false,
            anomalies: Variable::ALL.iter().map(|v| (*v, 0)).collect(),
            rows_deleted: 0,
            rows_inserted: 0,
            malformed_rows: 0,
            trimmed_rows: 0,
        }
    }

    pub fn total_anomalies(&self) -> usize {
        self.anomalies.values().sum()
    }

    fn record(&mut self, rescore: &Rescore) {
        self.rescored += 1;
        for (variable, count) in &rescore.anomalies {
            *self.anomalies.entry(*variable).or_default() += count;
        }
        self.rows_deleted += rescore.replace.deleted;
        self.rows_inserted += rescore.replace.inserted;
        self.malformed_rows += rescore.malformed_rows;
        self.trimmed_rows += rescore.trimmed_rows;
    }

    fn record_skip(&mut self, err: &SweepError) {
        match err {
            SweepError::MissingTable { .. } => self.skipped_missing += 1,
            SweepError::InsufficientData { .. } => self.skipped_insufficient += 1,
            SweepError::ScoringRejected { .. } => self.skipped_rejected += 1,
            _ => self.skipped_unreadable += 1,
        }
    }
}

#[derive(Debug)]
struct Rescore {
    anomalies: BTreeMap<Variable, usize>,
    replace: ReplaceOutcome,
    malformed_rows: usize,
    trimmed_rows: usize,
}

enum SensorOutcome {
    Rescored(Rescore),
    NotStarted,
}

/// Re-scores every sensor with new observations and rewrites its ledger rows.
/// `started_at` becomes `last_analysed` on every row written by this batch.
///
/// A scorer or store outage stops new sensors from starting; sensors already
/// in flight finish or roll back, and the error is returned.
pub async fn run_detection<S, R>(
    store: &S,
    scorer: &R,
    options: &SweepOptions,
    started_at: NaiveDateTime,
) -> Result<BatchReport, SweepError>
where
    S: SeriesStore + LedgerStore,
    R: ReconstructionScorer,
{
    let batch_id = Uuid::new_v4();
    let span = tracing::info_span!(
        "anomaly_sweep",
        batch_id = %batch_id,
        started_at = %started_at,
    );
    detect(store, scorer, options, batch_id, started_at)
        .instrument(span)
        .await
}

async fn detect<S, R>(
    store: &S,
    scorer: &R,
    options: &SweepOptions,
    batch_id: Uuid,
    started_at: NaiveDateTime,
) -> Result<BatchReport, SweepError>
where
    S: SeriesStore + LedgerStore,
    R: ReconstructionScorer,
{
    let mut report = BatchReport::new(batch_id, started_at);
    let plan = scheduler::plan_sweep(store).await?;
    report.candidates = plan.candidates;
    report.selected = plan.selected.len();
    report.up_to_date = plan.up_to_date.len();
    report.skipped_missing = plan.skipped_missing.len();
    report.skipped_unreadable = plan.skipped_unreadable.len();

    if plan.selected.is_empty() {
        tracing::info!(up_to_date = report.up_to_date, "no sensors need re-scoring");
        return Ok(report);
    }

    if let Err(err) = scorer.ready().await {
        tracing::error!(error = %err, "scorer not ready; batch aborted before any writes");
        report.not_started = plan.selected.len();
        report.aborted = true;
        return Err(err.into());
    }

    let abort = AtomicBool::new(false);
    let granularity = options.granularity;
    let mut outcomes = stream::iter(plan.selected.iter())
        .map(|sensor_id| {
            let abort = &abort;
            async move {
                if abort.load(Ordering::SeqCst) {
                    return (sensor_id, Ok(SensorOutcome::NotStarted));
                }
                let span = tracing::info_span!("sensor", sensor_id = %sensor_id);
                let result = rescore_sensor(store, scorer, sensor_id, granularity, started_at)
                    .instrument(span)
                    .await;
                if matches!(&result, Err(err) if err.is_batch_fatal()) {
                    abort.store(true, Ordering::SeqCst);
                }
                (sensor_id, result.map(SensorOutcome::Rescored))
            }
        })
        .buffer_unordered(options.max_concurrent_sensors.max(1));

    let mut fatal: Option<SweepError> = None;
    while let Some((sensor_id, result)) = outcomes.next().await {
        match result {
            Ok(SensorOutcome::Rescored(rescore)) => report.record(&rescore),
            Ok(SensorOutcome::NotStarted) => report.not_started += 1,
            Err(err) if err.is_batch_fatal() => {
                tracing::error!(sensor_id = %sensor_id, error = %err, "aborting batch");
                report.failed += 1;
                report.aborted = true;
                if fatal.is_none() {
                    fatal = Some(err);
                }
            }
            Err(err) => {
                tracing::warn!(sensor_id = %sensor_id, error = %err, "sensor skipped");
                report.record_skip(&err);
            }
        }
    }

    tracing::info!(
        selected = report.selected,
        rescored = report.rescored,
        skipped_missing = report.skipped_missing,
        skipped_unreadable = report.skipped_unreadable,
        skipped_insufficient = report.skipped_insufficient,
        skipped_rejected = report.skipped_rejected,
        failed = report.failed,
        not_started = report.not_started,
        aborted = report.aborted,
        anomalies = report.total_anomalies(),
        rows_inserted = report.rows_inserted,
        "detection finished"
    );

    match fatal {
        Some(err) => Err(err),
        None => Ok(report),
    }
}

async fn rescore_sensor<S, R>(
    store: &S,
    scorer: &R,
    sensor_id: &str,
    granularity: ErrorGranularity,
    started_at: NaiveDateTime,
) -> Result<Rescore, SweepError>
where
    S: SeriesStore + LedgerStore,
    R: ReconstructionScorer,
{
    let rows = store
        .observations(sensor_id)
        .await
        .map_err(|err| SweepError::from_lookup(sensor_id, err))?;
    let windows = build_windows(sensor_id, rows)?;

    let mut flags = Vec::new();
    let mut anomalies = BTreeMap::new();
    for variable in Variable::ALL {
        let input = windows.variable(variable);
        let errors = scorer
            .score(variable, input)
            .await
            .map_err(|err| SweepError::from_score(sensor_id, variable, err))?;
        if errors.len() != input.len() {
            return Err(SweepError::from_score(
                sensor_id,
                variable,
                ScorerError::ShapeMismatch {
                    expected: input.len(),
                    actual: errors.len(),
                },
            ));
        }
        let flagged = flag_anomalies(variable, &errors, &windows.timestamps, granularity);
        anomalies.insert(variable, flagged.len());
        flags.extend(flagged);
    }

    let replace = ledger::replace_on_rescore(store, sensor_id, &flags, started_at).await?;
    tracing::info!(
        windows = windows.windows(),
        trimmed = windows.trimmed_rows,
        malformed = windows.malformed_rows,
        anomalies = flags.len(),
        "sensor re-scored"
    );

    Ok(Rescore {
        anomalies,
        replace,
        malformed_rows: windows.malformed_rows,
        trimmed_rows: windows.trimmed_rows,
    })
}

/// Staleness pass on its own, for every sensor with ledger rows.
pub async fn run_staleness<S>(store: &S) -> Result<StalenessReport, SweepError>
where
    S: SeriesStore + LedgerStore,
{
    let span = tracing::info_span!("staleness_pass");
    async {
        let report = ledger::recompute_staleness(store).await?;
        tracing::info!(
            sensors = report.sensors,
            updated = report.updated,
            superseded = report.superseded,
            skipped = report.skipped,
            "staleness refreshed"
        );
        Ok(report)
    }
    .instrument(span)
    .await
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub detection: BatchReport,
    pub staleness: StalenessReport,
}

/// Detection followed by the staleness pass. Staleness still runs when
/// detection aborted on the scorer; the detection error is returned after it.
/// A store outage skips staleness.
pub async fn run_sweep<S, R>(
    store: &S,
    scorer: &R,
    options: &SweepOptions,
    started_at: NaiveDateTime,
) -> Result<SweepReport, SweepError>
where
    S: SeriesStore + LedgerStore,
    R: ReconstructionScorer,
{
    let detection = match run_detection(store, scorer, options, started_at).await {
        Err(err @ SweepError::StoreUnavailable(_)) => return Err(err),
        other => other,
    };
    let staleness = run_staleness(store).await;

    match (detection, staleness) {
        (Ok(detection), Ok(staleness)) => Ok(SweepReport {
            detection,
            staleness,
        }),
        (Err(err), staleness) => {
            if let Err(staleness_err) = staleness {
                tracing::warn!(error = %staleness_err, "staleness pass failed after aborted detection");
            }
            Err(err)
        }
        (Ok(_), Err(err)) => Err(err),
    }
}
