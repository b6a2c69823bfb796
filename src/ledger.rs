use crate::error::SweepError;
use crate::flagging::FlaggedAnomaly;
use crate::observation::{is_valid_sensor_id, Variable};
use crate::store::{LedgerStore, SeriesStore};
use chrono::{Duration, NaiveDateTime};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// A row to be written: one flagged timestamp for one variable.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub sensor_id: String,
    pub variable: Variable,
    pub anomaly_at: NaiveDateTime,
    pub last_analysed: NaiveDateTime,
}

impl LedgerEntry {
    /// `(soil_date, light_date, air_date)` with only this entry's variable set.
    pub fn dates(
        &self,
    ) -> (
        Option<NaiveDateTime>,
        Option<NaiveDateTime>,
        Option<NaiveDateTime>,
    ) {
        let at = Some(self.anomaly_at);
        match self.variable {
            Variable::Soil => (at, None, None),
            Variable::Light => (None, at, None),
            Variable::Air => (None, None, at),
        }
    }
}

/// A stored ledger row.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRow {
    pub sensor_id: String,
    pub soil_date: Option<NaiveDateTime>,
    pub light_date: Option<NaiveDateTime>,
    pub air_date: Option<NaiveDateTime>,
    pub last_analysed: Option<NaiveDateTime>,
    pub days_since_anomaly: Option<i32>,
}

impl LedgerRow {
    pub fn from_entry(entry: &LedgerEntry) -> Self {
        let (soil_date, light_date, air_date) = entry.dates();
        Self {
            sensor_id: entry.sensor_id.clone(),
            soil_date,
            light_date,
            air_date,
            last_analysed: Some(entry.last_analysed),
            days_since_anomaly: None,
        }
    }

    /// Latest of the three variable dates, nulls ignored.
    pub fn greatest_anomaly(&self) -> Option<NaiveDateTime> {
        [self.soil_date, self.light_date, self.air_date]
            .into_iter()
            .flatten()
            .max()
    }
}

/// Per-sensor aggregate over the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerSummary {
    pub sensor_id: String,
    pub row_count: i64,
    pub last_analysed: Option<NaiveDateTime>,
    pub latest_anomaly: Option<NaiveDateTime>,
    pub days_since_anomaly: Option<i32>,
}

impl LedgerSummary {
    pub fn from_rows(sensor_id: &str, rows: &[LedgerRow]) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            row_count: rows.len() as i64,
            last_analysed: rows.iter().filter_map(|r| r.last_analysed).max(),
            latest_anomaly: rows.iter().filter_map(LedgerRow::greatest_anomaly).max(),
            days_since_anomaly: rows.iter().filter_map(|r| r.days_since_anomaly).min(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaceOutcome {
    pub deleted: u64,
    pub inserted: u64,
}

pub fn entries_from_flags(
    sensor_id: &str,
    flags: &[FlaggedAnomaly],
    last_analysed: NaiveDateTime,
) -> Vec<LedgerEntry> {
    flags
        .iter()
        .map(|flag| LedgerEntry {
            sensor_id: sensor_id.to_string(),
            variable: flag.variable,
            anomaly_at: flag.timestamp,
            last_analysed,
        })
        .collect()
}

/// Swaps a freshly re-scored sensor's ledger rows for the new flag set in one
/// atomic step. Zero flags leaves the sensor with zero rows.
pub async fn replace_on_rescore<L: LedgerStore>(
    ledger: &L,
    sensor_id: &str,
    flags: &[FlaggedAnomaly],
    last_analysed: NaiveDateTime,
) -> Result<ReplaceOutcome, SweepError> {
    let entries = entries_from_flags(sensor_id, flags, last_analysed);
    let outcome = ledger.replace_entries(sensor_id, &entries).await?;
    tracing::debug!(
        sensor_id = %sensor_id,
        deleted = outcome.deleted,
        inserted = outcome.inserted,
        "replaced ledger rows"
    );
    Ok(outcome)
}

/// Whole days from the latest anomaly to the latest observation, floored the
/// way a calendar delta is (a negative partial day counts as a full day back).
pub fn staleness_days(latest_observation: NaiveDateTime, latest_anomaly: NaiveDateTime) -> i64 {
    let delta = latest_observation - latest_anomaly;
    let days = delta.num_days();
    if delta < Duration::days(days) {
        days - 1
    } else {
        days
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StalenessReport {
    pub sensors: usize,
    pub updated: usize,
    /// Sensors whose anomaly set changed between read and write.
    pub superseded: usize,
    pub skipped: usize,
}

/// Recomputes `days_since_anomaly` for every sensor that has ledger rows,
/// whether or not it was re-scored in this run.
pub async fn recompute_staleness<S>(store: &S) -> Result<StalenessReport, SweepError>
where
    S: SeriesStore + LedgerStore,
{
    let summaries = store.ledger_summaries().await?;
    let mut report = StalenessReport::default();

    for summary in summaries {
        let Some(latest_anomaly) = summary.latest_anomaly else {
            continue;
        };
        report.sensors += 1;
        let sensor_id = summary.sensor_id.as_str();

        let latest_observation = match store.latest_observation_timestamp(sensor_id).await {
            Ok(Some(ts)) => ts,
            Ok(None) => {
                tracing::debug!(sensor_id = %sensor_id, "no observations; staleness left as is");
                report.skipped += 1;
                continue;
            }
            Err(err) if err.is_fatal() => return Err(SweepError::from_lookup(sensor_id, err)),
            Err(err) => {
                tracing::warn!(sensor_id = %sensor_id, error = %err, "skipping staleness update");
                report.skipped += 1;
                continue;
            }
        };

        let days = staleness_days(latest_observation, latest_anomaly);
        let days = days.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        let updated = store
            .update_staleness(sensor_id, latest_anomaly, days)
            .await?;
        if updated == 0 {
            tracing::info!(sensor_id = %sensor_id, "anomaly set changed during staleness pass");
            report.superseded += 1;
        } else {
            report.updated += 1;
            tracing::trace!(sensor_id = %sensor_id, days, rows = updated, "staleness updated");
        }
    }

    Ok(report)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorHealth {
    /// No ledger rows.
    Healthy,
    /// Ledger rows exist but staleness has not been computed yet.
    Pending,
    /// Latest anomaly is at least the threshold number of days old.
    Recovered,
    Faulty,
}

impl SensorHealth {
    pub fn classify(summary: Option<&LedgerSummary>, faulty_threshold_days: i32) -> Self {
        match summary {
            None => SensorHealth::Healthy,
            Some(summary) if summary.row_count == 0 => SensorHealth::Healthy,
            Some(summary) => match summary.days_since_anomaly {
                None => SensorHealth::Pending,
                Some(days) if days < faulty_threshold_days => SensorHealth::Faulty,
                Some(_) => SensorHealth::Recovered,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorHealth::Healthy => "healthy",
            SensorHealth::Pending => "pending",
            SensorHealth::Recovered => "recovered",
            SensorHealth::Faulty => "faulty",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorStatus {
    pub sensor_id: String,
    pub health: SensorHealth,
    pub days_since_anomaly: Option<i32>,
    pub latest_anomaly: Option<NaiveDateTime>,
    pub last_analysed: Option<NaiveDateTime>,
}

/// Health of every known sensor, whether it has an observation table, ledger
/// rows, or both.
pub async fn sensor_health<S>(
    store: &S,
    faulty_threshold_days: i32,
) -> Result<Vec<SensorStatus>, SweepError>
where
    S: SeriesStore + LedgerStore,
{
    let summaries: BTreeMap<String, LedgerSummary> = store
        .ledger_summaries()
        .await?
        .into_iter()
        .map(|s| (s.sensor_id.clone(), s))
        .collect();
    let mut sensors: BTreeSet<String> = store
        .list_sensors()
        .await?
        .into_iter()
        .filter(|id| is_valid_sensor_id(id))
        .collect();
    sensors.extend(summaries.keys().cloned());

    Ok(sensors
        .into_iter()
        .map(|sensor_id| {
            let summary = summaries.get(&sensor_id);
            SensorStatus {
                health: SensorHealth::classify(summary, faulty_threshold_days),
                days_since_anomaly: summary.and_then(|s| s.days_since_anomaly),
                latest_anomaly: summary.and_then(|s| s.latest_anomaly),
                last_analysed: summary.and_then(|s| s.last_analysed),
                sensor_id,
            }
        })
        .collect())
}
