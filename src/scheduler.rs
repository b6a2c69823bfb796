//! Decides which sensors need re-scoring in this run.
//!
//! A sensor is selected when it has no ledger rows, or when its newest
//! observation is strictly newer than the `last_analysed` watermark stored on
//! its ledger rows. Sensors that were clean last time have no rows and are
//! therefore always selected.

use crate::error::{LookupError, SweepError};
use crate::ledger::LedgerSummary;
use crate::observation::is_valid_sensor_id;
use crate::store::{LedgerStore, SeriesStore};
use chrono::NaiveDateTime;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepPlan {
    pub candidates: usize,
    pub selected: Vec<String>,
    pub up_to_date: Vec<String>,
    pub skipped_missing: Vec<String>,
    pub skipped_unreadable: Vec<String>,
}

/// Ledger watermark per sensor. A present key with `None` means rows exist
/// but none carries an analysis time.
pub fn watermarks(summaries: &[LedgerSummary]) -> HashMap<String, Option<NaiveDateTime>> {
    summaries
        .iter()
        .filter(|summary| summary.row_count > 0)
        .map(|summary| (summary.sensor_id.clone(), summary.last_analysed))
        .collect()
}

pub fn needs_analysis(
    latest_observation: Option<NaiveDateTime>,
    watermark: Option<Option<NaiveDateTime>>,
) -> bool {
    match watermark {
        None | Some(None) => true,
        Some(Some(last_analysed)) => {
            matches!(latest_observation, Some(observed) if observed > last_analysed)
        }
    }
}

/// Pure selection over already-fetched observation watermarks.
pub fn select_sensors(
    observed: Vec<(String, Result<Option<NaiveDateTime>, LookupError>)>,
    watermarks: &HashMap<String, Option<NaiveDateTime>>,
) -> Result<SweepPlan, SweepError> {
    let mut plan = SweepPlan {
        candidates: observed.len(),
        ..SweepPlan::default()
    };

    for (sensor_id, latest) in observed {
        match latest {
            Ok(latest) => {
                if needs_analysis(latest, watermarks.get(&sensor_id).copied()) {
                    plan.selected.push(sensor_id);
                } else {
                    plan.up_to_date.push(sensor_id);
                }
            }
            Err(err) if err.is_fatal() => return Err(SweepError::from_lookup(&sensor_id, err)),
            Err(LookupError::MissingTable { .. }) => {
                tracing::warn!(sensor_id = %sensor_id, "observation table disappeared; skipping");
                plan.skipped_missing.push(sensor_id);
            }
            Err(err) => {
                tracing::warn!(sensor_id = %sensor_id, error = %err, "skipping unreadable sensor");
                plan.skipped_unreadable.push(sensor_id);
            }
        }
    }

    Ok(plan)
}

pub async fn plan_sweep<S>(store: &S) -> Result<SweepPlan, SweepError>
where
    S: SeriesStore + LedgerStore,
{
    let sensors = store.list_sensors().await?;
    let summaries = store.ledger_summaries().await?;
    let watermarks = watermarks(&summaries);

    let mut observed = Vec::with_capacity(sensors.len());
    for sensor_id in sensors {
        if !is_valid_sensor_id(&sensor_id) {
            tracing::debug!(sensor_id = %sensor_id, "ignoring invalid sensor id");
            continue;
        }
        let latest = store.latest_observation_timestamp(&sensor_id).await;
        observed.push((sensor_id, latest));
    }

    let plan = select_sensors(observed, &watermarks)?;
    tracing::info!(
        candidates = plan.candidates,
        selected = plan.selected.len(),
        up_to_date = plan.up_to_date.len(),
        skipped = plan.skipped_missing.len() + plan.skipped_unreadable.len(),
        "sweep planned"
    );
    Ok(plan)
}
