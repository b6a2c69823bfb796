mod postgres;

#[cfg(test)]
pub(crate) mod memory;

pub use postgres::{build_pool, PgStore};

use crate::error::LookupError;
use crate::ledger::{LedgerEntry, LedgerRow, LedgerSummary, ReplaceOutcome};
use crate::observation::ObservationRow;
use chrono::NaiveDateTime;
use std::future::Future;

/// Read side: one observation table per sensor.
pub trait SeriesStore: Send + Sync {
    /// Sensor ids with an observation table, in a stable order.
    fn list_sensors(&self) -> impl Future<Output = Result<Vec<String>, sqlx::Error>> + Send;

    fn observations(
        &self,
        sensor_id: &str,
    ) -> impl Future<Output = Result<Vec<ObservationRow>, LookupError>> + Send;

    /// `Ok(None)` for an existing but empty table.
    fn latest_observation_timestamp(
        &self,
        sensor_id: &str,
    ) -> impl Future<Output = Result<Option<NaiveDateTime>, LookupError>> + Send;
}

/// The shared anomaly ledger.
pub trait LedgerStore: Send + Sync {
    fn ensure_schema(&self) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    /// One summary per sensor that has at least one ledger row.
    fn ledger_summaries(
        &self,
    ) -> impl Future<Output = Result<Vec<LedgerSummary>, sqlx::Error>> + Send;

    fn entries_for(
        &self,
        sensor_id: &str,
    ) -> impl Future<Output = Result<Vec<LedgerRow>, sqlx::Error>> + Send;

    /// Deletes every row for the sensor and inserts `entries` as one atomic
    /// unit. Concurrent readers see either the old set or the new one.
    fn replace_entries(
        &self,
        sensor_id: &str,
        entries: &[LedgerEntry],
    ) -> impl Future<Output = Result<ReplaceOutcome, sqlx::Error>> + Send;

    /// Sets `days_since_anomaly` on all of the sensor's rows, but only while
    /// the sensor's greatest anomaly date still equals `anomaly_watermark`.
    /// Returns the number of rows written; zero means the set was replaced
    /// in between.
    fn update_staleness(
        &self,
        sensor_id: &str,
        anomaly_watermark: NaiveDateTime,
        days: i32,
    ) -> impl Future<Output = Result<u64, sqlx::Error>> + Send;
}
