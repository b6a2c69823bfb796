use super::{LedgerStore, SeriesStore};
use crate::error::LookupError;
use crate::ledger::{LedgerEntry, LedgerRow, LedgerSummary, ReplaceOutcome};
use crate::observation::ObservationRow;
use chrono::NaiveDateTime;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// In-process store for pipeline tests.
#[derive(Default)]
pub(crate) struct MemoryStore {
    series: Mutex<BTreeMap<String, Vec<ObservationRow>>>,
    unreadable: Mutex<HashSet<String>>,
    ledger: Mutex<Vec<LedgerRow>>,
    failing_replace: Mutex<HashSet<String>>,
    offline: AtomicBool,
    replace_calls: AtomicUsize,
}

impl MemoryStore {
    pub(crate) fn insert_series(&self, sensor_id: &str, rows: Vec<ObservationRow>) {
        self.series
            .lock()
            .unwrap()
            .insert(sensor_id.to_string(), rows);
    }

    pub(crate) fn push_observations(&self, sensor_id: &str, rows: Vec<ObservationRow>) {
        self.series
            .lock()
            .unwrap()
            .entry(sensor_id.to_string())
            .or_default()
            .extend(rows);
    }

    pub(crate) fn mark_unreadable(&self, sensor_id: &str) {
        self.unreadable
            .lock()
            .unwrap()
            .insert(sensor_id.to_string());
    }

    pub(crate) fn fail_replace_for(&self, sensor_id: &str) {
        self.failing_replace
            .lock()
            .unwrap()
            .insert(sensor_id.to_string());
    }

    pub(crate) fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub(crate) fn replace_calls(&self) -> usize {
        self.replace_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn insert_ledger_row(&self, row: LedgerRow) {
        self.ledger.lock().unwrap().push(row);
    }

    pub(crate) fn ledger_rows(&self, sensor_id: &str) -> Vec<LedgerRow> {
        self.ledger
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.sensor_id == sensor_id)
            .cloned()
            .collect()
    }

    fn check_online(&self) -> Result<(), sqlx::Error> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(sqlx::Error::PoolTimedOut);
        }
        Ok(())
    }

    fn table_for(&self, sensor_id: &str) -> Result<Vec<ObservationRow>, LookupError> {
        self.check_online()?;
        let table = format!("grow_data_{sensor_id}");
        if self.unreadable.lock().unwrap().contains(sensor_id) {
            return Err(LookupError::Unreadable {
                table,
                source: sqlx::Error::ColumnNotFound("soil_moisture".to_string()),
            });
        }
        self.series
            .lock()
            .unwrap()
            .get(sensor_id)
            .cloned()
            .ok_or(LookupError::MissingTable { table })
    }
}

impl SeriesStore for MemoryStore {
    async fn list_sensors(&self) -> Result<Vec<String>, sqlx::Error> {
        self.check_online()?;
        Ok(self.series.lock().unwrap().keys().cloned().collect())
    }

    async fn observations(&self, sensor_id: &str) -> Result<Vec<ObservationRow>, LookupError> {
        self.table_for(sensor_id)
    }

    async fn latest_observation_timestamp(
        &self,
        sensor_id: &str,
    ) -> Result<Option<NaiveDateTime>, LookupError> {
        Ok(self
            .table_for(sensor_id)?
            .iter()
            .filter_map(|row| row.datetime)
            .max())
    }
}

impl LedgerStore for MemoryStore {
    async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        self.check_online()
    }

    async fn ledger_summaries(&self) -> Result<Vec<LedgerSummary>, sqlx::Error> {
        self.check_online()?;
        let ledger = self.ledger.lock().unwrap();
        let mut by_sensor: BTreeMap<&str, Vec<LedgerRow>> = BTreeMap::new();
        for row in ledger.iter() {
            by_sensor
                .entry(row.sensor_id.as_str())
                .or_default()
                .push(row.clone());
        }
        Ok(by_sensor
            .iter()
            .map(|(sensor_id, rows)| LedgerSummary::from_rows(sensor_id, rows))
            .collect())
    }

    async fn entries_for(&self, sensor_id: &str) -> Result<Vec<LedgerRow>, sqlx::Error> {
        self.check_online()?;
        Ok(self.ledger_rows(sensor_id))
    }

    async fn replace_entries(
        &self,
        sensor_id: &str,
        entries: &[LedgerEntry],
    ) -> Result<ReplaceOutcome, sqlx::Error> {
        self.replace_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        if self.failing_replace.lock().unwrap().contains(sensor_id) {
            return Err(sqlx::Error::PoolClosed);
        }
        let mut ledger = self.ledger.lock().unwrap();
        let before = ledger.len();
        ledger.retain(|row| row.sensor_id != sensor_id);
        let deleted = (before - ledger.len()) as u64;
        ledger.extend(entries.iter().map(LedgerRow::from_entry));
        Ok(ReplaceOutcome {
            deleted,
            inserted: entries.len() as u64,
        })
    }

    async fn update_staleness(
        &self,
        sensor_id: &str,
        anomaly_watermark: NaiveDateTime,
        days: i32,
    ) -> Result<u64, sqlx::Error> {
        self.check_online()?;
        let mut ledger = self.ledger.lock().unwrap();
        let current = ledger
            .iter()
            .filter(|row| row.sensor_id == sensor_id)
            .filter_map(LedgerRow::greatest_anomaly)
            .max();
        if current != Some(anomaly_watermark) {
            return Ok(0);
        }
        let mut updated = 0;
        for row in ledger.iter_mut().filter(|row| row.sensor_id == sensor_id) {
            row.days_since_anomaly = Some(days);
            updated += 1;
        }
        Ok(updated)
    }
}
