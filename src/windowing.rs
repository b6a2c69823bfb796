//! Reshapes one sensor's raw observations into fixed-size windows per scored
//! variable.
//!
//! The series is sorted, the oldest `len % WINDOW_SIZE` observations are
//! dropped so only a window-aligned suffix remains, and each scored variable
//! is min-max scaled to `[0, 1]` using statistics of that suffix alone. Scale
//! parameters are not persisted, so the same reading can normalise differently
//! from one batch to the next.

use crate::error::SweepError;
use crate::observation::{Observation, ObservationRow, Variable};
use chrono::NaiveDateTime;
use std::cmp::Ordering;

/// Samples per window; at the nominal sampling interval this is one day.
pub const WINDOW_SIZE: usize = 96;

/// A `(windows, WINDOW_SIZE, 1)` tensor stored flat in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct Windowed<T> {
    windows: usize,
    values: Vec<T>,
}

pub type WindowTensor = Windowed<f64>;
pub type TimestampTensor = Windowed<NaiveDateTime>;

impl<T> Windowed<T> {
    /// Returns `None` unless `values` is a non-empty multiple of `WINDOW_SIZE`.
    pub fn from_flat(values: Vec<T>) -> Option<Self> {
        if values.is_empty() || values.len() % WINDOW_SIZE != 0 {
            return None;
        }
        Some(Self {
            windows: values.len() / WINDOW_SIZE,
            values,
        })
    }

    pub fn windows(&self) -> usize {
        self.windows
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.windows, WINDOW_SIZE, 1)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_flat(&self) -> &[T] {
        &self.values
    }

    pub fn into_flat(self) -> Vec<T> {
        self.values
    }

    pub fn window(&self, index: usize) -> Option<&[T]> {
        self.values.chunks(WINDOW_SIZE).nth(index)
    }

    pub fn iter_windows(&self) -> std::slice::Chunks<'_, T> {
        self.values.chunks(WINDOW_SIZE)
    }
}

/// Everything the scorer and flagging engine need for one sensor.
#[derive(Debug, Clone)]
pub struct SensorWindows {
    pub sensor_id: String,
    pub soil: WindowTensor,
    pub light: WindowTensor,
    pub air: WindowTensor,
    pub timestamps: TimestampTensor,
    pub battery: Vec<Option<f64>>,
    /// Oldest rows sacrificed to align the series to whole windows.
    pub trimmed_rows: usize,
    pub malformed_rows: usize,
}

impl SensorWindows {
    pub fn variable(&self, variable: Variable) -> &WindowTensor {
        match variable {
            Variable::Soil => &self.soil,
            Variable::Light => &self.light,
            Variable::Air => &self.air,
        }
    }

    pub fn windows(&self) -> usize {
        self.timestamps.windows()
    }
}

pub fn build_windows(
    sensor_id: &str,
    rows: Vec<ObservationRow>,
) -> Result<SensorWindows, SweepError> {
    let total_rows = rows.len();
    let mut observations: Vec<Observation> = Vec::with_capacity(total_rows);
    for row in rows {
        match Observation::from_row(sensor_id, row) {
            Ok(observation) => observations.push(observation),
            Err(err) => tracing::debug!(error = %err, "dropping malformed observation"),
        }
    }
    let malformed_rows = total_rows - observations.len();

    // Ties on timestamp are broken on the values so the output does not depend
    // on the order rows came back from the store.
    observations.sort_by(compare_observations);

    let trimmed_rows = observations.len() % WINDOW_SIZE;
    let aligned = &observations[trimmed_rows..];
    if aligned.is_empty() {
        return Err(SweepError::InsufficientData {
            sensor_id: sensor_id.to_string(),
            observations: observations.len(),
            window: WINDOW_SIZE,
        });
    }

    let column = |variable: Variable| -> Vec<f64> {
        let raw: Vec<f64> = aligned.iter().map(|obs| obs.value(variable)).collect();
        min_max_scale(&raw)
    };
    let tensor = |values: Vec<f64>| {
        WindowTensor::from_flat(values).ok_or_else(|| SweepError::InsufficientData {
            sensor_id: sensor_id.to_string(),
            observations: aligned.len(),
            window: WINDOW_SIZE,
        })
    };

    let soil = tensor(column(Variable::Soil))?;
    let light = tensor(column(Variable::Light))?;
    let air = tensor(column(Variable::Air))?;
    let timestamps = TimestampTensor::from_flat(aligned.iter().map(|obs| obs.timestamp).collect())
        .ok_or_else(|| SweepError::InsufficientData {
            sensor_id: sensor_id.to_string(),
            observations: aligned.len(),
            window: WINDOW_SIZE,
        })?;
    let battery = aligned.iter().map(|obs| obs.battery_level).collect();

    Ok(SensorWindows {
        sensor_id: sensor_id.to_string(),
        soil,
        light,
        air,
        timestamps,
        battery,
        trimmed_rows,
        malformed_rows,
    })
}

fn compare_observations(a: &Observation, b: &Observation) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.soil_moisture.total_cmp(&b.soil_moisture))
        .then_with(|| a.light.total_cmp(&b.light))
        .then_with(|| a.air_temperature.total_cmp(&b.air_temperature))
        .then_with(|| {
            let a_battery = a.battery_level.unwrap_or(f64::NEG_INFINITY);
            let b_battery = b.battery_level.unwrap_or(f64::NEG_INFINITY);
            a_battery.total_cmp(&b_battery)
        })
}

/// Scales to `[0, 1]`. A constant column maps to all zeros.
pub fn min_max_scale(values: &[f64]) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(*v), hi.max(*v))
        });
    let range = max - min;
    if range == 0.0 {
        return vec![0.0; values.len()];
    }
    values.iter().map(|v| (v - min) / range).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn base() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap()
    }

    fn series(len: usize) -> Vec<ObservationRow> {
        (0..len)
            .map(|i| ObservationRow {
                datetime: Some(base() + Duration::minutes(15 * i as i64)),
                soil_moisture: Some(20.0 + (i % 7) as f64),
                light: Some((i % 13) as f64 * 0.5),
                air_temperature: Some(10.0 + (i % 5) as f64),
                battery_level: Some(100.0 - (i as f64) * 0.01),
            })
            .collect()
    }

    #[test]
    fn window_count_is_floor_of_length() {
        for len in [96usize, 97, 191, 192, 500] {
            let windows = build_windows("5kc81f8r", series(len)).unwrap();
            assert_eq!(windows.windows(), len / WINDOW_SIZE, "len {len}");
            assert_eq!(windows.soil.shape(), (len / WINDOW_SIZE, WINDOW_SIZE, 1));
            assert_eq!(windows.timestamps.len(), windows.soil.len());
            assert_eq!(windows.trimmed_rows, len % WINDOW_SIZE);
        }
    }

    #[test]
    fn short_series_signals_insufficient_data() {
        let err = build_windows("5kc81f8r", series(95)).unwrap_err();
        assert!(matches!(
            err,
            SweepError::InsufficientData {
                observations: 95,
                window: WINDOW_SIZE,
                ..
            }
        ));
        assert!(build_windows("5kc81f8r", Vec::new()).is_err());
    }

    #[test]
    fn oldest_rows_are_dropped() {
        let windows = build_windows("5kc81f8r", series(100)).unwrap();
        let first = windows.timestamps.as_flat()[0];
        assert_eq!(first, base() + Duration::minutes(15 * 4));
        let last = *windows.timestamps.as_flat().last().unwrap();
        assert_eq!(last, base() + Duration::minutes(15 * 99));
    }

    #[test]
    fn input_order_does_not_matter() {
        let ordered = series(250);
        let mut shuffled = ordered.clone();
        shuffled.reverse();
        shuffled.rotate_left(37);
        // Duplicate timestamps must not make the ordering unstable either.
        let mut dup = ordered[10].clone();
        dup.soil_moisture = Some(99.0);
        let mut ordered_with_dup = ordered.clone();
        ordered_with_dup.push(dup.clone());
        shuffled.insert(3, dup);

        let a = build_windows("5kc81f8r", ordered_with_dup).unwrap();
        let b = build_windows("5kc81f8r", shuffled).unwrap();
        assert_eq!(a.soil, b.soil);
        assert_eq!(a.light, b.light);
        assert_eq!(a.air, b.air);
        assert_eq!(a.timestamps, b.timestamps);
        assert_eq!(a.battery, b.battery);
    }

    #[test]
    fn each_variable_is_scaled_independently() {
        let windows = build_windows("5kc81f8r", series(192)).unwrap();
        for variable in Variable::ALL {
            let values = windows.variable(variable).as_flat();
            let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            assert_eq!(min, 0.0, "{variable}");
            assert_eq!(max, 1.0, "{variable}");
        }
    }

    #[test]
    fn constant_column_scales_to_zero() {
        assert_eq!(min_max_scale(&[4.0, 4.0, 4.0]), vec![0.0, 0.0, 0.0]);
        assert_eq!(min_max_scale(&[1.0, 3.0, 2.0]), vec![0.0, 1.0, 0.5]);
    }

    #[test]
    fn malformed_rows_are_dropped_not_fatal() {
        let mut rows = series(97);
        rows[50].light = None;
        let windows = build_windows("5kc81f8r", rows).unwrap();
        assert_eq!(windows.malformed_rows, 1);
        assert_eq!(windows.trimmed_rows, 0);
        assert_eq!(windows.windows(), 1);
    }

    #[test]
    fn windowed_rejects_ragged_input() {
        assert!(WindowTensor::from_flat(vec![0.0; 95]).is_none());
        assert!(WindowTensor::from_flat(Vec::new()).is_none());
        let tensor = WindowTensor::from_flat(vec![0.5; 192]).unwrap();
        assert_eq!(tensor.iter_windows().count(), 2);
        assert_eq!(tensor.window(1).map(|w| w.len()), Some(WINDOW_SIZE));
        assert!(tensor.window(2).is_none());
    }
}
