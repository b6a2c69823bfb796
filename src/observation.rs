use crate::error::SweepError;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scored channels of a sensor series. Battery level is carried but never scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variable {
    Soil,
    Light,
    Air,
}

impl Variable {
    pub const ALL: [Variable; 3] = [Variable::Soil, Variable::Light, Variable::Air];

    pub fn as_str(&self) -> &'static str {
        match self {
            Variable::Soil => "soil",
            Variable::Light => "light",
            Variable::Air => "air",
        }
    }

    /// Column in the per-sensor observation table.
    pub fn observation_column(&self) -> &'static str {
        match self {
            Variable::Soil => "soil_moisture",
            Variable::Light => "light",
            Variable::Air => "air_temperature",
        }
    }

    /// Column in the anomaly ledger that holds this variable's anomaly timestamp.
    pub fn ledger_column(&self) -> &'static str {
        match self {
            Variable::Soil => "soil_date",
            Variable::Light => "light_date",
            Variable::Air => "air_date",
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row as read from an observation table; every column may be null.
#[derive(Debug, Clone, PartialEq, Default, sqlx::FromRow)]
pub struct ObservationRow {
    pub datetime: Option<NaiveDateTime>,
    pub soil_moisture: Option<f64>,
    pub light: Option<f64>,
    pub air_temperature: Option<f64>,
    pub battery_level: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub sensor_id: String,
    pub timestamp: NaiveDateTime,
    pub soil_moisture: f64,
    pub light: f64,
    pub air_temperature: f64,
    pub battery_level: Option<f64>,
}

impl Observation {
    pub fn from_row(sensor_id: &str, row: ObservationRow) -> Result<Self, SweepError> {
        let malformed = |reason: &'static str| SweepError::MalformedObservation {
            sensor_id: sensor_id.to_string(),
            timestamp: row.datetime,
            reason,
        };

        let timestamp = row.datetime.ok_or_else(|| malformed("missing timestamp"))?;
        let soil_moisture = finite(row.soil_moisture).ok_or_else(|| malformed("soil_moisture"))?;
        let light = finite(row.light).ok_or_else(|| malformed("light"))?;
        let air_temperature =
            finite(row.air_temperature).ok_or_else(|| malformed("air_temperature"))?;

        Ok(Self {
            sensor_id: sensor_id.to_string(),
            timestamp,
            soil_moisture,
            light,
            air_temperature,
            battery_level: finite(row.battery_level),
        })
    }

    pub fn value(&self, variable: Variable) -> f64 {
        match variable {
            Variable::Soil => self.soil_moisture,
            Variable::Light => self.light,
            Variable::Air => self.air_temperature,
        }
    }
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

/// Sensor ids are opaque alphanumeric tokens; they end up inside quoted table names.
pub fn is_valid_sensor_id(sensor_id: &str) -> bool {
    !sensor_id.is_empty() && sensor_id.chars().all(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 15, 0))
            .unwrap()
    }

    #[test]
    fn complete_row_converts() {
        let row = ObservationRow {
            datetime: Some(ts()),
            soil_moisture: Some(21.5),
            light: Some(0.8),
            air_temperature: Some(12.0),
            battery_level: None,
        };
        let obs = Observation::from_row("5pga25ec", row).unwrap();
        assert_eq!(obs.value(Variable::Soil), 21.5);
        assert_eq!(obs.value(Variable::Light), 0.8);
        assert_eq!(obs.value(Variable::Air), 12.0);
        assert_eq!(obs.battery_level, None);
    }

    #[test]
    fn null_or_nan_scored_values_are_malformed() {
        let row = ObservationRow {
            datetime: Some(ts()),
            soil_moisture: None,
            light: Some(0.8),
            air_temperature: Some(12.0),
            battery_level: Some(90.0),
        };
        let err = Observation::from_row("5pga25ec", row).unwrap_err();
        assert!(matches!(
            err,
            SweepError::MalformedObservation {
                reason: "soil_moisture",
                ..
            }
        ));

        let row = ObservationRow {
            datetime: Some(ts()),
            soil_moisture: Some(1.0),
            light: Some(f64::NAN),
            air_temperature: Some(12.0),
            battery_level: None,
        };
        assert!(Observation::from_row("5pga25ec", row).is_err());

        let row = ObservationRow {
            datetime: None,
            ..Default::default()
        };
        assert!(Observation::from_row("5pga25ec", row).is_err());
    }

    #[test]
    fn sensor_ids_must_be_alphanumeric() {
        assert!(is_valid_sensor_id("02krq5q5"));
        assert!(!is_valid_sensor_id(""));
        assert!(!is_valid_sensor_id("abc\"; drop"));
        assert!(!is_valid_sensor_id("abc_1"));
    }
}
