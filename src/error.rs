use crate::observation::Variable;
use crate::scorer::ScorerError;
use chrono::NaiveDateTime;
use thiserror::Error;

const UNDEFINED_TABLE: &str = "42P01";

/// Failure to read one sensor's observation table.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("observation table {table} does not exist")]
    MissingTable { table: String },
    #[error("observation table {table} is unreadable: {source}")]
    Unreadable {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("store unavailable: {0}")]
    Store(#[from] sqlx::Error),
}

impl LookupError {
    /// Sorts a query error against one observation table into "skip this sensor"
    /// versus "the store itself is gone".
    pub fn classify(table: &str, err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.code().as_deref() == Some(UNDEFINED_TABLE) => {
                LookupError::MissingTable {
                    table: table.to_string(),
                }
            }
            sqlx::Error::Database(_)
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_) => LookupError::Unreadable {
                table: table.to_string(),
                source: err,
            },
            _ => LookupError::Store(err),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, LookupError::Store(_))
    }
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("sensor {sensor_id} has no observation table")]
    MissingTable { sensor_id: String },
    #[error("sensor {sensor_id} observation table is unreadable: {reason}")]
    UnreadableSeries { sensor_id: String, reason: String },
    #[error("sensor {sensor_id} has {observations} usable observations; a window needs {window}")]
    InsufficientData {
        sensor_id: String,
        observations: usize,
        window: usize,
    },
    #[error("reconstruction scorer unavailable: {0}")]
    ScorerUnavailable(#[from] ScorerError),
    #[error("scorer rejected {variable} windows for sensor {sensor_id}: {source}")]
    ScoringRejected {
        sensor_id: String,
        variable: Variable,
        #[source]
        source: ScorerError,
    },
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),
    #[error("malformed observation for {sensor_id} at {timestamp:?}: {reason}")]
    MalformedObservation {
        sensor_id: String,
        timestamp: Option<NaiveDateTime>,
        reason: &'static str,
    },
}

impl SweepError {
    pub fn from_lookup(sensor_id: &str, err: LookupError) -> Self {
        match err {
            LookupError::MissingTable { .. } => SweepError::MissingTable {
                sensor_id: sensor_id.to_string(),
            },
            LookupError::Unreadable { source, .. } => SweepError::UnreadableSeries {
                sensor_id: sensor_id.to_string(),
                reason: source.to_string(),
            },
            LookupError::Store(err) => SweepError::StoreUnavailable(err),
        }
    }

    /// A failed `score` call. Only transport failures and server-side
    /// statuses mean the scorer is gone; the rest concern this sensor's payload.
    pub fn from_score(sensor_id: &str, variable: Variable, err: ScorerError) -> Self {
        if err.is_request_specific() {
            SweepError::ScoringRejected {
                sensor_id: sensor_id.to_string(),
                variable,
                source: err,
            }
        } else {
            SweepError::ScorerUnavailable(err)
        }
    }

    /// Scorer and store outages stop the whole batch; everything else only
    /// skips the sensor it happened on.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(
            self,
            SweepError::ScorerUnavailable(_) | SweepError::StoreUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_errors_are_fatal_lookups() {
        let err = LookupError::classify("grow_data_abc12345", sqlx::Error::PoolTimedOut);
        assert!(err.is_fatal());
        assert!(SweepError::from_lookup("abc12345", err).is_batch_fatal());
    }

    #[test]
    fn decode_errors_only_skip_the_sensor() {
        let err = LookupError::classify(
            "grow_data_abc12345",
            sqlx::Error::ColumnNotFound("soil_moisture".to_string()),
        );
        assert!(!err.is_fatal());
        let sweep = SweepError::from_lookup("abc12345", err);
        assert!(matches!(sweep, SweepError::UnreadableSeries { .. }));
        assert!(!sweep.is_batch_fatal());
    }

    #[test]
    fn rejected_payloads_only_skip_the_sensor() {
        let rejected = SweepError::from_score(
            "abc12345",
            Variable::Light,
            ScorerError::Status {
                url: "http://models.local/v1/models/light_model:predict".to_string(),
                status: reqwest::StatusCode::PAYLOAD_TOO_LARGE,
            },
        );
        assert!(matches!(
            rejected,
            SweepError::ScoringRejected {
                variable: Variable::Light,
                ..
            }
        ));
        assert!(!rejected.is_batch_fatal());

        let garbled = SweepError::from_score(
            "abc12345",
            Variable::Soil,
            ScorerError::ShapeMismatch {
                expected: 96,
                actual: 95,
            },
        );
        assert!(!garbled.is_batch_fatal());

        let down = SweepError::from_score(
            "abc12345",
            Variable::Soil,
            ScorerError::Status {
                url: "http://models.local/v1/models/soil_model:predict".to_string(),
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
            },
        );
        assert!(matches!(down, SweepError::ScorerUnavailable(_)));
        assert!(down.is_batch_fatal());
    }

    #[test]
    fn per_sensor_errors_are_not_fatal() {
        let err = SweepError::InsufficientData {
            sensor_id: "abc12345".to_string(),
            observations: 12,
            window: 96,
        };
        assert!(!err.is_batch_fatal());
        let missing = SweepError::MissingTable {
            sensor_id: "abc12345".to_string(),
        };
        assert!(!missing.is_batch_fatal());
    }
}
