//! Flags plateaus in a reconstruction-error sequence.
//!
//! Position `i` is anomalous when its error is exactly equal to the error at
//! `i + 1`. The last position has no successor and is never flagged. This is a
//! repeat detector, not a magnitude threshold.

use crate::observation::Variable;
use crate::windowing::{TimestampTensor, WindowTensor, WINDOW_SIZE};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorGranularity {
    /// Scan every timestep of the flattened error tensor.
    #[default]
    Timestep,
    /// Reduce each window to its mean error and scan window by window,
    /// recording the window's first timestamp.
    Window,
}

impl ErrorGranularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorGranularity::Timestep => "timestep",
            ErrorGranularity::Window => "window",
        }
    }
}

impl FromStr for ErrorGranularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "timestep" | "step" => Ok(ErrorGranularity::Timestep),
            "window" => Ok(ErrorGranularity::Window),
            other => Err(format!("unknown error granularity: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlaggedAnomaly {
    pub variable: Variable,
    pub error: f64,
    pub timestamp: NaiveDateTime,
}

/// Indices `i` with `errors[i] == errors[i + 1]`.
pub fn repeated_error_positions(errors: &[f64]) -> Vec<usize> {
    errors
        .windows(2)
        .enumerate()
        // IEEE equality: NaN never repeats, -0.0 matches 0.0.
        .filter(|(_, pair)| pair[0] == pair[1])
        .map(|(index, _)| index)
        .collect()
}

pub fn flag_anomalies(
    variable: Variable,
    errors: &WindowTensor,
    timestamps: &TimestampTensor,
    granularity: ErrorGranularity,
) -> Vec<FlaggedAnomaly> {
    match granularity {
        ErrorGranularity::Timestep => {
            let errors = errors.as_flat();
            let timestamps = timestamps.as_flat();
            repeated_error_positions(errors)
                .into_iter()
                .filter_map(|index| {
                    Some(FlaggedAnomaly {
                        variable,
                        error: errors[index],
                        timestamp: *timestamps.get(index)?,
                    })
                })
                .collect()
        }
        ErrorGranularity::Window => {
            let means: Vec<f64> = errors
                .iter_windows()
                .map(|window| window.iter().sum::<f64>() / WINDOW_SIZE as f64)
                .collect();
            repeated_error_positions(&means)
                .into_iter()
                .filter_map(|index| {
                    let first = timestamps.window(index)?.first()?;
                    Some(FlaggedAnomaly {
                        variable,
                        error: means[index],
                        timestamp: *first,
                    })
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn timestamps(len: usize) -> TimestampTensor {
        let base = NaiveDate::from_ymd_opt(2024, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap();
        TimestampTensor::from_flat(
            (0..len)
                .map(|i| base + Duration::minutes(15 * i as i64))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn repeats_flag_the_first_of_each_pair() {
        assert_eq!(
            repeated_error_positions(&[5.0, 5.0, 3.0, 3.0, 3.0, 7.0]),
            vec![0, 2, 3]
        );
    }

    #[test]
    fn last_position_is_never_flagged() {
        assert_eq!(
            repeated_error_positions(&[5.0, 5.0, 3.0, 3.0, 3.0, 3.0]),
            vec![0, 2, 3, 4]
        );
        assert!(repeated_error_positions(&[1.0]).is_empty());
        assert!(repeated_error_positions(&[]).is_empty());
    }

    #[test]
    fn near_equal_errors_do_not_repeat() {
        assert!(repeated_error_positions(&[0.1 + 0.2, 0.3]).is_empty());
        assert!(repeated_error_positions(&[f64::NAN, f64::NAN]).is_empty());
    }

    #[test]
    fn timestep_flags_carry_error_and_timestamp() {
        let mut errors: Vec<f64> = (0..WINDOW_SIZE * 2).map(|i| i as f64 * 0.001).collect();
        errors[10] = 0.5;
        errors[11] = 0.5;
        // Repeats straddling a window boundary count too.
        errors[95] = 0.75;
        errors[96] = 0.75;
        let errors = WindowTensor::from_flat(errors).unwrap();
        let stamps = timestamps(WINDOW_SIZE * 2);

        let flags = flag_anomalies(Variable::Soil, &errors, &stamps, ErrorGranularity::Timestep);
        assert_eq!(flags.len(), 2);
        assert_eq!(flags[0].error, 0.5);
        assert_eq!(flags[0].timestamp, stamps.as_flat()[10]);
        assert_eq!(flags[1].timestamp, stamps.as_flat()[95]);
        assert!(flags.iter().all(|f| f.variable == Variable::Soil));
    }

    #[test]
    fn window_granularity_uses_window_means() {
        let mut errors = vec![0.2; WINDOW_SIZE * 3];
        for v in errors.iter_mut().skip(WINDOW_SIZE * 2) {
            *v = 0.4;
        }
        let errors = WindowTensor::from_flat(errors).unwrap();
        let stamps = timestamps(WINDOW_SIZE * 3);

        let flags = flag_anomalies(Variable::Air, &errors, &stamps, ErrorGranularity::Window);
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].timestamp, stamps.as_flat()[0]);
    }

    #[test]
    fn granularity_parses() {
        assert_eq!("window".parse::<ErrorGranularity>(), Ok(ErrorGranularity::Window));
        assert_eq!(
            " Timestep ".parse::<ErrorGranularity>(),
            Ok(ErrorGranularity::Timestep)
        );
        assert!("magnitude".parse::<ErrorGranularity>().is_err());
    }
}
