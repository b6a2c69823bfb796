mod http;

pub use http::{HttpScorer, ScorerModels};

use crate::observation::Variable;
use crate::windowing::WindowTensor;
use std::future::Future;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScorerError {
    #[error("scorer request to {url} failed: {source}")]
    Unavailable {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("scorer at {url} returned {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("scorer response could not be decoded: {0}")]
    Decode(String),
    #[error("scorer returned {actual} values for a tensor of {expected}")]
    ShapeMismatch { expected: usize, actual: usize },
}

impl ScorerError {
    /// True when the server answered but refused or garbled this one request.
    pub fn is_request_specific(&self) -> bool {
        match self {
            ScorerError::Unavailable { .. } => false,
            ScorerError::Status { status, .. } => status.is_client_error(),
            ScorerError::Decode(_) | ScorerError::ShapeMismatch { .. } => true,
        }
    }
}

/// Black-box reconstruction model for one variable at a time.
///
/// `score` takes a normalised `(n, 96, 1)` tensor and returns the per-timestep
/// reconstruction error with the same shape. The pipeline makes no assumption
/// about the error distribution.
pub trait ReconstructionScorer: Send + Sync {
    /// Checked once before any sensor in a batch is scored.
    fn ready(&self) -> impl Future<Output = Result<(), ScorerError>> + Send {
        async { Ok(()) }
    }

    fn score(
        &self,
        variable: Variable,
        input: &WindowTensor,
    ) -> impl Future<Output = Result<WindowTensor, ScorerError>> + Send;
}

/// Elementwise squared difference averaged over the trailing dimension, which
/// is 1 here, so it reduces to the squared difference per timestep.
pub fn reconstruction_error(
    input: &WindowTensor,
    reconstruction: &WindowTensor,
) -> Result<WindowTensor, ScorerError> {
    if input.len() != reconstruction.len() {
        return Err(ScorerError::ShapeMismatch {
            expected: input.len(),
            actual: reconstruction.len(),
        });
    }
    let errors: Vec<f64> = input
        .as_flat()
        .iter()
        .zip(reconstruction.as_flat())
        .map(|(x, r)| (x - r).powi(2))
        .collect();
    WindowTensor::from_flat(errors).ok_or(ScorerError::ShapeMismatch {
        expected: input.len(),
        actual: reconstruction.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::windowing::WINDOW_SIZE;

    #[test]
    fn error_is_squared_difference_per_timestep() {
        let input = WindowTensor::from_flat(vec![0.5; WINDOW_SIZE]).unwrap();
        let mut recon = vec![0.5; WINDOW_SIZE];
        recon[3] = 0.25;
        recon[4] = 1.0;
        let recon = WindowTensor::from_flat(recon).unwrap();

        let errors = reconstruction_error(&input, &recon).unwrap();
        assert_eq!(errors.shape(), input.shape());
        assert_eq!(errors.as_flat()[0], 0.0);
        assert_eq!(errors.as_flat()[3], 0.0625);
        assert_eq!(errors.as_flat()[4], 0.25);
    }

    #[test]
    fn client_errors_are_request_specific() {
        let status = |status| ScorerError::Status {
            url: "http://models.local".to_string(),
            status,
        };
        assert!(status(reqwest::StatusCode::BAD_REQUEST).is_request_specific());
        assert!(!status(reqwest::StatusCode::BAD_GATEWAY).is_request_specific());
        assert!(ScorerError::Decode("truncated".to_string()).is_request_specific());
    }

    #[test]
    fn mismatched_reconstruction_is_rejected() {
        let input = WindowTensor::from_flat(vec![0.5; WINDOW_SIZE * 2]).unwrap();
        let recon = WindowTensor::from_flat(vec![0.5; WINDOW_SIZE]).unwrap();
        let err = reconstruction_error(&input, &recon).unwrap_err();
        assert!(matches!(
            err,
            ScorerError::ShapeMismatch {
                expected: 192,
                actual: 96
            }
        ));
    }
}
