use super::{reconstruction_error, ReconstructionScorer, ScorerError};
use crate::config::Config;
use crate::observation::Variable;
use crate::windowing::WindowTensor;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ScorerModels {
    pub soil: String,
    pub light: String,
    pub air: String,
}

impl ScorerModels {
    pub fn model_for(&self, variable: Variable) -> &str {
        match variable {
            Variable::Soil => &self.soil,
            Variable::Light => &self.light,
            Variable::Air => &self.air,
        }
    }
}

/// Talks to a model server exposing the TensorFlow Serving REST predict API.
#[derive(Clone)]
pub struct HttpScorer {
    client: Client,
    base_url: String,
    models: ScorerModels,
    token: Option<String>,
}

#[derive(Serialize)]
struct PredictRequest {
    instances: Vec<Vec<[f64; 1]>>,
}

#[derive(Deserialize)]
struct PredictResponse {
    predictions: Vec<Vec<Vec<f64>>>,
}

impl HttpScorer {
    pub fn new(
        base_url: &str,
        models: ScorerModels,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ScorerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| ScorerError::Unavailable {
                url: base_url.to_string(),
                source,
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            models,
            token,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ScorerError> {
        Self::new(
            &config.scorer_url,
            config.scorer_models.clone(),
            config.scorer_token.clone(),
            config.scorer_timeout(),
        )
    }

    fn model_url(&self, variable: Variable) -> String {
        format!("{}/v1/models/{}", self.base_url, self.models.model_for(variable))
    }

    fn predict_url(&self, variable: Variable) -> String {
        format!("{}:predict", self.model_url(variable))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl ReconstructionScorer for HttpScorer {
    async fn ready(&self) -> Result<(), ScorerError> {
        for variable in Variable::ALL {
            let url = self.model_url(variable);
            let response = self
                .authorize(self.client.get(&url))
                .send()
                .await
                .map_err(|source| ScorerError::Unavailable {
                    url: url.clone(),
                    source,
                })?;
            if !response.status().is_success() {
                return Err(ScorerError::Status {
                    url,
                    status: response.status(),
                });
            }
        }
        Ok(())
    }

    async fn score(
        &self,
        variable: Variable,
        input: &WindowTensor,
    ) -> Result<WindowTensor, ScorerError> {
        let url = self.predict_url(variable);
        let payload = PredictRequest {
            instances: instances(input),
        };
        let response = self
            .authorize(self.client.post(&url).json(&payload))
            .send()
            .await
            .map_err(|source| ScorerError::Unavailable {
                url: url.clone(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(ScorerError::Status {
                url,
                status: response.status(),
            });
        }
        let body: PredictResponse = response
            .json()
            .await
            .map_err(|err| ScorerError::Decode(err.to_string()))?;

        let reconstruction = flatten_predictions(body.predictions, input.len())?;
        tracing::trace!(
            variable = %variable,
            windows = input.windows(),
            "scored windows"
        );
        reconstruction_error(input, &reconstruction)
    }
}

fn instances(input: &WindowTensor) -> Vec<Vec<[f64; 1]>> {
    input
        .iter_windows()
        .map(|window| window.iter().map(|v| [*v]).collect())
        .collect()
}

fn flatten_predictions(
    predictions: Vec<Vec<Vec<f64>>>,
    expected: usize,
) -> Result<WindowTensor, ScorerError> {
    let flat: Vec<f64> = predictions.into_iter().flatten().flatten().collect();
    if flat.len() != expected {
        return Err(ScorerError::ShapeMismatch {
            expected,
            actual: flat.len(),
        });
    }
    WindowTensor::from_flat(flat).ok_or(ScorerError::ShapeMismatch {
        expected,
        actual: 0,
    })
}
