use crate::flagging::ErrorGranularity;
use crate::scorer::ScorerModels;
use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/anomaly-sweeper/config.json";

fn setup_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("SWEEPER_SETUP_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from(DEFAULT_SETUP_CONFIG_PATH)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    sweeper_table_prefix: Option<String>,
    #[serde(default)]
    sweeper_ledger_table: Option<String>,
    #[serde(default)]
    sweeper_scorer_url: Option<String>,
    #[serde(default)]
    sweeper_scorer_token: Option<String>,
    #[serde(default)]
    sweeper_max_concurrent_sensors: Option<usize>,
    #[serde(default)]
    sweeper_error_granularity: Option<String>,
    #[serde(default)]
    sweeper_interval_secs: Option<u64>,
    #[serde(default)]
    sweeper_faulty_threshold_days: Option<i32>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path();
    if !path.exists() {
        return None;
    }
    load_setup_config_from(&path)
}

fn load_setup_config_from(path: &Path) -> Option<SetupConfigOverrides> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "anomaly-sweeper failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "anomaly-sweeper failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

fn apply_setup_overrides(
    config: &mut Config,
    overrides: &SetupConfigOverrides,
    env_allows: impl Fn(&str) -> bool,
) {
    let non_empty = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    if env_allows("SWEEPER_TABLE_PREFIX") {
        if let Some(prefix) = non_empty(&overrides.sweeper_table_prefix) {
            config.table_prefix = prefix;
        }
    }
    if env_allows("SWEEPER_LEDGER_TABLE") {
        if let Some(table) = non_empty(&overrides.sweeper_ledger_table) {
            config.ledger_table = table;
        }
    }
    if env_allows("SWEEPER_SCORER_URL") {
        if let Some(url) = non_empty(&overrides.sweeper_scorer_url) {
            config.scorer_url = url;
        }
    }
    if env_allows("SWEEPER_SCORER_TOKEN") {
        if let Some(token) = overrides.sweeper_scorer_token.as_deref() {
            let trimmed = token.trim();
            config.scorer_token = if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            };
        }
    }
    if env_allows("SWEEPER_MAX_CONCURRENT_SENSORS") {
        if let Some(value) = overrides.sweeper_max_concurrent_sensors.filter(|v| *v != 0) {
            config.max_concurrent_sensors = value;
        }
    }
    if env_allows("SWEEPER_ERROR_GRANULARITY") {
        if let Some(raw) = non_empty(&overrides.sweeper_error_granularity) {
            match raw.parse() {
                Ok(granularity) => config.error_granularity = granularity,
                Err(err) => tracing::warn!(error = %err, "ignoring setup config granularity"),
            }
        }
    }
    if env_allows("SWEEPER_INTERVAL_SECS") {
        if let Some(value) = overrides.sweeper_interval_secs.filter(|v| *v != 0) {
            config.sweep_interval_secs = value;
        }
    }
    if env_allows("SWEEPER_FAULTY_THRESHOLD_DAYS") {
        if let Some(value) = overrides.sweeper_faulty_threshold_days.filter(|v| *v > 0) {
            config.faulty_threshold_days = value;
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub table_prefix: String,
    pub ledger_table: String,
    pub scorer_url: String,
    pub scorer_token: Option<String>,
    pub scorer_models: ScorerModels,
    pub scorer_timeout_ms: u64,
    pub max_concurrent_sensors: usize,
    pub error_granularity: ErrorGranularity,
    pub sweep_interval_secs: u64,
    pub faulty_threshold_days: i32,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Same as [`Config::from_env`], but an explicit database URL (from the
    /// command line) wins over every other source.
    pub fn load(database_url_override: Option<String>) -> Result<Self> {
        dotenv().ok();

        let setup_overrides = load_setup_config_overrides();

        let database_url = database_url_override
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                env::var("SWEEPER_DATABASE_URL")
                    .or_else(|_| env::var("DATABASE_URL"))
                    .ok()
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
            })
            .or_else(|| {
                setup_overrides
                    .as_ref()
                    .and_then(|ov| ov.database_url.as_deref())
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(|value| value.to_string())
            })
            .context("SWEEPER_DATABASE_URL or DATABASE_URL is required (or present as database_url in the setup config)")?;
        let database_url = normalize_database_url(database_url);

        let db_pool_size = env::var("SWEEPER_DB_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(5);
        let table_prefix =
            env::var("SWEEPER_TABLE_PREFIX").unwrap_or_else(|_| "grow_data_".to_string());
        let ledger_table =
            env::var("SWEEPER_LEDGER_TABLE").unwrap_or_else(|_| "grow_anomalies".to_string());

        let scorer_url = env::var("SWEEPER_SCORER_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8501".to_string());
        let scorer_token = env::var("SWEEPER_SCORER_TOKEN")
            .ok()
            .filter(|v| !v.trim().is_empty());
        let scorer_models = ScorerModels {
            soil: env::var("SWEEPER_SOIL_MODEL").unwrap_or_else(|_| "soil_model".to_string()),
            light: env::var("SWEEPER_LIGHT_MODEL").unwrap_or_else(|_| "light_model".to_string()),
            air: env::var("SWEEPER_AIR_MODEL").unwrap_or_else(|_| "air_model".to_string()),
        };
        let scorer_timeout_ms = env::var("SWEEPER_SCORER_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30_000);

        let max_concurrent_sensors = env::var("SWEEPER_MAX_CONCURRENT_SENSORS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v != 0)
            .unwrap_or(1);
        let error_granularity = match env::var("SWEEPER_ERROR_GRANULARITY") {
            Ok(raw) => raw
                .parse::<ErrorGranularity>()
                .map_err(anyhow::Error::msg)
                .context("invalid SWEEPER_ERROR_GRANULARITY")?,
            Err(_) => ErrorGranularity::default(),
        };
        let sweep_interval_secs = env::var("SWEEPER_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v != 0)
            .unwrap_or(86_400);
        let faulty_threshold_days = env::var("SWEEPER_FAULTY_THRESHOLD_DAYS")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(2);
        let otlp_endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();

        let mut config = Self {
            database_url,
            db_pool_size,
            table_prefix,
            ledger_table,
            scorer_url,
            scorer_token,
            scorer_models,
            scorer_timeout_ms,
            max_concurrent_sensors,
            error_granularity,
            sweep_interval_secs,
            faulty_threshold_days,
            otlp_endpoint,
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides, |key| {
                std::env::var(key)
                    .ok()
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
                    .is_none()
            });
        }

        config.validate()?;
        Ok(config)
    }

    /// Table names are spliced into SQL as quoted identifiers; keep them plain.
    pub fn validate(&self) -> Result<()> {
        if !is_plain_identifier(&self.table_prefix) {
            bail!("invalid table prefix {:?}", self.table_prefix);
        }
        if !is_plain_identifier(&self.ledger_table) {
            bail!("invalid ledger table {:?}", self.ledger_table);
        }
        Ok(())
    }

    pub fn scorer_timeout(&self) -> Duration {
        Duration::from_millis(self.scorer_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

pub fn is_plain_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn normalize_database_url(url: String) -> String {
    for scheme in ["postgresql+psycopg://", "postgresql+psycopg2://", "postgresql+asyncpg://"] {
        if let Some(stripped) = url.strip_prefix(scheme) {
            return format!("postgresql://{stripped}");
        }
    }
    url
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        database_url: "postgresql://postgres@localhost/postgres".to_string(),
        db_pool_size: 2,
        table_prefix: "grow_data_".to_string(),
        ledger_table: "grow_anomalies".to_string(),
        scorer_url: "http://127.0.0.1:8501".to_string(),
        scorer_token: None,
        scorer_models: ScorerModels {
            soil: "soil_model".to_string(),
            light: "light_model".to_string(),
            air: "air_model".to_string(),
        },
        scorer_timeout_ms: 1_000,
        max_concurrent_sensors: 1,
        error_granularity: ErrorGranularity::Timestep,
        sweep_interval_secs: 86_400,
        faulty_threshold_days: 2,
        otlp_endpoint: None,
    }
}
