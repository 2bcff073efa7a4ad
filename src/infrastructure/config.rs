use crate::infrastructure::error::InfraError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use url::Url;

const APP_JSON: &str = "app.json";
const REPORT_ENDPOINT_ENV: &str = "POMOSYNC_REPORT_ENDPOINT";
pub const MIN_AUTO_START_DELAY_MS: u64 = 800;
pub const MAX_AUTO_START_DELAY_MS: u64 = 1_000;
const MIN_POLL_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub schema: u8,
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default)]
    pub report_endpoint: Option<String>,
    #[serde(default = "default_auto_start_delay_ms")]
    pub auto_start_delay_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            schema: 1,
            app_name: default_app_name(),
            report_endpoint: None,
            auto_start_delay_ms: default_auto_start_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), InfraError> {
        if !(MIN_AUTO_START_DELAY_MS..=MAX_AUTO_START_DELAY_MS).contains(&self.auto_start_delay_ms) {
            return Err(InfraError::InvalidConfig(format!(
                "autoStartDelayMs must be within {MIN_AUTO_START_DELAY_MS}..={MAX_AUTO_START_DELAY_MS}, got {}",
                self.auto_start_delay_ms
            )));
        }
        if self.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            return Err(InfraError::InvalidConfig(format!(
                "pollIntervalMs must be >= {MIN_POLL_INTERVAL_MS}, got {}",
                self.poll_interval_ms
            )));
        }
        if let Some(endpoint) = self.report_endpoint.as_deref() {
            validate_endpoint(endpoint)?;
        }
        Ok(())
    }

    pub fn auto_start_delay(&self) -> Duration {
        Duration::from_millis(self.auto_start_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_app_name() -> String {
    "PomoSync".to_string()
}

fn default_auto_start_delay_ms() -> u64 {
    MIN_AUTO_START_DELAY_MS
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    HashMap::from([(
        APP_JSON,
        serde_json::json!({
            "schema": 1,
            "appName": "PomoSync",
            "reportEndpoint": null,
            "autoStartDelayMs": 800,
            "pollIntervalMs": 1000
        }),
    )])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            let formatted = serde_json::to_string_pretty(&value)?;
            fs::write(path, format!("{formatted}\n"))?;
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != 1 {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_app_config(config_dir: &Path) -> Result<AppConfig, InfraError> {
    load_app_config_with_lookup(config_dir, |key| std::env::var(key).ok())
}

pub fn load_app_config_with_lookup<F>(config_dir: &Path, lookup: F) -> Result<AppConfig, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    let path = config_dir.join(APP_JSON);
    let raw = read_config(&path)?;
    let mut config: AppConfig = serde_json::from_value(raw).map_err(|error| {
        InfraError::InvalidConfig(format!("invalid {}: {error}", path.display()))
    })?;

    if let Some(endpoint) = lookup(REPORT_ENDPOINT_ENV)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    {
        config.report_endpoint = Some(endpoint);
    }
    config.report_endpoint = config
        .report_endpoint
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    config.validate()?;
    Ok(config)
}

fn validate_endpoint(endpoint: &str) -> Result<(), InfraError> {
    let url = Url::parse(endpoint)
        .map_err(|error| InfraError::InvalidConfig(format!("invalid reportEndpoint '{endpoint}': {error}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(InfraError::InvalidConfig(format!(
            "reportEndpoint must use http or https, got '{}'",
            url.scheme()
        )));
    }
    Ok(())
}
