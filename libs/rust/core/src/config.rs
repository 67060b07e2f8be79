//! Layered service configuration: defaults, optional file, `CHURN__*` environment, then the
//! MLflow-compatible variables the tracking ecosystem already uses.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;

use crate::model_registry::{MetricOrder, Stage};

pub const DEFAULT_REGISTRY_URI: &str = "sled://./data/registry";
pub const DEFAULT_MODEL_NAME: &str = "telco-churn-prediction";
pub const DEFAULT_SELECTION_METRIC: &str = "final_accuracy";

/// Environment variable -> settings key.
const MLFLOW_OVERRIDES: [(&str, &str); 5] = [
    ("MLFLOW_TRACKING_URI", "registry_uri"),
    ("MLFLOW_MODEL_NAME", "model_name"),
    ("MLFLOW_MODEL_STAGE", "model_stage"),
    ("MLFLOW_TRACKING_USERNAME", "registry_username"),
    ("MLFLOW_TRACKING_PASSWORD", "registry_password"),
];

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub service_name: String,
    pub registry_uri: String,
    pub model_name: String,
    pub experiment_name: String,
    pub model_stage: String,
    pub selection_metric: String,
    pub metric_order: String,
    pub bind_addr: String,
    pub load_timeout_ms: u64,
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub artifact_root: Option<String>,
    #[serde(default)]
    pub registry_username: Option<String>,
    #[serde(default)]
    pub registry_password: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service_name: "churnguard".into(),
            registry_uri: DEFAULT_REGISTRY_URI.into(),
            model_name: DEFAULT_MODEL_NAME.into(),
            experiment_name: DEFAULT_MODEL_NAME.into(),
            model_stage: Stage::Production.as_str().into(),
            selection_metric: DEFAULT_SELECTION_METRIC.into(),
            metric_order: "desc".into(),
            bind_addr: "0.0.0.0:8000".into(),
            load_timeout_ms: 30_000,
            request_timeout_ms: 10_000,
            artifact_root: None,
            registry_username: None,
            registry_password: None,
        }
    }
}

impl Settings {
    pub fn stage(&self) -> Result<Stage> { Ok(self.model_stage.parse()?) }

    pub fn metric_order(&self) -> Result<MetricOrder> { self.metric_order.parse().map_err(anyhow::Error::msg) }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind_addr.parse().with_context(|| format!("invalid bind_addr '{}'", self.bind_addr))
    }

    pub fn load_timeout(&self) -> Duration { Duration::from_millis(self.load_timeout_ms) }

    pub fn request_timeout(&self) -> Duration { Duration::from_millis(self.request_timeout_ms) }
}

fn base_builder(service: &str) -> Result<ConfigBuilder<DefaultState>> {
    let d = Settings::default();
    Ok(Config::builder()
        .set_default("service_name", service)?
        .set_default("registry_uri", d.registry_uri)?
        .set_default("model_name", d.model_name)?
        .set_default("experiment_name", d.experiment_name)?
        .set_default("model_stage", d.model_stage)?
        .set_default("selection_metric", d.selection_metric)?
        .set_default("metric_order", d.metric_order)?
        .set_default("bind_addr", d.bind_addr)?
        .set_default("load_timeout_ms", d.load_timeout_ms as i64)?
        .set_default("request_timeout_ms", d.request_timeout_ms as i64)?)
}

fn finish(builder: ConfigBuilder<DefaultState>) -> Result<Settings> {
    let settings: Settings = builder.build()?.try_deserialize()?;
    // fail at startup rather than on first use
    settings.stage()?;
    settings.metric_order()?;
    Ok(settings)
}

pub fn load_settings(service: &str) -> Result<Settings> {
    let mut builder = base_builder(service)?;
    if let Ok(file) = std::env::var("CHURN_CONFIG_FILE") {
        builder = builder.add_source(File::with_name(&file).required(false));
    }
    builder = builder.add_source(Environment::with_prefix("CHURN").separator("__"));
    for (var, key) in MLFLOW_OVERRIDES {
        if let Ok(value) = std::env::var(var) {
            if !value.trim().is_empty() { builder = builder.set_override(key, value)?; }
        }
    }
    finish(builder)
}
