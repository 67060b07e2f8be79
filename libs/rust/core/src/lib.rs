//! Core shared utilities for ChurnGuard services.
//!
//! Holds the registry client and its store backends, the artifact format, the serving lifecycle
//! state machine and the ambient helpers (tracing + configuration) every service binary uses.

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("CHURN_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);
        if json {
            registry
                .with(fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false))
                .try_init()?;
        } else {
            registry
                .with(fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true))
                .try_init()?;
        }
        Ok(())
    })?;
    info!(target: "churn-core", service, "tracing initialized");
    Ok(())
}

pub mod artifact;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod model_registry;
pub mod store;

pub use artifact::{Artifact, ArtifactError, ArtifactLoader, FeatureFrame, FeatureValue, LinearArtifact};
pub use config::{load_settings, Settings};
pub use error::{RegistryError, Result as RegistryResult};
pub use lifecycle::{FailedLoad, LoadedModel, ModelMetadata, ModelStatus, ServingCell, ServingPhase, ServingState, SettleError};
pub use model_registry::{
    model_uri, ExperimentRun, MetricOrder, ModelVersion, RegisteredModel, RegistryClient, RegistryReport, ResolvedModel, Stage,
};
pub use store::{open_store, MemoryRunStore, MlflowRunStore, RunStore, SledRunStore};
