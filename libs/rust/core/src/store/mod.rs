//! Run Store backends.
//!
//! The store persists runs and registry entries; it is queried, never owned, by the services.
//! Backend selection is by registry URI scheme:
//! - `memory://`      process-local, used by tests and fixtures
//! - `sled://<path>`  embedded persistent store, one process at a time
//! - `http(s)://...`  MLflow-compatible tracking server (REST 2.0 API)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::Settings;
use crate::error::{RegistryError, Result};
use crate::model_registry::{ExperimentRun, ModelVersion, RegisteredModel, Stage};

mod memory;
mod mlflow;
mod sled_store;

pub use memory::MemoryRunStore;
pub use mlflow::MlflowRunStore;
pub use sled_store::SledRunStore;

#[async_trait]
pub trait RunStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn record_run(&self, run: ExperimentRun) -> Result<()>;
    async fn search_runs(&self, experiment: &str) -> Result<Vec<ExperimentRun>>;
    async fn get_run(&self, run_id: &str) -> Result<Option<ExperimentRun>>;

    async fn get_registered_model(&self, name: &str) -> Result<Option<RegisteredModel>>;
    async fn create_registered_model(&self, name: &str) -> Result<RegisteredModel>;

    /// Allocates the next version number for `name`, stage `None`.
    async fn create_model_version(&self, name: &str, run_id: &str, source: &str) -> Result<ModelVersion>;
    async fn search_model_versions(&self, name: &str) -> Result<Vec<ModelVersion>>;
    /// Must be atomic with respect to concurrent callers.
    async fn transition_stage(&self, name: &str, version: u64, stage: Stage) -> Result<ModelVersion>;
}

pub fn open_store(settings: &Settings) -> Result<Arc<dyn RunStore>> {
    let uri = settings.registry_uri.trim();
    let store: Arc<dyn RunStore> = if uri.starts_with("memory:") {
        Arc::new(MemoryRunStore::new())
    } else if let Some(path) = uri.strip_prefix("sled://") {
        Arc::new(SledRunStore::open_with_wait(path, Duration::from_millis(settings.load_timeout_ms))?)
    } else if uri.starts_with("http://") || uri.starts_with("https://") {
        let auth = settings.registry_username.clone().map(|u| (u, settings.registry_password.clone()));
        Arc::new(MlflowRunStore::new(uri, auth, Duration::from_millis(settings.load_timeout_ms))?)
    } else {
        return Err(RegistryError::Unsupported { backend: "registry", operation: format!("registry uri '{uri}'") });
    };
    info!(target: "churn-core", backend = store.backend(), uri, "run store opened");
    Ok(store)
}

pub(crate) fn now_ms() -> i64 { chrono::Utc::now().timestamp_millis() }
