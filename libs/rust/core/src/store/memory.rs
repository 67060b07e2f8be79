use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{now_ms, RunStore};
use crate::error::{RegistryError, Result};
use crate::model_registry::{ExperimentRun, ModelVersion, RegisteredModel, Stage};

#[derive(Debug)]
struct ModelEntry {
    model: RegisteredModel,
    versions: Vec<ModelVersion>,
}

#[derive(Debug, Default)]
struct Inner {
    runs: Vec<ExperimentRun>,
    models: BTreeMap<String, ModelEntry>,
}

/// Process-local store. Every mutation happens under one write lock.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    inner: RwLock<Inner>,
}

impl MemoryRunStore {
    pub fn new() -> Self { Self::default() }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    fn backend(&self) -> &'static str { "memory" }

    async fn record_run(&self, run: ExperimentRun) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.runs.iter().any(|r| r.run_id == run.run_id) { return Err(RegistryError::DuplicateRun(run.run_id)); }
        inner.runs.push(run);
        Ok(())
    }

    async fn search_runs(&self, experiment: &str) -> Result<Vec<ExperimentRun>> {
        Ok(self.inner.read().runs.iter().filter(|r| r.experiment == experiment).cloned().collect())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<ExperimentRun>> {
        Ok(self.inner.read().runs.iter().find(|r| r.run_id == run_id).cloned())
    }

    async fn get_registered_model(&self, name: &str) -> Result<Option<RegisteredModel>> {
        Ok(self.inner.read().models.get(name).map(|e| e.model.clone()))
    }

    async fn create_registered_model(&self, name: &str) -> Result<RegisteredModel> {
        let mut inner = self.inner.write();
        if inner.models.contains_key(name) {
            return Err(RegistryError::ModelExists(name.to_string()));
        }
        let now = now_ms();
        let model = RegisteredModel { name: name.to_string(), description: None, creation_timestamp: now, last_updated_timestamp: now };
        inner.models.insert(name.to_string(), ModelEntry { model: model.clone(), versions: Vec::new() });
        Ok(model)
    }

    async fn create_model_version(&self, name: &str, run_id: &str, source: &str) -> Result<ModelVersion> {
        let mut inner = self.inner.write();
        let entry = inner.models.get_mut(name).ok_or_else(|| RegistryError::ModelNotFound(name.to_string()))?;
        let now = now_ms();
        let version = entry.versions.iter().map(|v| v.version).max().unwrap_or(0) + 1;
        let mv = ModelVersion {
            name: name.to_string(),
            version,
            run_id: run_id.to_string(),
            source: source.to_string(),
            stage: Stage::None,
            creation_timestamp: now,
            last_updated_timestamp: now,
        };
        entry.versions.push(mv.clone());
        entry.model.last_updated_timestamp = now;
        Ok(mv)
    }

    async fn search_model_versions(&self, name: &str) -> Result<Vec<ModelVersion>> {
        Ok(self.inner.read().models.get(name).map(|e| e.versions.clone()).unwrap_or_default())
    }

    async fn transition_stage(&self, name: &str, version: u64, stage: Stage) -> Result<ModelVersion> {
        let mut inner = self.inner.write();
        let entry = inner.models.get_mut(name).ok_or_else(|| RegistryError::ModelNotFound(name.to_string()))?;
        let mv = entry
            .versions
            .iter_mut()
            .find(|v| v.version == version)
            .ok_or_else(|| RegistryError::VersionNotFound { name: name.to_string(), version })?;
        mv.stage = stage;
        mv.last_updated_timestamp = now_ms();
        Ok(mv.clone())
    }
}
