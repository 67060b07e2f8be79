//! Serving lifecycle of a model-backed process.
//!
//! A process starts `Unloaded` and settles exactly once, to `Loaded` or `Failed`. There is no
//! way back: a failed load means restarting the process, and a new model version is picked up
//! by a restart as well. `ServingCell` enforces the single settle with a write-once cell, so
//! readers never need a lock.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::artifact::{Artifact, ArtifactError, FeatureFrame};
use crate::model_registry::{ModelVersion, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus { Pending, Loaded, Error }

/// What the process knows about the model it serves (or tried to serve).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelMetadata {
    pub name: String,
    pub stage: Stage,
    pub uri: String,
    pub version: Option<u64>,
    pub run_id: Option<String>,
    pub source: Option<String>,
    pub status: ModelStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub loaded_at: Option<DateTime<Utc>>,
}

impl ModelMetadata {
    pub fn pending(name: &str, stage: Stage) -> Self {
        Self {
            name: name.to_string(),
            stage,
            uri: crate::model_registry::model_uri(name, stage),
            version: None,
            run_id: None,
            source: None,
            status: ModelStatus::Pending,
            error: None,
            loaded_at: None,
        }
    }

    pub fn with_version(mut self, mv: &ModelVersion) -> Self {
        self.version = Some(mv.version);
        self.run_id = Some(mv.run_id.clone());
        self.source = Some(mv.source.clone());
        self
    }

    fn loaded(mut self) -> Self {
        self.status = ModelStatus::Loaded;
        self.error = None;
        self.loaded_at = Some(Utc::now());
        self
    }

    fn failed(mut self, error: &str) -> Self {
        self.status = ModelStatus::Error;
        self.error = Some(error.to_string());
        self
    }
}

pub struct LoadedModel {
    artifact: Arc<dyn Artifact>,
    gate: Option<Mutex<()>>,
    metadata: ModelMetadata,
}

impl LoadedModel {
    pub fn new(artifact: Arc<dyn Artifact>, metadata: ModelMetadata) -> Self {
        let gate = (!artifact.reentrant()).then(|| Mutex::new(()));
        Self { artifact, gate, metadata: metadata.loaded() }
    }

    pub fn metadata(&self) -> &ModelMetadata { &self.metadata }

    pub fn flavor(&self) -> &'static str { self.artifact.flavor() }

    /// `true` when predictions are serialized behind a mutex.
    pub fn gated(&self) -> bool { self.gate.is_some() }

    /// Blocking; call from a blocking-capable thread. Non-reentrant artifacts are serialized.
    pub fn predict(&self, frame: &FeatureFrame) -> Result<Vec<f64>, ArtifactError> {
        let _guard = self.gate.as_ref().map(|g| g.lock());
        self.artifact.predict(frame)
    }
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel").field("flavor", &self.flavor()).field("gated", &self.gated()).field("metadata", &self.metadata).finish()
    }
}

#[derive(Debug, Clone)]
pub struct FailedLoad {
    pub error: String,
    pub metadata: ModelMetadata,
}

impl FailedLoad {
    pub fn new(error: impl Into<String>, metadata: ModelMetadata) -> Self {
        let error = error.into();
        let metadata = metadata.failed(&error);
        Self { error, metadata }
    }
}

#[derive(Debug)]
pub enum ServingState {
    Unloaded,
    Loaded(Arc<LoadedModel>),
    Failed(FailedLoad),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServingPhase { Unloaded, Loaded, Failed }

impl ServingState {
    pub fn phase(&self) -> ServingPhase {
        match self {
            Self::Unloaded => ServingPhase::Unloaded,
            Self::Loaded(_) => ServingPhase::Loaded,
            Self::Failed(_) => ServingPhase::Failed,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettleError {
    #[error("serving state already settled as {0:?}")]
    AlreadySettled(ServingPhase),
    #[error("cannot settle back to unloaded")]
    InvalidTarget,
}

static UNLOADED: ServingState = ServingState::Unloaded;

pub struct ServingCell {
    pending: ModelMetadata,
    state: OnceCell<ServingState>,
    created_at: Instant,
}

impl ServingCell {
    pub fn new(pending: ModelMetadata) -> Self { Self { pending, state: OnceCell::new(), created_at: Instant::now() } }

    pub fn settle(&self, next: ServingState) -> Result<ServingPhase, SettleError> {
        if matches!(next, ServingState::Unloaded) { return Err(SettleError::InvalidTarget); }
        let phase = next.phase();
        self.state.set(next).map_err(|_| SettleError::AlreadySettled(self.phase()))?;
        tracing::info!(target: "churn-core", ?phase, elapsed_ms = self.created_at.elapsed().as_millis() as u64, "serving state settled");
        Ok(phase)
    }

    pub fn state(&self) -> &ServingState { self.state.get().unwrap_or(&UNLOADED) }

    pub fn phase(&self) -> ServingPhase { self.state().phase() }

    pub fn loaded(&self) -> Option<Arc<LoadedModel>> {
        match self.state() {
            ServingState::Loaded(m) => Some(m.clone()),
            _ => None,
        }
    }

    pub fn is_loaded(&self) -> bool { self.phase() == ServingPhase::Loaded }

    pub fn metadata(&self) -> &ModelMetadata {
        match self.state() {
            ServingState::Unloaded => &self.pending,
            ServingState::Loaded(m) => m.metadata(),
            ServingState::Failed(f) => &f.metadata,
        }
    }
}
