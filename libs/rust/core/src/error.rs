//! Failure taxonomy shared by the registry client, its backends and the promotion job.

use thiserror::Error;

use crate::artifact::ArtifactError;
use crate::model_registry::Stage;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// No candidate to promote. Fatal to that promotion invocation.
    #[error("no runs in experiment '{experiment}' carry metric '{metric}'")]
    NoRunsFound { experiment: String, metric: String },

    /// Store unreachable or returned something unusable.
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("registered model '{0}' not found")]
    ModelNotFound(String),

    #[error("registered model '{0}' already exists")]
    ModelExists(String),

    #[error("version {version} of model '{name}' not found")]
    VersionNotFound { name: String, version: u64 },

    #[error("model '{name}' has no version in stage '{stage}'")]
    StageEmpty { name: String, stage: Stage },

    #[error("invalid stage '{0}'")]
    InvalidStage(String),

    #[error("run '{0}' already recorded")]
    DuplicateRun(String),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("unsupported by {backend} backend: {operation}")]
    Unsupported { backend: &'static str, operation: String },
}

impl RegistryError {
    pub fn unavailable(e: impl std::fmt::Display) -> Self { Self::RegistryUnavailable(e.to_string()) }

    /// Short machine-readable tag, used in logs and status payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoRunsFound { .. } => "no_runs_found",
            Self::RegistryUnavailable(_) => "registry_unavailable",
            Self::ModelNotFound(_) => "model_not_found",
            Self::ModelExists(_) => "model_exists",
            Self::VersionNotFound { .. } => "version_not_found",
            Self::StageEmpty { .. } => "stage_empty",
            Self::InvalidStage(_) => "invalid_stage",
            Self::DuplicateRun(_) => "duplicate_run",
            Self::Artifact(_) => "artifact_error",
            Self::Timeout(_) => "timeout",
            Self::Unsupported { .. } => "unsupported",
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
