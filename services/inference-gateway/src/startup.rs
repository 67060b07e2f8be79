//! One-shot model load performed before the listener accepts traffic.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use churn_core::{
    open_store, ArtifactLoader, FailedLoad, LoadedModel, ModelMetadata, RegistryClient, RegistryError, ServingCell, ServingState, Settings, Stage,
};
use tracing::{error, info};

/// Builds the serving cell from settings. Registry or artifact failures settle the cell as
/// Failed; only invalid settings are returned as errors.
pub async fn start(settings: &Settings) -> Result<Arc<ServingCell>> {
    let stage = settings.stage()?;
    let mut loader = ArtifactLoader::new(settings.artifact_root.as_ref().map(PathBuf::from), settings.load_timeout())?;
    let registry = settings.registry_uri.trim();
    if registry.starts_with("http://") || registry.starts_with("https://") {
        let auth = settings.registry_username.clone().map(|u| (u, settings.registry_password.clone()));
        loader = loader.with_tracking(registry, auth);
    }
    match open_store(settings) {
        Ok(store) => Ok(start_with(&settings.model_name, stage, settings.load_timeout(), RegistryClient::new(store), loader).await),
        Err(e) => {
            let cell = Arc::new(ServingCell::new(ModelMetadata::pending(&settings.model_name, stage)));
            settle_failed(&cell, ModelMetadata::pending(&settings.model_name, stage), &e);
            Ok(cell)
        }
    }
}

pub async fn start_with(model_name: &str, stage: Stage, load_timeout: Duration, client: RegistryClient, loader: ArtifactLoader) -> Arc<ServingCell> {
    let cell = Arc::new(ServingCell::new(ModelMetadata::pending(model_name, stage)));
    let mut metadata = ModelMetadata::pending(model_name, stage);
    info!(target: "inference-gateway", uri = %metadata.uri, backend = client.backend(), timeout_ms = load_timeout.as_millis() as u64, "loading model");

    let outcome = tokio::time::timeout(load_timeout, load(&client, &loader, &mut metadata)).await;
    let result = outcome.unwrap_or_else(|_| Err(RegistryError::Timeout(load_timeout.as_millis() as u64)));
    match result {
        Ok(model) => {
            let model = Arc::new(LoadedModel::new(model, metadata));
            let meta = model.metadata();
            info!(target: "inference-gateway", uri = %meta.uri, version = ?meta.version, run_id = ?meta.run_id, flavor = model.flavor(), "model loaded");
            if let Err(e) = cell.settle(ServingState::Loaded(model)) {
                error!(target: "inference-gateway", error = %e, "serving state already settled");
            }
        }
        Err(e) => settle_failed(&cell, metadata, &e),
    }
    cell
}

async fn load(client: &RegistryClient, loader: &ArtifactLoader, metadata: &mut ModelMetadata) -> Result<Arc<dyn churn_core::Artifact>, RegistryError> {
    let resolved = client.resolve(&metadata.name, metadata.stage).await?;
    *metadata = metadata.clone().with_version(&resolved.version);
    Ok(loader.load(&resolved.version.source).await?)
}

fn settle_failed(cell: &ServingCell, metadata: ModelMetadata, e: &RegistryError) {
    error!(target: "inference-gateway", uri = %metadata.uri, kind = e.kind(), error = %e, "model load failed, serving health only");
    if let Err(settle) = cell.settle(ServingState::Failed(FailedLoad::new(e.to_string(), metadata))) {
        error!(target: "inference-gateway", error = %settle, "serving state already settled");
    }
}
