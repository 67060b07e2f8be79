//! MLflow-compatible tracking server backend (REST API 2.0).
//!
//! Runs are logged by the trainer straight into the tracking server, so `record_run` is not
//! offered here. Stage transitions are delegated to the server and are atomic per call.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::RunStore;
use crate::error::{RegistryError, Result};
use crate::model_registry::{ExperimentRun, ModelVersion, RegisteredModel, Stage};

/// Sub-path under a run's artifact root where the model artifact is logged.
pub const MODEL_ARTIFACT_PATH: &str = "model";

const PAGE_SIZE: u32 = 1000;
const RESOURCE_DOES_NOT_EXIST: &str = "RESOURCE_DOES_NOT_EXIST";

pub struct MlflowRunStore {
    base: String,
    http: Client,
    auth: Option<(String, Option<String>)>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct KeyValue<V> { key: String, value: V }

#[derive(Debug, Deserialize)]
struct WireRunInfo {
    run_id: String,
    experiment_id: String,
    artifact_uri: String,
    #[serde(default)]
    start_time: i64,
}

#[derive(Debug, Default, Deserialize)]
struct WireRunData {
    #[serde(default)]
    metrics: Vec<KeyValue<f64>>,
    #[serde(default)]
    params: Vec<KeyValue<String>>,
}

#[derive(Debug, Deserialize)]
struct WireRun {
    info: WireRunInfo,
    #[serde(default)]
    data: WireRunData,
}

impl WireRun {
    fn into_run(self, experiment: &str) -> ExperimentRun {
        ExperimentRun {
            run_id: self.info.run_id,
            experiment: experiment.to_string(),
            metrics: self.data.metrics.into_iter().map(|m| (m.key, m.value)).collect(),
            params: self.data.params.into_iter().map(|p| (p.key, p.value)).collect(),
            artifact_uri: format!("{}/{}", self.info.artifact_uri.trim_end_matches('/'), MODEL_ARTIFACT_PATH),
            start_time: self.info.start_time,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireRegisteredModel {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    creation_timestamp: i64,
    #[serde(default)]
    last_updated_timestamp: i64,
}

impl From<WireRegisteredModel> for RegisteredModel {
    fn from(w: WireRegisteredModel) -> Self {
        Self { name: w.name, description: w.description.filter(|d| !d.is_empty()), creation_timestamp: w.creation_timestamp, last_updated_timestamp: w.last_updated_timestamp }
    }
}

#[derive(Debug, Deserialize)]
struct WireModelVersion {
    name: String,
    version: String,
    #[serde(default)]
    run_id: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    current_stage: String,
    #[serde(default)]
    creation_timestamp: i64,
    #[serde(default)]
    last_updated_timestamp: i64,
}

impl TryFrom<WireModelVersion> for ModelVersion {
    type Error = RegistryError;
    fn try_from(w: WireModelVersion) -> Result<Self> {
        let version = w.version.parse().map_err(|_| RegistryError::unavailable(format!("non-numeric version '{}'", w.version)))?;
        let stage = if w.current_stage.is_empty() { Stage::None } else { w.current_stage.parse()? };
        Ok(Self {
            name: w.name,
            version,
            run_id: w.run_id,
            source: w.source,
            stage,
            creation_timestamp: w.creation_timestamp,
            last_updated_timestamp: w.last_updated_timestamp,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ExperimentEnvelope { experiment: WireExperiment }
#[derive(Debug, Deserialize)]
struct WireExperiment { experiment_id: String }
#[derive(Debug, Deserialize)]
struct RunsPage {
    #[serde(default)]
    runs: Vec<WireRun>,
    #[serde(default)]
    next_page_token: Option<String>,
}
#[derive(Debug, Deserialize)]
struct RunEnvelope { run: WireRun }
#[derive(Debug, Deserialize)]
struct RegisteredModelEnvelope { registered_model: WireRegisteredModel }
#[derive(Debug, Deserialize)]
struct ModelVersionEnvelope { model_version: WireModelVersion }
#[derive(Debug, Deserialize)]
struct ModelVersionsPage {
    #[serde(default)]
    model_versions: Vec<WireModelVersion>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct SearchRuns<'a> {
    experiment_ids: [&'a str; 1],
    max_results: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_token: Option<&'a str>,
}

impl MlflowRunStore {
    pub fn new(base: &str, auth: Option<(String, Option<String>)>, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build().map_err(RegistryError::unavailable)?;
        Ok(Self { base: base.trim_end_matches('/').to_string(), http, auth })
    }

    fn url(&self, path: &str) -> String { format!("{}/api/2.0/mlflow/{}", self.base, path) }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Some((user, pass)) => req.basic_auth(user, pass.as_ref()),
            None => req,
        }
    }

    /// Sends `req`; `Ok(None)` only when the server answers with an MLflow
    /// RESOURCE_DOES_NOT_EXIST error. A bare 404 (wrong URI, proxy page) is an unavailable store.
    async fn call<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<Option<T>> {
        let resp = self.authed(req).send().await.map_err(RegistryError::unavailable)?;
        let status = resp.status();
        if status.is_success() {
            return resp.json::<T>().await.map(Some).map_err(RegistryError::unavailable);
        }
        let body = resp.text().await.unwrap_or_default();
        let api: Option<ApiError> = serde_json::from_str(&body).ok();
        if api.as_ref().is_some_and(|e| e.error_code == RESOURCE_DOES_NOT_EXIST) {
            return Ok(None);
        }
        Err(RegistryError::RegistryUnavailable(match api {
            Some(e) => format!("{status}: {} {}", e.error_code, e.message),
            None => format!("{status}: {body}"),
        }))
    }

    async fn require<T: DeserializeOwned>(&self, req: RequestBuilder, what: impl FnOnce() -> RegistryError) -> Result<T> {
        self.call(req).await?.ok_or_else(what)
    }

    async fn experiment_id(&self, experiment: &str) -> Result<Option<String>> {
        let req = self.http.get(self.url("experiments/get-by-name")).query(&[("experiment_name", experiment)]);
        Ok(self.call::<ExperimentEnvelope>(req).await?.map(|e| e.experiment.experiment_id))
    }
}

#[async_trait]
impl RunStore for MlflowRunStore {
    fn backend(&self) -> &'static str { "mlflow" }

    async fn record_run(&self, _run: ExperimentRun) -> Result<()> {
        Err(RegistryError::Unsupported { backend: "mlflow", operation: "record_run (log runs through the tracking client)".into() })
    }

    async fn search_runs(&self, experiment: &str) -> Result<Vec<ExperimentRun>> {
        let Some(experiment_id) = self.experiment_id(experiment).await? else { return Ok(Vec::new()) };
        let mut out = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let body = SearchRuns { experiment_ids: [experiment_id.as_str()], max_results: PAGE_SIZE, page_token: token.as_deref() };
            let page: RunsPage = self
                .require(self.http.post(self.url("runs/search")).json(&body), || RegistryError::unavailable("runs/search returned not found"))
                .await?;
            out.extend(page.runs.into_iter().map(|r| r.into_run(experiment)));
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        debug!(experiment, experiment_id, runs = out.len(), "mlflow runs fetched");
        Ok(out)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<ExperimentRun>> {
        let req = self.http.get(self.url("runs/get")).query(&[("run_id", run_id)]);
        let Some(env) = self.call::<RunEnvelope>(req).await? else { return Ok(None) };
        // runs/get only carries the experiment id; keep it as the experiment label
        let experiment = env.run.info.experiment_id.clone();
        Ok(Some(env.run.into_run(&experiment)))
    }

    async fn get_registered_model(&self, name: &str) -> Result<Option<RegisteredModel>> {
        let req = self.http.get(self.url("registered-models/get")).query(&[("name", name)]);
        Ok(self.call::<RegisteredModelEnvelope>(req).await?.map(|e| e.registered_model.into()))
    }

    async fn create_registered_model(&self, name: &str) -> Result<RegisteredModel> {
        let req = self.http.post(self.url("registered-models/create")).json(&json!({ "name": name }));
        let env: RegisteredModelEnvelope = self.require(req, || RegistryError::unavailable("registered-models/create returned not found")).await?;
        Ok(env.registered_model.into())
    }

    async fn create_model_version(&self, name: &str, run_id: &str, source: &str) -> Result<ModelVersion> {
        let req = self.http.post(self.url("model-versions/create")).json(&json!({ "name": name, "source": source, "run_id": run_id }));
        let env: ModelVersionEnvelope = self.require(req, || RegistryError::ModelNotFound(name.to_string())).await?;
        env.model_version.try_into()
    }

    async fn search_model_versions(&self, name: &str) -> Result<Vec<ModelVersion>> {
        let filter = format!("name='{}'", name.replace('\'', "\\'"));
        let mut out = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut req = self.http.get(self.url("model-versions/search")).query(&[("filter", filter.as_str())]).query(&[("max_results", PAGE_SIZE)]);
            if let Some(t) = &token { req = req.query(&[("page_token", t.as_str())]); }
            let Some(page) = self.call::<ModelVersionsPage>(req).await? else { break };
            for wire in page.model_versions { out.push(ModelVersion::try_from(wire)?); }
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        Ok(out)
    }

    async fn transition_stage(&self, name: &str, version: u64, stage: Stage) -> Result<ModelVersion> {
        let body = json!({
            "name": name,
            "version": version.to_string(),
            "stage": stage.as_str(),
            "archive_existing_versions": false,
        });
        let req = self.http.post(self.url("model-versions/transition-stage")).json(&body);
        let env: ModelVersionEnvelope = self.require(req, || RegistryError::VersionNotFound { name: name.to_string(), version }).await?;
        env.model_version.try_into()
    }
}
