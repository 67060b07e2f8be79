//! Serialized model artifacts and their loader.
//!
//! An artifact is anything implementing [`Artifact`]: it takes a tabular [`FeatureFrame`] and
//! returns one scalar per row. The shipped format is a JSON logistic model ([`LinearArtifact`]);
//! the loader resolves local paths, `file://`, `http(s)://` and, given a tracking server,
//! `mlflow-artifacts:` URIs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const MODEL_FILE: &str = "model.json";
const MLFLOW_ARTIFACTS: &str = "mlflow-artifacts:";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact not found at {0}")]
    NotFound(String),
    #[error("failed to read artifact {uri}: {source}")]
    Io { uri: String, #[source] source: std::io::Error },
    #[error("failed to fetch artifact {uri}: {message}")]
    Fetch { uri: String, message: String },
    #[error("malformed artifact: {0}")]
    Malformed(String),
    #[error("unsupported artifact uri '{0}'")]
    UnsupportedUri(String),
    #[error("input shape mismatch: {0}")]
    Shape(String),
    #[error("artifact runtime error: {0}")]
    Runtime(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Number(f64),
    Text(String),
}

impl From<f64> for FeatureValue { fn from(v: f64) -> Self { Self::Number(v) } }
impl From<u32> for FeatureValue { fn from(v: u32) -> Self { Self::Number(f64::from(v)) } }
impl From<&str> for FeatureValue { fn from(v: &str) -> Self { Self::Text(v.to_string()) } }
impl From<String> for FeatureValue { fn from(v: String) -> Self { Self::Text(v) } }

/// Column-named rows, the tabular input shape artifacts consume.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureFrame {
    columns: Vec<String>,
    rows: Vec<Vec<FeatureValue>>,
}

impl FeatureFrame {
    pub fn new(columns: Vec<String>) -> Self { Self { columns, rows: Vec::new() } }

    pub fn single_row(cells: Vec<(&str, FeatureValue)>) -> Self {
        let (columns, row): (Vec<String>, Vec<FeatureValue>) = cells.into_iter().map(|(c, v)| (c.to_string(), v)).unzip();
        Self { columns, rows: vec![row] }
    }

    pub fn push_row(&mut self, row: Vec<FeatureValue>) -> Result<(), ArtifactError> {
        if row.len() != self.columns.len() {
            return Err(ArtifactError::Shape(format!("row has {} cells, frame has {} columns", row.len(), self.columns.len())));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] { &self.columns }
    pub fn rows(&self) -> &[Vec<FeatureValue>] { &self.rows }
    pub fn len(&self) -> usize { self.rows.len() }
    pub fn is_empty(&self) -> bool { self.rows.is_empty() }
    pub fn column_index(&self, name: &str) -> Option<usize> { self.columns.iter().position(|c| c == name) }
}

/// The inference entry point of a loaded model.
pub trait Artifact: Send + Sync {
    fn flavor(&self) -> &'static str;

    /// One output per input row.
    fn predict(&self, frame: &FeatureFrame) -> Result<Vec<f64>, ArtifactError>;

    /// `false` when concurrent `predict` calls may corrupt internal state; callers must then
    /// serialize access.
    fn reentrant(&self) -> bool { true }
}

/// Logistic model over numeric features plus one-hot categorical weights. Outputs the label
/// (`0.0` / `1.0`) obtained by thresholding the probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearArtifact {
    pub intercept: f64,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default)]
    pub numeric: BTreeMap<String, f64>,
    /// column -> category -> weight; unseen categories weigh nothing.
    #[serde(default)]
    pub categorical: BTreeMap<String, BTreeMap<String, f64>>,
}

fn default_threshold() -> f64 { 0.5 }

impl LinearArtifact {
    fn validate(&self) -> Result<(), ArtifactError> {
        if !(self.threshold > 0.0 && self.threshold < 1.0) {
            return Err(ArtifactError::Malformed(format!("threshold {} outside (0, 1)", self.threshold)));
        }
        let weights = self.numeric.values().chain(self.categorical.values().flat_map(|m| m.values()));
        if !self.intercept.is_finite() || weights.into_iter().any(|w| !w.is_finite()) {
            return Err(ArtifactError::Malformed("non-finite weight".into()));
        }
        Ok(())
    }

    pub fn probability(&self, frame: &FeatureFrame, row: &[FeatureValue]) -> Result<f64, ArtifactError> {
        let mut z = self.intercept;
        for (column, weight) in &self.numeric {
            let idx = frame.column_index(column).ok_or_else(|| ArtifactError::Shape(format!("missing numeric column '{column}'")))?;
            match &row[idx] {
                FeatureValue::Number(v) => z += weight * v,
                FeatureValue::Text(_) => return Err(ArtifactError::Shape(format!("column '{column}' must be numeric"))),
            }
        }
        for (column, table) in &self.categorical {
            let idx = frame.column_index(column).ok_or_else(|| ArtifactError::Shape(format!("missing categorical column '{column}'")))?;
            match &row[idx] {
                FeatureValue::Text(v) => z += table.get(v).copied().unwrap_or(0.0),
                FeatureValue::Number(_) => return Err(ArtifactError::Shape(format!("column '{column}' must be categorical"))),
            }
        }
        Ok(1.0 / (1.0 + (-z).exp()))
    }
}

impl Artifact for LinearArtifact {
    fn flavor(&self) -> &'static str { "linear" }

    fn predict(&self, frame: &FeatureFrame) -> Result<Vec<f64>, ArtifactError> {
        frame
            .rows()
            .iter()
            .map(|row| self.probability(frame, row).map(|p| if p >= self.threshold { 1.0 } else { 0.0 }))
            .collect()
    }
}

#[derive(Deserialize)]
#[serde(tag = "flavor", rename_all = "lowercase")]
enum ArtifactDocument {
    Linear(LinearArtifact),
}

pub fn parse_artifact(bytes: &[u8]) -> Result<Arc<dyn Artifact>, ArtifactError> {
    let doc: ArtifactDocument = serde_json::from_slice(bytes).map_err(|e| ArtifactError::Malformed(e.to_string()))?;
    match doc {
        ArtifactDocument::Linear(model) => {
            model.validate()?;
            Ok(Arc::new(model))
        }
    }
}

/// Tracking server that proxies `mlflow-artifacts:` URIs.
#[derive(Clone)]
struct TrackingServer {
    base: String,
    auth: Option<(String, Option<String>)>,
}

/// Resolves artifact URIs to loaded artifacts.
#[derive(Clone)]
pub struct ArtifactLoader {
    root: Option<PathBuf>,
    http: reqwest::Client,
    tracking: Option<TrackingServer>,
}

impl ArtifactLoader {
    pub fn new(root: Option<PathBuf>, timeout: Duration) -> Result<Self, ArtifactError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ArtifactError::Fetch { uri: String::new(), message: e.to_string() })?;
        Ok(Self { root, http, tracking: None })
    }

    /// Serves `mlflow-artifacts:` URIs through the tracking server's artifact proxy, with the
    /// registry credentials.
    pub fn with_tracking(mut self, base: &str, auth: Option<(String, Option<String>)>) -> Self {
        self.tracking = Some(TrackingServer { base: base.trim_end_matches('/').to_string(), auth });
        self
    }

    pub async fn load(&self, uri: &str) -> Result<Arc<dyn Artifact>, ArtifactError> {
        let bytes = if uri.starts_with("http://") || uri.starts_with("https://") {
            self.fetch(uri, uri).await?
        } else if uri.starts_with(MLFLOW_ARTIFACTS) {
            self.fetch(uri, &self.proxied_url(uri)?).await?
        } else {
            let path = self.local_path(uri)?;
            let shown = uri.to_string();
            tokio::task::spawn_blocking(move || read_local(&path, &shown))
                .await
                .map_err(|e| ArtifactError::Runtime(format!("artifact read task failed: {e}")))??
        };
        let artifact = parse_artifact(&bytes)?;
        info!(target: "churn-core", uri, flavor = artifact.flavor(), bytes = bytes.len(), "artifact loaded");
        Ok(artifact)
    }

    /// `mlflow-artifacts:/<path>` or `mlflow-artifacts://<host>/<path>` ->
    /// `<tracking>/api/2.0/mlflow-artifacts/artifacts/<path>`.
    fn proxied_url(&self, uri: &str) -> Result<String, ArtifactError> {
        let tracking = self.tracking.as_ref().ok_or_else(|| ArtifactError::UnsupportedUri(uri.to_string()))?;
        let mut rest = uri.strip_prefix(MLFLOW_ARTIFACTS).unwrap_or(uri);
        if let Some(authority) = rest.strip_prefix("//") {
            rest = authority.find('/').map_or("", |i| &authority[i..]);
        }
        let path = rest.trim_start_matches('/');
        if path.is_empty() { return Err(ArtifactError::UnsupportedUri(uri.to_string())); }
        Ok(format!("{}/api/2.0/mlflow-artifacts/artifacts/{path}", tracking.base))
    }

    fn local_path(&self, uri: &str) -> Result<PathBuf, ArtifactError> {
        let raw = match uri.strip_prefix("file://") {
            Some(rest) => rest,
            None if uri.contains("://") || uri.starts_with("runs:") || uri.starts_with("models:") => {
                return Err(ArtifactError::UnsupportedUri(uri.to_string()))
            }
            None => uri,
        };
        let path = Path::new(raw);
        Ok(match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        })
    }

    async fn fetch(&self, uri: &str, location: &str) -> Result<Vec<u8>, ArtifactError> {
        let url = if location.ends_with(".json") { location.to_string() } else { format!("{}/{MODEL_FILE}", location.trim_end_matches('/')) };
        debug!(target: "churn-core", %url, "fetching artifact");
        let fetch_err = |message: String| ArtifactError::Fetch { uri: uri.to_string(), message };
        let mut req = self.http.get(&url);
        if let Some(TrackingServer { base, auth: Some((user, pass)) }) = &self.tracking {
            if url.starts_with(base.as_str()) { req = req.basic_auth(user, pass.as_ref()); }
        }
        let resp = req.send().await.map_err(|e| fetch_err(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND { return Err(ArtifactError::NotFound(url)); }
        let resp = resp.error_for_status().map_err(|e| fetch_err(e.to_string()))?;
        let body = resp.bytes().await.map_err(|e| fetch_err(e.to_string()))?;
        Ok(body.to_vec())
    }
}

fn read_local(path: &Path, uri: &str) -> Result<Vec<u8>, ArtifactError> {
    let file = if path.is_dir() { path.join(MODEL_FILE) } else { path.to_path_buf() };
    if !file.exists() { return Err(ArtifactError::NotFound(file.display().to_string())); }
    std::fs::read(&file).map_err(|source| ArtifactError::Io { uri: uri.to_string(), source })
}
