//! Model registry: typed query/mutation surface over a [`RunStore`].
//!
//! Runs are recorded by the (external) trainer. Registered models group versions; every version
//! references the run it was built from and carries a lifecycle [`Stage`]. The store itself is dumb:
//! nothing here enforces "at most one Production version", that is the promotion controller's job.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{RegistryError, Result};
use crate::store::RunStore;

/// Lifecycle label on a [`ModelVersion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage { None, Staging, Production, Archived }

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::None, Stage::Staging, Stage::Production, Stage::Archived];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::None => "None",
            Stage::Staging => "Staging",
            Stage::Production => "Production",
            Stage::Archived => "Archived",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Stage {
    type Err = RegistryError;
    fn from_str(s: &str) -> Result<Self> {
        Stage::ALL.into_iter().find(|st| st.as_str().eq_ignore_ascii_case(s.trim())).ok_or_else(|| RegistryError::InvalidStage(s.to_string()))
    }
}

/// Ranking direction for the selection metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricOrder {
    #[default]
    Desc,
    Asc,
}

impl MetricOrder {
    fn rank(self, a: f64, b: f64) -> std::cmp::Ordering {
        let ord = a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal);
        match self { MetricOrder::Desc => ord, MetricOrder::Asc => ord.reverse() }
    }
}

impl FromStr for MetricOrder {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.trim().to_ascii_lowercase().as_str() {
            "desc" | "descending" => Ok(MetricOrder::Desc),
            "asc" | "ascending" => Ok(MetricOrder::Asc),
            other => Err(format!("unknown metric order '{other}', expected 'desc' or 'asc'")),
        }
    }
}

/// A recorded execution of the training procedure. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRun {
    pub run_id: String,
    pub experiment: String,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Pointer to the serialized model artifact.
    pub artifact_uri: String,
    /// Milliseconds since epoch; most recent wins metric ties.
    #[serde(default)]
    pub start_time: i64,
}

impl ExperimentRun {
    pub fn metric(&self, name: &str) -> Option<f64> { self.metrics.get(name).copied().filter(|v| !v.is_nan()) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredModel {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub creation_timestamp: i64,
    pub last_updated_timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    pub version: u64,
    pub run_id: String,
    /// Artifact URI copied from the originating run.
    pub source: String,
    pub stage: Stage,
    pub creation_timestamp: i64,
    pub last_updated_timestamp: i64,
}

/// `models:/<name>/<stage>`
pub fn model_uri(name: &str, stage: Stage) -> String { format!("models:/{name}/{stage}") }

/// Outcome of resolving `models:/<name>/<stage>` to a concrete version.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedModel {
    pub uri: String,
    pub version: ModelVersion,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductionSummary {
    pub version: ModelVersion,
    pub metrics: BTreeMap<String, f64>,
    pub params: BTreeMap<String, String>,
}

/// Snapshot of a registered model: every version grouped by stage.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryReport {
    pub model: RegisteredModel,
    pub total_versions: usize,
    pub by_stage: BTreeMap<Stage, Vec<ModelVersion>>,
    pub production: Vec<ProductionSummary>,
}

impl RegistryReport {
    pub fn in_stage(&self, stage: Stage) -> &[ModelVersion] { self.by_stage.get(&stage).map(Vec::as_slice).unwrap_or(&[]) }
}

const REPORT_PARAMS: [&str; 4] = ["model_name", "algorithm", "n_estimators", "max_depth"];

#[derive(Clone)]
pub struct RegistryClient {
    store: Arc<dyn RunStore>,
}

impl RegistryClient {
    pub fn new(store: Arc<dyn RunStore>) -> Self { Self { store } }

    pub fn backend(&self) -> &'static str { self.store.backend() }

    /// Best run of `experiment` by `metric`; ties go to the most recent run.
    pub async fn find_best_run(&self, experiment: &str, metric: &str, order: MetricOrder) -> Result<ExperimentRun> {
        let runs = self.store.search_runs(experiment).await?;
        let total = runs.len();
        let best = runs
            .into_iter()
            .filter_map(|run| run.metric(metric).map(|value| (value, run)))
            .max_by(|(a, ra), (b, rb)| order.rank(*a, *b).then(ra.start_time.cmp(&rb.start_time)));
        match best {
            Some((value, run)) => {
                debug!(experiment, metric, total, run_id = %run.run_id, value, "best run selected");
                Ok(run)
            }
            None => Err(RegistryError::NoRunsFound { experiment: experiment.to_string(), metric: metric.to_string() }),
        }
    }

    /// Get-or-create; repeated calls return the same registration.
    pub async fn ensure_registered(&self, name: &str) -> Result<RegisteredModel> {
        if let Some(model) = self.store.get_registered_model(name).await? { return Ok(model); }
        match self.store.create_registered_model(name).await {
            Ok(model) => Ok(model),
            // lost a create race: someone else registered it in between
            Err(e) => self.store.get_registered_model(name).await?.ok_or(e),
        }
    }

    /// Versions currently in `stage`, newest first.
    pub async fn list_versions(&self, name: &str, stage: Stage) -> Result<Vec<ModelVersion>> {
        let mut versions: Vec<ModelVersion> = self.store.search_model_versions(name).await?.into_iter().filter(|v| v.stage == stage).collect();
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(versions)
    }

    pub async fn all_versions(&self, name: &str) -> Result<Vec<ModelVersion>> {
        let mut versions = self.store.search_model_versions(name).await?;
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(versions)
    }

    /// New version in stage `None` pointing at the run's artifact.
    pub async fn register_version(&self, name: &str, run: &ExperimentRun) -> Result<ModelVersion> {
        self.store.create_model_version(name, &run.run_id, &run.artifact_uri).await
    }

    pub async fn transition_stage(&self, name: &str, version: u64, stage: Stage) -> Result<ModelVersion> {
        self.store.transition_stage(name, version, stage).await
    }

    /// Resolve `models:/<name>/<stage>` to the newest version in that stage.
    pub async fn resolve(&self, name: &str, stage: Stage) -> Result<ResolvedModel> {
        let versions = self.list_versions(name, stage).await?;
        if versions.len() > 1 {
            warn!(model = name, %stage, count = versions.len(), "more than one version in stage, picking newest");
        }
        let version = versions.into_iter().next().ok_or_else(|| RegistryError::StageEmpty { name: name.to_string(), stage })?;
        Ok(ResolvedModel { uri: model_uri(name, stage), version })
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<ExperimentRun>> { self.store.get_run(run_id).await }

    pub async fn record_run(&self, run: ExperimentRun) -> Result<()> { self.store.record_run(run).await }

    pub async fn registry_report(&self, name: &str) -> Result<RegistryReport> {
        let model = self.store.get_registered_model(name).await?.ok_or_else(|| RegistryError::ModelNotFound(name.to_string()))?;
        let versions = self.all_versions(name).await?;
        let total_versions = versions.len();
        let mut by_stage: BTreeMap<Stage, Vec<ModelVersion>> = BTreeMap::new();
        for v in versions { by_stage.entry(v.stage).or_default().push(v); }
        let mut production = Vec::new();
        for version in by_stage.get(&Stage::Production).cloned().unwrap_or_default() {
            // a missing run only thins the report, it does not fail it
            let run = match self.store.get_run(&version.run_id).await {
                Ok(run) => run,
                Err(e) => { warn!(run_id = %version.run_id, error = %e, "run lookup failed"); None }
            };
            let (metrics, params) = run
                .map(|r| (r.metrics, r.params.into_iter().filter(|(k, _)| REPORT_PARAMS.contains(&k.as_str())).collect()))
                .unwrap_or_default();
            production.push(ProductionSummary { version, metrics, params });
        }
        Ok(RegistryReport { model, total_versions, by_stage, production })
    }
}
