//! Input document for `record-run`, the hook trainers use to log runs into local backends.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use churn_core::ExperimentRun;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunDocument {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub experiment: Option<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    pub artifact_uri: String,
    /// Epoch milliseconds; defaults to now.
    #[serde(default)]
    pub start_time: Option<i64>,
}

impl RunDocument {
    /// Fills in a fresh run id, the default experiment and the current time where absent.
    pub fn into_run(self, default_experiment: &str) -> Result<ExperimentRun> {
        if self.artifact_uri.trim().is_empty() { bail!("artifact_uri must not be empty"); }
        if let Some((k, _)) = self.metrics.iter().find(|(_, v)| !v.is_finite()) { bail!("metric '{k}' is not finite"); }
        Ok(ExperimentRun {
            run_id: self.run_id.filter(|id| !id.trim().is_empty()).unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
            experiment: self.experiment.unwrap_or_else(|| default_experiment.to_string()),
            metrics: self.metrics,
            params: self.params,
            artifact_uri: self.artifact_uri,
            start_time: self.start_time.unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_filled_in() {
        let doc: RunDocument = serde_json::from_str(r#"{"metrics": {"final_accuracy": 0.9}, "artifact_uri": "runs/a/model"}"#).unwrap();
        let run = doc.into_run("exp").unwrap();
        assert_eq!(run.run_id.len(), 32);
        assert_eq!(run.experiment, "exp");
        assert!(run.start_time > 0);
        assert_eq!(run.metric("final_accuracy"), Some(0.9));
    }

    #[test]
    fn explicit_fields_win_and_bad_documents_fail() {
        let doc: RunDocument =
            serde_json::from_str(r#"{"run_id": "r1", "experiment": "other", "artifact_uri": "x", "start_time": 5}"#).unwrap();
        let run = doc.into_run("exp").unwrap();
        assert_eq!((run.run_id.as_str(), run.experiment.as_str(), run.start_time), ("r1", "other", 5));

        assert!(serde_json::from_str::<RunDocument>(r#"{"artifact_uri": "x", "extra": 1}"#).is_err());
        let empty: RunDocument = serde_json::from_str(r#"{"artifact_uri": " "}"#).unwrap();
        assert!(empty.into_run("exp").is_err());
    }
}
