//! Promotion of the best experiment run to the Production stage.
//!
//! One invocation selects the best run, registers it as a new version, archives whatever is in
//! Production and promotes the new version. Archiving happens first: an empty Production stage is
//! a loud failure for servers, two Production versions would be a silent one. The two steps are
//! not transactional, so every invocation starts by repairing a leftover double Production.

pub mod runs;

use churn_core::{MetricOrder, ModelVersion, RegistryClient, RegistryError, RegistryResult, Settings, Stage};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct PromotionPolicy {
    pub experiment: String,
    pub model_name: String,
    pub metric: String,
    pub order: MetricOrder,
}

impl PromotionPolicy {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            experiment: settings.experiment_name.clone(),
            model_name: settings.model_name.clone(),
            metric: settings.selection_metric.clone(),
            order: settings.metric_order()?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PromotionOutcome {
    pub model_name: String,
    pub run_id: String,
    pub metric: String,
    pub metric_value: f64,
    pub version: u64,
    /// Versions moved out of Production by this promotion.
    pub archived: Vec<u64>,
    /// Extra Production versions archived by the pre-flight repair.
    pub repaired: Vec<u64>,
    pub invariant_ok: bool,
}

pub struct PromotionController {
    client: RegistryClient,
    policy: PromotionPolicy,
}

impl PromotionController {
    pub fn new(client: RegistryClient, policy: PromotionPolicy) -> Self { Self { client, policy } }

    pub fn policy(&self) -> &PromotionPolicy { &self.policy }

    /// Archives every Production version except the highest. Returns the archived versions.
    #[instrument(skip(self), fields(model = %self.policy.model_name))]
    pub async fn heal(&self) -> RegistryResult<Vec<u64>> {
        let production = self.client.list_versions(&self.policy.model_name, Stage::Production).await?;
        if production.len() <= 1 { return Ok(Vec::new()); }
        let keep = production[0].version;
        let mut extra: Vec<u64> = production[1..].iter().map(|v| v.version).collect();
        extra.sort_unstable();
        warn!(target: "promotion-controller", keep, extra = ?extra, "multiple Production versions found, archiving extras");
        for &version in &extra {
            self.client.transition_stage(&self.policy.model_name, version, Stage::Archived).await?;
        }
        Ok(extra)
    }

    #[instrument(skip(self), fields(model = %self.policy.model_name, experiment = %self.policy.experiment))]
    pub async fn promote(&self) -> RegistryResult<PromotionOutcome> {
        let name = self.policy.model_name.as_str();
        let repaired = self.heal().await?;

        let run = self.client.find_best_run(&self.policy.experiment, &self.policy.metric, self.policy.order).await?;
        let metric_value = run
            .metric(&self.policy.metric)
            .ok_or_else(|| RegistryError::NoRunsFound { experiment: self.policy.experiment.clone(), metric: self.policy.metric.clone() })?;
        info!(target: "promotion-controller", run_id = %run.run_id, metric = %self.policy.metric, metric_value, "best run selected");

        self.client.ensure_registered(name).await?;
        let created = self.client.register_version(name, &run).await?;
        info!(target: "promotion-controller", version = created.version, source = %created.source, "version registered");

        let mut current: Vec<ModelVersion> = self.client.list_versions(name, Stage::Production).await?;
        current.sort_by_key(|v| v.version);
        let mut archived = Vec::with_capacity(current.len());
        for v in current.iter().filter(|v| v.version != created.version) {
            // a failed archive stops here, before anything is promoted
            self.client.transition_stage(name, v.version, Stage::Archived).await?;
            info!(target: "promotion-controller", version = v.version, "archived previous Production version");
            archived.push(v.version);
        }

        self.client.transition_stage(name, created.version, Stage::Production).await?;

        let after = self.client.list_versions(name, Stage::Production).await?;
        let invariant_ok = after.len() == 1 && after[0].version == created.version;
        if invariant_ok {
            info!(target: "promotion-controller", version = created.version, archived = ?archived, "promotion complete");
        } else {
            let found: Vec<u64> = after.iter().map(|v| v.version).collect();
            error!(target: "promotion-controller", version = created.version, production = ?found, "Production invariant violated after promotion");
        }

        Ok(PromotionOutcome {
            model_name: name.to_string(),
            run_id: run.run_id,
            metric: self.policy.metric.clone(),
            metric_value,
            version: created.version,
            archived,
            repaired,
            invariant_ok,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use churn_core::{ExperimentRun, MemoryRunStore};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn policy() -> PromotionPolicy {
        PromotionPolicy { experiment: "exp".into(), model_name: "churn".into(), metric: "final_accuracy".into(), order: MetricOrder::Desc }
    }

    fn run(id: &str, acc: f64, t: i64) -> ExperimentRun {
        ExperimentRun {
            run_id: id.into(),
            experiment: "exp".into(),
            metrics: BTreeMap::from([("final_accuracy".to_string(), acc)]),
            params: BTreeMap::new(),
            artifact_uri: format!("/artifacts/{id}/model"),
            start_time: t,
        }
    }

    #[test]
    fn policy_follows_settings() {
        let settings = Settings { metric_order: "asc".into(), selection_metric: "final_loss".into(), ..Settings::default() };
        let p = PromotionPolicy::from_settings(&settings).unwrap();
        assert_eq!(p.order, MetricOrder::Asc);
        assert_eq!(p.metric, "final_loss");
        assert_eq!(p.model_name, "telco-churn-prediction");
    }

    #[tokio::test]
    async fn heal_is_noop_on_healthy_registry() {
        let client = RegistryClient::new(Arc::new(MemoryRunStore::new()));
        client.record_run(run("r1", 0.8, 1)).await.unwrap();
        let controller = PromotionController::new(client, policy());
        assert_eq!(controller.policy().model_name, "churn");
        assert!(controller.heal().await.unwrap().is_empty());
        let outcome = controller.promote().await.unwrap();
        assert!(outcome.repaired.is_empty());
        assert!(controller.heal().await.unwrap().is_empty());
    }
}
