use std::collections::BTreeMap;
use std::sync::Arc;

use churn_core::{open_store, ExperimentRun, MetricOrder, RegistryClient, RegistryError, Settings, SledRunStore, Stage};

fn run(id: &str, accuracy: f64, start_time: i64) -> ExperimentRun {
    ExperimentRun {
        run_id: id.into(),
        experiment: "exp".into(),
        metrics: BTreeMap::from([("final_accuracy".to_string(), accuracy)]),
        params: BTreeMap::from([("n_estimators".to_string(), "100".to_string()), ("seed".to_string(), "7".to_string())]),
        artifact_uri: format!("runs/{id}/model"),
        start_time,
    }
}

#[tokio::test]
async fn registry_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let client = RegistryClient::new(Arc::new(SledRunStore::open(dir.path()).unwrap()));
        client.record_run(run("r1", 0.7, 1)).await.unwrap();
        client.record_run(run("r2", 0.9, 2)).await.unwrap();
        assert!(matches!(client.record_run(run("r1", 0.1, 3)).await.unwrap_err(), RegistryError::DuplicateRun(_)));
        client.ensure_registered("churn").await.unwrap();
        let best = client.find_best_run("exp", "final_accuracy", MetricOrder::Desc).await.unwrap();
        let v = client.register_version("churn", &best).await.unwrap();
        client.transition_stage("churn", v.version, Stage::Production).await.unwrap();
    }

    let client = RegistryClient::new(Arc::new(SledRunStore::open(dir.path()).unwrap()));
    let resolved = client.resolve("churn", Stage::Production).await.unwrap();
    assert_eq!((resolved.version.version, resolved.version.run_id.as_str()), (1, "r2"));
    // the counter persisted too
    let r1 = client.get_run("r1").await.unwrap().unwrap();
    assert_eq!(client.register_version("churn", &r1).await.unwrap().version, 2);

    let report = client.registry_report("churn").await.unwrap();
    assert_eq!(report.total_versions, 2);
    assert_eq!(report.in_stage(Stage::None).len(), 1);
    let params = &report.production[0].params;
    assert_eq!(params.get("n_estimators").map(String::as_str), Some("100"));
    assert!(!params.contains_key("seed"));
}

#[tokio::test]
async fn concurrent_registrations_get_distinct_versions() {
    let client = RegistryClient::new(Arc::new(SledRunStore::temporary().unwrap()));
    client.record_run(run("r1", 0.5, 1)).await.unwrap();
    client.ensure_registered("churn").await.unwrap();
    let r1 = client.get_run("r1").await.unwrap().unwrap();

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let client = client.clone();
            let r1 = r1.clone();
            tokio::spawn(async move { client.register_version("churn", &r1).await.unwrap().version })
        })
        .collect();
    let mut versions = Vec::new();
    for t in tasks { versions.push(t.await.unwrap()); }
    versions.sort_unstable();
    assert_eq!(versions, (1..=16).collect::<Vec<u64>>());
}

#[tokio::test]
async fn open_store_dispatches_on_scheme() {
    let dir = tempfile::tempdir().unwrap();
    let sled = Settings { registry_uri: format!("sled://{}", dir.path().join("reg").display()), ..Settings::default() };
    assert_eq!(open_store(&sled).unwrap().backend(), "sled");
    let memory = Settings { registry_uri: "memory://".into(), ..Settings::default() };
    assert_eq!(open_store(&memory).unwrap().backend(), "memory");
    let mlflow = Settings { registry_uri: "http://127.0.0.1:5000".into(), ..Settings::default() };
    assert_eq!(open_store(&mlflow).unwrap().backend(), "mlflow");
    let bad = Settings { registry_uri: "ftp://nowhere".into(), ..Settings::default() };
    assert!(matches!(open_store(&bad).err(), Some(RegistryError::Unsupported { .. })));

    let err = RegistryClient::new(open_store(&memory).unwrap()).resolve("churn", Stage::Production).await.unwrap_err();
    assert!(matches!(err, RegistryError::StageEmpty { .. }));
}
