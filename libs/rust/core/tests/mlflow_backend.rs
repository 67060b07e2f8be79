//! Drives the MLflow REST backend against an in-process stub tracking server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use churn_core::{Artifact, ArtifactLoader, FeatureFrame, MetricOrder, MlflowRunStore, RegistryClient, RegistryError, RunStore, Stage};
use parking_lot::Mutex;
use serde_json::{json, Value};

#[derive(Default)]
struct Stub {
    runs: Vec<Value>,
    models: Vec<String>,
    versions: Vec<Value>,
    auth_headers: Vec<String>,
}

type Shared = Arc<Mutex<Stub>>;

fn missing(what: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error_code": "RESOURCE_DOES_NOT_EXIST", "message": format!("{what} not found")}))).into_response()
}

fn note_auth(stub: &Shared, headers: &HeaderMap) {
    if let Some(v) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        stub.lock().auth_headers.push(v.to_string());
    }
}

async fn experiment_by_name(State(stub): State<Shared>, headers: HeaderMap, Query(q): Query<HashMap<String, String>>) -> Response {
    note_auth(&stub, &headers);
    match q.get("experiment_name").map(String::as_str) {
        Some("churn-exp") => Json(json!({"experiment": {"experiment_id": "7", "name": "churn-exp"}})).into_response(),
        _ => missing("experiment"),
    }
}

/// One run per page to exercise pagination.
async fn search_runs(State(stub): State<Shared>, Json(body): Json<Value>) -> Response {
    assert_eq!(body["experiment_ids"], json!(["7"]));
    let idx: usize = body["page_token"].as_str().and_then(|t| t.parse().ok()).unwrap_or(0);
    let stub = stub.lock();
    let runs: Vec<Value> = stub.runs.get(idx).cloned().into_iter().collect();
    let next = (idx + 1 < stub.runs.len()).then(|| (idx + 1).to_string());
    Json(json!({"runs": runs, "next_page_token": next})).into_response()
}

async fn get_run(State(stub): State<Shared>, Query(q): Query<HashMap<String, String>>) -> Response {
    let id = q.get("run_id").cloned().unwrap_or_default();
    match stub.lock().runs.iter().find(|r| r["info"]["run_id"] == json!(id)) {
        Some(run) => Json(json!({"run": run})).into_response(),
        None => missing("run"),
    }
}

async fn get_model(State(stub): State<Shared>, Query(q): Query<HashMap<String, String>>) -> Response {
    let name = q.get("name").cloned().unwrap_or_default();
    if stub.lock().models.contains(&name) {
        Json(json!({"registered_model": {"name": name, "creation_timestamp": 1, "last_updated_timestamp": 1}})).into_response()
    } else {
        missing("registered model")
    }
}

async fn create_model(State(stub): State<Shared>, Json(body): Json<Value>) -> Response {
    let name = body["name"].as_str().unwrap_or_default().to_string();
    stub.lock().models.push(name.clone());
    Json(json!({"registered_model": {"name": name, "creation_timestamp": 2, "last_updated_timestamp": 2}})).into_response()
}

async fn create_version(State(stub): State<Shared>, Json(body): Json<Value>) -> Response {
    let mut stub = stub.lock();
    let version = json!({
        "name": body["name"],
        "version": (stub.versions.len() + 1).to_string(),
        "run_id": body["run_id"],
        "source": body["source"],
        "current_stage": "None",
        "creation_timestamp": 3,
    });
    stub.versions.push(version.clone());
    Json(json!({"model_version": version})).into_response()
}

async fn search_versions(State(stub): State<Shared>, Query(q): Query<HashMap<String, String>>) -> Response {
    let filter = q.get("filter").cloned().unwrap_or_default();
    let stub = stub.lock();
    let versions: Vec<Value> = stub.versions.iter().filter(|v| filter == format!("name='{}'", v["name"].as_str().unwrap_or_default())).cloned().collect();
    Json(json!({"model_versions": versions})).into_response()
}

async fn transition(State(stub): State<Shared>, Json(body): Json<Value>) -> Response {
    assert_eq!(body["archive_existing_versions"], json!(false));
    let mut stub = stub.lock();
    match stub.versions.iter_mut().find(|v| v["name"] == body["name"] && v["version"] == body["version"]) {
        Some(v) => {
            v["current_stage"] = body["stage"].clone();
            Json(json!({"model_version": v.clone()})).into_response()
        }
        None => missing("model version"),
    }
}

const PROXIED_MODEL: &str = r#"{"flavor": "linear", "intercept": 2.0}"#;

async fn proxied_artifact(State(stub): State<Shared>, headers: HeaderMap, Path(path): Path<String>) -> Response {
    note_auth(&stub, &headers);
    if path == "7/b/artifacts/model/model.json" {
        PROXIED_MODEL.into_response()
    } else {
        (StatusCode::NOT_FOUND, "no such artifact").into_response()
    }
}

fn wire_run(id: &str, accuracy: Option<f64>, start_time: i64) -> Value {
    let metrics: Vec<Value> = accuracy.map(|a| json!({"key": "final_accuracy", "value": a, "step": 0})).into_iter().collect();
    json!({
        "info": {"run_id": id, "experiment_id": "7", "artifact_uri": format!("http://artifacts/7/{id}/artifacts/"), "start_time": start_time, "status": "FINISHED"},
        "data": {"metrics": metrics, "params": [{"key": "algorithm", "value": "logistic"}]}
    })
}

async fn spawn_stub(stub: Shared) -> String {
    let app = Router::new()
        .route("/api/2.0/mlflow/experiments/get-by-name", get(experiment_by_name))
        .route("/api/2.0/mlflow/runs/search", post(search_runs))
        .route("/api/2.0/mlflow/runs/get", get(get_run))
        .route("/api/2.0/mlflow/registered-models/get", get(get_model))
        .route("/api/2.0/mlflow/registered-models/create", post(create_model))
        .route("/api/2.0/mlflow/model-versions/create", post(create_version))
        .route("/api/2.0/mlflow/model-versions/search", get(search_versions))
        .route("/api/2.0/mlflow/model-versions/transition-stage", post(transition))
        .route("/api/2.0/mlflow-artifacts/artifacts/*path", get(proxied_artifact))
        .with_state(stub);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}/")
}

async fn client_for(stub: &Shared) -> RegistryClient {
    let base = spawn_stub(stub.clone()).await;
    let store = MlflowRunStore::new(&base, Some(("trainer".into(), Some("secret".into()))), Duration::from_secs(5)).unwrap();
    RegistryClient::new(Arc::new(store))
}

#[tokio::test]
async fn selects_registers_and_promotes_through_rest_api() {
    let stub: Shared = Arc::default();
    stub.lock().runs = vec![wire_run("a", Some(0.80), 1), wire_run("b", Some(0.91), 2), wire_run("c", None, 3)];
    let client = client_for(&stub).await;
    assert_eq!(client.backend(), "mlflow");

    let best = client.find_best_run("churn-exp", "final_accuracy", MetricOrder::Desc).await.unwrap();
    assert_eq!(best.run_id, "b");
    assert_eq!(best.artifact_uri, "http://artifacts/7/b/artifacts/model");
    assert_eq!(best.params.get("algorithm").map(String::as_str), Some("logistic"));

    client.ensure_registered("churn").await.unwrap();
    client.ensure_registered("churn").await.unwrap();
    assert_eq!(stub.lock().models, vec!["churn".to_string()]);

    let v = client.register_version("churn", &best).await.unwrap();
    assert_eq!((v.version, v.stage), (1, Stage::None));
    client.transition_stage("churn", 1, Stage::Production).await.unwrap();
    let resolved = client.resolve("churn", Stage::Production).await.unwrap();
    assert_eq!(resolved.version.run_id, "b");
    assert_eq!(resolved.uri, "models:/churn/Production");

    let err = client.transition_stage("churn", 9, Stage::Archived).await.unwrap_err();
    assert!(matches!(err, RegistryError::VersionNotFound { version: 9, .. }));

    let report = client.registry_report("churn").await.unwrap();
    assert_eq!(report.production.len(), 1);
    assert_eq!(report.production[0].metrics.get("final_accuracy"), Some(&0.91));

    assert!(stub.lock().auth_headers.iter().all(|h| h.starts_with("Basic ")));
    assert!(!stub.lock().auth_headers.is_empty());
}

#[tokio::test]
async fn missing_resources_map_to_empty_results() {
    let stub: Shared = Arc::default();
    let client = client_for(&stub).await;
    let err = client.find_best_run("unknown", "final_accuracy", MetricOrder::Desc).await.unwrap_err();
    assert!(matches!(err, RegistryError::NoRunsFound { .. }));
    assert!(client.get_run("nope").await.unwrap().is_none());
    assert!(client.list_versions("churn", Stage::Production).await.unwrap().is_empty());
    assert!(matches!(client.registry_report("churn").await.unwrap_err(), RegistryError::ModelNotFound(_)));
}

#[tokio::test]
async fn unreachable_server_is_unavailable_and_runs_are_read_only() {
    let store = MlflowRunStore::new("http://127.0.0.1:9", None, Duration::from_millis(500)).unwrap();
    let err = store.search_runs("churn-exp").await.unwrap_err();
    assert_eq!(err.kind(), "registry_unavailable");

    let stub: Shared = Arc::default();
    let client = client_for(&stub).await;
    let run = churn_core::ExperimentRun {
        run_id: "x".into(),
        experiment: "churn-exp".into(),
        metrics: Default::default(),
        params: Default::default(),
        artifact_uri: "x".into(),
        start_time: 0,
    };
    assert!(matches!(client.record_run(run).await.unwrap_err(), RegistryError::Unsupported { .. }));
}

#[tokio::test]
async fn bare_not_found_pages_mean_unavailable_not_empty() {
    let app = Router::new().fallback(|| async { (StatusCode::NOT_FOUND, "<html>Not Found</html>") });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    let store = MlflowRunStore::new(&format!("http://{addr}"), None, Duration::from_secs(2)).unwrap();
    let client = RegistryClient::new(Arc::new(store));
    let err = client.find_best_run("churn-exp", "final_accuracy", MetricOrder::Desc).await.unwrap_err();
    assert_eq!(err.kind(), "registry_unavailable");
    let err = client.resolve("churn", Stage::Production).await.unwrap_err();
    assert_eq!(err.kind(), "registry_unavailable");
    assert_eq!(client.get_run("r1").await.unwrap_err().kind(), "registry_unavailable");
}

#[tokio::test]
async fn proxied_artifacts_load_through_tracking_server() {
    let stub: Shared = Arc::default();
    let mut run = wire_run("b", Some(0.9), 1);
    run["info"]["artifact_uri"] = json!("mlflow-artifacts:/7/b/artifacts/model");
    stub.lock().runs = vec![run];
    let base = spawn_stub(stub.clone()).await;
    let auth = Some(("trainer".to_string(), Some("secret".to_string())));
    let client = RegistryClient::new(Arc::new(MlflowRunStore::new(&base, auth.clone(), Duration::from_secs(5)).unwrap()));

    client.ensure_registered("churn").await.unwrap();
    let best = client.find_best_run("churn-exp", "final_accuracy", MetricOrder::Desc).await.unwrap();
    let v = client.register_version("churn", &best).await.unwrap();
    client.transition_stage("churn", v.version, Stage::Production).await.unwrap();
    let source = client.resolve("churn", Stage::Production).await.unwrap().version.source;
    assert_eq!(source, "mlflow-artifacts:/7/b/artifacts/model");

    stub.lock().auth_headers.clear();
    let loader = ArtifactLoader::new(None, Duration::from_secs(5)).unwrap().with_tracking(&base, auth);
    let artifact = loader.load(&source).await.unwrap();
    let frame = FeatureFrame::single_row(vec![("customer_id", "C".into())]);
    assert_eq!(artifact.predict(&frame).unwrap(), vec![1.0]);
    assert_eq!(stub.lock().auth_headers.len(), 1);

    let missing = loader.load("mlflow-artifacts:/7/zzz/artifacts/model").await.err();
    assert!(matches!(missing, Some(churn_core::ArtifactError::NotFound(_))));
}
