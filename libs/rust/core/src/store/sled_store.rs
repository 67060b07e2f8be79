use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use tracing::{debug, warn};

use super::{now_ms, RunStore};
use crate::error::{RegistryError, Result};
use crate::model_registry::{ExperimentRun, ModelVersion, RegisteredModel, Stage};

const DEFAULT_OPEN_WAIT: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_millis(200);

/// Embedded persistent store.
///
/// Trees: `runs` (run_id -> json), `models` (name -> json), `versions` (name \0 version_be -> json)
/// and `counters` (name -> last allocated version, big endian). Version allocation and stage
/// transitions run inside sled transactions.
///
/// sled holds an exclusive file lock on the directory: one process at a time. Clones share the
/// handle; a second `open` of the same path waits for the lock instead of failing at once, since
/// a dropped handle gives the lock back from sled's background flusher, not synchronously.
/// Every operation runs on the blocking pool, so callers' timeouts stay effective.
#[derive(Clone)]
pub struct SledRunStore {
    db: Db,
    runs: Tree,
    models: Tree,
    versions: Tree,
    counters: Tree,
}

fn storage(e: sled::Error) -> RegistryError { RegistryError::unavailable(format!("sled: {e}")) }

fn lock_held(e: &sled::Error) -> bool {
    match e {
        sled::Error::Io(io) => io.kind() == std::io::ErrorKind::WouldBlock || io.to_string().contains("could not acquire lock"),
        _ => false,
    }
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T> {
    serde_json::from_slice(raw).map_err(|e| RegistryError::unavailable(format!("corrupt record: {e}")))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| RegistryError::unavailable(format!("encode: {e}")))
}

fn version_prefix(name: &str) -> Vec<u8> {
    let mut key = name.as_bytes().to_vec();
    key.push(0);
    key
}

fn version_key(name: &str, version: u64) -> Vec<u8> {
    let mut key = version_prefix(name);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

fn flatten<T>(res: std::result::Result<T, TransactionError<RegistryError>>) -> Result<T> {
    res.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => storage(e),
    })
}

impl SledRunStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> { Self::open_with_wait(path, DEFAULT_OPEN_WAIT) }

    /// Opens the store, retrying while another handle holds the directory lock. Blocks the
    /// calling thread for at most `wait`; a lock still held after that is `RegistryUnavailable`.
    pub fn open_with_wait(path: impl AsRef<Path>, wait: Duration) -> Result<Self> {
        let path = path.as_ref();
        let deadline = Instant::now() + wait;
        let mut backoff = Duration::from_millis(10);
        let db = loop {
            match sled::open(path) {
                Ok(db) => break db,
                Err(e) if lock_held(&e) && Instant::now() < deadline => {
                    debug!(target: "churn-core", path = %path.display(), ?backoff, "sled directory locked, retrying");
                    std::thread::sleep(backoff.min(deadline.saturating_duration_since(Instant::now())));
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => {
                    if lock_held(&e) { warn!(target: "churn-core", path = %path.display(), "sled directory still locked by another handle"); }
                    return Err(storage(e));
                }
            }
        };
        Self::from_db(db)
    }

    /// Throwaway store backed by a temporary sled instance.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open().map_err(storage)?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        let runs = db.open_tree("runs").map_err(storage)?;
        let models = db.open_tree("models").map_err(storage)?;
        let versions = db.open_tree("versions").map_err(storage)?;
        let counters = db.open_tree("counters").map_err(storage)?;
        Ok(Self { db, runs, models, versions, counters })
    }

    fn flush(&self) -> Result<()> {
        self.db.flush().map_err(storage)?;
        Ok(())
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SledRunStore) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| RegistryError::unavailable(format!("sled task failed: {e}")))?
    }

    fn put_run(&self, run: &ExperimentRun) -> Result<()> {
        let bytes = encode(run)?;
        let swapped = self.runs.compare_and_swap(run.run_id.as_bytes(), None as Option<&[u8]>, Some(bytes)).map_err(storage)?;
        if swapped.is_err() { return Err(RegistryError::DuplicateRun(run.run_id.clone())); }
        self.flush()
    }

    fn runs_in(&self, experiment: &str) -> Result<Vec<ExperimentRun>> {
        let mut out = Vec::new();
        for kv in self.runs.iter() {
            let (_, raw) = kv.map_err(storage)?;
            let run: ExperimentRun = decode(&raw)?;
            if run.experiment == experiment { out.push(run); }
        }
        Ok(out)
    }

    fn put_model(&self, name: &str) -> Result<RegisteredModel> {
        let now = now_ms();
        let model = RegisteredModel { name: name.to_string(), description: None, creation_timestamp: now, last_updated_timestamp: now };
        let bytes = encode(&model)?;
        let swapped = self.models.compare_and_swap(name.as_bytes(), None as Option<&[u8]>, Some(bytes)).map_err(storage)?;
        if swapped.is_err() { return Err(RegistryError::ModelExists(name.to_string())); }
        self.flush()?;
        Ok(model)
    }

    fn allocate_version(&self, name: &str, run_id: &str, source: &str) -> Result<ModelVersion> {
        let res = (&self.models, &self.counters, &self.versions).transaction(|(models, counters, versions)| {
            if models.get(name.as_bytes())?.is_none() {
                return Err(ConflictableTransactionError::Abort(RegistryError::ModelNotFound(name.to_string())));
            }
            let last = counters
                .get(name.as_bytes())?
                .and_then(|raw| <[u8; 8]>::try_from(raw.as_ref()).ok())
                .map(u64::from_be_bytes)
                .unwrap_or(0);
            let now = now_ms();
            let mv = ModelVersion {
                name: name.to_string(),
                version: last + 1,
                run_id: run_id.to_string(),
                source: source.to_string(),
                stage: Stage::None,
                creation_timestamp: now,
                last_updated_timestamp: now,
            };
            let bytes = encode(&mv).map_err(ConflictableTransactionError::Abort)?;
            counters.insert(name.as_bytes(), mv.version.to_be_bytes().to_vec())?;
            versions.insert(version_key(name, mv.version), bytes)?;
            Ok(mv)
        });
        let mv = flatten(res)?;
        self.flush()?;
        Ok(mv)
    }

    fn versions_of(&self, name: &str) -> Result<Vec<ModelVersion>> {
        let mut out = Vec::new();
        for kv in self.versions.scan_prefix(version_prefix(name)) {
            let (_, raw) = kv.map_err(storage)?;
            out.push(decode(&raw)?);
        }
        Ok(out)
    }

    fn set_stage(&self, name: &str, version: u64, stage: Stage) -> Result<ModelVersion> {
        let key = version_key(name, version);
        let res = self.versions.transaction(|tx| {
            let raw = tx
                .get(key.as_slice())?
                .ok_or_else(|| ConflictableTransactionError::Abort(RegistryError::VersionNotFound { name: name.to_string(), version }))?;
            let mut mv: ModelVersion = decode(&raw).map_err(ConflictableTransactionError::Abort)?;
            mv.stage = stage;
            mv.last_updated_timestamp = now_ms();
            let bytes = encode(&mv).map_err(ConflictableTransactionError::Abort)?;
            tx.insert(key.clone(), bytes)?;
            Ok(mv)
        });
        let mv = flatten(res)?;
        self.flush()?;
        Ok(mv)
    }
}

#[async_trait]
impl RunStore for SledRunStore {
    fn backend(&self) -> &'static str { "sled" }

    async fn record_run(&self, run: ExperimentRun) -> Result<()> {
        let run = self.blocking(move |s| s.put_run(&run).map(|()| run)).await?;
        debug!(run_id = %run.run_id, experiment = %run.experiment, "run recorded");
        Ok(())
    }

    async fn search_runs(&self, experiment: &str) -> Result<Vec<ExperimentRun>> {
        let experiment = experiment.to_string();
        self.blocking(move |s| s.runs_in(&experiment)).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<ExperimentRun>> {
        let run_id = run_id.to_string();
        self.blocking(move |s| s.runs.get(run_id.as_bytes()).map_err(storage)?.map(|raw| decode(&raw)).transpose()).await
    }

    async fn get_registered_model(&self, name: &str) -> Result<Option<RegisteredModel>> {
        let name = name.to_string();
        self.blocking(move |s| s.models.get(name.as_bytes()).map_err(storage)?.map(|raw| decode(&raw)).transpose()).await
    }

    async fn create_registered_model(&self, name: &str) -> Result<RegisteredModel> {
        let name = name.to_string();
        self.blocking(move |s| s.put_model(&name)).await
    }

    async fn create_model_version(&self, name: &str, run_id: &str, source: &str) -> Result<ModelVersion> {
        let (owned_name, owned_run, owned_source) = (name.to_string(), run_id.to_string(), source.to_string());
        let mv = self.blocking(move |s| s.allocate_version(&owned_name, &owned_run, &owned_source)).await?;
        debug!(model = name, version = mv.version, run_id, "model version created");
        Ok(mv)
    }

    async fn search_model_versions(&self, name: &str) -> Result<Vec<ModelVersion>> {
        let name = name.to_string();
        self.blocking(move |s| s.versions_of(&name)).await
    }

    async fn transition_stage(&self, name: &str, version: u64, stage: Stage) -> Result<ModelVersion> {
        let name = name.to_string();
        self.blocking(move |s| s.set_stage(&name, version, stage)).await
    }
}
