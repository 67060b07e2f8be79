//! Records a training run into a local registry backend.
//!
//! Usage: `record-run [FILE]`; reads the run document from stdin when no file is given.

use anyhow::{Context, Result};
use churn_core::{init_tracing, load_settings, open_store, RegistryClient};
use promotion_controller::runs::RunDocument;
use tokio::io::AsyncReadExt;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("record-run")?;
    let settings = load_settings("record-run")?;

    let raw = match std::env::args().nth(1) {
        Some(path) => tokio::fs::read_to_string(&path).await.with_context(|| format!("reading {path}"))?,
        None => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await.context("reading stdin")?;
            buf
        }
    };
    let doc: RunDocument = serde_json::from_str(&raw).context("parsing run document")?;
    let run = doc.into_run(&settings.experiment_name)?;

    let client = RegistryClient::new(open_store(&settings)?);
    client.record_run(run.clone()).await?;
    info!(target: "record-run", run_id = %run.run_id, experiment = %run.experiment, backend = client.backend(), "run recorded");
    println!("{}", run.run_id);
    Ok(())
}
