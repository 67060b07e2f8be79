//! Exits 0 when the configured model has a version in the configured stage, printing the
//! registry report either way. Meant as a gate before rolling out inference servers.

use anyhow::Result;
use churn_core::{init_tracing, load_settings, open_store, RegistryClient, RegistryError};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("check-model")?;
    let settings = load_settings("check-model")?;
    let stage = settings.stage()?;
    let client = RegistryClient::new(open_store(&settings)?);
    info!(target: "check-model", service = %settings.service_name, backend = client.backend(), model = %settings.model_name, %stage, "checking registry");

    let report = match client.registry_report(&settings.model_name).await {
        Ok(report) => report,
        Err(e @ RegistryError::ModelNotFound(_)) => {
            error!(target: "check-model", model = %settings.model_name, error = %e, "model is not registered");
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    let in_stage = report.in_stage(stage);
    match in_stage.first() {
        Some(v) => {
            info!(target: "check-model", model = %settings.model_name, %stage, version = v.version, run_id = %v.run_id, "model ready for serving");
            Ok(())
        }
        None => {
            error!(target: "check-model", model = %settings.model_name, %stage, "no version in stage");
            std::process::exit(1);
        }
    }
}
