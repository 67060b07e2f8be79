use anyhow::Result;
use churn_core::{init_tracing, load_settings, open_store, RegistryClient};
use promotion_controller::{PromotionController, PromotionPolicy};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("promotion-controller")?;
    let settings = load_settings("promotion-controller")?;
    let client = RegistryClient::new(open_store(&settings)?);
    let controller = PromotionController::new(client, PromotionPolicy::from_settings(&settings)?);
    info!(
        target: "promotion-controller",
        service = %settings.service_name,
        registry = %settings.registry_uri,
        policy = ?controller.policy(),
        "starting promotion"
    );
    match controller.promote().await {
        Ok(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.invariant_ok { std::process::exit(1); }
            Ok(())
        }
        Err(e) => {
            error!(target: "promotion-controller", kind = e.kind(), error = %e, "promotion failed");
            std::process::exit(1);
        }
    }
}
