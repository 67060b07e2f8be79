use std::sync::Arc;

use anyhow::Result;
use churn_core::{init_tracing, load_settings};
use inference_gateway::{router, startup, AppState, GatewayMetrics};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("inference-gateway")?;
    let settings = load_settings("inference-gateway")?;
    info!(target: "inference-gateway", service = %settings.service_name, registry = %settings.registry_uri, model = %settings.model_name, stage = %settings.model_stage, "config loaded");

    // the model is loaded (or failed) before the listener accepts anything
    let serving = startup::start(&settings).await?;
    let state = AppState::new(serving, Arc::new(GatewayMetrics::new()?), settings.request_timeout());

    let addr = settings.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(target: "inference-gateway", %addr, phase = ?state.serving.phase(), "listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
        })
        .await?;
    info!(target: "inference-gateway", "shutdown");
    Ok(())
}
