//! HTTP front of a single model: health, readiness, metrics and `/predict`.

pub mod gateway;
pub mod metrics;
pub mod schema;
pub mod startup;

use axum::routing::{get, post};
use axum::Router;

pub use gateway::{AppState, GatewayError};
pub use metrics::GatewayMetrics;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(gateway::root))
        .route("/health", get(gateway::health))
        .route("/ready", get(gateway::ready))
        .route("/metrics", get(gateway::metrics))
        .route("/predict", post(gateway::predict))
        .with_state(state)
}
