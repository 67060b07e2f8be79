use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};

/// Request counters and latency for `/predict`, exposed on `/metrics`.
pub struct GatewayMetrics {
    registry: Registry,
    requests: IntCounterVec,
    latency_ms: Histogram,
}

impl GatewayMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let requests = IntCounterVec::new(Opts::new("churn_predict_requests_total", "Prediction requests by outcome"), &["outcome"])?;
        let latency_ms = Histogram::with_opts(
            HistogramOpts::new("churn_predict_latency_ms", "Prediction latency in milliseconds")
                .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0]),
        )?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(latency_ms.clone()))?;
        Ok(Self { registry, requests, latency_ms })
    }

    pub fn observe(&self, outcome: &str, elapsed_ms: f64) {
        self.requests.with_label_values(&[outcome]).inc();
        self.latency_ms.observe(elapsed_ms);
    }

    pub fn count(&self, outcome: &str) -> u64 { self.requests.with_label_values(&[outcome]).get() }

    pub fn render(&self) -> Response {
        let families = self.registry.gather();
        match TextEncoder::new().encode_to_string(&families) {
            Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_are_counted_separately() {
        let m = GatewayMetrics::new().unwrap();
        m.observe("ok", 1.0);
        m.observe("ok", 3.0);
        m.observe("unavailable", 0.1);
        assert_eq!(m.count("ok"), 2);
        assert_eq!(m.count("unavailable"), 1);
        assert_eq!(m.count("invalid"), 0);
        let text = prometheus::TextEncoder::new().encode_to_string(&m.registry.gather()).unwrap();
        assert!(text.contains("churn_predict_requests_total{outcome=\"ok\"} 2"));
        assert!(text.contains("churn_predict_latency_ms_count 3"));
    }
}
