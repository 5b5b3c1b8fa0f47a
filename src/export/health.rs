use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for agent health and observability.
///
/// All metrics use the "tracefuse" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Perf events dispatched to visitors in timestamp order.
    pub events_merged: Counter,
    /// Perf events discarded for violating the cross-source skew bound.
    pub events_discarded: Counter,
    /// Perf events buffered awaiting the safety delay.
    pub events_buffered: Gauge,
    /// Timestamp writes skipped because the slot pool was saturated.
    pub instrumentation_dropped: Counter,
    /// GPU submissions retired.
    pub submissions_completed: Counter,
    /// GPU submissions awaiting their timers.
    pub submissions_pending: Gauge,
    /// Correlated records handed to the transport.
    pub records_emitted: Counter,
    /// Query slots pending on the GPU, across devices.
    pub slots_pending: Gauge,
    /// Logical devices with a registered query pool.
    pub devices_registered: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_merged = Counter::with_opts(
            Opts::new(
                "events_merged_total",
                "Perf events dispatched to visitors in timestamp order.",
            )
            .namespace("tracefuse"),
        )?;
        let events_discarded = Counter::with_opts(
            Opts::new(
                "events_discarded_total",
                "Perf events discarded for violating the cross-source skew bound.",
            )
            .namespace("tracefuse"),
        )?;
        let events_buffered = Gauge::with_opts(
            Opts::new(
                "events_buffered",
                "Perf events buffered awaiting the safety delay.",
            )
            .namespace("tracefuse"),
        )?;
        let instrumentation_dropped = Counter::with_opts(
            Opts::new(
                "instrumentation_dropped_total",
                "Timestamp writes skipped because the slot pool was saturated.",
            )
            .namespace("tracefuse"),
        )?;
        let submissions_completed = Counter::with_opts(
            Opts::new("submissions_completed_total", "GPU submissions retired.")
                .namespace("tracefuse"),
        )?;
        let submissions_pending = Gauge::with_opts(
            Opts::new(
                "submissions_pending",
                "GPU submissions awaiting their timers.",
            )
            .namespace("tracefuse"),
        )?;
        let records_emitted = Counter::with_opts(
            Opts::new(
                "records_emitted_total",
                "Correlated records handed to the transport.",
            )
            .namespace("tracefuse"),
        )?;
        let slots_pending = Gauge::with_opts(
            Opts::new(
                "slots_pending",
                "Query slots pending on the GPU, across devices.",
            )
            .namespace("tracefuse"),
        )?;
        let devices_registered = Gauge::with_opts(
            Opts::new(
                "devices_registered",
                "Logical devices with a registered query pool.",
            )
            .namespace("tracefuse"),
        )?;

        registry.register(Box::new(events_merged.clone()))?;
        registry.register(Box::new(events_discarded.clone()))?;
        registry.register(Box::new(events_buffered.clone()))?;
        registry.register(Box::new(instrumentation_dropped.clone()))?;
        registry.register(Box::new(submissions_completed.clone()))?;
        registry.register(Box::new(submissions_pending.clone()))?;
        registry.register(Box::new(records_emitted.clone()))?;
        registry.register(Box::new(slots_pending.clone()))?;
        registry.register(Box::new(devices_registered.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_merged,
            events_discarded,
            events_buffered,
            instrumentation_dropped,
            submissions_completed,
            submissions_pending,
            records_emitted,
            slots_pending,
            devices_registered,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9184"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let health = HealthMetrics::new(":0").expect("metrics");
        health.events_merged.inc();
        health.events_merged.inc();
        health.slots_pending.set(12.0);

        let families = health.registry.gather();
        assert_eq!(families.len(), 9);

        let merged = families
            .iter()
            .find(|f| f.get_name() == "tracefuse_events_merged_total")
            .expect("merged metric");
        assert_eq!(merged.get_metric()[0].get_counter().get_value(), 2.0);
    }

    #[tokio::test]
    async fn test_server_start_and_stop() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        health.start().await.expect("start");
        health.stop().await.expect("stop");
    }
}
