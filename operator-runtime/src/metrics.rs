//! Metrics exposed by the manager
use std::{net::SocketAddr, sync::Arc};

use axum::{extract::State, http::StatusCode, routing::get, Router};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Errors of the metrics registry and endpoint
#[derive(Debug, Error)]
pub enum Error {
    /// A metric could not be created or registered.
    #[error("failed to register metric: {0}")]
    Register(#[from] prometheus::Error),
    /// The endpoint address could not be bound.
    #[error("failed to bind metrics endpoint {addr}: {source}")]
    Bind {
        /// Address of the endpoint.
        addr: SocketAddr,
        /// Why binding failed.
        #[source]
        source: std::io::Error,
    },
    /// The endpoint stopped with an io error.
    #[error("metrics endpoint failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// All metrics of a manager and its controllers
#[derive(Clone, Debug)]
pub struct Metrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    failures: IntCounterVec,
    leader: IntGauge,
}

impl Metrics {
    /// Create the metric families on a fresh registry.
    ///
    /// # Errors
    /// Fails if a metric family can not be registered.
    pub fn new() -> Result<Self, Error> {
        let registry = Registry::new();
        let reconciliations = IntCounterVec::new(
            Opts::new("operator_reconcile_total", "Reconciliations per controller"),
            &["controller"],
        )?;
        let failures = IntCounterVec::new(
            Opts::new("operator_reconcile_errors_total", "Failed reconciliations per controller"),
            &["controller"],
        )?;
        let leader = IntGauge::new("operator_leader", "Whether this replica holds the leader lease")?;
        let build_info = IntGaugeVec::new(
            Opts::new("operator_build_info", "Build information"),
            &["version"],
        )?;
        build_info.with_label_values(&[env!("CARGO_PKG_VERSION")]).set(1);

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(failures.clone()))?;
        registry.register(Box::new(leader.clone()))?;
        registry.register(Box::new(build_info))?;
        Ok(Self {
            registry,
            reconciliations,
            failures,
            leader,
        })
    }

    /// Counters scoped to a single controller.
    #[must_use]
    pub fn controller(&self, name: &str) -> ControllerMetrics {
        ControllerMetrics {
            reconciliations: self.reconciliations.with_label_values(&[name]),
            failures: self.failures.with_label_values(&[name]),
        }
    }

    pub(crate) fn set_leader(&self, leading: bool) {
        self.leader.set(i64::from(leading));
    }

    /// Render all families in the prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(err) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %err, "failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Reconcile counters of one controller
#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    reconciliations: IntCounter,
    failures: IntCounter,
}

impl ControllerMetrics {
    /// Count a finished reconciliation.
    pub fn reconciled(&self) {
        self.reconciliations.inc();
    }

    /// Count a failed reconciliation.
    pub fn failed(&self) {
        self.failures.inc();
    }
}

/// Serve `/metrics` and `/healthz` on `addr` until `shutdown` fires.
pub(crate) async fn serve(addr: SocketAddr, metrics: Arc<Metrics>, shutdown: CancellationToken) -> Result<(), Error> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| Error::Bind { addr, source })?;
    tracing::info!(%addr, "serving metrics");
    let app = Router::new()
        .route("/metrics", get(render))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(metrics);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(Error::Serve)
}

async fn render(State(metrics): State<Arc<Metrics>>) -> (StatusCode, String) {
    (StatusCode::OK, metrics.render())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_counters_are_labelled() {
        let metrics = Metrics::new().unwrap();
        let contour = metrics.controller("contour");
        contour.reconciled();
        contour.reconciled();
        contour.failed();
        metrics.set_leader(true);

        let text = metrics.render();
        assert!(text.contains(r#"operator_reconcile_total{controller="contour"} 2"#));
        assert!(text.contains(r#"operator_reconcile_errors_total{controller="contour"} 1"#));
        assert!(text.contains("operator_leader 1"));
        assert!(text.contains("operator_build_info"));
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve("127.0.0.1:0".parse().unwrap(), metrics, shutdown.clone()));
        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
