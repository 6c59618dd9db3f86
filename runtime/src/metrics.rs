//! Prometheus metrics for the delivery layer.
//!
//! Registers descriptions for every operator-visible transition (outbox
//! publish/fail/exhaust, consumer ack/requeue/dead-letter/reject) and
//! exposes them on an HTTP endpoint for scraping.
//!
//! # Example
//!
//! ```rust,no_run
//! use steadfast_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Initialize metrics and start the HTTP exporter.
    ///
    /// # Errors
    ///
    /// Returns error if the metrics exporter cannot be installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), the
    /// existing recorder is kept and this call succeeds with a warning.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new();

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!(
                        "Metrics recorder already initialized, skipping re-initialization"
                    );
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Outbox / relay
    describe_counter!(
        "outbox.published",
        "Outbox records confirmed delivered to the broker"
    );
    describe_counter!(
        "outbox.publish_failed",
        "Outbox publish attempts that exhausted the publish pipeline"
    );
    describe_gauge!(
        "outbox.pending",
        "Unpublished outbox records still under the retry cap"
    );
    describe_gauge!(
        "outbox.exhausted",
        "Outbox records stuck past the retry cap, awaiting manual intervention"
    );

    // Publish pipeline
    describe_counter!(
        "delivery.publish.confirmed",
        "Broker-acknowledged publishes"
    );
    describe_counter!(
        "delivery.publish.exhausted",
        "Publish pipelines that surfaced a terminal failure"
    );

    // Consumer
    describe_counter!("consumer.handled", "Messages acknowledged after handling");
    describe_counter!(
        "consumer.requeued",
        "Messages negatively acknowledged with requeue"
    );
    describe_counter!(
        "consumer.dead_lettered",
        "Messages written to the dead-letter sink"
    );
    describe_counter!(
        "consumer.rejected",
        "Messages rejected as permanently undecodable"
    );

    // Dead-letter sink
    describe_counter!("dead_letter.recorded", "Dead-letter records persisted");
    describe_counter!(
        "dead_letter.resolved",
        "Dead-letter records manually resolved"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_construction_is_cheap() {
        let addr: SocketAddr = match "127.0.0.1:9090".parse() {
            Ok(addr) => addr,
            Err(_) => return,
        };
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }
}
