//! Prometheus metrics for the page runtime.
//!
//! Counters and histograms are recorded through the `metrics` facade, so they
//! cost nothing until a recorder is installed. [`MetricsExporter`] installs a
//! Prometheus recorder and renders the text exposition format on demand; the
//! host decides where to ship it.
//!
//! # Example
//!
//! ```rust,no_run
//! use raxm_runtime::metrics::MetricsExporter;
//!
//! let mut exporter = MetricsExporter::new();
//! exporter.install()?;
//! // ... run the page ...
//! if let Some(text) = exporter.render() {
//!     println!("{text}");
//! }
//! # Ok::<(), raxm_runtime::metrics::MetricsError>(())
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

/// Requests sent to the server
pub const MESSAGES_SENT: &str = "raxm_messages_sent_total";
/// Requests that ended in a failure (transport, non-2xx, dump, bad patch)
pub const MESSAGES_FAILED: &str = "raxm_messages_failed_total";
/// HTTP 419 responses
pub const SESSION_EXPIRED: &str = "raxm_session_expired_total";
/// Responses dropped because their component was gone
pub const PATCHES_DISCARDED: &str = "raxm_patches_discarded_total";
/// DOM mutations applied by morphs
pub const MORPH_MUTATIONS: &str = "raxm_morph_mutations_total";
/// Round-trip time of a message
pub const MESSAGE_DURATION: &str = "raxm_message_duration_seconds";

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

/// Prometheus recorder owner.
#[derive(Default)]
pub struct MetricsExporter {
    handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsExporter")
            .field("installed", &self.handle.is_some())
            .finish()
    }
}

impl MetricsExporter {
    /// An exporter with no recorder installed yet
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Register metric descriptions and install the global recorder.
    ///
    /// # Errors
    ///
    /// Returns an error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g. by another test), this logs a
    /// warning and succeeds without a handle; [`MetricsExporter::render`] then
    /// returns `None`.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                register_metrics();
                self.handle = Some(handle);
                tracing::info!("Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this exporter did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(MESSAGES_SENT, "Total number of messages sent to the server");
    describe_counter!(MESSAGES_FAILED, "Total number of messages that failed");
    describe_counter!(SESSION_EXPIRED, "Total number of session-expired (419) responses");
    describe_counter!(
        PATCHES_DISCARDED,
        "Total number of responses discarded because their component was removed"
    );
    describe_counter!(MORPH_MUTATIONS, "Total number of DOM mutations applied by morphs");
    describe_histogram!(MESSAGE_DURATION, "Message round-trip time in seconds");
}

/// Message lifecycle recorder.
pub struct MessageMetrics;

impl MessageMetrics {
    /// A message left for the server
    pub fn record_sent(component: &str) {
        counter!(MESSAGES_SENT, "component" => component.to_string()).increment(1);
    }

    /// A message completed (any outcome)
    pub fn record_completed(component: &str, elapsed: Duration) {
        histogram!(MESSAGE_DURATION, "component" => component.to_string()).record(elapsed.as_secs_f64());
    }

    /// A message failed
    pub fn record_failed(component: &str, reason: &'static str) {
        counter!(MESSAGES_FAILED, "component" => component.to_string(), "reason" => reason).increment(1);
    }

    /// A 419 arrived
    pub fn record_session_expired() {
        counter!(SESSION_EXPIRED).increment(1);
    }

    /// A late response was dropped
    pub fn record_discarded() {
        counter!(PATCHES_DISCARDED).increment(1);
    }

    /// A morph applied `count` mutations
    pub fn record_morph(count: u64) {
        counter!(MORPH_MUTATIONS).increment(count);
    }
}
