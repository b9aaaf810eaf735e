//! Metric handles and text exposition.
//!
//! All series live in one [`Metrics`] handle constructed at service start and
//! passed down to the components that record into it; there is no global
//! registry.

use std::sync::Arc;

use prometheus::{
    histogram_opts, Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

use crate::{CubicleError, CubicleResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Duration buckets shared by exec and HTTP histograms, in seconds.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The control plane's metric series.
pub struct Metrics {
    registry: Registry,

    /// Sandboxes created since process start.
    pub sandbox_created_total: IntCounter,

    /// Sandboxes currently alive (not destroyed).
    pub sandbox_active: IntGauge,

    /// Executions per sandbox and command.
    pub sandbox_exec_total: IntCounterVec,

    /// Wall-clock duration of executions.
    pub sandbox_exec_duration_seconds: Histogram,

    /// Snapshots created since process start.
    pub snapshot_created_total: IntCounter,

    /// Snapshots restored since process start.
    pub snapshot_restored_total: IntCounter,

    /// Compressed snapshot payload sizes.
    pub snapshot_size_bytes: Histogram,

    /// HTTP requests by method, route template, and status.
    pub http_requests_total: IntCounterVec,

    /// Wall-clock duration of HTTP requests.
    pub http_request_duration_seconds: HistogramVec,

    /// Quota admission rejections by kind.
    pub quota_violations_total: IntCounterVec,

    /// Proxied preview requests currently in flight.
    pub preview_proxy_in_flight: IntGauge,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Metrics {
    /// Creates and registers every series on a fresh registry.
    pub fn new() -> CubicleResult<Arc<Self>> {
        let registry = Registry::new();

        let sandbox_created_total = IntCounter::with_opts(Opts::new(
            "sandbox_created_total",
            "Sandboxes created since process start",
        ))
        .map_err(CubicleError::custom)?;

        let sandbox_active = IntGauge::with_opts(Opts::new(
            "sandbox_active",
            "Sandboxes currently alive",
        ))
        .map_err(CubicleError::custom)?;

        let sandbox_exec_total = IntCounterVec::new(
            Opts::new("sandbox_exec_total", "Executions per sandbox and command"),
            &["sandbox", "command"],
        )
        .map_err(CubicleError::custom)?;

        let sandbox_exec_duration_seconds = Histogram::with_opts(histogram_opts!(
            "sandbox_exec_duration_seconds",
            "Wall-clock duration of executions",
            DURATION_BUCKETS.to_vec()
        ))
        .map_err(CubicleError::custom)?;

        let snapshot_created_total = IntCounter::with_opts(Opts::new(
            "snapshot_created_total",
            "Snapshots created since process start",
        ))
        .map_err(CubicleError::custom)?;

        let snapshot_restored_total = IntCounter::with_opts(Opts::new(
            "snapshot_restored_total",
            "Snapshots restored since process start",
        ))
        .map_err(CubicleError::custom)?;

        let snapshot_size_bytes = Histogram::with_opts(histogram_opts!(
            "snapshot_size_bytes",
            "Compressed snapshot payload sizes",
            size_buckets()
        ))
        .map_err(CubicleError::custom)?;

        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "http_requests_total",
                "HTTP requests by method, route, and status",
            ),
            &["method", "path", "status"],
        )
        .map_err(CubicleError::custom)?;

        let http_request_duration_seconds = HistogramVec::new(
            histogram_opts!(
                "http_request_duration_seconds",
                "Wall-clock duration of HTTP requests",
                DURATION_BUCKETS.to_vec()
            ),
            &["method", "path"],
        )
        .map_err(CubicleError::custom)?;

        let quota_violations_total = IntCounterVec::new(
            Opts::new("quota_violations_total", "Quota admission rejections"),
            &["kind"],
        )
        .map_err(CubicleError::custom)?;

        let preview_proxy_in_flight = IntGauge::with_opts(Opts::new(
            "preview_proxy_in_flight",
            "Proxied preview requests currently in flight",
        ))
        .map_err(CubicleError::custom)?;

        for collector in [
            Box::new(sandbox_created_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(sandbox_active.clone()),
            Box::new(sandbox_exec_total.clone()),
            Box::new(sandbox_exec_duration_seconds.clone()),
            Box::new(snapshot_created_total.clone()),
            Box::new(snapshot_restored_total.clone()),
            Box::new(snapshot_size_bytes.clone()),
            Box::new(http_requests_total.clone()),
            Box::new(http_request_duration_seconds.clone()),
            Box::new(quota_violations_total.clone()),
            Box::new(preview_proxy_in_flight.clone()),
        ] {
            registry.register(collector).map_err(CubicleError::custom)?;
        }

        Ok(Arc::new(Self {
            registry,
            sandbox_created_total,
            sandbox_active,
            sandbox_exec_total,
            sandbox_exec_duration_seconds,
            snapshot_created_total,
            snapshot_restored_total,
            snapshot_size_bytes,
            http_requests_total,
            http_request_duration_seconds,
            quota_violations_total,
            preview_proxy_in_flight,
        }))
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn render(&self) -> CubicleResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(CubicleError::custom)?;
        String::from_utf8(buffer).map_err(CubicleError::custom)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Powers-of-two size buckets from 4 KiB to 1 GiB.
fn size_buckets() -> Vec<f64> {
    let mut buckets = Vec::new();
    let mut size = 4096u64;
    while size <= 1024 * 1024 * 1024 {
        buckets.push(size as f64);
        size *= 2;
    }
    buckets
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_buckets_span_4k_to_1g() {
        let buckets = size_buckets();
        assert_eq!(buckets.first().copied(), Some(4096.0));
        assert_eq!(buckets.last().copied(), Some(1024.0 * 1024.0 * 1024.0));
        assert_eq!(buckets.len(), 19);
    }

    #[test]
    fn test_render_exposition() -> anyhow::Result<()> {
        let metrics = Metrics::new()?;
        metrics.sandbox_created_total.inc();
        metrics.sandbox_active.set(1);
        metrics
            .quota_violations_total
            .with_label_values(&["concurrent_exec"])
            .inc();

        let text = metrics.render()?;
        assert!(text.contains("# HELP sandbox_created_total"));
        assert!(text.contains("# TYPE sandbox_created_total counter"));
        assert!(text.contains("sandbox_created_total 1"));
        assert!(text.contains("quota_violations_total{kind=\"concurrent_exec\"} 1"));
        Ok(())
    }
}
