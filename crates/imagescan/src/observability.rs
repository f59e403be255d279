//! Observability for the scan scheduler
//!
//! Provides:
//! - Prometheus metrics (scan outcomes, scan duration, image counts, status reports)
//! - Structured JSON logging with tracing

use crate::executor::ScanMode;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounterVec, IntGauge, Registry};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Histogram buckets for scan durations (in seconds)
const SCAN_DURATION_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Scan outcome label values
pub mod scan_status {
    pub const OK: &str = "ok";
    pub const ERROR: &str = "error";
}

/// Metrics sink for the scheduler
pub trait ScanMetrics: Send + Sync {
    /// Count a finished scan attempt
    fn inc_scans_total(&self, mode: ScanMode, status: &str);

    fn observe_scan_duration(&self, mode: ScanMode, duration_secs: f64);

    /// Images currently tracked
    fn set_total_images(&self, count: usize);

    /// Images waiting to be scanned
    fn set_pending_images(&self, count: usize);

    fn inc_status_reports(&self, full_snapshot: bool);
}

/// Metrics sink that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopScanMetrics;

impl ScanMetrics for NoopScanMetrics {
    fn inc_scans_total(&self, _mode: ScanMode, _status: &str) {}
    fn observe_scan_duration(&self, _mode: ScanMode, _duration_secs: f64) {}
    fn set_total_images(&self, _count: usize) {}
    fn set_pending_images(&self, _count: usize) {}
    fn inc_status_reports(&self, _full_snapshot: bool) {}
}

/// Prometheus backed scan metrics
///
/// Metrics are registered on the registry passed in, so several schedulers
/// (or tests) never collide on the process-wide default registry.
#[derive(Clone)]
pub struct PrometheusScanMetrics {
    scans_total: IntCounterVec,
    scan_duration_seconds: HistogramVec,
    images: IntGauge,
    pending_images: IntGauge,
    status_reports_total: IntCounterVec,
}

impl PrometheusScanMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let scans_total = IntCounterVec::new(
            opts!("imagescan_scans_total", "Image scans by mode and outcome"),
            &["scan_type", "scan_status"],
        )?;
        let scan_duration_seconds = HistogramVec::new(
            histogram_opts!(
                "imagescan_scan_duration_seconds",
                "Time spent running an image scan",
                SCAN_DURATION_BUCKETS.to_vec()
            ),
            &["scan_type"],
        )?;
        let images = IntGauge::new("imagescan_images", "Images tracked by the scheduler")?;
        let pending_images =
            IntGauge::new("imagescan_pending_images", "Images waiting to be scanned")?;
        let status_reports_total = IntCounterVec::new(
            opts!(
                "imagescan_status_reports_total",
                "Image status reports sent to the remote authority"
            ),
            &["snapshot"],
        )?;

        registry.register(Box::new(scans_total.clone()))?;
        registry.register(Box::new(scan_duration_seconds.clone()))?;
        registry.register(Box::new(images.clone()))?;
        registry.register(Box::new(pending_images.clone()))?;
        registry.register(Box::new(status_reports_total.clone()))?;

        Ok(Self {
            scans_total,
            scan_duration_seconds,
            images,
            pending_images,
            status_reports_total,
        })
    }
}

impl ScanMetrics for PrometheusScanMetrics {
    fn inc_scans_total(&self, mode: ScanMode, status: &str) {
        let mode = mode.to_string();
        self.scans_total
            .with_label_values(&[mode.as_str(), status])
            .inc();
    }

    fn observe_scan_duration(&self, mode: ScanMode, duration_secs: f64) {
        let mode = mode.to_string();
        self.scan_duration_seconds
            .with_label_values(&[mode.as_str()])
            .observe(duration_secs);
    }

    fn set_total_images(&self, count: usize) {
        self.images.set(count as i64);
    }

    fn set_pending_images(&self, count: usize) {
        self.pending_images.set(count as i64);
    }

    fn inc_status_reports(&self, full_snapshot: bool) {
        let snapshot = if full_snapshot { "full" } else { "delta" };
        self.status_reports_total
            .with_label_values(&[snapshot])
            .inc();
    }
}

/// Install the global JSON tracing subscriber.
///
/// `RUST_LOG` overrides `default_filter`.
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_filter))?;
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

/// Structured logger for scheduler events
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    cluster_id: String,
}

impl StructuredLogger {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
        }
    }

    pub fn log_startup(&self, mode: ScanMode, max_concurrent_scans: usize, seeded_images: usize) {
        info!(
            event = "scheduler_started",
            cluster = %self.cluster_id,
            mode = %mode,
            max_concurrent_scans = max_concurrent_scans,
            seeded_images = seeded_images,
            "Image scan scheduler started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "scheduler_shutdown",
            cluster = %self.cluster_id,
            reason = %reason,
            "Image scan scheduler shutting down"
        );
    }

    pub fn log_scan_started(&self, image: &str, image_id: &str, node: &str, mode: ScanMode) {
        info!(
            event = "scan_started",
            cluster = %self.cluster_id,
            image = %image,
            image_id = %image_id,
            node = %node,
            mode = %mode,
            "Scanning image"
        );
    }

    pub fn log_scan_finished(&self, image: &str, mode: ScanMode, duration_secs: f64) {
        info!(
            event = "scan_finished",
            cluster = %self.cluster_id,
            image = %image,
            mode = %mode,
            duration_secs = duration_secs,
            "Image scan finished"
        );
    }

    pub fn log_scan_failed(&self, image: &str, mode: ScanMode, kind: &str, error: &str) {
        warn!(
            event = "scan_failed",
            cluster = %self.cluster_id,
            image = %image,
            mode = %mode,
            kind = %kind,
            error = %error,
            "Image scan failed"
        );
    }

    pub fn log_placement_failed(&self, image: &str, mode: ScanMode, reason: &str) {
        warn!(
            event = "placement_failed",
            cluster = %self.cluster_id,
            image = %image,
            mode = %mode,
            reason = %reason,
            "No node available for image scan"
        );
    }

    /// Log the outcome of a status report or sync query
    pub fn log_remote_sync(&self, operation: &str, ok: bool, images: usize, error: Option<&str>) {
        if ok {
            info!(
                event = "remote_sync",
                cluster = %self.cluster_id,
                operation = %operation,
                images = images,
                "Remote sync succeeded"
            );
        } else {
            warn!(
                event = "remote_sync",
                cluster = %self.cluster_id,
                operation = %operation,
                images = images,
                error = error.unwrap_or_default(),
                "Remote sync failed"
            );
        }
    }

    pub fn log_full_resync(&self, images: usize) {
        info!(
            event = "full_resync",
            cluster = %self.cluster_id,
            images = images,
            "Replaced image state from remote authority"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Encoder;

    #[test]
    fn test_prometheus_metrics_exposed() {
        let registry = Registry::new();
        let metrics = PrometheusScanMetrics::new(&registry).unwrap();

        metrics.inc_scans_total(ScanMode::HostFs, scan_status::OK);
        metrics.inc_scans_total(ScanMode::Remote, scan_status::ERROR);
        metrics.observe_scan_duration(ScanMode::HostFs, 1.5);
        metrics.set_total_images(7);
        metrics.set_pending_images(2);
        metrics.inc_status_reports(true);

        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();

        assert!(text.contains(r#"imagescan_scans_total{scan_status="ok",scan_type="hostfs"} 1"#));
        assert!(text.contains(r#"imagescan_scans_total{scan_status="error",scan_type="remote"} 1"#));
        assert!(text.contains("imagescan_images 7"));
        assert!(text.contains("imagescan_pending_images 2"));
        assert!(text.contains(r#"imagescan_status_reports_total{snapshot="full"} 1"#));
    }

    #[test]
    fn test_registering_twice_on_one_registry_fails() {
        let registry = Registry::new();
        assert!(PrometheusScanMetrics::new(&registry).is_ok());
        assert!(PrometheusScanMetrics::new(&registry).is_err());
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("cluster-1");
        assert_eq!(logger.cluster_id, "cluster-1");
    }
}
