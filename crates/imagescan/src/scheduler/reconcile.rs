//! Reconciliation with the remote authority

use super::Controller;
use crate::delta::ImageKey;
use crate::error::ScanFailure;
use crate::health::components;
use crate::remote::{ImageScanStatus, ImageStatusEntry, StatusReport, SyncStateQuery};
use chrono::{DateTime, Duration, Utc};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Unscanned images are re-checked with the remote authority at most this often
pub const REMOTE_SYNC_WINDOW_MINUTES: i64 = 10;

impl Controller {
    /// Ask the remote authority about unscanned images not checked recently
    pub(super) async fn sync_remote_state(
        &mut self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) {
        let keys = self
            .delta
            .images_needing_remote_sync(now, Duration::minutes(REMOTE_SYNC_WINDOW_MINUTES));
        if keys.is_empty() {
            return;
        }

        // Keys are sorted by id, so architectures of one digest are adjacent.
        let mut image_ids: Vec<String> = keys.iter().map(|k| k.id.clone()).collect();
        image_ids.dedup();

        let query = SyncStateQuery { image_ids };
        let Some(state) = self
            .call_remote(
                "sync_state",
                keys.len(),
                self.remote.query_sync_state(query),
                cancel,
            )
            .await
        else {
            return;
        };

        self.delta.mark_remote_synced(&keys, now);
        let marked: usize = state
            .scanned_images
            .iter()
            .map(|scanned| self.delta.mark_scanned_from_remote(scanned))
            .sum();
        if state.full_resync_required {
            self.full_snapshot_sent = false;
        }
        info!(
            full_resync = state.full_resync_required,
            scanned_images = state.scanned_images.len(),
            marked = marked,
            "Images updated from remote state"
        );
    }

    /// Send the batched status report: every image until a full snapshot
    /// went through, then only images whose owners changed since.
    pub(super) async fn send_status_report(
        &mut self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) {
        let full_snapshot = !self.full_snapshot_sent;
        let keys = self.delta.images_for_status_report(full_snapshot);
        if keys.is_empty() {
            return;
        }

        let images = keys
            .iter()
            .filter_map(|key| self.delta.image(key))
            .map(|image| ImageStatusEntry {
                id: image.id.clone(),
                architecture: image.architecture.clone(),
                name: image.name.clone(),
                resource_ids: image.owner_ids(),
                status: image.is_pending(now).then_some(ImageScanStatus::Pending),
                error_message: None,
            })
            .collect();
        let report = StatusReport {
            full_snapshot,
            images,
        };

        if self
            .call_remote(
                "status_report",
                keys.len(),
                self.remote.post_status_report(report),
                cancel,
            )
            .await
            .is_none()
        {
            return;
        }

        self.delta.mark_reported(&keys, now);
        self.full_snapshot_sent = true;
        self.metrics.inc_status_reports(full_snapshot);
    }

    /// Report a single failed image right away
    pub(super) async fn report_scan_failure(
        &self,
        key: &ImageKey,
        failure: &ScanFailure,
        cancel: &CancellationToken,
    ) {
        let Some(image) = self.delta.image(key) else {
            return;
        };
        let report = StatusReport {
            full_snapshot: false,
            images: vec![ImageStatusEntry {
                id: image.id.clone(),
                architecture: image.architecture.clone(),
                name: image.name.clone(),
                resource_ids: image.owner_ids(),
                status: Some(ImageScanStatus::Error),
                error_message: Some(failure.message().to_string()),
            }],
        };

        self.call_remote(
            "failed_status",
            1,
            self.remote.post_status_report(report),
            cancel,
        )
        .await;
    }

    /// Run a remote call under the remote timeout and track its health.
    /// Cancellation abandons the call without touching health.
    async fn call_remote<T>(
        &self,
        operation: &str,
        images: usize,
        call: impl Future<Output = anyhow::Result<T>>,
        cancel: &CancellationToken,
    ) -> Option<T> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(operation = %operation, "Remote call cancelled");
                return None;
            }
            result = tokio::time::timeout(self.config.remote_timeout(), call) => result,
        };
        let error = match result {
            Ok(Ok(value)) => {
                self.health.set_healthy(components::REMOTE_SYNC).await;
                self.logger.log_remote_sync(operation, true, images, None);
                return Some(value);
            }
            Ok(Err(e)) => format!("{e:#}"),
            Err(_) => format!(
                "timed out after {}s",
                self.config.remote_timeout().as_secs()
            ),
        };

        self.logger
            .log_remote_sync(operation, false, images, Some(&error));
        self.health
            .set_degraded(components::REMOTE_SYNC, format!("{operation}: {error}"))
            .await;
        None
    }
}
