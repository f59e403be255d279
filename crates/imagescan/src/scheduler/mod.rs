//! Scan scheduler
//!
//! The [`Controller`] is the single owner of the delta state. It applies
//! queued cluster events as they arrive and, on every scan tick, runs one
//! scheduling pass:
//!
//! 1. Reconcile unscanned images with the remote authority
//! 2. Report image status (full snapshot first, then owner changes only)
//! 3. Select pending images, fresh ones before those in backoff
//! 4. Place and dispatch the batch concurrently, then apply the results
//!
//! Passes never overlap: the batch is joined before the loop resumes.

mod placement;
mod reconcile;


pub use placement::{resolve_placement, ManagedNodeLabel, Placement};

use crate::clock::{Clock, SystemClock};
use crate::config::{ScanConfig, ScanResources};
use crate::delta::{DeltaState, ImageKey};
use crate::error::{QueueClosed, ScanFailure, SchedulerError};
use crate::events::{event_queue, EventReceiver, EventSender};
use crate::executor::{AgentImage, CompletionPolicy, ScanExecutor, ScanMode, ScanRequest};
use crate::health::{components, HealthRegistry};
use crate::observability::{scan_status, NoopScanMetrics, ScanMetrics, StructuredLogger};
use crate::remote::{RemoteAuthority, ScannedImage};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pending full resync payloads
const FULL_RESYNC_CAPACITY: usize = 3;

/// Producer side of a running controller
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    events: EventSender,
    full_resync: mpsc::Sender<Vec<ScannedImage>>,
}

impl ControllerHandle {
    /// Sender for cluster events
    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    /// Replace the whole image state with the remote authority's scanned list
    pub async fn observe_full_resync(&self, images: Vec<ScannedImage>) -> Result<(), QueueClosed> {
        self.full_resync.send(images).await.map_err(|_| QueueClosed)
    }
}

/// Builder for the scan controller
pub struct ControllerBuilder {
    config: ScanConfig,
    clock: Arc<dyn Clock>,
    executor: Option<Arc<dyn ScanExecutor>>,
    remote: Option<Arc<dyn RemoteAuthority>>,
    metrics: Arc<dyn ScanMetrics>,
    health: HealthRegistry,
    scanned_images: Vec<ScannedImage>,
}

impl ControllerBuilder {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            executor: None,
            remote: None,
            metrics: Arc::new(NoopScanMetrics),
            health: HealthRegistry::new(),
            scanned_images: Vec::new(),
        }
    }

    /// Set the scan execution backend
    pub fn executor(mut self, executor: Arc<dyn ScanExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Set the remote authority client
    pub fn remote(mut self, remote: Arc<dyn RemoteAuthority>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn ScanMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Seed the state with images the remote authority already scanned
    pub fn scanned_images(mut self, images: Vec<ScannedImage>) -> Self {
        self.scanned_images = images;
        self
    }

    /// Build the controller and the handle producers use to feed it
    pub fn build(self) -> Result<(Controller, ControllerHandle)> {
        let executor = self
            .executor
            .ok_or_else(|| anyhow::anyhow!("Scan executor is required"))?;
        let remote = self
            .remote
            .ok_or_else(|| anyhow::anyhow!("Remote authority is required"))?;
        let resources = self.config.validate()?;

        let (events_tx, events_rx) = event_queue(self.config.queue_capacity);
        let (resync_tx, resync_rx) = mpsc::channel(FULL_RESYNC_CAPACITY);

        let controller = Controller {
            delta: DeltaState::new(self.clock, &self.scanned_images),
            events: events_rx,
            full_resync: resync_rx,
            executor,
            remote,
            metrics: self.metrics,
            health: self.health,
            logger: StructuredLogger::new(&self.config.cluster_id),
            managed_label: ManagedNodeLabel {
                key: self.config.managed_node_label.clone(),
                value: self.config.managed_node_label_value.clone(),
            },
            seeded_images: self.scanned_images.len(),
            config: self.config,
            resources,
            full_snapshot_sent: false,
        };
        let handle = ControllerHandle {
            events: events_tx,
            full_resync: resync_tx,
        };
        Ok((controller, handle))
    }
}

/// How a dispatched scan ended
#[derive(Debug)]
enum ScanOutcome {
    Succeeded,
    Failed(ScanFailure),
    Cancelled,
}

#[derive(Debug)]
struct ScanResult {
    key: ImageKey,
    image_name: String,
    mode: ScanMode,
    duration: Duration,
    outcome: ScanOutcome,
}

/// The scan scheduling loop
pub struct Controller {
    delta: DeltaState,
    events: EventReceiver,
    full_resync: mpsc::Receiver<Vec<ScannedImage>>,
    executor: Arc<dyn ScanExecutor>,
    remote: Arc<dyn RemoteAuthority>,
    metrics: Arc<dyn ScanMetrics>,
    health: HealthRegistry,
    logger: StructuredLogger,
    managed_label: ManagedNodeLabel,
    seeded_images: usize,
    config: ScanConfig,
    resources: ScanResources,
    full_snapshot_sent: bool,
}

impl Controller {
    /// Read access to the delta state
    pub fn delta(&self) -> &DeltaState {
        &self.delta
    }

    /// Run until `cancel` fires.
    ///
    /// Events are applied exclusively during the initial delay so the first
    /// pass sees a warm view of nodes and owners.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        self.health.register_all(&components::ALL).await;
        self.logger.log_startup(
            self.config.mode,
            self.config.max_concurrent_scans,
            self.seeded_images,
        );

        let mut events_open = true;

        let initial_delay = tokio::time::sleep(self.config.init_delay());
        tokio::pin!(initial_delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.logger.log_shutdown("cancelled during initial delay");
                    return Ok(());
                }
                event = self.events.recv(), if events_open => match event {
                    Some(event) => self.delta.apply(event),
                    None => events_open = self.on_queue_closed().await,
                },
                Some(images) = self.full_resync.recv() => self.apply_full_resync(images),
                _ = &mut initial_delay => break,
            }
        }

        self.health.set_ready(true).await;
        info!(
            images = self.delta.image_count(),
            nodes = self.delta.node_count(),
            "Initial delay finished, starting image scans"
        );

        let interval = self.config.scan_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = self.events.recv(), if events_open => match event {
                    Some(event) => self.delta.apply(event),
                    None => events_open = self.on_queue_closed().await,
                },
                Some(images) = self.full_resync.recv() => self.apply_full_resync(images),
                _ = ticker.tick() => {
                    match self.run_pass(&cancel).await {
                        Ok(()) => self.health.set_healthy(components::SCHEDULER).await,
                        Err(e) => {
                            error!(error = %e, "Image scan pass failed");
                            self.health
                                .set_degraded(components::SCHEDULER, e.to_string())
                                .await;
                        }
                    }
                }
            }
        }

        self.health.set_ready(false).await;
        self.logger.log_shutdown("cancelled");
        Ok(())
    }

    async fn on_queue_closed(&self) -> bool {
        warn!("Event queue closed, no further cluster updates will be applied");
        self.health
            .set_unhealthy(components::EVENT_QUEUE, "all event producers dropped")
            .await;
        false
    }

    fn apply_full_resync(&mut self, images: Vec<ScannedImage>) {
        // An empty list carries no state to rebuild from.
        if images.is_empty() {
            debug!("Ignoring empty full resync");
            return;
        }
        self.delta.replace_images(&images);
        self.logger.log_full_resync(images.len());
    }

    /// One scheduling pass. Per image failures are absorbed; only errors
    /// that make the whole batch impossible are returned.
    pub async fn run_pass(&mut self, cancel: &CancellationToken) -> Result<(), SchedulerError> {
        let now = self.delta.now();
        self.sync_remote_state(now, cancel).await;
        if cancel.is_cancelled() {
            debug!("Pass cancelled before status report");
            return Ok(());
        }
        self.send_status_report(now, cancel).await;
        if cancel.is_cancelled() {
            debug!("Pass cancelled before dispatch");
            return Ok(());
        }

        let pending = self.delta.pending_images(now);
        self.metrics.set_total_images(self.delta.image_count());
        self.metrics.set_pending_images(pending.len());
        info!(
            images = self.delta.image_count(),
            pending = pending.len(),
            "Found images"
        );
        let private_images = self.delta.private_image_count();
        if private_images > 0 {
            warn!(count = private_images, "Skipping private images");
        }

        let batch: Vec<ImageKey> = pending.into_iter().take(self.concurrency_budget()).collect();
        if batch.is_empty() {
            debug!("Skipping image scan, no pending images");
            return Ok(());
        }

        info!(count = batch.len(), "Scheduling image scans");
        self.scan_images(batch, cancel).await?;
        info!("Image scan batch finished");
        Ok(())
    }

    /// Scans allowed per pass. A single node cluster runs one at a time.
    fn concurrency_budget(&self) -> usize {
        if self.delta.node_count() == 1 {
            1
        } else {
            self.config.max_concurrent_scans
        }
    }

    fn resolve_agent_image(&self) -> Result<AgentImage, SchedulerError> {
        self.delta
            .agent_image(
                &self.config.agent_namespace,
                &self.config.agent_deployment,
                &self.config.agent_container,
            )
            .ok_or_else(|| SchedulerError::AgentImageNotFound {
                namespace: self.config.agent_namespace.clone(),
                name: self.config.agent_deployment.clone(),
                container: self.config.agent_container.clone(),
            })
    }

    async fn scan_images(
        &mut self,
        batch: Vec<ImageKey>,
        cancel: &CancellationToken,
    ) -> Result<(), SchedulerError> {
        for key in &batch {
            if let Some(image) = self.delta.image(key) {
                if image.name.is_empty() {
                    return Err(SchedulerError::MissingImageName {
                        image_id: image.id.clone(),
                    });
                }
            }
        }
        let agent_image = self.resolve_agent_image()?;
        let timeout = self.config.scan_timeout();

        let mut scans = JoinSet::new();
        for key in batch {
            let Some(image) = self.delta.image(&key) else {
                continue;
            };

            let placement = match resolve_placement(
                &self.delta,
                image,
                self.config.mode,
                &self.managed_label,
                self.resources,
            ) {
                Ok(placement) => placement,
                Err(e) => {
                    self.logger
                        .log_placement_failed(&image.name, self.config.mode, &e.to_string());
                    continue;
                }
            };

            let request = ScanRequest {
                image_name: image.name.clone(),
                image_id: image.id.clone(),
                container_runtime: image.container_runtime,
                mode: placement.mode,
                resource_ids: image.owner_ids(),
                node_name: placement.node_name,
                architecture: image.architecture.clone(),
                os: image.os.clone(),
                agent_image: agent_image.clone(),
                completion: CompletionPolicy::default(),
            };
            self.logger.log_scan_started(
                &request.image_name,
                &request.image_id,
                &request.node_name,
                request.mode,
            );

            let executor = Arc::clone(&self.executor);
            let token = cancel.child_token();
            scans.spawn(async move {
                let image_name = request.image_name.clone();
                let mode = request.mode;
                let started = Instant::now();

                let outcome = tokio::select! {
                    biased;
                    _ = token.cancelled() => ScanOutcome::Cancelled,
                    result = tokio::time::timeout(timeout, executor.scan_image(request)) => match result {
                        Ok(Ok(())) => ScanOutcome::Succeeded,
                        Ok(Err(failure)) => ScanOutcome::Failed(failure),
                        Err(_) => ScanOutcome::Failed(ScanFailure::Other(format!(
                            "scan timed out after {}s",
                            timeout.as_secs()
                        ))),
                    },
                };

                ScanResult {
                    key,
                    image_name,
                    mode,
                    duration: started.elapsed(),
                    outcome,
                }
            });
        }

        while let Some(joined) = scans.join_next().await {
            match joined {
                Ok(result) => self.apply_scan_result(result, cancel).await,
                Err(e) => error!(error = %e, "Scan task failed to complete"),
            }
        }
        Ok(())
    }

    async fn apply_scan_result(&mut self, result: ScanResult, cancel: &CancellationToken) {
        let duration_secs = result.duration.as_secs_f64();
        match result.outcome {
            ScanOutcome::Succeeded => {
                self.metrics.inc_scans_total(result.mode, scan_status::OK);
                self.metrics.observe_scan_duration(result.mode, duration_secs);
                self.logger
                    .log_scan_finished(&result.image_name, result.mode, duration_secs);
                self.delta.mark_scanned(&result.key);
            }
            ScanOutcome::Failed(failure) => {
                self.metrics.inc_scans_total(result.mode, scan_status::ERROR);
                self.metrics.observe_scan_duration(result.mode, duration_secs);
                self.logger.log_scan_failed(
                    &result.image_name,
                    result.mode,
                    failure.kind(),
                    failure.message(),
                );
                self.delta.set_image_scan_error(&result.key, failure.clone());
                if !cancel.is_cancelled() {
                    self.report_scan_failure(&result.key, &failure, cancel).await;
                }
            }
            ScanOutcome::Cancelled => {
                debug!(image = %result.image_name, "Image scan cancelled");
            }
        }
    }
}
