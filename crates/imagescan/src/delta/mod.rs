//! Delta state: the live view of images, owners and node capacity
//!
//! The state is built from an unordered stream of cluster events and is
//! owned by the scheduler task alone. Producers never touch it directly;
//! they go through the event queue.

mod image;
mod node;
mod owner;


pub use image::{Image, ImageKey, OwnerChanges, DEFAULT_ARCHITECTURE, DEFAULT_OS};
pub use node::{Node, PodRequests};
pub use owner::{selector_matches, OwnerCache};

use crate::clock::Clock;
use crate::error::{PlacementError, ScanFailure};
use crate::events::{object_uid, ClusterEvent, ClusterObject, EventKind};
use crate::executor::{AgentImage, ContainerRuntime};
use crate::quantity::Quantity;
use crate::remote::ScannedImage;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::{Node as K8sNode, Pod};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

const POD_RUNNING: &str = "Running";
const POD_PENDING: &str = "Pending";

/// In-memory image/owner/node graph
pub struct DeltaState {
    clock: Arc<dyn Clock>,
    images: HashMap<ImageKey, Image>,
    nodes: HashMap<String, Node>,
    owners: OwnerCache,
    /// Set once any image fails with missing layers; host filesystem
    /// scans stay disabled for every image until restart.
    host_fs_disabled: bool,
}

impl DeltaState {
    /// Create the state, seeded with images the remote authority already scanned
    pub fn new(clock: Arc<dyn Clock>, scanned_images: &[ScannedImage]) -> Self {
        Self {
            clock,
            images: build_image_map(scanned_images),
            nodes: HashMap::new(),
            owners: OwnerCache::default(),
            host_fs_disabled: false,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Apply one queued cluster event
    pub fn apply(&mut self, event: ClusterEvent) {
        match event.kind {
            EventKind::Add | EventKind::Update => self.upsert(event.object),
            EventKind::Delete => self.delete(&event.object),
        }
    }

    pub fn upsert(&mut self, object: ClusterObject) {
        match object {
            ClusterObject::Pod(pod) => {
                self.upsert_images(&pod);
                self.update_node_usage_from_pod(&pod);
            }
            ClusterObject::Node(node) => self.update_node(&node),
            ClusterObject::ReplicaSet(rs) => self.owners.upsert_replica_set(rs),
            ClusterObject::Job(job) => self.owners.upsert_job(job),
            ClusterObject::Deployment(deployment) => self.owners.upsert_deployment(deployment),
        }
    }

    pub fn delete(&mut self, object: &ClusterObject) {
        match object {
            ClusterObject::Pod(pod) => self.handle_pod_delete(pod),
            ClusterObject::Node(node) => self.handle_node_delete(node),
            ClusterObject::ReplicaSet(rs) => self.owners.delete_replica_set(rs),
            ClusterObject::Job(job) => self.owners.delete_job(job),
            ClusterObject::Deployment(deployment) => self.owners.delete_deployment(deployment),
        }
    }

    /// Replace every tracked image with the remote authority's scanned set
    pub fn replace_images(&mut self, scanned_images: &[ScannedImage]) {
        self.images = build_image_map(scanned_images);
    }

    fn update_node(&mut self, k8s_node: &K8sNode) {
        let name = k8s_node.metadata.name.clone().unwrap_or_default();
        if name.is_empty() {
            return;
        }
        self.nodes
            .entry(name.clone())
            .or_insert_with(|| Node::new(name))
            .update_from(k8s_node);
    }

    fn update_node_usage_from_pod(&mut self, pod: &Pod) {
        let Some(node_name) = pod_node_name(pod) else {
            return;
        };
        let pod_id = object_uid(&pod.metadata);

        match pod_phase(pod) {
            POD_RUNNING | POD_PENDING => {
                let requests = pod
                    .spec
                    .as_ref()
                    .map(PodRequests::from_spec)
                    .unwrap_or_default();
                self.nodes
                    .entry(node_name.to_string())
                    .or_insert_with(|| Node::new(node_name))
                    .pods
                    .insert(pod_id, requests);
            }
            _ => {
                if let Some(node) = self.nodes.get_mut(node_name) {
                    node.pods.remove(&pod_id);
                }
            }
        }
    }

    fn upsert_images(&mut self, pod: &Pod) {
        // A running pod means its images are already on the node.
        if pod_phase(pod) != POD_RUNNING {
            return;
        }
        let (Some(spec), Some(status)) = (pod.spec.as_ref(), pod.status.as_ref()) else {
            return;
        };

        let pod_id = object_uid(&pod.metadata);
        let owner_id = self.owners.resolve_pod_owner(pod);
        let node_name = pod_node_name(pod).unwrap_or_default().to_string();
        let (architecture, os) = match self.nodes.get(&node_name) {
            Some(node) => (
                non_empty_or(&node.architecture, DEFAULT_ARCHITECTURE),
                non_empty_or(&node.os, DEFAULT_OS),
            ),
            None => (DEFAULT_ARCHITECTURE.to_string(), DEFAULT_OS.to_string()),
        };
        let now = self.clock.now();

        let containers = spec
            .containers
            .iter()
            .chain(spec.init_containers.iter().flatten());
        let statuses: Vec<_> = status
            .container_statuses
            .iter()
            .flatten()
            .chain(status.init_container_statuses.iter().flatten())
            .collect();

        for container in containers {
            let Some(container_status) = statuses.iter().find(|s| s.name == container.name) else {
                continue;
            };
            if container_status.image_id.is_empty() {
                continue;
            }
            let Some(image_name) = container.image.as_deref().filter(|i| !i.is_empty()) else {
                continue;
            };

            let key = ImageKey::new(&container_status.image_id, &architecture);
            let image = self
                .images
                .entry(key)
                .or_insert_with(|| Image::new(&container_status.image_id, &architecture));
            image.name = image_name.to_string();
            image.os = os.clone();
            image.container_runtime = container_status
                .container_id
                .as_deref()
                .and_then(ContainerRuntime::from_container_id);

            match image.owners.get_mut(&owner_id) {
                Some(pods) => {
                    pods.insert(pod_id.clone());
                }
                None => {
                    image
                        .owners
                        .insert(owner_id.clone(), [pod_id.clone()].into_iter().collect());
                    image.owner_changed_at = Some(now);
                    if image.scanned {
                        image.owner_changes.added.push(owner_id.clone());
                    }
                }
            }

            if !node_name.is_empty() {
                image
                    .nodes
                    .entry(node_name.clone())
                    .or_default()
                    .insert(pod_id.clone());
            }
        }
    }

    fn handle_pod_delete(&mut self, pod: &Pod) {
        let pod_id = object_uid(&pod.metadata);
        let now = self.clock.now();

        self.images.retain(|_, image| {
            image.nodes.retain(|_, pods| {
                pods.remove(&pod_id);
                !pods.is_empty()
            });

            let emptied: Vec<String> = image
                .owners
                .iter_mut()
                .filter_map(|(owner_id, pods)| {
                    (pods.remove(&pod_id) && pods.is_empty()).then(|| owner_id.clone())
                })
                .collect();
            for owner_id in emptied {
                image.owners.remove(&owner_id);
                image.owner_changed_at = Some(now);
                if image.scanned {
                    image.owner_changes.removed.push(owner_id);
                }
            }

            !image.is_unused()
        });

        for node in self.nodes.values_mut() {
            node.pods.remove(&pod_id);
        }
    }

    fn handle_node_delete(&mut self, k8s_node: &K8sNode) {
        let Some(name) = k8s_node.metadata.name.as_deref() else {
            return;
        };
        self.nodes.remove(name);
        self.images.retain(|_, image| {
            image.nodes.remove(name);
            !image.is_unused()
        });
    }

    pub fn images(&self) -> impl Iterator<Item = &Image> {
        self.images.values()
    }

    pub fn image(&self, key: &ImageKey) -> Option<&Image> {
        self.images.get(key)
    }

    #[cfg(test)]
    pub(crate) fn image_mut(&mut self, key: &ImageKey) -> Option<&mut Image> {
        self.images.get_mut(key)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    /// Names of every tracked node, sorted
    pub fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn host_fs_disabled(&self) -> bool {
        self.host_fs_disabled
    }

    pub fn mark_scanned(&mut self, key: &ImageKey) {
        if let Some(image) = self.images.get_mut(key) {
            image.scanned = true;
        }
    }

    /// Mark an image the remote authority already scanned. An empty
    /// architecture matches every tracked architecture of the digest.
    pub fn mark_scanned_from_remote(&mut self, scanned: &ScannedImage) -> usize {
        let mut marked = 0;
        for image in self.images.values_mut() {
            let matches = image.id == scanned.id
                && (scanned.architecture.is_empty() || image.architecture == scanned.architecture);
            if matches {
                image.scanned = true;
                marked += 1;
            }
        }
        marked
    }

    /// Record a failed scan: count it, classify it and schedule the retry
    pub fn set_image_scan_error(&mut self, key: &ImageKey, failure: ScanFailure) {
        let now = self.clock.now();
        let Some(image) = self.images.get_mut(key) else {
            return;
        };

        image.failures += 1;
        if matches!(failure, ScanFailure::LayerNotFound(_)) {
            self.host_fs_disabled = true;
        }
        let delay = image.retry_backoff.step();
        image.next_scan = Some(now + Duration::from_std(delay).unwrap_or_else(|_| Duration::days(365)));
        debug!(
            image = %image.name,
            failures = image.failures,
            kind = failure.kind(),
            retry_in_secs = delay.as_secs(),
            "Scheduled image scan retry"
        );
        image.last_scan_error = Some(failure);
    }

    /// Scan candidates, images that never failed first
    pub fn pending_images(&self, now: DateTime<Utc>) -> Vec<ImageKey> {
        let mut pending: Vec<&Image> = self.images.values().filter(|i| i.is_pending(now)).collect();
        pending.sort_by(|a, b| {
            a.failures
                .cmp(&b.failures)
                .then_with(|| a.key().cmp(&b.key()))
        });
        pending.into_iter().map(Image::key).collect()
    }

    pub fn private_image_count(&self) -> usize {
        self.images.values().filter(|i| i.is_private()).count()
    }

    /// Unscanned images whose remote status was not checked within `window`
    pub fn images_needing_remote_sync(&self, now: DateTime<Utc>, window: Duration) -> Vec<ImageKey> {
        let cutoff = now - window;
        let mut keys: Vec<ImageKey> = self
            .images
            .values()
            .filter(|i| !i.scanned && i.last_remote_sync_at.map_or(true, |at| at < cutoff))
            .map(Image::key)
            .collect();
        keys.sort();
        keys
    }

    pub fn mark_remote_synced(&mut self, keys: &[ImageKey], at: DateTime<Utc>) {
        for key in keys {
            if let Some(image) = self.images.get_mut(key) {
                image.last_remote_sync_at = Some(at);
            }
        }
    }

    /// Images to include in the next status report
    pub fn images_for_status_report(&self, full_snapshot: bool) -> Vec<ImageKey> {
        let mut keys: Vec<ImageKey> = self
            .images
            .values()
            .filter(|i| full_snapshot || i.owners_changed_since_report())
            .map(Image::key)
            .collect();
        keys.sort();
        keys
    }

    /// Stamp reported images and drop their accumulated owner changes
    pub fn mark_reported(&mut self, keys: &[ImageKey], at: DateTime<Utc>) {
        for key in keys {
            if let Some(image) = self.images.get_mut(key) {
                image.resources_updated_at = Some(at);
                image.owner_changes.clear();
            }
        }
    }

    /// Pick the candidate with the most available CPU that fits the request.
    /// Ties go to the lexicographically smallest node name.
    pub fn find_best_node(
        &self,
        candidates: &[String],
        required_memory: Quantity,
        required_cpu: Quantity,
    ) -> Result<String, PlacementError> {
        if self.nodes.is_empty() {
            return Err(PlacementError::NoCandidates);
        }

        let mut best: Option<(Quantity, &str)> = None;
        for name in candidates {
            let Some(node) = self.nodes.get(name) else {
                continue;
            };
            if !node.fits(required_memory, required_cpu) {
                continue;
            }
            let cpu = node.available_cpu();
            let better = match best {
                None => true,
                Some((best_cpu, best_name)) => {
                    cpu > best_cpu || (cpu == best_cpu && name.as_str() < best_name)
                }
            };
            if better {
                best = Some((cpu, name.as_str()));
            }
        }

        best.map(|(_, name)| name.to_string())
            .ok_or(PlacementError::NoCandidates)
    }

    /// Image of the agent's own deployment, used to run scan jobs
    pub fn agent_image(&self, namespace: &str, name: &str, container: &str) -> Option<AgentImage> {
        let image = self.owners.deployment_image(namespace, name, container);
        if image.is_none() {
            warn!(namespace = %namespace, deployment = %name, container = %container, "Agent deployment image not found");
        }
        image
    }
}

fn build_image_map(scanned_images: &[ScannedImage]) -> HashMap<ImageKey, Image> {
    scanned_images
        .iter()
        .map(|scanned| {
            let image = Image::from_scanned(scanned);
            (image.key(), image)
        })
        .collect()
}

fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default()
}

fn pod_node_name(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .filter(|n| !n.is_empty())
}

fn non_empty_or(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}
