//! Tracked container images

use crate::backoff::RetryBackoff;
use crate::error::ScanFailure;
use crate::executor::ContainerRuntime;
use crate::remote::ScannedImage;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Architecture assumed when the image's node is unknown
pub const DEFAULT_ARCHITECTURE: &str = "amd64";

/// Operating system assumed when the image's node is unknown
pub const DEFAULT_OS: &str = "linux";

/// Image identity: the same digest on different architectures is tracked separately
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageKey {
    pub id: String,
    pub architecture: String,
}

impl ImageKey {
    pub fn new(id: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            architecture: architecture.into(),
        }
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.id, self.architecture)
    }
}

/// Owners added or removed since the image was last reported
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnerChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl OwnerChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    pub fn clear(&mut self) {
        self.added.clear();
        self.removed.clear();
    }
}

/// A container image in use in the cluster
#[derive(Debug, Clone)]
pub struct Image {
    /// Image ID from the container status (name and digest)
    pub id: String,
    /// Image name as declared in the workload spec, possibly not fully qualified
    pub name: String,
    pub architecture: String,
    pub os: String,
    pub container_runtime: Option<ContainerRuntime>,

    /// Top level owner ID -> pods realizing that ownership
    pub owners: BTreeMap<String, BTreeSet<String>>,
    /// Node name -> pods running the image there
    pub nodes: BTreeMap<String, BTreeSet<String>>,
    pub owner_changes: OwnerChanges,

    pub scanned: bool,
    pub last_scan_error: Option<ScanFailure>,
    pub failures: u32,
    pub retry_backoff: RetryBackoff,
    pub next_scan: Option<DateTime<Utc>>,

    pub resources_updated_at: Option<DateTime<Utc>>,
    pub owner_changed_at: Option<DateTime<Utc>>,
    pub last_remote_sync_at: Option<DateTime<Utc>>,
}

impl Image {
    pub fn new(id: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            architecture: architecture.into(),
            os: DEFAULT_OS.to_string(),
            container_runtime: None,
            owners: BTreeMap::new(),
            nodes: BTreeMap::new(),
            owner_changes: OwnerChanges::default(),
            scanned: false,
            last_scan_error: None,
            failures: 0,
            retry_backoff: RetryBackoff::default(),
            next_scan: None,
            resources_updated_at: None,
            owner_changed_at: None,
            last_remote_sync_at: None,
        }
    }

    /// Image rebuilt from the remote authority's scanned list
    pub fn from_scanned(scanned: &ScannedImage) -> Self {
        let mut image = Image::new(&scanned.id, &scanned.architecture);
        image.scanned = true;
        image.owners = scanned
            .resource_ids
            .iter()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();
        image
    }

    pub fn key(&self) -> ImageKey {
        ImageKey::new(&self.id, &self.architecture)
    }

    pub fn is_unused(&self) -> bool {
        self.owners.is_empty() && self.nodes.is_empty()
    }

    /// The registry refused the last pull
    pub fn is_private(&self) -> bool {
        matches!(self.last_scan_error, Some(ScanFailure::Unauthorized(_)))
    }

    pub fn last_error_was_layer_not_found(&self) -> bool {
        matches!(self.last_scan_error, Some(ScanFailure::LayerNotFound(_)))
    }

    /// Whether the image is a scan candidate at `now`
    pub fn is_pending(&self, now: DateTime<Utc>) -> bool {
        !self.scanned
            && !self.owners.is_empty()
            && !self.is_private()
            && self.next_scan.map_or(true, |next| next <= now)
    }

    /// Owner set changed after the last successful status report
    pub fn owners_changed_since_report(&self) -> bool {
        match (self.owner_changed_at, self.resources_updated_at) {
            (Some(changed), Some(reported)) => changed > reported,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub fn owner_ids(&self) -> Vec<String> {
        self.owners.keys().cloned().collect()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn owned_image() -> Image {
        let mut image = Image::new("sha256:abc", "amd64");
        image
            .owners
            .insert("deploy-1".to_string(), BTreeSet::from(["pod-1".to_string()]));
        image
    }

    #[test]
    fn test_new_image_is_pending_once_owned() {
        let now = Utc::now();
        let mut image = Image::new("sha256:abc", "amd64");
        assert!(image.is_unused());
        assert!(!image.is_pending(now));

        image.owners.insert("deploy-1".to_string(), BTreeSet::new());
        assert!(image.is_pending(now));

        image.scanned = true;
        assert!(!image.is_pending(now));
    }

    #[test]
    fn test_pending_respects_next_scan() {
        let now = Utc::now();
        let mut image = owned_image();
        image.next_scan = Some(now + Duration::seconds(60));
        assert!(!image.is_pending(now));
        assert!(image.is_pending(now + Duration::seconds(60)));
    }

    #[test]
    fn test_private_image_never_pending() {
        let now = Utc::now();
        let mut image = owned_image();
        image.last_scan_error = Some(ScanFailure::Unauthorized("DENIED".to_string()));
        image.next_scan = Some(now);

        assert!(image.is_private());
        assert!(!image.is_pending(now + Duration::days(365)));
    }

    #[test]
    fn test_from_scanned() {
        let image = Image::from_scanned(&ScannedImage {
            id: "sha256:abc".to_string(),
            architecture: "arm64".to_string(),
            resource_ids: vec!["a".to_string(), "b".to_string()],
        });
        assert!(image.scanned);
        assert_eq!(image.key(), ImageKey::new("sha256:abc", "arm64"));
        assert_eq!(image.owner_ids(), vec!["a".to_string(), "b".to_string()]);
        assert!(image.owners.values().all(|pods| pods.is_empty()));
    }

    #[test]
    fn test_owners_changed_since_report() {
        let now = Utc::now();
        let mut image = owned_image();
        assert!(!image.owners_changed_since_report());

        image.owner_changed_at = Some(now);
        assert!(image.owners_changed_since_report());

        image.resources_updated_at = Some(now);
        assert!(!image.owners_changed_since_report());

        image.owner_changed_at = Some(now + Duration::seconds(1));
        assert!(image.owners_changed_since_report());
    }

    #[test]
    fn test_owner_changes_clear() {
        let mut changes = OwnerChanges {
            added: vec!["a".to_string()],
            removed: vec![],
        };
        assert!(!changes.is_empty());
        changes.clear();
        assert!(changes.is_empty());
    }
}
