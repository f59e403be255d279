//! Scan placement: which node runs the scan, and in which mode

use crate::config::ScanResources;
use crate::delta::{DeltaState, Image};
use crate::error::PlacementError;
use crate::executor::ScanMode;
use tracing::debug;

/// Resolved node and mode for one scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub node_name: String,
    pub mode: ScanMode,
}

/// Label identifying nodes managed by the orchestrating authority
#[derive(Debug, Clone)]
pub struct ManagedNodeLabel {
    pub key: String,
    pub value: String,
}

/// Resolve placement for `image` against the current node view.
///
/// Host filesystem scans are restricted to managed nodes already running the
/// image. When host filesystem placement finds no candidate the resolution is
/// retried once in remote mode.
pub fn resolve_placement(
    delta: &DeltaState,
    image: &Image,
    configured_mode: ScanMode,
    managed_label: &ManagedNodeLabel,
    resources: ScanResources,
) -> Result<Placement, PlacementError> {
    let mut mode = configured_mode;
    if image.last_error_was_layer_not_found() {
        debug!(image = %image.name, "Selecting remote mode after missing layers");
        mode = ScanMode::Remote;
    } else if mode == ScanMode::HostFs && delta.host_fs_disabled() {
        debug!(image = %image.name, "Selecting remote mode, host filesystem scans disabled");
        mode = ScanMode::Remote;
    }

    match place(delta, image, mode, managed_label, resources) {
        Err(PlacementError::NoCandidates) if mode == ScanMode::HostFs => {
            debug!(image = %image.name, "No host filesystem candidates, retrying in remote mode");
            place(delta, image, ScanMode::Remote, managed_label, resources)
        }
        result => result,
    }
}

fn place(
    delta: &DeltaState,
    image: &Image,
    mode: ScanMode,
    managed_label: &ManagedNodeLabel,
    resources: ScanResources,
) -> Result<Placement, PlacementError> {
    let (mode, candidates) = match mode {
        ScanMode::HostFs => {
            let image_nodes = image.node_names();
            if image_nodes.is_empty() {
                return Err(PlacementError::NoCandidates);
            }
            let managed: Vec<String> = image_nodes
                .into_iter()
                .filter(|name| {
                    delta
                        .node(name)
                        .is_some_and(|n| n.has_label(&managed_label.key, &managed_label.value))
                })
                .collect();
            if managed.is_empty() {
                debug!(image = %image.name, "Image not on managed nodes, selecting remote mode");
                (ScanMode::Remote, delta.node_names())
            } else {
                (ScanMode::HostFs, managed)
            }
        }
        ScanMode::Remote => (ScanMode::Remote, delta.node_names()),
    };

    let linux: Vec<String> = candidates
        .into_iter()
        .filter(|name| {
            let is_linux = delta.node(name).is_some_and(|n| n.is_linux());
            if !is_linux {
                debug!(node = %name, "Skipping non-linux node");
            }
            is_linux
        })
        .collect();

    let node_name = delta.find_best_node(&linux, resources.memory, resources.cpu)?;
    Ok(Placement { node_name, mode })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::delta::ImageKey;
    use crate::error::ScanFailure;
    use crate::events::ClusterObject;
    use crate::quantity::Quantity;
    use crate::testutil::{node, node_with_labels, PodBuilder};
    use std::sync::Arc;

    const MANAGED: (&str, &str) = ("provisioner.cast.ai/managed-by", "cast.ai");

    fn label() -> ManagedNodeLabel {
        ManagedNodeLabel {
            key: MANAGED.0.to_string(),
            value: MANAGED.1.to_string(),
        }
    }

    fn resources() -> ScanResources {
        ScanResources {
            cpu: Quantity::parse("100m").unwrap(),
            memory: Quantity::parse("100Mi").unwrap(),
        }
    }

    fn key() -> ImageKey {
        ImageKey::new("nginx@sha256:aaa", "amd64")
    }

    fn delta_with_image_on(node_name: &str) -> DeltaState {
        let mut delta = DeltaState::new(Arc::new(SystemClock), &[]);
        delta.upsert(
            PodBuilder::new("pod-1")
                .node(node_name)
                .container("nginx", "nginx:1.25", "nginx@sha256:aaa")
                .object(),
        );
        delta
    }

    fn resolve(delta: &DeltaState, mode: ScanMode) -> Result<Placement, PlacementError> {
        let image = delta.image(&key()).unwrap();
        resolve_placement(delta, image, mode, &label(), resources())
    }

    #[test]
    fn test_host_fs_on_managed_node_running_image() {
        let mut delta = delta_with_image_on("managed");
        delta.upsert(ClusterObject::Node(node_with_labels(
            "managed",
            "amd64",
            "2",
            "4Gi",
            &[MANAGED],
        )));
        delta.upsert(ClusterObject::Node(node("big", "amd64", "16", "64Gi")));

        assert_eq!(
            resolve(&delta, ScanMode::HostFs),
            Ok(Placement {
                node_name: "managed".to_string(),
                mode: ScanMode::HostFs,
            })
        );
    }

    #[test]
    fn test_host_fs_falls_back_to_remote_without_managed_nodes() {
        let mut delta = delta_with_image_on("plain");
        delta.upsert(ClusterObject::Node(node("plain", "amd64", "2", "4Gi")));
        delta.upsert(ClusterObject::Node(node("big", "amd64", "16", "64Gi")));

        assert_eq!(
            resolve(&delta, ScanMode::HostFs),
            Ok(Placement {
                node_name: "big".to_string(),
                mode: ScanMode::Remote,
            })
        );
    }

    #[test]
    fn test_host_fs_without_room_retries_remote() {
        let mut delta = delta_with_image_on("managed");
        delta.upsert(ClusterObject::Node(node_with_labels(
            "managed",
            "amd64",
            "50m",
            "4Gi",
            &[MANAGED],
        )));
        delta.upsert(ClusterObject::Node(node("other", "amd64", "2", "4Gi")));

        assert_eq!(
            resolve(&delta, ScanMode::HostFs),
            Ok(Placement {
                node_name: "other".to_string(),
                mode: ScanMode::Remote,
            })
        );
    }

    #[test]
    fn test_layer_not_found_forces_remote() {
        let mut delta = delta_with_image_on("managed");
        delta.upsert(ClusterObject::Node(node_with_labels(
            "managed",
            "amd64",
            "2",
            "4Gi",
            &[MANAGED],
        )));
        delta.set_image_scan_error(
            &key(),
            ScanFailure::classify("failed to get the layer: no such file or directory"),
        );

        let placement = resolve(&delta, ScanMode::HostFs).unwrap();
        assert_eq!(placement.mode, ScanMode::Remote);
        assert_eq!(placement.node_name, "managed");
    }

    #[test]
    fn test_host_fs_disabled_for_every_image() {
        let mut delta = delta_with_image_on("managed");
        delta.upsert(ClusterObject::Node(node_with_labels(
            "managed",
            "amd64",
            "2",
            "4Gi",
            &[MANAGED],
        )));
        delta.upsert(
            PodBuilder::new("pod-2")
                .node("managed")
                .container("redis", "redis:7", "redis@sha256:bbb")
                .object(),
        );
        delta.set_image_scan_error(
            &ImageKey::new("redis@sha256:bbb", "amd64"),
            ScanFailure::LayerNotFound("missing".to_string()),
        );

        assert_eq!(resolve(&delta, ScanMode::HostFs).unwrap().mode, ScanMode::Remote);
    }

    #[test]
    fn test_non_linux_nodes_skipped() {
        use k8s_openapi::api::core::v1::NodeSystemInfo;

        let mut delta = delta_with_image_on("n1");
        let mut windows = node("win", "amd64", "64", "256Gi");
        if let Some(status) = windows.status.as_mut() {
            status.node_info = Some(NodeSystemInfo {
                architecture: "amd64".to_string(),
                operating_system: "windows".to_string(),
                ..Default::default()
            });
        }
        delta.upsert(ClusterObject::Node(windows));
        delta.upsert(ClusterObject::Node(node("n1", "amd64", "1", "1Gi")));

        assert_eq!(
            resolve(&delta, ScanMode::Remote).unwrap().node_name,
            "n1".to_string()
        );
    }

    #[test]
    fn test_no_fitting_node() {
        let mut delta = delta_with_image_on("n1");
        delta.upsert(ClusterObject::Node(node("n1", "amd64", "10m", "1Gi")));

        assert_eq!(
            resolve(&delta, ScanMode::HostFs),
            Err(PlacementError::NoCandidates)
        );
    }
}
