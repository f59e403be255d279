//! Remote authority seam
//!
//! The remote authority is the source of truth for which images were already
//! scanned (by this agent before a restart, or by another agent). The
//! scheduler reports image status to it and asks it for sync state.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Scan status of a reported image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageScanStatus {
    Pending,
    Error,
}

/// One image in a status report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatusEntry {
    pub id: String,
    pub architecture: String,
    pub name: String,
    pub resource_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ImageScanStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Batched image status report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// The report carries every tracked image, not only the changed ones
    pub full_snapshot: bool,
    pub images: Vec<ImageStatusEntry>,
}

/// Image the remote authority already has results for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannedImage {
    pub id: String,
    /// Empty when the authority does not distinguish architectures
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub resource_ids: Vec<String>,
}

/// Sync state query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStateQuery {
    pub image_ids: Vec<String>,
}

/// Sync state answer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    #[serde(default)]
    pub scanned_images: Vec<ScannedImage>,
    /// The authority lost track of resources and wants a full snapshot
    #[serde(default)]
    pub full_resync_required: bool,
}

/// Client for the remote authority
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// Send a batched image status report
    async fn post_status_report(&self, report: StatusReport) -> Result<()>;

    /// Ask which of the given images were already scanned
    async fn query_sync_state(&self, query: SyncStateQuery) -> Result<SyncState>;
}
