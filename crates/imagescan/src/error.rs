//! Error types for scan scheduling

use thiserror::Error;

/// Substrings reported by the layer extractor when image layers are missing
/// from the node's container storage.
const LAYER_NOT_FOUND_MARKERS: &[&str] = &["no such file or directory", "failed to get the layer"];

/// Registry error codes that indicate the image can not be pulled anonymously.
const UNAUTHORIZED_MARKERS: &[&str] = &["UNAUTHORIZED", "MANIFEST_UNKNOWN", "DENIED"];

/// Classified failure returned by the scan execution backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanFailure {
    /// Image layers were not found in the node's local storage
    #[error("image layer not found: {0}")]
    LayerNotFound(String),
    /// Registry rejected the pull (private image, missing credentials)
    #[error("private image: {0}")]
    Unauthorized(String),
    /// Any other scan failure
    #[error("{0}")]
    Other(String),
}

impl ScanFailure {
    /// Classify a raw failure message by the markers the scan job prints
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        if LAYER_NOT_FOUND_MARKERS.iter().any(|m| message.contains(m)) {
            ScanFailure::LayerNotFound(message)
        } else if UNAUTHORIZED_MARKERS.iter().any(|m| message.contains(m)) {
            ScanFailure::Unauthorized(message)
        } else {
            ScanFailure::Other(message)
        }
    }

    /// Raw message without the classification prefix
    pub fn message(&self) -> &str {
        match self {
            ScanFailure::LayerNotFound(m) | ScanFailure::Unauthorized(m) | ScanFailure::Other(m) => m,
        }
    }

    /// Short label used for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ScanFailure::LayerNotFound(_) => "layer_not_found",
            ScanFailure::Unauthorized(_) => "unauthorized",
            ScanFailure::Other(_) => "other",
        }
    }
}

/// Placement failure: no node satisfies resource and mode constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PlacementError {
    #[error("no candidates")]
    NoCandidates,
}

/// Failure to parse a resource quantity
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,
    #[error("invalid quantity number: {0}")]
    InvalidNumber(String),
    #[error("unknown quantity suffix: {0}")]
    UnknownSuffix(String),
    #[error("quantity out of range: {0}")]
    Overflow(String),
}

/// Errors that abort a whole scheduling pass
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no image name set, image_id={image_id}")]
    MissingImageName { image_id: String },

    #[error("agent image not found in deployment {namespace}/{name} container {container}")]
    AgentImageNotFound {
        namespace: String,
        name: String,
        container: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// The event queue consumer has gone away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("event queue closed")]
pub struct QueueClosed;
