//! Image scan scheduling engine
//!
//! This crate provides the core of a cluster-resident scan agent:
//! - Delta state built from cluster events (images, owners, nodes)
//! - Node-fit placement under CPU/memory constraints
//! - Retry backoff and scan mode fallback
//! - The scan scheduling loop with bounded concurrency and remote reconciliation
//! - Health checks and observability

pub mod api;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod delta;
pub mod error;
pub mod events;
pub mod executor;
pub mod health;
pub mod observability;
pub mod quantity;
pub mod remote;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::ScanConfig;
pub use delta::{DeltaState, Image, ImageKey};
pub use error::{PlacementError, QueueClosed, ScanFailure, SchedulerError};
pub use events::{ClusterEvent, ClusterObject, EventKind, EventReceiver, EventSender};
pub use executor::{ScanExecutor, ScanMode, ScanRequest};
pub use health::{ComponentHealth, ComponentStatus, HealthRegistry};
pub use observability::{PrometheusScanMetrics, ScanMetrics, StructuredLogger};
pub use quantity::Quantity;
pub use remote::RemoteAuthority;
pub use scheduler::{Controller, ControllerBuilder, ControllerHandle};
