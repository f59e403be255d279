//! Cluster event queue
//!
//! Informer callbacks only enqueue events here. The scheduler task is the
//! single consumer and the only writer of the delta state, so the state
//! needs no locking. The queue is bounded and producers wait on overflow
//! instead of dropping events.

use crate::error::QueueClosed;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::sync::mpsc;

/// Default queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Kind of cluster change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

/// Cluster objects the scheduler consumes
#[derive(Debug, Clone)]
pub enum ClusterObject {
    Pod(Pod),
    Node(Node),
    ReplicaSet(ReplicaSet),
    Job(Job),
    Deployment(Deployment),
}

impl ClusterObject {
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            ClusterObject::Pod(o) => &o.metadata,
            ClusterObject::Node(o) => &o.metadata,
            ClusterObject::ReplicaSet(o) => &o.metadata,
            ClusterObject::Job(o) => &o.metadata,
            ClusterObject::Deployment(o) => &o.metadata,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClusterObject::Pod(_) => "Pod",
            ClusterObject::Node(_) => "Node",
            ClusterObject::ReplicaSet(_) => "ReplicaSet",
            ClusterObject::Job(_) => "Job",
            ClusterObject::Deployment(_) => "Deployment",
        }
    }

    /// Cache key in `namespace/name` form (`name` for cluster scoped objects)
    pub fn key(&self) -> String {
        object_key(self.metadata())
    }
}

/// Cache key for object metadata
pub fn object_key(meta: &ObjectMeta) -> String {
    let name = meta.name.as_deref().unwrap_or_default();
    match meta.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_string(),
    }
}

/// Object UID, falling back to the cache key for objects without one
pub fn object_uid(meta: &ObjectMeta) -> String {
    match meta.uid.as_deref() {
        Some(uid) if !uid.is_empty() => uid.to_string(),
        _ => object_key(meta),
    }
}

/// A queued cluster change
#[derive(Debug, Clone)]
pub struct ClusterEvent {
    pub kind: EventKind,
    pub object: ClusterObject,
}

/// Create a bounded event queue
pub fn event_queue(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender { tx }, EventReceiver { rx })
}

/// Producer side of the event queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<ClusterEvent>,
}

impl EventSender {
    /// Enqueue an event, waiting for room when the queue is full
    pub async fn send(&self, kind: EventKind, object: ClusterObject) -> Result<(), QueueClosed> {
        self.tx
            .send(ClusterEvent { kind, object })
            .await
            .map_err(|_| QueueClosed)
    }

    pub async fn on_add(&self, object: ClusterObject) -> Result<(), QueueClosed> {
        self.send(EventKind::Add, object).await
    }

    pub async fn on_update(&self, object: ClusterObject) -> Result<(), QueueClosed> {
        self.send(EventKind::Update, object).await
    }

    pub async fn on_delete(&self, object: ClusterObject) -> Result<(), QueueClosed> {
        self.send(EventKind::Delete, object).await
    }

    /// Free slots left before producers start waiting
    pub fn remaining_capacity(&self) -> usize {
        self.tx.capacity()
    }
}

/// Consumer side of the event queue
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<ClusterEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<ClusterEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ClusterEvent> {
        self.rx.try_recv().ok()
    }
}
