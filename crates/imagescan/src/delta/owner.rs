//! Top level owner resolution
//!
//! Pods are grouped by the workload that ultimately owns them: a
//! Deployment for ReplicaSet pods, a CronJob for Job pods, the DaemonSet or
//! StatefulSet directly, or the pod itself when it has no owner.

use crate::events::object_uid;
use crate::executor::AgentImage;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use std::collections::{BTreeMap, HashMap};

/// Parent resources cached only to walk owner chains
#[derive(Debug, Default)]
pub struct OwnerCache {
    replica_sets: HashMap<String, ReplicaSet>,
    jobs: HashMap<String, Job>,
    deployments: HashMap<String, Deployment>,
}

impl OwnerCache {
    pub fn upsert_replica_set(&mut self, rs: ReplicaSet) {
        self.replica_sets.insert(object_uid(&rs.metadata), rs);
    }

    pub fn delete_replica_set(&mut self, rs: &ReplicaSet) {
        self.replica_sets.remove(&object_uid(&rs.metadata));
    }

    pub fn upsert_job(&mut self, job: Job) {
        self.jobs.insert(object_uid(&job.metadata), job);
    }

    pub fn delete_job(&mut self, job: &Job) {
        self.jobs.remove(&object_uid(&job.metadata));
    }

    pub fn upsert_deployment(&mut self, deployment: Deployment) {
        self.deployments
            .insert(object_uid(&deployment.metadata), deployment);
    }

    pub fn delete_deployment(&mut self, deployment: &Deployment) {
        self.deployments.remove(&object_uid(&deployment.metadata));
    }

    /// Resolve the ID of the top level resource owning the pod
    pub fn resolve_pod_owner(&self, pod: &Pod) -> String {
        let Some(owner) = primary_owner(&pod.metadata) else {
            return object_uid(&pod.metadata);
        };

        match owner.kind.as_str() {
            "ReplicaSet" => {
                if let Some(deployment) = self
                    .replica_sets
                    .get(&owner.uid)
                    .and_then(|rs| owner_of_kind(&rs.metadata, "Deployment"))
                {
                    return deployment.uid.clone();
                }
                // ReplicaSets managed by something other than a Deployment
                // (e.g. rollout controllers) can still match a Deployment selector.
                if let Some(uid) = self.find_deployment_by_selector(pod) {
                    return uid;
                }
                owner.uid.clone()
            }
            "Job" => self
                .jobs
                .get(&owner.uid)
                .and_then(|job| owner_of_kind(&job.metadata, "CronJob"))
                .map(|cron| cron.uid.clone())
                .unwrap_or_else(|| owner.uid.clone()),
            _ => owner.uid.clone(),
        }
    }

    fn find_deployment_by_selector(&self, pod: &Pod) -> Option<String> {
        let labels = pod.metadata.labels.as_ref()?;
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();

        self.deployments
            .iter()
            .filter(|(_, d)| d.metadata.namespace.as_deref().unwrap_or_default() == namespace)
            .filter(|(_, d)| {
                d.spec
                    .as_ref()
                    .is_some_and(|spec| selector_matches(&spec.selector, labels))
            })
            .map(|(uid, _)| uid.clone())
            .min()
    }

    /// Image of a container in a cached deployment, with its pull secrets
    pub fn deployment_image(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
    ) -> Option<AgentImage> {
        let deployment = self.deployments.values().find(|d| {
            d.metadata.namespace.as_deref() == Some(namespace)
                && d.metadata.name.as_deref() == Some(name)
        })?;
        let pod_spec = deployment.spec.as_ref()?.template.spec.as_ref()?;

        let image = pod_spec
            .containers
            .iter()
            .find(|c| c.name == container)
            .and_then(|c| c.image.clone())
            .filter(|image| !image.is_empty())?;
        let pull_secrets = pod_spec
            .image_pull_secrets
            .iter()
            .flatten()
            .filter_map(|s| s.name.clone())
            .collect();

        Some(AgentImage {
            image,
            pull_secrets,
        })
    }
}

/// The controlling owner reference, or the first one
fn primary_owner(meta: &ObjectMeta) -> Option<&OwnerReference> {
    let refs = meta.owner_references.as_ref()?;
    refs.iter()
        .find(|r| r.controller == Some(true))
        .or_else(|| refs.first())
}

fn owner_of_kind<'a>(meta: &'a ObjectMeta, kind: &str) -> Option<&'a OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.kind == kind)
}

/// Match labels against a label selector. An empty selector matches nothing.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let match_labels = selector.match_labels.as_ref();
    let expressions = selector.match_expressions.as_ref();

    let has_terms = match_labels.is_some_and(|m| !m.is_empty())
        || expressions.is_some_and(|e| !e.is_empty());
    if !has_terms {
        return false;
    }

    let labels_match = match_labels
        .into_iter()
        .flatten()
        .all(|(k, v)| labels.get(k) == Some(v));

    let expressions_match = expressions.into_iter().flatten().all(|req| {
        let value = labels.get(&req.key);
        let values = req.values.as_deref().unwrap_or_default();
        match req.operator.as_str() {
            "In" => value.is_some_and(|v| values.contains(v)),
            "NotIn" => value.map_or(true, |v| !values.contains(v)),
            "Exists" => value.is_some(),
            "DoesNotExist" => value.is_none(),
            _ => false,
        }
    });

    labels_match && expressions_match
}
