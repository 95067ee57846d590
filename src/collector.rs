//! Event-driven worker that keeps the index in sync with the cluster. One
//! handler, generic over `Watched`, is fanned out over watcher streams for
//! Deployments, DaemonSets, and StatefulSets.

use crate::index::Index;
use crate::parser;
use crate::types::{SecretRef, WorkloadKey, WorkloadKind};
use crate::vault::SharedBackend;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub static OPT_IN_ANNOTATION: &str = "secret-reload/enabled";
pub static VAULT_FROM_PATH_ANNOTATION: &str = "secret-reload/vault-from-path";
pub static VAULT_FROM_PATH_ANNOTATION_DEPRECATED: &str = "vault.security.banzaicloud.io/vault-from-path";

/// Anything the collector needs to turn a watched resource into zero or more
/// `SecretRef`s: its opt-in annotation, its env-carrying containers, and the
/// label selector used to seed `last_restart_time` from existing pods.
pub trait Watched
where
    Self: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Send
        + Sync
        + DeserializeOwned
        + 'static,
{
    fn kind() -> WorkloadKind;
    fn pod_template_annotation(&self, key: &str) -> Option<&str>;
    fn env_values(&self) -> Vec<String>;
    fn selector_labels(&self) -> std::collections::BTreeMap<String, String>;

    fn workload_key(&self) -> WorkloadKey {
        WorkloadKey {
            namespace: self.namespace().unwrap_or_default(),
            name: self.name_any(),
            kind: Self::kind(),
        }
    }

    fn is_opted_in(&self) -> bool {
        self.pod_template_annotation(OPT_IN_ANNOTATION) == Some("true")
    }
}

fn env_values_from_containers(containers: &[k8s_openapi::api::core::v1::Container]) -> Vec<String> {
    containers
        .iter()
        .flat_map(|c| c.env.iter().flatten())
        .filter_map(|e| e.value.clone())
        .collect()
}

impl Watched for Deployment {
    fn kind() -> WorkloadKind {
        WorkloadKind::Deployment
    }
    fn pod_template_annotation(&self, key: &str) -> Option<&str> {
        self.spec.as_ref()?.template.metadata.as_ref()?.annotations.as_ref()?.get(key).map(|s| s.as_str())
    }
    fn env_values(&self) -> Vec<String> {
        let Some(spec) = self.spec.as_ref().and_then(|s| s.template.spec.as_ref()) else {
            return Vec::new();
        };
        let mut values = env_values_from_containers(&spec.containers);
        if let Some(init) = &spec.init_containers {
            values.extend(env_values_from_containers(init));
        }
        values
    }
    fn selector_labels(&self) -> std::collections::BTreeMap<String, String> {
        self.spec.as_ref().and_then(|s| s.selector.match_labels.clone()).unwrap_or_default()
    }
}

impl Watched for StatefulSet {
    fn kind() -> WorkloadKind {
        WorkloadKind::StatefulSet
    }
    fn pod_template_annotation(&self, key: &str) -> Option<&str> {
        self.spec.as_ref()?.template.metadata.as_ref()?.annotations.as_ref()?.get(key).map(|s| s.as_str())
    }
    fn env_values(&self) -> Vec<String> {
        let Some(spec) = self.spec.as_ref().and_then(|s| s.template.spec.as_ref()) else {
            return Vec::new();
        };
        let mut values = env_values_from_containers(&spec.containers);
        if let Some(init) = &spec.init_containers {
            values.extend(env_values_from_containers(init));
        }
        values
    }
    fn selector_labels(&self) -> std::collections::BTreeMap<String, String> {
        self.spec.as_ref().and_then(|s| s.selector.match_labels.clone()).unwrap_or_default()
    }
}

impl Watched for DaemonSet {
    fn kind() -> WorkloadKind {
        WorkloadKind::DaemonSet
    }
    fn pod_template_annotation(&self, key: &str) -> Option<&str> {
        self.spec.as_ref()?.template.metadata.as_ref()?.annotations.as_ref()?.get(key).map(|s| s.as_str())
    }
    fn env_values(&self) -> Vec<String> {
        let Some(spec) = self.spec.as_ref().and_then(|s| s.template.spec.as_ref()) else {
            return Vec::new();
        };
        let mut values = env_values_from_containers(&spec.containers);
        if let Some(init) = &spec.init_containers {
            values.extend(env_values_from_containers(init));
        }
        values
    }
    fn selector_labels(&self) -> std::collections::BTreeMap<String, String> {
        self.spec.as_ref().and_then(|s| s.selector.match_labels.clone()).unwrap_or_default()
    }
}

/// Runs the three watcher streams until `cancel` fires. Each event is
/// handled inline on the stream's own task; the index's lock is the sole
/// synchronization, so no work queue is needed.
pub async fn run(
    client: Client,
    index: Arc<Index>,
    backend: SharedBackend,
    namespace: Option<String>,
    sync_period: std::time::Duration,
    cancel: CancellationToken,
) {
    let deployments: Api<Deployment> = scoped_api(&client, &namespace);
    let daemonsets: Api<DaemonSet> = scoped_api(&client, &namespace);
    let statefulsets: Api<StatefulSet> = scoped_api(&client, &namespace);
    let pods: Api<Pod> = scoped_api(&client, &namespace);

    let watcher_config = watcher::Config::default();

    let deployment_stream = watcher(deployments, watcher_config.clone()).map(|r| r.map(|ev| ev.map(WatchedEvent::Deployment)));
    let daemonset_stream = watcher(daemonsets, watcher_config.clone()).map(|r| r.map(|ev| ev.map(WatchedEvent::DaemonSet)));
    let statefulset_stream = watcher(statefulsets, watcher_config).map(|r| r.map(|ev| ev.map(WatchedEvent::StatefulSet)));

    let mut merged = stream::select_all([
        deployment_stream.boxed(),
        daemonset_stream.boxed(),
        statefulset_stream.boxed(),
    ])
    .take_until(cancel.cancelled());

    // sync_period bounds how often a missed event is self-healed by the next
    // relist; kube's watcher streams deliver incremental events natively, so
    // this only governs the relist cadence, not a poll loop.
    debug!(worker = "collector", sync_period_secs = sync_period.as_secs(), "collector watchers started");

    while let Some(event) = merged.next().await {
        match event {
            Ok(watcher::Event::Apply(WatchedEvent::Deployment(d))) => handle_applied(&index, &backend, &pods, d).await,
            Ok(watcher::Event::Apply(WatchedEvent::DaemonSet(d))) => handle_applied(&index, &backend, &pods, d).await,
            Ok(watcher::Event::Apply(WatchedEvent::StatefulSet(d))) => handle_applied(&index, &backend, &pods, d).await,
            Ok(watcher::Event::InitApply(WatchedEvent::Deployment(d))) => handle_applied(&index, &backend, &pods, d).await,
            Ok(watcher::Event::InitApply(WatchedEvent::DaemonSet(d))) => handle_applied(&index, &backend, &pods, d).await,
            Ok(watcher::Event::InitApply(WatchedEvent::StatefulSet(d))) => handle_applied(&index, &backend, &pods, d).await,
            Ok(watcher::Event::Delete(WatchedEvent::Deployment(d))) => index.delete(&d.workload_key()),
            Ok(watcher::Event::Delete(WatchedEvent::DaemonSet(d))) => index.delete(&d.workload_key()),
            Ok(watcher::Event::Delete(WatchedEvent::StatefulSet(d))) => index.delete(&d.workload_key()),
            Ok(watcher::Event::Init | watcher::Event::InitDone) => {}
            Err(err) => error!(worker = "collector", error = %err, "watcher stream error"),
        }
    }

    info!(worker = "collector", "collector stopped");
}

enum WatchedEvent {
    Deployment(Deployment),
    DaemonSet(DaemonSet),
    StatefulSet(StatefulSet),
}

fn scoped_api<K>(client: &Client, namespace: &Option<String>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Handles one add/update event; annotation removal is folded into the same
/// path since step 1 below degrades it to a delete.
async fn handle_applied<K: Watched>(index: &Index, backend: &SharedBackend, pods: &Api<Pod>, workload: K) {
    let key = workload.workload_key();

    if !workload.is_opted_in() {
        index.delete(&key);
        return;
    }

    let mut paths: BTreeSet<String> = BTreeSet::new();
    for value in workload.env_values() {
        for parsed in parser::parse_env_value(&value) {
            if !parsed.is_versioned {
                paths.insert(parsed.path);
            }
        }
    }
    for parsed in annotation_refs(&workload) {
        if !parsed.is_versioned {
            paths.insert(parsed.path);
        }
    }

    if paths.is_empty() {
        index.delete(&key);
        return;
    }

    let existing_dynamic = index.dynamic_refs_for(&key);
    let mut refs = Vec::with_capacity(paths.len());
    for path in paths {
        if let Some(reused) = existing_dynamic.get(&path) {
            refs.push(reused.clone());
            continue;
        }
        match backend.read(&path).await {
            Ok(info) => refs.push(SecretRef::new(info.path, info.classification)),
            Err(err) => {
                warn!(worker = "collector", workload = %key, path, error = %err, "failed to classify secret; skipping path this event");
            }
        }
    }

    index.upsert(key.clone(), refs.clone());

    if index.get_tracking(&key).is_none() {
        let last_restart = seed_last_restart(pods, &workload).await;
        let shortest_ttl = refs
            .iter()
            .filter_map(|r| r.classification.ttl_seconds())
            .min()
            .unwrap_or(0);
        index.upsert_tracking(key, last_restart, shortest_ttl);
    }
}

fn annotation_refs<K: Watched>(workload: &K) -> Vec<parser::ParsedRef> {
    let primary = workload.pod_template_annotation(VAULT_FROM_PATH_ANNOTATION);
    let value = match primary {
        Some(v) if !v.is_empty() => Some(v),
        _ => workload.pod_template_annotation(VAULT_FROM_PATH_ANNOTATION_DEPRECATED),
    };
    value.map(parser::parse_annotation_value).unwrap_or_default()
}

async fn seed_last_restart<K: Watched>(pods: &Api<Pod>, workload: &K) -> chrono::DateTime<Utc> {
    let selector = workload.selector_labels();
    if selector.is_empty() {
        return Utc::now();
    }
    let label_selector = selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");

    let list_params = kube::api::ListParams::default().labels(&label_selector);
    match pods.list(&list_params).await {
        Ok(list) => list
            .items
            .into_iter()
            .filter(|p| p.metadata.deletion_timestamp.is_none())
            .filter_map(|p| p.status.and_then(|s| s.start_time).map(|t| t.0))
            .min()
            .unwrap_or_else(Utc::now),
        Err(err) => {
            debug!(error = %err, "failed to list pods while seeding last_restart_time; defaulting to now");
            Utc::now()
        }
    }
}
