//! Timer-driven worker. Each tick runs one "round": a KV version check
//! (Phase A), a dynamic-TTL check (Phase B, only for workloads not already
//! marked by Phase A), then a rollout fan-out (Phase C).

use crate::index::Index;
use crate::rollout::Rollout;
use crate::types::{RestartReason, WorkloadKey, WorkloadKind};
use crate::vault::{BackendError, SharedBackend};
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use kube::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// WorkloadKind is a closed, three-armed enum, so the "unknown workload kind"
// programmer error named in the design is a compile-time impossibility here:
// the match in KubeRolloutSink::rollout is exhaustive, and adding a fourth
// kind requires adding an arm before the crate builds.

/// Applies the rollout-triggering patch for one workload. Split out from the
/// reloader so rounds can be exercised in tests without a live cluster.
#[async_trait]
pub trait RolloutSink: Send + Sync {
    async fn rollout(&self, workload: &WorkloadKey) -> anyhow::Result<()>;
}

pub struct KubeRolloutSink {
    pub client: Client,
}

#[async_trait]
impl RolloutSink for KubeRolloutSink {
    async fn rollout(&self, workload: &WorkloadKey) -> anyhow::Result<()> {
        match workload.kind {
            WorkloadKind::Deployment => {
                let api: kube::Api<Deployment> = kube::Api::namespaced(self.client.clone(), &workload.namespace);
                Deployment::patch_restart_count_annotation(&api, &workload.name).await
            }
            WorkloadKind::DaemonSet => {
                let api: kube::Api<DaemonSet> = kube::Api::namespaced(self.client.clone(), &workload.namespace);
                DaemonSet::patch_restart_count_annotation(&api, &workload.name).await
            }
            WorkloadKind::StatefulSet => {
                let api: kube::Api<StatefulSet> = kube::Api::namespaced(self.client.clone(), &workload.namespace);
                StatefulSet::patch_restart_count_annotation(&api, &workload.name).await
            }
        }
        .with_context(|| format!("rollout failed for {workload}"))
    }
}

pub struct ReloaderContext {
    pub index: Arc<Index>,
    pub backend: SharedBackend,
    pub rollout_sink: Arc<dyn RolloutSink>,
    pub ignore_missing_secrets: bool,
    pub restart_threshold: f64,
}

/// Runs the reloader on `run_period`, stopping once `cancel` fires. A round
/// in flight when cancellation is requested is allowed to finish.
pub async fn run(ctx: ReloaderContext, run_period: std::time::Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(run_period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(worker = "reloader", "reloader stopped");
                return;
            }
            _ = interval.tick() => {
                run_round(&ctx).await;
            }
        }
    }
}

/// One firing of the reloader: an atomic, observable unit of reconciliation.
pub async fn run_round(ctx: &ReloaderContext) {
    if ctx.index.is_empty() {
        debug!(worker = "reloader", "index empty; nothing to do");
        return;
    }

    if let Err(err) = ctx.backend.health_check().await {
        error!(worker = "reloader", error = %err, "backend unhealthy; skipping round");
        return;
    }

    let marked: Mutex<HashMap<WorkloadKey, RestartReason>> = Mutex::new(HashMap::new());
    let by_workload = ctx.index.snapshot_by_workload();
    let by_secret = ctx.index.snapshot_by_secret();

    run_phase_a(ctx, &by_workload, &by_secret, &marked).await;
    run_phase_b(ctx, &by_workload, &marked);
    run_phase_c(ctx, marked).await;
}

/// KV version check, in parallel across every tracked KV path.
async fn run_phase_a(
    ctx: &ReloaderContext,
    by_workload: &HashMap<WorkloadKey, Vec<crate::types::SecretRef>>,
    by_secret: &HashMap<String, Vec<WorkloadKey>>,
    marked: &Mutex<HashMap<WorkloadKey, RestartReason>>,
) {
    let kv_paths: Vec<(String, Vec<WorkloadKey>, Option<u64>)> = by_secret
        .iter()
        .filter_map(|(path, workloads)| {
            let current_version = workloads.iter().find_map(|w| {
                by_workload
                    .get(w)
                    .and_then(|refs| refs.iter().find(|r| &r.path == path))
                    .and_then(|r| r.classification.kv_version())
            });
            let is_kv = workloads.iter().any(|w| {
                by_workload
                    .get(w)
                    .and_then(|refs| refs.iter().find(|r| &r.path == path))
                    .map(|r| r.classification.is_kv())
                    .unwrap_or(false)
            });
            is_kv.then(|| (path.clone(), workloads.clone(), current_version))
        })
        .collect();

    let reads = kv_paths.into_iter().map(|(path, workloads, current_version)| async move {
        let result = ctx.backend.read(&path).await;
        (path, workloads, current_version, result)
    });

    for (path, workloads, current_version, result) in join_all(reads).await {
        match result {
            Ok(info) => {
                let Some(new_version) = info.classification.kv_version() else {
                    warn!(worker = "reloader", path, "path is no longer KV-classified; skipping this round");
                    continue;
                };
                if Some(new_version) != current_version {
                    info!(worker = "reloader", path, old = ?current_version, new = new_version, "KV secret version changed");
                    for w in &workloads {
                        ctx.index.update_kv_version(w, &path, new_version);
                    }
                    let mut guard = marked.lock().expect("marked set poisoned");
                    for w in workloads {
                        guard.insert(w, RestartReason::KvVersionChanged);
                    }
                }
            }
            Err(BackendError::NotFound { .. }) => {
                if ctx.ignore_missing_secrets {
                    warn!(worker = "reloader", path, "secret not found; ignoring because VAULT_IGNORE_MISSING_SECRETS is set");
                } else {
                    error!(worker = "reloader", path, "secret not found");
                }
            }
            Err(err) => {
                error!(worker = "reloader", path, error = %err, "failed to read secret");
            }
        }
    }
}

/// Dynamic TTL check. A workload already marked by Phase A is left alone:
/// KV wins.
fn run_phase_b(
    ctx: &ReloaderContext,
    by_workload: &HashMap<WorkloadKey, Vec<crate::types::SecretRef>>,
    marked: &Mutex<HashMap<WorkloadKey, RestartReason>>,
) {
    let now = Utc::now();
    for workload in by_workload.keys() {
        let Some(tracking) = ctx.index.get_tracking(workload) else {
            continue;
        };
        if tracking.shortest_dynamic_ttl_seconds == 0 {
            continue;
        }

        let mut guard = marked.lock().expect("marked set poisoned");
        if guard.contains_key(workload) {
            continue;
        }

        let elapsed = (now - tracking.last_restart_time).num_seconds().max(0) as u64;
        let threshold_seconds = (ctx.restart_threshold * tracking.shortest_dynamic_ttl_seconds as f64) as u64;
        if elapsed >= threshold_seconds {
            info!(worker = "reloader", workload = %workload, elapsed, threshold_seconds, "dynamic TTL threshold reached");
            guard.insert(workload.clone(), RestartReason::DynamicTtlReached);
        }
    }
}

/// Rollout, in parallel across every marked workload.
async fn run_phase_c(ctx: &ReloaderContext, marked: Mutex<HashMap<WorkloadKey, RestartReason>>) {
    let marked = marked.into_inner().expect("marked set poisoned");
    let rollouts = marked.into_iter().map(|(workload, reason)| async move {
        match ctx.rollout_sink.rollout(&workload).await {
            Ok(()) => {
                info!(worker = "reloader", workload = %workload, %reason, "triggered rollout");
                ctx.index.set_last_restart(&workload, Utc::now());
            }
            Err(err) => {
                error!(worker = "reloader", workload = %workload, %reason, error = %err, "rollout failed; will retry next round");
            }
        }
    });
    join_all(rollouts).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SecretClassification, SecretRef};
    use crate::vault::{LeaseInfo, SecretInfo, SecretBackend};
    use std::collections::{HashMap as StdHashMap, HashSet};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration as StdDuration;

    struct FakeBackend {
        classifications: StdMutex<StdHashMap<String, SecretClassification>>,
        not_found: StdMutex<HashSet<String>>,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                classifications: StdMutex::new(StdHashMap::new()),
                not_found: StdMutex::new(HashSet::new()),
            }
        }

        fn set_kv(&self, path: &str, version: u64) {
            self.classifications
                .lock()
                .unwrap()
                .insert(path.to_string(), SecretClassification::Kv { version });
        }

        fn set_not_found(&self, path: &str) {
            self.not_found.lock().unwrap().insert(path.to_string());
        }
    }

    #[async_trait]
    impl SecretBackend for FakeBackend {
        async fn read(&self, path: &str) -> Result<SecretInfo, BackendError> {
            if self.not_found.lock().unwrap().contains(path) {
                return Err(BackendError::NotFound { path: path.to_string() });
            }
            self.classifications
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .map(|classification| SecretInfo { path: path.to_string(), classification })
                .ok_or_else(|| BackendError::NotFound { path: path.to_string() })
        }

        async fn renew_lease(&self, _path: &str, _lease_id: &str) -> Result<LeaseInfo, BackendError> {
            unimplemented!("not exercised by these tests")
        }

        async fn health_check(&self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    struct FakeRolloutSink {
        calls: StdMutex<Vec<WorkloadKey>>,
        fail_for: StdMutex<HashSet<WorkloadKey>>,
    }

    impl FakeRolloutSink {
        fn new() -> Self {
            Self {
                calls: StdMutex::new(Vec::new()),
                fail_for: StdMutex::new(HashSet::new()),
            }
        }

        fn fail(&self, workload: &WorkloadKey) {
            self.fail_for.lock().unwrap().insert(workload.clone());
        }

        fn calls(&self) -> Vec<WorkloadKey> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RolloutSink for FakeRolloutSink {
        async fn rollout(&self, workload: &WorkloadKey) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(workload.clone());
            if self.fail_for.lock().unwrap().contains(workload) {
                anyhow::bail!("simulated rollout failure for {workload}");
            }
            Ok(())
        }
    }

    fn key(name: &str) -> WorkloadKey {
        WorkloadKey {
            namespace: "default".to_string(),
            name: name.to_string(),
            kind: WorkloadKind::Deployment,
        }
    }

    fn ctx(backend: Arc<FakeBackend>, sink: Arc<FakeRolloutSink>) -> (ReloaderContext, Arc<Index>) {
        let index = Arc::new(Index::new());
        let ctx = ReloaderContext {
            index: index.clone(),
            backend,
            rollout_sink: sink,
            ignore_missing_secrets: false,
            restart_threshold: 0.7,
        };
        (ctx, index)
    }

    #[tokio::test]
    async fn unchanged_kv_version_triggers_no_rollout() {
        let backend = Arc::new(FakeBackend::new());
        backend.set_kv("secret/data/mysql", 1);
        let sink = Arc::new(FakeRolloutSink::new());
        let (ctx, index) = ctx(backend, sink.clone());

        index.upsert(key("w"), vec![SecretRef::new("secret/data/mysql", SecretClassification::Kv { version: 1 })]);

        run_round(&ctx).await;

        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn kv_bump_triggers_restart_and_records_new_version() {
        let backend = Arc::new(FakeBackend::new());
        backend.set_kv("secret/data/mysql", 2);
        let sink = Arc::new(FakeRolloutSink::new());
        let (ctx, index) = ctx(backend, sink.clone());

        index.upsert(key("w"), vec![SecretRef::new("secret/data/mysql", SecretClassification::Kv { version: 1 })]);

        run_round(&ctx).await;

        assert_eq!(sink.calls(), vec![key("w")]);
        let refs = index.snapshot_by_workload();
        assert_eq!(
            refs.get(&key("w")).unwrap()[0].classification,
            SecretClassification::Kv { version: 2 }
        );
    }

    #[tokio::test]
    async fn shared_secret_restarts_each_workload_exactly_once() {
        let backend = Arc::new(FakeBackend::new());
        backend.set_kv("secret/data/aws", 4);
        let sink = Arc::new(FakeRolloutSink::new());
        let (ctx, index) = ctx(backend, sink.clone());

        index.upsert(key("a"), vec![SecretRef::new("secret/data/aws", SecretClassification::Kv { version: 3 })]);
        index.upsert(key("b"), vec![SecretRef::new("secret/data/aws", SecretClassification::Kv { version: 3 })]);

        run_round(&ctx).await;

        let mut calls = sink.calls();
        calls.sort();
        assert_eq!(calls, vec![key("a"), key("b")]);
    }

    #[tokio::test]
    async fn missing_secret_with_ignore_flag_skips_restart_and_keeps_path() {
        let backend = Arc::new(FakeBackend::new());
        backend.set_not_found("secret/data/gone");
        let sink = Arc::new(FakeRolloutSink::new());
        let (mut ctx, index) = ctx(backend, sink.clone());
        ctx.ignore_missing_secrets = true;

        index.upsert(key("w"), vec![SecretRef::new("secret/data/gone", SecretClassification::Kv { version: 1 })]);

        run_round(&ctx).await;

        assert!(sink.calls().is_empty());
        assert!(index.snapshot_by_workload().contains_key(&key("w")));
    }

    #[tokio::test]
    async fn dynamic_ttl_restart_boundary() {
        let backend = Arc::new(FakeBackend::new());
        let sink = Arc::new(FakeRolloutSink::new());
        let (ctx, index) = ctx(backend, sink.clone());

        let dyn_ref = SecretRef::new(
            "database/creds/app",
            SecretClassification::Dynamic {
                lease_id: "lease-1".to_string(),
                ttl_seconds: 1000,
                renewable: true,
            },
        );
        index.upsert(key("w"), vec![dyn_ref]);
        index.upsert_tracking(key("w"), Utc::now() - chrono::Duration::seconds(700), 1000);

        run_round(&ctx).await;
        assert_eq!(sink.calls(), vec![key("w")]);

        // reset and check the not-yet-due case
        let sink2 = Arc::new(FakeRolloutSink::new());
        let backend2 = Arc::new(FakeBackend::new());
        let (ctx2, index2) = ctx(backend2, sink2.clone());
        index2.upsert(key("w"), vec![SecretRef::new(
            "database/creds/app",
            SecretClassification::Dynamic { lease_id: "lease-1".to_string(), ttl_seconds: 1000, renewable: true },
        )]);
        index2.upsert_tracking(key("w"), Utc::now() - chrono::Duration::seconds(500), 1000);

        run_round(&ctx2).await;
        assert!(sink2.calls().is_empty());
    }

    #[tokio::test]
    async fn kv_change_and_ttl_elapsed_produce_exactly_one_restart() {
        let backend = Arc::new(FakeBackend::new());
        backend.set_kv("secret/data/mysql", 2);
        let sink = Arc::new(FakeRolloutSink::new());
        let (ctx, index) = ctx(backend, sink.clone());

        let dyn_ref = SecretRef::new(
            "database/creds/app",
            SecretClassification::Dynamic { lease_id: "lease-1".to_string(), ttl_seconds: 1000, renewable: true },
        );
        index.upsert(
            key("w"),
            vec![SecretRef::new("secret/data/mysql", SecretClassification::Kv { version: 1 }), dyn_ref],
        );
        index.upsert_tracking(key("w"), Utc::now() - chrono::Duration::seconds(900), 1000);

        run_round(&ctx).await;

        assert_eq!(sink.calls(), vec![key("w")]);
    }

    #[tokio::test]
    async fn rollout_failure_does_not_update_last_restart_or_drop_workload() {
        let backend = Arc::new(FakeBackend::new());
        backend.set_kv("secret/data/mysql", 2);
        let sink = Arc::new(FakeRolloutSink::new());
        sink.fail(&key("w"));
        let (ctx, index) = ctx(backend, sink.clone());

        let before = Utc::now() - chrono::Duration::seconds(10_000);
        index.upsert(key("w"), vec![SecretRef::new("secret/data/mysql", SecretClassification::Kv { version: 1 })]);
        index.upsert_tracking(key("w"), before, 0);

        run_round(&ctx).await;

        assert_eq!(sink.calls(), vec![key("w")]);
        let tracking = index.get_tracking(&key("w")).unwrap();
        assert_eq!(tracking.last_restart_time, before);
        assert!(index.snapshot_by_workload().contains_key(&key("w")));
    }

    #[tokio::test]
    async fn empty_index_short_circuits_without_touching_backend() {
        let backend = Arc::new(FakeBackend::new());
        let sink = Arc::new(FakeRolloutSink::new());
        let (ctx, _index) = ctx(backend, sink.clone());

        run_round(&ctx).await;
        assert!(sink.calls().is_empty());
    }

    #[test]
    fn threshold_boundary_is_inclusive() {
        let shortest_ttl = 1000u64;
        let threshold = 0.7;
        let elapsed_due = StdDuration::from_secs(700).as_secs();
        assert!(elapsed_due as f64 >= threshold * shortest_ttl as f64);
    }
}
