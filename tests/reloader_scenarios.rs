//! End-to-end reloader scenarios (spec-level scenarios, not unit-level
//! phase tests, those live beside `reloader.rs`). Drives a full
//! `run_round` against an in-memory fake backend and rollout sink.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use vault_secrets_reloader::index::Index;
use vault_secrets_reloader::reloader::{run_round, ReloaderContext, RolloutSink};
use vault_secrets_reloader::types::{SecretClassification, SecretRef, WorkloadKey, WorkloadKind};
use vault_secrets_reloader::vault::{BackendError, LeaseInfo, SecretBackend, SecretInfo};

struct FakeBackend {
    classifications: Mutex<HashMap<String, SecretClassification>>,
    not_found: Mutex<HashSet<String>>,
    healthy: Mutex<bool>,
}

impl FakeBackend {
    fn new() -> Self {
        Self {
            classifications: Mutex::new(HashMap::new()),
            not_found: Mutex::new(HashSet::new()),
            healthy: Mutex::new(true),
        }
    }

    fn set_kv(&self, path: &str, version: u64) {
        self.classifications.lock().unwrap().insert(path.to_string(), SecretClassification::Kv { version });
    }

    fn set_dynamic(&self, path: &str, lease_id: &str, ttl_seconds: u64) {
        self.classifications.lock().unwrap().insert(
            path.to_string(),
            SecretClassification::Dynamic { lease_id: lease_id.to_string(), ttl_seconds, renewable: true },
        );
    }

    fn set_not_found(&self, path: &str) {
        self.not_found.lock().unwrap().insert(path.to_string());
    }

    fn set_unhealthy(&self) {
        *self.healthy.lock().unwrap() = false;
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
        unimplemented!("not exercised by these scenarios")
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        if *self.healthy.lock().unwrap() {
            Ok(())
        } else {
            Err(BackendError::Io("simulated outage".to_string()))
        }
    }
}

#[derive(Default)]
struct FakeRolloutSink {
    calls: Mutex<Vec<WorkloadKey>>,
}

impl FakeRolloutSink {
    fn calls(&self) -> Vec<WorkloadKey> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RolloutSink for FakeRolloutSink {
    async fn rollout(&self, workload: &WorkloadKey) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(workload.clone());
        Ok(())
    }
}

fn key(name: &str) -> WorkloadKey {
    WorkloadKey { namespace: "default".to_string(), name: name.to_string(), kind: WorkloadKind::Deployment }
}

fn context(backend: Arc<FakeBackend>, sink: Arc<FakeRolloutSink>) -> (ReloaderContext, Arc<Index>) {
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

/// Two unrelated workloads, one with a KV bump and one untouched: only the
/// first rolls.
#[tokio::test]
async fn only_the_workload_with_a_changed_secret_rolls() {
    let backend = Arc::new(FakeBackend::new());
    backend.set_kv("secret/data/mysql", 2);
    backend.set_kv("secret/data/redis", 1);
    let sink = Arc::new(FakeRolloutSink::default());
    let (ctx, index) = context(backend, sink.clone());

    index.upsert(key("web"), vec![SecretRef::new("secret/data/mysql", SecretClassification::Kv { version: 1 })]);
    index.upsert(key("cache"), vec![SecretRef::new("secret/data/redis", SecretClassification::Kv { version: 1 })]);

    run_round(&ctx).await;

    assert_eq!(sink.calls(), vec![key("web")]);
}

/// A round where the backend is unreachable does no work and leaves the
/// index untouched.
#[tokio::test]
async fn unhealthy_backend_aborts_the_round() {
    let backend = Arc::new(FakeBackend::new());
    backend.set_kv("secret/data/mysql", 2);
    backend.set_unhealthy();
    let sink = Arc::new(FakeRolloutSink::default());
    let (ctx, index) = context(backend, sink.clone());

    index.upsert(key("web"), vec![SecretRef::new("secret/data/mysql", SecretClassification::Kv { version: 1 })]);

    run_round(&ctx).await;

    assert!(sink.calls().is_empty());
    let refs = index.snapshot_by_workload();
    assert_eq!(refs.get(&key("web")).unwrap()[0].classification, SecretClassification::Kv { version: 1 });
}

/// A workload tracking both a KV secret and a dynamic lease: the dynamic
/// lease is not yet due, only the KV bump fires, and it fires once.
#[tokio::test]
async fn kv_change_fires_independently_of_a_not_yet_due_lease() {
    let backend = Arc::new(FakeBackend::new());
    backend.set_kv("secret/data/mysql", 5);
    backend.set_dynamic("database/creds/app", "lease-9", 10_000);
    let sink = Arc::new(FakeRolloutSink::default());
    let (ctx, index) = context(backend, sink.clone());

    index.upsert(
        key("api"),
        vec![
            SecretRef::new("secret/data/mysql", SecretClassification::Kv { version: 4 }),
            SecretRef::new(
                "database/creds/app",
                SecretClassification::Dynamic { lease_id: "lease-9".to_string(), ttl_seconds: 10_000, renewable: true },
            ),
        ],
    );
    index.upsert_tracking(key("api"), Utc::now(), 10_000);

    run_round(&ctx).await;

    assert_eq!(sink.calls(), vec![key("api")]);
}

/// After a restart, a subsequent round with nothing changed is a no-op:
/// restarts don't repeat without a new diff.
#[tokio::test]
async fn restart_does_not_repeat_without_a_new_change() {
    let backend = Arc::new(FakeBackend::new());
    backend.set_kv("secret/data/mysql", 2);
    let sink = Arc::new(FakeRolloutSink::default());
    let (ctx, index) = context(backend, sink.clone());

    index.upsert(key("web"), vec![SecretRef::new("secret/data/mysql", SecretClassification::Kv { version: 1 })]);

    run_round(&ctx).await;
    assert_eq!(sink.calls(), vec![key("web")]);

    run_round(&ctx).await;
    assert_eq!(sink.calls(), vec![key("web")], "second round must not roll again with no version change");
}

/// A missing secret without the ignore flag is reported as an error but
/// still doesn't trigger a restart, and the workload stays tracked.
#[tokio::test]
async fn missing_secret_without_ignore_flag_does_not_restart() {
    let backend = Arc::new(FakeBackend::new());
    backend.set_not_found("secret/data/gone");
    let sink = Arc::new(FakeRolloutSink::default());
    let (ctx, index) = context(backend, sink.clone());

    index.upsert(key("web"), vec![SecretRef::new("secret/data/gone", SecretClassification::Kv { version: 1 })]);

    run_round(&ctx).await;

    assert!(sink.calls().is_empty());
    assert!(index.snapshot_by_workload().contains_key(&key("web")));
}
