//! The bidirectional workload/secret index. `by_secret` is always derived
//! from `by_workload` on read rather than maintained as a second source of
//! truth, so the two views can never drift apart.

use crate::types::{SecretRef, WorkloadKey, WorkloadTracking};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
struct IndexState {
    by_workload: HashMap<WorkloadKey, Vec<SecretRef>>,
    tracking: HashMap<WorkloadKey, WorkloadTracking>,
}

pub struct Index {
    state: RwLock<IndexState>,
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

impl Index {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
        }
    }

    /// Atomically replaces a workload's reference list.
    pub fn upsert(&self, workload: WorkloadKey, refs: Vec<SecretRef>) {
        let mut state = self.state.write().expect("index lock poisoned");
        state.by_workload.insert(workload, refs);
    }

    /// Removes a workload from both maps and from tracking.
    pub fn delete(&self, workload: &WorkloadKey) {
        let mut state = self.state.write().expect("index lock poisoned");
        state.by_workload.remove(workload);
        state.tracking.remove(workload);
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.read().expect("index lock poisoned");
        state.by_workload.is_empty()
    }

    /// Owned snapshot; safe to iterate without holding the lock.
    pub fn snapshot_by_workload(&self) -> HashMap<WorkloadKey, Vec<SecretRef>> {
        let state = self.state.read().expect("index lock poisoned");
        state.by_workload.clone()
    }

    /// Derived inverse view, rebuilt fresh on every call.
    pub fn snapshot_by_secret(&self) -> HashMap<String, Vec<WorkloadKey>> {
        let state = self.state.read().expect("index lock poisoned");
        let mut by_secret: HashMap<String, Vec<WorkloadKey>> = HashMap::new();
        for (workload, refs) in state.by_workload.iter() {
            for r in refs {
                by_secret.entry(r.path.clone()).or_default().push(workload.clone());
            }
        }
        by_secret
    }

    /// Narrow mutation used by the reloader after a successful KV read; a
    /// no-op if the path is no longer present (workload may have been
    /// re-upserted or deleted concurrently).
    pub fn update_kv_version(&self, workload: &WorkloadKey, path: &str, new_version: u64) {
        use crate::types::SecretClassification;

        let mut state = self.state.write().expect("index lock poisoned");
        if let Some(refs) = state.by_workload.get_mut(workload) {
            for r in refs.iter_mut() {
                if r.path == path {
                    if let SecretClassification::Kv { version } = &mut r.classification {
                        *version = new_version;
                    }
                }
            }
        }
    }

    pub fn upsert_tracking(
        &self,
        workload: WorkloadKey,
        last_restart: DateTime<Utc>,
        shortest_ttl_seconds: u64,
    ) {
        let mut state = self.state.write().expect("index lock poisoned");
        state.tracking.insert(
            workload,
            WorkloadTracking {
                last_restart_time: last_restart,
                shortest_dynamic_ttl_seconds: shortest_ttl_seconds,
            },
        );
    }

    pub fn set_last_restart(&self, workload: &WorkloadKey, at: DateTime<Utc>) {
        let mut state = self.state.write().expect("index lock poisoned");
        if let Some(tracking) = state.tracking.get_mut(workload) {
            tracking.last_restart_time = at;
        }
    }

    pub fn get_tracking(&self, workload: &WorkloadKey) -> Option<WorkloadTracking> {
        let state = self.state.read().expect("index lock poisoned");
        state.tracking.get(workload).copied()
    }

    /// Existing dynamic `SecretRef`s for a workload, keyed by path, reused by
    /// the collector to avoid a backend round-trip on every event.
    pub fn dynamic_refs_for(&self, workload: &WorkloadKey) -> HashMap<String, SecretRef> {
        let state = self.state.read().expect("index lock poisoned");
        state
            .by_workload
            .get(workload)
            .map(|refs| {
                refs.iter()
                    .filter(|r| r.classification.is_dynamic())
                    .map(|r| (r.path.clone(), r.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}
