use chrono::{DateTime, Utc};
use std::fmt;

/// Identity of a rollout-capable resource: the map key the index and reloader
/// key everything off of.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadKey {
    pub namespace: String,
    pub name: String,
    pub kind: WorkloadKind,
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkloadKind {
    Deployment,
    DaemonSet,
    StatefulSet,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::StatefulSet => "StatefulSet",
        };
        f.write_str(s)
    }
}

/// How a backend path classified: exactly one variant, never both-or-neither.
/// Keeping this as an enum (rather than two bools plus two numbers) makes the
/// "exactly one of is_kv/is_dynamic" invariant a type-level guarantee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretClassification {
    Kv { version: u64 },
    Dynamic {
        lease_id: String,
        ttl_seconds: u64,
        renewable: bool,
    },
}

impl SecretClassification {
    pub fn is_kv(&self) -> bool {
        matches!(self, SecretClassification::Kv { .. })
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, SecretClassification::Dynamic { .. })
    }

    pub fn kv_version(&self) -> Option<u64> {
        match self {
            SecretClassification::Kv { version } => Some(*version),
            SecretClassification::Dynamic { .. } => None,
        }
    }

    pub fn ttl_seconds(&self) -> Option<u64> {
        match self {
            SecretClassification::Dynamic { ttl_seconds, .. } => Some(*ttl_seconds),
            SecretClassification::Kv { .. } => None,
        }
    }
}

/// A normalized backend path plus its classification. Never constructed in
/// the "not yet classified" state: building one requires a backend read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub path: String,
    pub classification: SecretClassification,
}

impl SecretRef {
    pub fn new(path: impl Into<String>, classification: SecretClassification) -> Self {
        Self {
            path: path.into(),
            classification,
        }
    }
}

/// Per-workload runtime state consulted only by the dynamic-TTL decision in
/// the reloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadTracking {
    pub last_restart_time: DateTime<Utc>,
    pub shortest_dynamic_ttl_seconds: u64,
}

/// Why a workload was marked for restart in a reloader round. Kept as a
/// single reason per workload per round: a KV change always wins over an
/// elapsed TTL for the same workload (see design notes on ordering).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    KvVersionChanged,
    DynamicTtlReached,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RestartReason::KvVersionChanged => "KV secret version changed",
            RestartReason::DynamicTtlReached => "dynamic TTL threshold reached",
        };
        f.write_str(s)
    }
}
