// # Desired-State Records
//
// One namespaced record per managed workload, keyed by the stable workload
// id: a spec carrying the desired CPU request/limit (written by the agent)
// and a status substructure (written by the applier). Writes use optimistic
// concurrency: read-modify-write against a version stamp, bounded retry on
// conflict. Spec writes never overwrite the applier's status fields.

use crate::common::{WorkloadId, WorkloadRef};
use crate::error::AgentError;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Apply-side lifecycle of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyPhase {
    Pending,
    Applied,
    Failed,
}

/// Agent-owned half of the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredSpec {
    pub namespace: String,
    pub pod_name: String,
    /// Human millicore string, e.g. "450m".
    pub desired_cpu_request: String,
    pub desired_cpu_limit: String,
}

impl DesiredSpec {
    pub fn reference(&self) -> WorkloadRef {
        WorkloadRef::new(self.namespace.clone(), self.pod_name.clone())
    }
}

/// Applier-owned half of the record, plus the shadow price the agent
/// publishes alongside each spec write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredStatus {
    pub applied_cpu_request: Option<String>,
    pub applied_cpu_limit: Option<String>,
    pub phase: ApplyPhase,
    pub last_applied_time: Option<DateTime<Utc>>,
    pub last_attempt_time: Option<DateTime<Utc>>,
    pub shadow_price_cpu: f64,
    pub reason: Option<String>,
}

impl Default for DesiredStatus {
    fn default() -> Self {
        Self {
            applied_cpu_request: None,
            applied_cpu_limit: None,
            phase: ApplyPhase::Pending,
            last_applied_time: None,
            last_attempt_time: None,
            shadow_price_cpu: 0.0,
            reason: None,
        }
    }
}

impl DesiredStatus {
    /// Applier acknowledgement: the live limits now match the spec.
    pub fn acknowledge_applied(&mut self, request: String, limit: String) {
        self.applied_cpu_request = Some(request);
        self.applied_cpu_limit = Some(limit);
        self.phase = ApplyPhase::Applied;
        let now = Utc::now();
        self.last_applied_time = Some(now);
        self.last_attempt_time = Some(now);
        self.reason = None;
    }

    /// Applier rejection, e.g. a safety check.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.phase = ApplyPhase::Failed;
        self.last_attempt_time = Some(Utc::now());
        self.reason = Some(reason.into());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredStateRecord {
    pub spec: DesiredSpec,
    pub status: DesiredStatus,
    /// Optimistic-concurrency stamp, bumped on every successful write.
    pub version: u64,
}

/// Versioned record store. `put` enforces the version the caller read;
/// `None` expects the record to be absent.
#[async_trait::async_trait]
pub trait DesiredStateStore: Send + Sync {
    async fn get(&self, id: &WorkloadId) -> Result<Option<DesiredStateRecord>>;
    async fn put(
        &self,
        id: &WorkloadId,
        record: DesiredStateRecord,
        expected_version: Option<u64>,
    ) -> Result<()>;
    async fn delete(&self, id: &WorkloadId) -> Result<()>;
    async fn list(&self) -> Result<Vec<(WorkloadId, DesiredStateRecord)>>;
}

/// Conflict retries before a publish is counted as a transient failure.
const PUBLISH_RETRY_BUDGET: u32 = 3;

/// Read-modify-write publish of a spec plus the shadow price, preserving the
/// applier's status fields and retrying version conflicts with a fresh read.
pub async fn publish_spec(
    store: &dyn DesiredStateStore,
    id: &WorkloadId,
    spec: DesiredSpec,
    shadow_price: f64,
) -> Result<()> {
    let mut last_err = None;
    for attempt in 0..PUBLISH_RETRY_BUDGET {
        let existing = store.get(id).await?;
        let (record, expected) = match existing {
            Some(mut record) => {
                let spec_changed = record.spec != spec;
                let expected = Some(record.version);
                record.spec = spec.clone();
                record.status.shadow_price_cpu = shadow_price;
                if spec_changed {
                    record.status.phase = ApplyPhase::Pending;
                }
                record.version += 1;
                (record, expected)
            }
            None => (
                DesiredStateRecord {
                    spec: spec.clone(),
                    status: DesiredStatus {
                        shadow_price_cpu: shadow_price,
                        ..Default::default()
                    },
                    version: 1,
                },
                None,
            ),
        };

        match store.put(id, record, expected).await {
            Ok(()) => return Ok(()),
            Err(e @ AgentError::Conflict(_)) => {
                debug!(workload = %id, attempt, "publish conflict, re-reading");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| AgentError::Internal("publish retry budget".to_string())))
}

// ============================================================================
// Sled-backed store
// ============================================================================

const DESIRED_TREE: &str = "desired-state";

pub struct SledDesiredStore {
    tree: sled::Tree,
}

impl SledDesiredStore {
    pub fn new(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree(DESIRED_TREE)?,
        })
    }
}

#[async_trait::async_trait]
impl DesiredStateStore for SledDesiredStore {
    async fn get(&self, id: &WorkloadId) -> Result<Option<DesiredStateRecord>> {
        match self.tree.get(id.as_str())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        id: &WorkloadId,
        record: DesiredStateRecord,
        expected_version: Option<u64>,
    ) -> Result<()> {
        let current = self.tree.get(id.as_str())?;
        let current_version = match &current {
            Some(raw) => Some(serde_json::from_slice::<DesiredStateRecord>(raw)?.version),
            None => None,
        };
        if current_version != expected_version {
            return Err(AgentError::Conflict(format!(
                "{}: expected version {:?}, found {:?}",
                id, expected_version, current_version
            )));
        }

        let new = serde_json::to_vec(&record)?;
        // Compare-and-swap against the exact bytes we read so a concurrent
        // writer between our read and this point still surfaces as a
        // conflict.
        self.tree
            .compare_and_swap(id.as_str(), current, Some(new))?
            .map_err(|e| AgentError::Conflict(format!("{}: {}", id, e)))?;
        Ok(())
    }

    async fn delete(&self, id: &WorkloadId) -> Result<()> {
        self.tree.remove(id.as_str())?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(WorkloadId, DesiredStateRecord)>> {
        let mut out = Vec::new();
        for entry in self.tree.iter() {
            let (key, raw) = entry?;
            let id = WorkloadId::new(String::from_utf8_lossy(&key).to_string());
            out.push((id, serde_json::from_slice(&raw)?));
        }
        Ok(out)
    }
}

// ============================================================================
// In-memory store (tests and local dry runs)
// ============================================================================

#[derive(Default)]
pub struct MemoryDesiredStore {
    records: parking_lot::Mutex<HashMap<WorkloadId, DesiredStateRecord>>,
    fail_puts: std::sync::atomic::AtomicU32,
    put_count: std::sync::atomic::AtomicU64,
}

impl MemoryDesiredStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` puts fail with a transient store error.
    pub fn fail_next_puts(&self, n: u32) {
        self.fail_puts
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    /// Total successful puts, for write-count assertions.
    pub fn put_count(&self) -> u64 {
        self.put_count.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl DesiredStateStore for MemoryDesiredStore {
    async fn get(&self, id: &WorkloadId) -> Result<Option<DesiredStateRecord>> {
        Ok(self.records.lock().get(id).cloned())
    }

    async fn put(
        &self,
        id: &WorkloadId,
        record: DesiredStateRecord,
        expected_version: Option<u64>,
    ) -> Result<()> {
        use std::sync::atomic::Ordering;
        if self
            .fail_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AgentError::Store("injected put failure".to_string()));
        }

        let mut records = self.records.lock();
        let current_version = records.get(id).map(|r| r.version);
        if current_version != expected_version {
            return Err(AgentError::Conflict(format!(
                "{}: expected version {:?}, found {:?}",
                id, expected_version, current_version
            )));
        }
        records.insert(id.clone(), record);
        self.put_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, id: &WorkloadId) -> Result<()> {
        self.records.lock().remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(WorkloadId, DesiredStateRecord)>> {
        let mut out: Vec<_> = self
            .records
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::format_millis;

    fn spec(millis: u32) -> DesiredSpec {
        DesiredSpec {
            namespace: "default".to_string(),
            pod_name: "web-1".to_string(),
            desired_cpu_request: format_millis(millis * 9 / 10),
            desired_cpu_limit: format_millis(millis),
        }
    }

    #[tokio::test]
    async fn publish_creates_then_updates() {
        let store = MemoryDesiredStore::new();
        let id = WorkloadId::from("w1");

        publish_spec(&store, &id, spec(500), 0.1).await.unwrap();
        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.status.phase, ApplyPhase::Pending);
        assert!((record.status.shadow_price_cpu - 0.1).abs() < 1e-9);

        publish_spec(&store, &id, spec(700), 0.2).await.unwrap();
        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.spec.desired_cpu_limit, "700m");
    }

    #[tokio::test]
    async fn publish_preserves_applier_status() {
        let store = MemoryDesiredStore::new();
        let id = WorkloadId::from("w1");
        publish_spec(&store, &id, spec(500), 0.0).await.unwrap();

        // Applier acknowledges through the status sub-resource.
        let mut record = store.get(&id).await.unwrap().unwrap();
        record
            .status
            .acknowledge_applied("450m".to_string(), "500m".to_string());
        let version = record.version;
        record.version += 1;
        store.put(&id, record, Some(version)).await.unwrap();

        // The next spec write keeps the applied fields and re-pends.
        publish_spec(&store, &id, spec(700), 0.3).await.unwrap();
        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status.applied_cpu_limit.as_deref(), Some("500m"));
        assert_eq!(record.status.phase, ApplyPhase::Pending);
    }

    #[tokio::test]
    async fn unchanged_spec_does_not_repend() {
        let store = MemoryDesiredStore::new();
        let id = WorkloadId::from("w1");
        publish_spec(&store, &id, spec(500), 0.0).await.unwrap();

        let mut record = store.get(&id).await.unwrap().unwrap();
        record
            .status
            .acknowledge_applied("450m".to_string(), "500m".to_string());
        let version = record.version;
        record.version += 1;
        store.put(&id, record, Some(version)).await.unwrap();

        publish_spec(&store, &id, spec(500), 0.4).await.unwrap();
        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status.phase, ApplyPhase::Applied);
        assert!((record.status.shadow_price_cpu - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn version_mismatch_is_conflict() {
        let store = MemoryDesiredStore::new();
        let id = WorkloadId::from("w1");
        publish_spec(&store, &id, spec(500), 0.0).await.unwrap();

        let record = store.get(&id).await.unwrap().unwrap();
        let err = store.put(&id, record, Some(99)).await.unwrap_err();
        assert!(matches!(err, AgentError::Conflict(_)));
    }

    #[tokio::test]
    async fn sled_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = SledDesiredStore::new(&db).unwrap();
        let id = WorkloadId::from("w1");

        publish_spec(&store, &id, spec(500), 0.1).await.unwrap();
        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.spec.desired_cpu_limit, "500m");
        assert_eq!(record.version, 1);

        publish_spec(&store, &id, spec(800), 0.2).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);

        store.delete(&id).await.unwrap();
        assert!(store.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sled_store_detects_version_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = SledDesiredStore::new(&db).unwrap();
        let id = WorkloadId::from("w1");

        publish_spec(&store, &id, spec(500), 0.0).await.unwrap();
        let stale = store.get(&id).await.unwrap().unwrap();

        // A concurrent writer bumps the version underneath us.
        let mut fresh = stale.clone();
        fresh.version += 1;
        store.put(&id, fresh, Some(stale.version)).await.unwrap();

        let err = store
            .put(&id, stale.clone(), Some(stale.version))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Conflict(_)));
    }

    #[tokio::test]
    async fn injected_failures_surface_as_store_errors() {
        let store = MemoryDesiredStore::new();
        let id = WorkloadId::from("w1");
        store.fail_next_puts(PUBLISH_RETRY_BUDGET + 1);
        let err = publish_spec(&store, &id, spec(500), 0.0).await.unwrap_err();
        assert!(matches!(err, AgentError::Store(_)));
    }
}
