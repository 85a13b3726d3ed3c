// # Workload Inventory
//
// Event-driven, eventually-consistent cache of the workloads scheduled on
// this node. Consumers read from the cache only; the remote orchestration
// API is never queried on the read path. A `WorkloadSource` feeds the cache
// with apply/delete events plus an initial-sync marker.

use crate::common::{WorkloadId, WorkloadRef};
use crate::config::AgentConfig;
use crate::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Quality-of-service class assigned by the orchestration layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QosClass {
    Guaranteed,
    Burstable,
    BestEffort,
}

/// Workload lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl Phase {
    pub fn is_running(self) -> bool {
        matches!(self, Phase::Running)
    }
}

/// Cached view of one workload on this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    pub id: WorkloadId,
    pub namespace: String,
    pub name: String,
    pub node_name: String,
    pub phase: Phase,
    pub qos_class: QosClass,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// CPU request from the manifest, millicores.
    pub cpu_request_millis: u32,
    /// CPU limit from the manifest, millicores. None means unlimited.
    pub cpu_limit_millis: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub terminating: bool,
    #[serde(default)]
    pub evicted: bool,
}

impl Workload {
    pub fn reference(&self) -> WorkloadRef {
        WorkloadRef::new(self.namespace.clone(), self.name.clone())
    }
}

/// Event delivered by a `WorkloadSource`.
#[derive(Debug, Clone)]
pub enum WorkloadEvent {
    /// Workload created or updated.
    Applied(Workload),
    /// Workload removed from the node.
    Deleted(WorkloadId),
    /// The source finished its initial listing; the cache now reflects the
    /// full node state.
    Synced,
}

/// Upstream of the inventory. A production deployment attaches a node-scoped
/// List/Watch client here; tests and the local binary drive a channel.
#[async_trait::async_trait]
pub trait WorkloadSource: Send + Sync {
    /// Open the event stream. The source is responsible for reconnecting on
    /// failure and re-listing into the same channel.
    async fn subscribe(&self) -> Result<mpsc::Receiver<WorkloadEvent>>;
}

/// Channel-fed source used by the local binary and the test suites.
pub struct ChannelSource {
    buffer: usize,
    tx: parking_lot::Mutex<Option<mpsc::Sender<WorkloadEvent>>>,
}

impl ChannelSource {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer,
            tx: parking_lot::Mutex::new(None),
        }
    }

    /// Handle for feeding events in. Valid after `subscribe`.
    pub fn sender(&self) -> Option<mpsc::Sender<WorkloadEvent>> {
        self.tx.lock().clone()
    }
}

#[async_trait::async_trait]
impl WorkloadSource for ChannelSource {
    async fn subscribe(&self) -> Result<mpsc::Receiver<WorkloadEvent>> {
        let (tx, rx) = mpsc::channel(self.buffer);
        *self.tx.lock() = Some(tx);
        Ok(rx)
    }
}

/// File-backed source: polls a JSON manifest listing the node's workloads
/// and emits apply/delete events on change. This is the local stand-in for
/// a node-scoped List/Watch client; operators edit the manifest, the agent
/// converges.
pub struct FileSource {
    path: std::path::PathBuf,
    poll_interval: std::time::Duration,
    tx: parking_lot::Mutex<Option<mpsc::Sender<WorkloadEvent>>>,
}

impl FileSource {
    pub fn new(path: impl Into<std::path::PathBuf>, poll_interval: std::time::Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
            tx: parking_lot::Mutex::new(None),
        }
    }

    fn load_manifest(&self) -> Result<Vec<Workload>> {
        let raw = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&raw).map_err(Into::into)
    }

    /// Poll the manifest until shutdown, emitting diffs against the last
    /// seen set. A missing or unparseable manifest leaves the previous
    /// state in place, the way a stale cache is served through an API
    /// outage.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let tx = match self.tx.lock().clone() {
            Some(tx) => tx,
            None => return,
        };
        let mut known: std::collections::HashSet<WorkloadId> = std::collections::HashSet::new();
        let mut synced = false;
        let mut ticker = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let workloads = match self.load_manifest() {
                        Ok(w) => w,
                        Err(e) => {
                            debug!(path = %self.path.display(), error = %e, "manifest unreadable, serving stale state");
                            continue;
                        }
                    };
                    let current: std::collections::HashSet<WorkloadId> =
                        workloads.iter().map(|w| w.id.clone()).collect();
                    for gone in known.difference(&current) {
                        let _ = tx.send(WorkloadEvent::Deleted(gone.clone())).await;
                    }
                    for workload in workloads {
                        let _ = tx.send(WorkloadEvent::Applied(workload)).await;
                    }
                    known = current;
                    if !synced {
                        let _ = tx.send(WorkloadEvent::Synced).await;
                        synced = true;
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl WorkloadSource for FileSource {
    async fn subscribe(&self) -> Result<mpsc::Receiver<WorkloadEvent>> {
        let (tx, rx) = mpsc::channel(256);
        *self.tx.lock() = Some(tx);
        Ok(rx)
    }
}

pub struct WorkloadInventory {
    node_name: String,
    excluded_namespaces: HashSet<String>,
    opt_out_label: String,
    cache: DashMap<WorkloadId, Workload>,
    synced: AtomicBool,
}

impl WorkloadInventory {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            node_name: config.node_name.clone(),
            excluded_namespaces: config.excluded_namespaces.iter().cloned().collect(),
            opt_out_label: config.opt_out_label.clone(),
            cache: DashMap::new(),
            synced: AtomicBool::new(false),
        }
    }

    /// Readiness gate: true once the source reported its initial sync.
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub fn apply_event(&self, event: WorkloadEvent) {
        match event {
            WorkloadEvent::Applied(workload) => {
                // Workloads scheduled elsewhere never enter the cache.
                if workload.node_name != self.node_name {
                    self.cache.remove(&workload.id);
                    return;
                }
                self.cache.insert(workload.id.clone(), workload);
            }
            WorkloadEvent::Deleted(id) => {
                self.cache.remove(&id);
            }
            WorkloadEvent::Synced => {
                info!(workloads = self.cache.len(), "inventory synced");
                self.synced.store(true, Ordering::Release);
            }
        }
    }

    /// Cache lookup by (namespace, name).
    pub fn get(&self, namespace: &str, name: &str) -> Option<Workload> {
        self.cache
            .iter()
            .find(|entry| entry.namespace == namespace && entry.name == name)
            .map(|entry| entry.value().clone())
    }

    /// The currently managed set, ordered by id for deterministic iteration.
    pub fn list_managed(&self) -> Vec<Workload> {
        let mut managed: Vec<Workload> = self
            .cache
            .iter()
            .filter(|entry| self.is_managed(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        managed.sort_by(|a, b| a.id.cmp(&b.id));
        managed
    }

    /// Filter rules, in order: on this node, running, namespace not
    /// excluded, and either no opt-out label or best-effort QoS (best-effort
    /// workloads are always managed so their CPU can be reclaimed under
    /// contention).
    pub fn is_managed(&self, workload: &Workload) -> bool {
        if workload.node_name != self.node_name {
            return false;
        }
        if !workload.phase.is_running() {
            return false;
        }
        if self.excluded_namespaces.contains(&workload.namespace) {
            return false;
        }
        if workload.labels.contains_key(&self.opt_out_label)
            && workload.qos_class != QosClass::BestEffort
        {
            return false;
        }
        true
    }

    /// Summed CPU requests of this node's pods in excluded namespaces; the
    /// slow loop subtracts this from available capacity.
    pub fn unmanaged_cpu_millis(&self) -> u32 {
        self.cache
            .iter()
            .filter(|entry| self.excluded_namespaces.contains(&entry.namespace))
            .map(|entry| entry.cpu_request_millis)
            .sum()
    }

    /// Drain events from the source until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<WorkloadEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("inventory feeder stopping");
                    break;
                }
                event = events.recv() => {
                    match event {
                        Some(e) => self.apply_event(e),
                        None => {
                            debug!("workload source closed");
                            break;
                        }
                    }
                }
            }
        }
    }
}
