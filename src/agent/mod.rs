// # Node Agent
//
// Owns the runtime tables (learners, apply bookkeeping, id-to-name mapping,
// demand trackers) behind a single agent-level lock and drives the three
// periodic loops: fast reactive boosts, slow optimisation, and learner
// persistence. Bid collection and solving always complete inside one
// critical section, so allocation results are a pure function of the
// observation set regardless of task interleaving.

pub mod fast_loop;
pub mod slow_loop;
pub mod stats;

use crate::apply::{ApplyPipeline, ApplyTables};
use crate::bidding::BidBuilder;
use crate::cgroup::CgroupSampler;
use crate::common::{WorkloadId, WorkloadRef, DEFAULT_ALLOCATION_MILLIS};
use crate::config::AgentConfig;
use crate::desired::DesiredStateStore;
use crate::inventory::{Workload, WorkloadInventory};
use crate::learner::{Hyperparams, Learner};
use crate::persistence::LearnerStateStore;
use crate::Result;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Label carrying an optional latency target in milliseconds.
const SLO_TARGET_LABEL: &str = "corebalancer.io/slo-target-ms";

/// Everything behind the agent-level lock. Lock order is agent state first,
/// nothing else while held; no await point ever sits inside the guard.
pub struct AgentState {
    pub learners: HashMap<WorkloadId, Learner>,
    pub tables: ApplyTables,
    pub id_to_name: HashMap<WorkloadId, WorkloadRef>,
    pub bids: BidBuilder,
}

/// Read-only view of one workload's control state, for logs and tests.
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadDiagnostics {
    pub id: WorkloadId,
    pub reference: Option<WorkloadRef>,
    pub usage_millis: f64,
    pub pressure: f64,
    pub allocation_millis: u32,
    pub exploration: f64,
}

pub struct Agent {
    config: AgentConfig,
    inventory: Arc<WorkloadInventory>,
    sampler: CgroupSampler,
    pipeline: ApplyPipeline,
    store: Arc<dyn DesiredStateStore>,
    learner_store: LearnerStateStore,
    state: RwLock<AgentState>,
    /// Latest clearing price from the slow loop; the fast path republishes
    /// it so a boost never zeroes the status price.
    last_shadow_price: parking_lot::Mutex<f64>,
    stats: stats::AgentStats,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        inventory: Arc<WorkloadInventory>,
        store: Arc<dyn DesiredStateStore>,
        learner_store: LearnerStateStore,
    ) -> Self {
        let sampler = CgroupSampler::new(config.cgroup_root.clone(), config.min_usage_usec);
        let pipeline = ApplyPipeline::new(&config, store.clone());
        let bids = BidBuilder::new(&config);
        Self {
            config,
            inventory,
            sampler,
            pipeline,
            store,
            learner_store,
            state: RwLock::new(AgentState {
                learners: HashMap::new(),
                tables: ApplyTables::default(),
                id_to_name: HashMap::new(),
                bids,
            }),
            last_shadow_price: parking_lot::Mutex::new(0.0),
            stats: stats::AgentStats::default(),
        }
    }

    pub fn stats(&self) -> &stats::AgentStats {
        &self.stats
    }

    pub fn last_shadow_price(&self) -> f64 {
        *self.last_shadow_price.lock()
    }

    pub(crate) fn set_last_shadow_price(&self, price: f64) {
        *self.last_shadow_price.lock() = price;
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub(crate) fn sampler(&self) -> &CgroupSampler {
        &self.sampler
    }

    pub(crate) fn pipeline(&self) -> &ApplyPipeline {
        &self.pipeline
    }

    pub(crate) fn store(&self) -> &Arc<dyn DesiredStateStore> {
        &self.store
    }

    pub(crate) fn state(&self) -> &RwLock<AgentState> {
        &self.state
    }

    pub(crate) fn inventory(&self) -> &WorkloadInventory {
        &self.inventory
    }

    fn hyperparams(&self) -> Hyperparams {
        Hyperparams {
            learning_rate: self.config.learning_rate,
            discount_factor: self.config.discount_factor,
            exploration_rate: self.config.exploration_rate,
            exploration_min: self.config.exploration_min,
            exploration_decay: self.config.exploration_decay,
        }
    }

    /// Create a learner for a newly observed workload, restoring a stored
    /// Q-table when one exists.
    pub(crate) fn make_learner(
        &self,
        workload: &Workload,
        stored: Option<crate::learner::LearnerSnapshot>,
    ) -> Learner {
        let mut learner = Learner::new(self.hyperparams());
        if let Some(snapshot) = stored {
            info!(workload = %workload.id, "restored learner state");
            learner.restore(snapshot);
        }
        learner.slo_target_ms = workload
            .labels
            .get(SLO_TARGET_LABEL)
            .and_then(|v| v.parse().ok());
        learner
    }

    /// The applied-allocation fallback chain: applier status, then the last
    /// published target, then the manifest limit, then the default.
    pub(crate) async fn resolve_applied(&self, workload: &Workload) -> u32 {
        if let Ok(Some(record)) = self.store.get(&workload.id).await {
            if let Some(limit) = record
                .status
                .applied_cpu_limit
                .as_deref()
                .and_then(|s| crate::common::parse_millis(s).ok())
            {
                return limit;
            }
        }
        if let Some(&last) = self.state.read().tables.last_allocation.get(&workload.id) {
            return last;
        }
        workload
            .cpu_limit_millis
            .unwrap_or(DEFAULT_ALLOCATION_MILLIS)
    }

    /// Capacity offered to the solver: configured total minus the CPU held
    /// by excluded-namespace pods, minus the system reserve off what is
    /// left.
    pub(crate) fn available_capacity(&self) -> u32 {
        let total = self.config.capacity_millis() as f64;
        let unmanaged = self.inventory.unmanaged_cpu_millis() as f64;
        let available = (total - unmanaged).max(0.0);
        (available * (1.0 - self.config.system_reserve_percent / 100.0)).max(0.0) as u32
    }

    /// Snapshot every learner into the durable store.
    pub fn persist_learners(&self) -> Result<usize> {
        let snapshots: HashMap<WorkloadId, crate::learner::LearnerSnapshot> = {
            let state = self.state.read();
            state
                .learners
                .iter()
                .map(|(id, learner)| (id.clone(), learner.snapshot()))
                .collect()
        };
        let count = snapshots.len();
        self.learner_store.save_all(&snapshots)?;
        Ok(count)
    }

    pub(crate) fn learner_store(&self) -> &LearnerStateStore {
        &self.learner_store
    }

    /// Per-workload control state for diagnostics readers.
    pub fn snapshot(&self) -> Vec<WorkloadDiagnostics> {
        let state = self.state.read();
        let mut out: Vec<WorkloadDiagnostics> = state
            .learners
            .iter()
            .map(|(id, learner)| WorkloadDiagnostics {
                id: id.clone(),
                reference: state.id_to_name.get(id).cloned(),
                usage_millis: learner.usage(),
                pressure: learner.pressure(),
                allocation_millis: learner.allocation(),
                exploration: learner.epsilon(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Spawn the three periodic loops. Each honours the shutdown signal;
    /// the returned handles complete once the signal fires.
    pub fn spawn_loops(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(self).run_fast_loop(shutdown.clone())),
            tokio::spawn(Arc::clone(self).run_slow_loop(shutdown.clone())),
            tokio::spawn(Arc::clone(self).run_persistence_loop(shutdown)),
        ]
    }

    async fn run_persistence_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.persist_interval());
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.persist_learners() {
                        warn!(error = %e, "learner persistence failed");
                    }
                }
            }
        }
        // Final flush so a clean shutdown never loses learned state.
        match self.persist_learners() {
            Ok(count) => info!(learners = count, "final learner snapshot persisted"),
            Err(e) => warn!(error = %e, "final learner snapshot failed"),
        }
        if let Err(e) = self.learner_store.flush().await {
            warn!(error = %e, "learner store flush failed");
        }
    }
}
