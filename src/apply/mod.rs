// # Smoothing & Apply
//
// The write path between a computed allocation target and the published
// desired-state record. Every target passes a gate chain: absolute cap,
// asymmetric exponential smoothing, hysteresis, node-share cap, and a
// jittered per-workload cooldown. The fast reactive path bypasses smoothing
// and hysteresis only; caps and cooldown always apply. Table bookkeeping is
// committed only after a successful publish so a failed write never advances
// the smoothing state.

use crate::common::{format_millis, WorkloadId, WorkloadRef, HARD_CAP_MILLIS};
use crate::config::AgentConfig;
use crate::desired::{publish_spec, DesiredSpec, DesiredStateStore};
use crate::error::AgentError;
use crate::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Fraction of a computed limit reserved as the request.
const REQUEST_FRACTION: f64 = 0.9;

/// Smoothing factors: releases are fast, grants are slow.
const SMOOTH_DOWN_FACTOR: f64 = 0.7;
const SMOOTH_UP_FACTOR: f64 = 0.1;

/// Runtime write-path tables, guarded by the agent-level lock.
#[derive(Default)]
pub struct ApplyTables {
    pub last_allocation: HashMap<WorkloadId, u32>,
    pub smoothed_allocation: HashMap<WorkloadId, f64>,
    pub last_write_time: HashMap<WorkloadId, Instant>,
    /// Ids with a publish currently in flight; no second write for the same
    /// id may start until the first commits or aborts.
    pub in_flight: HashSet<WorkloadId>,
}

impl ApplyTables {
    pub fn forget(&mut self, id: &WorkloadId) {
        self.last_allocation.remove(id);
        self.smoothed_allocation.remove(id);
        self.last_write_time.remove(id);
        self.in_flight.remove(id);
    }
}

/// How a target enters the gate chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Slow-loop path: full smoothing and hysteresis.
    Smoothed,
    /// Fast-loop path: smoothing and hysteresis bypassed.
    Direct,
}

/// A write that passed every gate and may be published.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedWrite {
    pub id: WorkloadId,
    pub limit_millis: u32,
    pub request_millis: u32,
    smoothed: f64,
}

/// Gate-chain decision for one target.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Write(PlannedWrite),
    SkippedHysteresis,
    SkippedCooldown,
    SkippedInFlight,
}

pub struct ApplyPipeline {
    store: Arc<dyn DesiredStateStore>,
    capacity_millis: u32,
    absolute_min: u32,
    min_change_fraction: f64,
    node_share_fraction: f64,
    base_cooldown: Duration,
    cooldown_jitter: Duration,
    api_timeout: Duration,
    write_backoff: Duration,
}

impl ApplyPipeline {
    pub fn new(config: &AgentConfig, store: Arc<dyn DesiredStateStore>) -> Self {
        Self {
            store,
            capacity_millis: config.capacity_millis(),
            absolute_min: config.absolute_min_allocation,
            min_change_fraction: config.min_change_percent / 100.0,
            node_share_fraction: config.node_share_percent / 100.0,
            base_cooldown: config.base_cooldown(),
            cooldown_jitter: Duration::from_millis(config.cooldown_jitter_ms),
            api_timeout: config.api_timeout(),
            write_backoff: config.write_backoff(),
        }
    }

    pub fn write_backoff(&self) -> Duration {
        self.write_backoff
    }

    /// Run the gate chain for one target. Pure with respect to the tables;
    /// a returned `Plan::Write` must be either committed or aborted.
    ///
    /// `seed_applied` seeds the smoothing state on first touch, normally the
    /// currently applied limit. `cooldown` is the caller's write spacing
    /// (base cooldown for the slow path, the short fast-loop cooldown for
    /// boosts).
    pub fn plan(
        &self,
        tables: &ApplyTables,
        id: &WorkloadId,
        target_millis: u32,
        mode: ApplyMode,
        cooldown: Duration,
        seed_applied: Option<u32>,
        now: Instant,
    ) -> Plan {
        if tables.in_flight.contains(id) {
            return Plan::SkippedInFlight;
        }

        let capped = target_millis.min(HARD_CAP_MILLIS);
        let target = capped as f64;

        let smoothed = match mode {
            ApplyMode::Smoothed => {
                let prior = tables
                    .smoothed_allocation
                    .get(id)
                    .copied()
                    .unwrap_or_else(|| seed_applied.unwrap_or(capped) as f64);
                let next = if target < prior {
                    SMOOTH_DOWN_FACTOR * target + (1.0 - SMOOTH_DOWN_FACTOR) * prior
                } else {
                    SMOOTH_UP_FACTOR * target + (1.0 - SMOOTH_UP_FACTOR) * prior
                };
                next.max(self.absolute_min as f64)
            }
            ApplyMode::Direct => target.max(self.absolute_min as f64),
        };

        if mode == ApplyMode::Smoothed {
            if let Some(&last) = tables.last_allocation.get(id) {
                if last > 0 {
                    let relative_change = (smoothed - last as f64).abs() / last as f64;
                    if relative_change < self.min_change_fraction {
                        return Plan::SkippedHysteresis;
                    }
                }
            }
        }

        let smoothed = smoothed.min(self.node_share_fraction * self.capacity_millis as f64);

        if let Some(&last_write) = tables.last_write_time.get(id) {
            let jitter = match mode {
                // Per-call jitter desynchronises the slow-path writes across
                // workloads.
                ApplyMode::Smoothed => {
                    let jitter_ms = self.cooldown_jitter.as_millis() as i64;
                    if jitter_ms > 0 {
                        rand::random_range(-jitter_ms..=jitter_ms)
                    } else {
                        0
                    }
                }
                ApplyMode::Direct => 0,
            };
            let effective = cooldown.as_millis() as i64 + jitter;
            let elapsed = now.duration_since(last_write).as_millis() as i64;
            if elapsed < effective {
                return Plan::SkippedCooldown;
            }
        }

        let limit = (smoothed.round() as u32).max(self.absolute_min);
        let request = (smoothed * REQUEST_FRACTION)
            .min(smoothed - 5.0)
            .max(10.0)
            .round() as u32;

        Plan::Write(PlannedWrite {
            id: id.clone(),
            limit_millis: limit,
            request_millis: request,
            smoothed,
        })
    }

    /// Reserve the id before publishing so no second write can start.
    pub fn begin(&self, tables: &mut ApplyTables, write: &PlannedWrite) {
        tables.in_flight.insert(write.id.clone());
    }

    /// Publish the planned write as a desired-state record.
    pub async fn publish(
        &self,
        write: &PlannedWrite,
        reference: &WorkloadRef,
        shadow_price: f64,
    ) -> Result<()> {
        let spec = DesiredSpec {
            namespace: reference.namespace.clone(),
            pod_name: reference.name.clone(),
            desired_cpu_request: format_millis(write.request_millis),
            desired_cpu_limit: format_millis(write.limit_millis),
        };
        match tokio::time::timeout(
            self.api_timeout,
            publish_spec(self.store.as_ref(), &write.id, spec, shadow_price),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout(format!(
                "publish for {} exceeded {:?}",
                write.id, self.api_timeout
            ))),
        }
    }

    /// Commit bookkeeping after a successful publish.
    pub fn commit(&self, tables: &mut ApplyTables, write: &PlannedWrite, now: Instant) {
        tables.in_flight.remove(&write.id);
        tables
            .last_allocation
            .insert(write.id.clone(), write.limit_millis);
        tables
            .smoothed_allocation
            .insert(write.id.clone(), write.smoothed);
        tables.last_write_time.insert(write.id.clone(), now);
        debug!(
            workload = %write.id,
            limit = write.limit_millis,
            request = write.request_millis,
            "desired state published"
        );
    }

    /// Release the reservation after a failed publish; smoothing state is
    /// untouched so the next cycle retries from the same baseline.
    pub fn abort(&self, tables: &mut ApplyTables, write: &PlannedWrite) {
        tables.in_flight.remove(&write.id);
        warn!(workload = %write.id, "desired state publish failed");
    }

    /// Back-off decision after a cycle: sleep when more than half of the
    /// attempted writes failed.
    pub fn backoff_after(&self, attempts: usize, failures: usize) -> Option<Duration> {
        if attempts > 0 && failures * 2 > attempts {
            Some(self.write_backoff)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::MemoryDesiredStore;

    fn pipeline() -> (ApplyPipeline, Arc<MemoryDesiredStore>) {
        let store = Arc::new(MemoryDesiredStore::new());
        let config = AgentConfig {
            cooldown_jitter_ms: 0,
            ..Default::default()
        };
        (ApplyPipeline::new(&config, store.clone()), store)
    }

    fn id(s: &str) -> WorkloadId {
        WorkloadId::from(s)
    }

    #[test]
    fn hard_cap_applies_before_smoothing() {
        let (p, _) = pipeline();
        let tables = ApplyTables::default();
        match p.plan(
            &tables,
            &id("w"),
            60_000,
            ApplyMode::Direct,
            Duration::ZERO,
            None,
            Instant::now(),
        ) {
            // Node-share cap (75% of 4000) binds after the hard cap.
            Plan::Write(w) => assert_eq!(w.limit_millis, 3000),
            other => panic!("expected write, got {:?}", other),
        }
    }

    #[test]
    fn smoothing_is_asymmetric() {
        let (p, _) = pipeline();
        let mut tables = ApplyTables::default();
        tables.smoothed_allocation.insert(id("w"), 1000.0);

        // Down: 0.7 * 400 + 0.3 * 1000 = 580.
        match p.plan(
            &tables,
            &id("w"),
            400,
            ApplyMode::Smoothed,
            Duration::ZERO,
            None,
            Instant::now(),
        ) {
            Plan::Write(w) => assert_eq!(w.limit_millis, 580),
            other => panic!("expected write, got {:?}", other),
        }

        // Up: 0.1 * 2000 + 0.9 * 1000 = 1100.
        match p.plan(
            &tables,
            &id("w"),
            2000,
            ApplyMode::Smoothed,
            Duration::ZERO,
            None,
            Instant::now(),
        ) {
            Plan::Write(w) => assert_eq!(w.limit_millis, 1100),
            other => panic!("expected write, got {:?}", other),
        }
    }

    #[test]
    fn smoothing_seeds_from_applied_limit() {
        let (p, _) = pipeline();
        let tables = ApplyTables::default();
        match p.plan(
            &tables,
            &id("w"),
            1000,
            ApplyMode::Smoothed,
            Duration::ZERO,
            Some(500),
            Instant::now(),
        ) {
            // Seed 500, rising: 0.1 * 1000 + 0.9 * 500 = 550.
            Plan::Write(w) => assert_eq!(w.limit_millis, 550),
            other => panic!("expected write, got {:?}", other),
        }
    }

    #[test]
    fn smoothing_direction_is_bounded() {
        let (p, _) = pipeline();
        for (prior, target) in [(1000.0_f64, 400_u32), (400.0, 1000), (700.0, 700)] {
            let mut tables = ApplyTables::default();
            tables.smoothed_allocation.insert(id("w"), prior);
            if let Plan::Write(w) = p.plan(
                &tables,
                &id("w"),
                target,
                ApplyMode::Smoothed,
                Duration::ZERO,
                None,
                Instant::now(),
            ) {
                let lo = prior.min(target as f64);
                let hi = prior.max(target as f64);
                assert!(w.smoothed >= lo - 1e-9 && w.smoothed <= hi + 1e-9);
            }
        }
    }

    #[test]
    fn hysteresis_skips_small_changes() {
        let (p, _) = pipeline();
        let mut tables = ApplyTables::default();
        tables.last_allocation.insert(id("w"), 1000);
        tables.smoothed_allocation.insert(id("w"), 1000.0);

        // 2% move: skipped.
        let plan = p.plan(
            &tables,
            &id("w"),
            1020,
            ApplyMode::Smoothed,
            Duration::ZERO,
            None,
            Instant::now(),
        );
        assert_eq!(plan, Plan::SkippedHysteresis);

        // The fast path is exempt.
        let plan = p.plan(
            &tables,
            &id("w"),
            1020,
            ApplyMode::Direct,
            Duration::ZERO,
            None,
            Instant::now(),
        );
        assert!(matches!(plan, Plan::Write(_)));
    }

    #[test]
    fn node_share_cap_binds() {
        let (p, _) = pipeline();
        let tables = ApplyTables::default();
        match p.plan(
            &tables,
            &id("w"),
            3900,
            ApplyMode::Direct,
            Duration::ZERO,
            None,
            Instant::now(),
        ) {
            Plan::Write(w) => assert_eq!(w.limit_millis, 3000),
            other => panic!("expected write, got {:?}", other),
        }
    }

    #[test]
    fn cooldown_blocks_within_window() {
        let (p, _) = pipeline();
        let mut tables = ApplyTables::default();
        let now = Instant::now();
        tables.last_write_time.insert(id("w"), now);

        let plan = p.plan(
            &tables,
            &id("w"),
            2000,
            ApplyMode::Direct,
            Duration::from_secs(5),
            None,
            now + Duration::from_secs(3),
        );
        assert_eq!(plan, Plan::SkippedCooldown);

        let plan = p.plan(
            &tables,
            &id("w"),
            2000,
            ApplyMode::Direct,
            Duration::from_secs(5),
            None,
            now + Duration::from_secs(6),
        );
        assert!(matches!(plan, Plan::Write(_)));
    }

    #[test]
    fn request_derivation() {
        let (p, _) = pipeline();
        let tables = ApplyTables::default();
        match p.plan(
            &tables,
            &id("w"),
            1000,
            ApplyMode::Direct,
            Duration::ZERO,
            None,
            Instant::now(),
        ) {
            Plan::Write(w) => {
                assert_eq!(w.limit_millis, 1000);
                assert_eq!(w.request_millis, 900);
            }
            other => panic!("expected write, got {:?}", other),
        }

        // Tiny limits: request floors at 10.
        match p.plan(
            &tables,
            &id("w2"),
            12,
            ApplyMode::Direct,
            Duration::ZERO,
            None,
            Instant::now(),
        ) {
            Plan::Write(w) => assert_eq!(w.request_millis, 10),
            other => panic!("expected write, got {:?}", other),
        }
    }

    #[test]
    fn in_flight_blocks_second_write() {
        let (p, _) = pipeline();
        let mut tables = ApplyTables::default();
        let plan = p.plan(
            &tables,
            &id("w"),
            2000,
            ApplyMode::Direct,
            Duration::ZERO,
            None,
            Instant::now(),
        );
        let write = match plan {
            Plan::Write(w) => w,
            other => panic!("expected write, got {:?}", other),
        };
        p.begin(&mut tables, &write);

        let second = p.plan(
            &tables,
            &id("w"),
            2500,
            ApplyMode::Direct,
            Duration::ZERO,
            None,
            Instant::now(),
        );
        assert_eq!(second, Plan::SkippedInFlight);

        p.abort(&mut tables, &write);
        assert!(!tables.in_flight.contains(&id("w")));
    }

    #[tokio::test]
    async fn publish_then_commit_updates_tables() {
        let (p, store) = pipeline();
        let mut tables = ApplyTables::default();
        let now = Instant::now();

        let write = match p.plan(
            &tables,
            &id("w"),
            1000,
            ApplyMode::Smoothed,
            Duration::ZERO,
            Some(1000),
            now,
        ) {
            Plan::Write(w) => w,
            other => panic!("expected write, got {:?}", other),
        };
        p.begin(&mut tables, &write);
        p.publish(&write, &WorkloadRef::new("default", "web-1"), 0.25)
            .await
            .unwrap();
        p.commit(&mut tables, &write, now);

        assert_eq!(tables.last_allocation[&id("w")], 1000);
        assert!(tables.last_write_time.contains_key(&id("w")));
        let record = store.get(&id("w")).await.unwrap().unwrap();
        assert_eq!(record.spec.desired_cpu_limit, "1000m");
        assert_eq!(record.spec.desired_cpu_request, "900m");
        assert!((record.status.shadow_price_cpu - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failed_publish_leaves_tables_untouched() {
        let (p, store) = pipeline();
        let mut tables = ApplyTables::default();
        store.fail_next_puts(10);

        let write = match p.plan(
            &tables,
            &id("w"),
            1000,
            ApplyMode::Direct,
            Duration::ZERO,
            None,
            Instant::now(),
        ) {
            Plan::Write(w) => w,
            other => panic!("expected write, got {:?}", other),
        };
        p.begin(&mut tables, &write);
        assert!(p
            .publish(&write, &WorkloadRef::new("default", "web-1"), 0.0)
            .await
            .is_err());
        p.abort(&mut tables, &write);

        assert!(tables.last_allocation.is_empty());
        assert!(tables.smoothed_allocation.is_empty());
        assert!(tables.last_write_time.is_empty());
    }

    #[test]
    fn backoff_when_majority_fail() {
        let (p, _) = pipeline();
        assert!(p.backoff_after(4, 3).is_some());
        assert!(p.backoff_after(4, 2).is_none());
        assert!(p.backoff_after(0, 0).is_none());
    }
}
