//! Slow optimisation loop: the full sample-bid-solve-apply pipeline.
//!
//! Each tick samples every active workload, feeds the learners, runs the
//! solver twice (a price-discovery pass at zero shadow price, then the real
//! pass with the preview price biasing actions and damping demand), applies
//! the results through the smoothed write path, and reconciles control
//! state against the live workload set.

use super::Agent;
use crate::apply::{ApplyMode, Plan, PlannedWrite};
use crate::bidding::BidInputs;
use crate::cgroup::SampleOutcome;
use crate::common::{WorkloadId, WorkloadRef};
use crate::inventory::Workload;
use crate::learner::Learner;
use crate::solver::solve;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

struct Observation {
    workload: Workload,
    outcome: SampleOutcome,
    applied: u32,
}

impl Agent {
    pub async fn run_slow_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config().slow_interval());
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.run_slow_cycle().await,
            }
        }
        debug!("slow loop stopped");
    }

    pub async fn run_slow_cycle(self: &Arc<Self>) {
        if !self.inventory().has_synced() {
            debug!("inventory not synced, skipping slow cycle");
            return;
        }

        let managed = self.inventory().list_managed();
        let active: Vec<Workload> = managed
            .iter()
            .filter(|w| !w.terminating && !w.evicted)
            .cloned()
            .collect();

        // Sample phase. A failed or missing sample omits the workload from
        // this cycle's bidding; its learner and tables survive.
        let mut observations = Vec::with_capacity(active.len());
        for workload in &active {
            match self
                .sampler()
                .read_pressure_and_usage(&workload.id, self.config().sampling_interval())
                .await
            {
                Ok(outcome) => {
                    let applied = self.resolve_applied(workload).await;
                    observations.push(Observation {
                        workload: workload.clone(),
                        outcome,
                        applied,
                    });
                }
                Err(e) => {
                    self.stats().inc_sample_errors();
                    debug!(workload = %workload.id, error = %e, "sample failed, omitting from bidding");
                }
            }
        }

        let stored = self.learner_store().load_all().unwrap_or_default();
        let capacity = self.available_capacity();

        // Critical section: learner observation, both solver passes, and
        // write planning all complete under the agent lock so the result is
        // a pure function of the observation set.
        let writes: Vec<(PlannedWrite, WorkloadRef, f64)> = {
            let mut guard = self.state().write();
            let state = &mut *guard;
            let now = Instant::now();

            for obs in &observations {
                let learner = state
                    .learners
                    .entry(obs.workload.id.clone())
                    .or_insert_with(|| {
                        self.make_learner(&obs.workload, stored.get(&obs.workload.id).cloned())
                    });
                state
                    .id_to_name
                    .insert(obs.workload.id.clone(), obs.workload.reference());

                match obs.outcome {
                    SampleOutcome::Ready {
                        pressure,
                        usage_millis,
                    } => {
                        learner.record_usage(usage_millis);
                        learner.observe(obs.applied, pressure, false);
                    }
                    SampleOutcome::First => {
                        learner.record_usage(0.0);
                        learner.observe(obs.applied, 0.0, false);
                    }
                    SampleOutcome::Dropped => {
                        // No fresh signal: re-observe under the preserved
                        // pressure rather than coercing it to zero.
                        self.stats().inc_samples_dropped();
                        let prior = learner.pressure();
                        learner.observe(obs.applied, prior, false);
                    }
                }
            }

            // Price-discovery pass at zero shadow price.
            let mut preview_bids = Vec::with_capacity(observations.len());
            for obs in &observations {
                if let Some(learner) = state.learners.get_mut(&obs.workload.id) {
                    let action = learner.select_action(0.0);
                    let inputs = bid_inputs(&obs.workload, learner);
                    preview_bids.push(state.bids.preview(&obs.workload.id, inputs, action, 0.0));
                }
            }
            let preview = solve(capacity, &preview_bids);

            // Final pass: the preview price biases action selection and
            // damps demand before the market actually clears.
            let mut final_bids = Vec::with_capacity(observations.len());
            for obs in &observations {
                if let Some(learner) = state.learners.get_mut(&obs.workload.id) {
                    let action = learner.select_action(preview.shadow_price);
                    let inputs = bid_inputs(&obs.workload, learner);
                    final_bids.push(state.bids.build(
                        &obs.workload.id,
                        inputs,
                        action,
                        preview.shadow_price,
                    ));
                }
            }
            let result = solve(capacity, &final_bids);
            self.set_last_shadow_price(result.shadow_price);

            debug!(
                capacity,
                bidders = final_bids.len(),
                shadow_price = result.shadow_price,
                "market cleared"
            );

            let mut writes = Vec::new();
            for obs in &observations {
                let Some(target) = result.get(&obs.workload.id) else {
                    continue;
                };
                match self.pipeline().plan(
                    &state.tables,
                    &obs.workload.id,
                    target,
                    ApplyMode::Smoothed,
                    self.config().base_cooldown(),
                    Some(obs.applied),
                    now,
                ) {
                    Plan::Write(write) => {
                        self.pipeline().begin(&mut state.tables, &write);
                        writes.push((write, obs.workload.reference(), result.shadow_price));
                    }
                    Plan::SkippedHysteresis => self.stats().inc_skipped_hysteresis(),
                    Plan::SkippedCooldown => self.stats().inc_skipped_cooldown(),
                    Plan::SkippedInFlight => {}
                }
            }
            writes
        };

        // Publish outside the lock on transient tasks. Writes for different
        // workloads interleave freely; per-id ordering is preserved by the
        // in-flight reservation taken at plan time.
        let attempts = writes.len();
        let mut failures = 0usize;
        let mut publishes = tokio::task::JoinSet::new();
        for (write, reference, price) in writes {
            let agent = Arc::clone(self);
            publishes.spawn(async move {
                let outcome = agent.pipeline().publish(&write, &reference, price).await;
                (write, outcome)
            });
        }
        while let Some(joined) = publishes.join_next().await {
            let Ok((write, outcome)) = joined else {
                continue;
            };
            match outcome {
                Ok(()) => {
                    self.stats().inc_writes_ok();
                    let mut state = self.state().write();
                    self.pipeline().commit(&mut state.tables, &write, Instant::now());
                }
                Err(e) => {
                    failures += 1;
                    self.stats().inc_writes_failed();
                    warn!(workload = %write.id, error = %e, "desired-state write failed");
                    let mut state = self.state().write();
                    self.pipeline().abort(&mut state.tables, &write);
                }
            }
        }
        if let Some(backoff) = self.pipeline().backoff_after(attempts, failures) {
            self.stats().inc_backoffs();
            warn!(attempts, failures, "most writes failed this cycle, backing off");
            tokio::time::sleep(backoff).await;
        }

        self.reconcile(&managed).await;
        self.stats().inc_slow_cycles();
    }

    /// Destroy control state for workloads that left the managed set and
    /// delete their desired-state records.
    async fn reconcile(&self, managed: &[Workload]) {
        let live: HashSet<WorkloadId> = managed.iter().map(|w| w.id.clone()).collect();

        let stale: Vec<WorkloadId> = {
            let mut guard = self.state().write();
            let state = &mut *guard;
            let stale: Vec<WorkloadId> = state
                .learners
                .keys()
                .filter(|id| !live.contains(*id))
                .cloned()
                .collect();
            for id in &stale {
                state.learners.remove(id);
                state.tables.forget(id);
                state.id_to_name.remove(id);
            }
            state.bids.cleanup(&live);
            stale
        };

        for id in &stale {
            match self.store().delete(id).await {
                Ok(()) => info!(workload = %id, "workload gone, control state destroyed"),
                Err(e) => warn!(workload = %id, error = %e, "desired-state delete failed"),
            }
        }

        self.sampler().cleanup(&live);
    }
}

fn bid_inputs(workload: &Workload, learner: &Learner) -> BidInputs {
    let running_for = workload
        .started_at
        .and_then(|t| (Utc::now() - t).to_std().ok())
        .unwrap_or_else(|| learner.start_time().elapsed());
    BidInputs {
        usage: learner.usage(),
        effective_pressure: learner.effective_pressure(),
        allocation: learner.allocation(),
        running_for,
    }
}
