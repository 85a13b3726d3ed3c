//! Fast reactive loop: short-interval pressure scanning that boosts a
//! throttled workload without waiting for the next full optimisation cycle.
//! The boost bypasses smoothing and hysteresis but still honours the
//! per-workload cooldown, the node-share cap, and the hard ceiling.

use super::Agent;
use crate::apply::{ApplyMode, Plan};
use crate::cgroup::SampleOutcome;
use crate::common::{DEFAULT_ALLOCATION_MILLIS, HARD_CAP_MILLIS};
use crate::inventory::Workload;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

impl Agent {
    pub async fn run_fast_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config().fast_interval());
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.run_fast_cycle().await,
            }
        }
        debug!("fast loop stopped");
    }

    pub async fn run_fast_cycle(&self) {
        if !self.inventory().has_synced() {
            return;
        }

        let active: Vec<Workload> = self
            .inventory()
            .list_managed()
            .into_iter()
            .filter(|w| !w.terminating && !w.evicted)
            .collect();
        let threshold = self.config().throttling_threshold;

        for workload in active {
            let outcome = match self
                .sampler()
                .read_pressure_and_usage(&workload.id, self.config().sampling_interval())
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => continue,
            };
            let pressure = match outcome {
                SampleOutcome::Ready { pressure, .. } => pressure,
                // First samples and dropped samples carry no boost signal.
                SampleOutcome::First | SampleOutcome::Dropped => continue,
            };
            if pressure <= threshold {
                continue;
            }

            let planned = {
                let mut guard = self.state().write();
                let state = &mut *guard;

                let current = state
                    .tables
                    .last_allocation
                    .get(&workload.id)
                    .copied()
                    .or(workload.cpu_limit_millis)
                    .unwrap_or(DEFAULT_ALLOCATION_MILLIS);

                let span = self.config().fast_step_max - self.config().fast_step_min;
                let step = (self.config().fast_step_min + span * pressure)
                    .clamp(self.config().fast_step_min, self.config().fast_step_max);

                let mut target = (current as f64 * (1.0 + step)).round() as u32;
                target = target.min(self.config().capacity_millis());
                if let Some(limit) = workload.cpu_limit_millis {
                    target = target.min(limit);
                }
                target = target.min(HARD_CAP_MILLIS);
                if target <= current {
                    None
                } else {
                    match self.pipeline().plan(
                        &state.tables,
                        &workload.id,
                        target,
                        ApplyMode::Direct,
                        self.config().fast_cooldown(),
                        Some(current),
                        Instant::now(),
                    ) {
                        Plan::Write(write) => {
                            self.pipeline().begin(&mut state.tables, &write);
                            Some((write, workload.reference(), current))
                        }
                        Plan::SkippedCooldown => {
                            self.stats().inc_skipped_cooldown();
                            None
                        }
                        Plan::SkippedInFlight | Plan::SkippedHysteresis => None,
                    }
                }
            };

            let Some((write, reference, previous)) = planned else {
                continue;
            };
            info!(
                workload = %write.id,
                pressure,
                from = previous,
                to = write.limit_millis,
                "fast boost"
            );
            let price = self.last_shadow_price();
            match self.pipeline().publish(&write, &reference, price).await {
                Ok(()) => {
                    self.stats().inc_writes_ok();
                    self.stats().inc_fast_boosts();
                    let mut state = self.state().write();
                    self.pipeline().commit(&mut state.tables, &write, Instant::now());
                }
                Err(e) => {
                    self.stats().inc_writes_failed();
                    warn!(workload = %write.id, error = %e, "fast boost write failed");
                    let mut state = self.state().write();
                    self.pipeline().abort(&mut state.tables, &write);
                }
            }
        }
        self.stats().inc_fast_cycles();
    }
}
