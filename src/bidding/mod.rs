// # Bid Builder
//
// Turns a workload's observed usage, pressure trend, learner action, and the
// market's shadow-price feedback into a capped, floored, weighted demand
// record for the solver. Demand is tracked through an asymmetric smoother so
// a single noisy sample does not whipsaw the market; cost-efficiency mode
// inverts the smoother's asymmetry.

use crate::common::{WorkloadId, HARD_CAP_MILLIS, SHADOW_PRICE_BIAS_THRESHOLD};
use crate::config::AgentConfig;
use crate::learner::Action;
use crate::solver::Bid;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Pressure above this level is treated as a real contention signal.
const PRESSURE_SIGNAL_FLOOR: f64 = 0.05;

/// Demand amplification under pressure is bounded to this factor.
const MAX_PRESSURE_AMPLIFICATION: f64 = 3.0;

/// Amplified demand never exceeds this multiple of the base demand.
const MAX_DEMAND_BASE_MULTIPLE: f64 = 10.0;

/// Per-workload inputs for one bid, read out of the learner under the agent
/// lock.
#[derive(Debug, Clone, Copy)]
pub struct BidInputs {
    pub usage: f64,
    pub effective_pressure: f64,
    pub allocation: u32,
    /// Time since the workload started, for the grace-window floor.
    pub running_for: Duration,
}

pub struct BidBuilder {
    absolute_min: u32,
    baseline: u32,
    need_headroom: f64,
    want_headroom: f64,
    startup_grace: Duration,
    cost_efficiency_mode: bool,
    smoothed_demand: HashMap<WorkloadId, f64>,
}

impl BidBuilder {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            absolute_min: config.absolute_min_allocation,
            baseline: config.baseline_millis(),
            need_headroom: config.need_headroom,
            want_headroom: config.want_headroom,
            startup_grace: config.startup_grace_period(),
            cost_efficiency_mode: config.cost_efficiency_mode,
            smoothed_demand: HashMap::new(),
        }
    }

    /// Build one bid, advancing the workload's tracked demand.
    pub fn build(
        &mut self,
        id: &WorkloadId,
        inputs: BidInputs,
        action: Action,
        shadow_price: f64,
    ) -> Bid {
        let raw = self.raw_demand(inputs, action, shadow_price);
        let prior = self.smoothed_demand.get(id).copied();
        let tracked = smooth_demand(prior, raw, self.cost_efficiency_mode);
        self.smoothed_demand.insert(id.clone(), tracked);
        self.compose(id, inputs, action, tracked)
    }

    /// Build one bid without committing the tracked demand. Used by the
    /// slow loop's preview pass so the price-discovery solve does not
    /// double-step the smoother.
    pub fn preview(
        &self,
        id: &WorkloadId,
        inputs: BidInputs,
        action: Action,
        shadow_price: f64,
    ) -> Bid {
        let raw = self.raw_demand(inputs, action, shadow_price);
        let prior = self.smoothed_demand.get(id).copied();
        let tracked = smooth_demand(prior, raw, self.cost_efficiency_mode);
        self.compose(id, inputs, action, tracked)
    }

    /// Steps 1-5: base demand, action multiplier, price damping, pressure
    /// amplification.
    fn raw_demand(&self, inputs: BidInputs, action: Action, shadow_price: f64) -> f64 {
        let base_demand = inputs.usage.max(self.absolute_min as f64);

        let multiplier = match action {
            Action::Aggressive => 1.5,
            Action::Normal => 1.2,
            Action::Conservative => 1.0,
        };
        let mut demand = base_demand * multiplier;

        // A hot market damps everyone's ask.
        if shadow_price > SHADOW_PRICE_BIAS_THRESHOLD {
            demand *= (1.0 - 0.5 * shadow_price).max(0.5);
        }

        let pressure = inputs.effective_pressure;
        if pressure > PRESSURE_SIGNAL_FLOOR {
            demand *= (1.0 + 2.0 * pressure).min(MAX_PRESSURE_AMPLIFICATION);
            demand = demand.min(MAX_DEMAND_BASE_MULTIPLE * base_demand);
        }
        demand
    }

    /// Steps 6-8: floors, ceilings, and weight around the tracked demand.
    fn compose(&self, id: &WorkloadId, inputs: BidInputs, action: Action, demand: f64) -> Bid {
        let absolute_min = self.absolute_min as f64;
        let pressure = inputs.effective_pressure;

        // The per-pod baseline is the disagreement floor of every bid; the
        // tighter absolute minimum only binds on the final published value.
        let mut min = (inputs.usage * (1.0 + self.need_headroom)).max(self.baseline as f64);
        if inputs.running_for < self.startup_grace {
            // Fresh workloads are still warming up; never bid their floor
            // below what they already hold.
            min = min.max(inputs.allocation as f64);
        }
        let min = (min.round() as u32).min(HARD_CAP_MILLIS);

        let max = if pressure > PRESSURE_SIGNAL_FLOOR {
            let cap = (inputs.usage * 10.0).min(HARD_CAP_MILLIS as f64);
            (cap.round() as u32).max(min + 100)
        } else if inputs.usage < 2.0 * absolute_min {
            // Idle workload: keep the ceiling tight so its spare capacity is
            // reclaimable.
            let cap = inputs.usage * (1.0 + self.want_headroom);
            (cap.round() as u32).max(min + 10)
        } else {
            let cap = (demand * (1.0 + self.want_headroom)).min(HARD_CAP_MILLIS as f64);
            cap.round() as u32
        };
        let max = max.clamp(min, HARD_CAP_MILLIS.max(min));

        let weight = if self.cost_efficiency_mode {
            if pressure > PRESSURE_SIGNAL_FLOOR {
                1.2
            } else {
                1.0
            }
        } else if action == Action::Aggressive {
            1.2
        } else {
            1.0
        };

        Bid {
            id: id.clone(),
            demand,
            weight,
            min,
            max,
        }
    }

    /// Drop tracked demand for identities no longer live.
    pub fn cleanup(&mut self, live: &HashSet<WorkloadId>) {
        self.smoothed_demand.retain(|id, _| live.contains(id));
    }
}

/// Asymmetric demand smoothing. Default mode follows rising demand quickly
/// and releases slowly; cost-efficiency mode inverts the asymmetry.
fn smooth_demand(prior: Option<f64>, demand: f64, invert: bool) -> f64 {
    let prior = match prior {
        Some(p) => p,
        None => return demand,
    };
    let rising = demand > prior;
    let fast = if invert { !rising } else { rising };
    if fast {
        0.7 * demand + 0.3 * prior
    } else {
        0.1 * demand + 0.9 * prior
    }
}
