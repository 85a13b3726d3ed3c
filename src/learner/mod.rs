// # Per-Workload Learner
//
// Each managed workload carries a discrete-state Q-learner that selects a
// bidding strategy and adapts on observed outcomes. State is a coarse
// bucketing of (usage, pressure, allocation-vs-usage); actions are the three
// bidding postures. Q-values live in a string-keyed table so they serialise
// directly for persistence across restarts.

use crate::common::SHADOW_PRICE_BIAS_THRESHOLD;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Instant;

/// Bidding strategy chosen per slow cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Aggressive,
    Normal,
    Conservative,
}

impl Action {
    /// Fixed iteration order; ties in action selection resolve to the
    /// earliest entry.
    pub const ALL: [Action; 3] = [Action::Aggressive, Action::Normal, Action::Conservative];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Aggressive => "aggressive",
            Action::Normal => "normal",
            Action::Conservative => "conservative",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Learner hyperparameters, copied out of the agent configuration at
/// learner creation.
#[derive(Debug, Clone, Copy)]
pub struct Hyperparams {
    pub learning_rate: f64,
    pub discount_factor: f64,
    pub exploration_rate: f64,
    pub exploration_min: f64,
    pub exploration_decay: f64,
}

impl Default for Hyperparams {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            discount_factor: 0.9,
            exploration_rate: 0.2,
            exploration_min: 0.01,
            exploration_decay: 0.995,
        }
    }
}

/// Serialisable learner state for the persistence loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerSnapshot {
    pub qtable: HashMap<String, HashMap<String, f64>>,
    pub epsilon: f64,
}

const PRESSURE_HISTORY_LEN: usize = 3;

pub struct Learner {
    /// Latest observed usage in millicores.
    usage: f64,
    /// Latest pressure sample.
    pressure: f64,
    /// Currently applied allocation in millicores.
    allocation: u32,
    qtable: HashMap<String, HashMap<String, f64>>,
    params: Hyperparams,
    epsilon: f64,
    prev_state: Option<String>,
    prev_action: Option<Action>,
    prev_allocation: u32,
    pressure_history: VecDeque<f64>,
    start_time: Instant,
    pub slo_target_ms: Option<u64>,
}

impl Learner {
    pub fn new(params: Hyperparams) -> Self {
        Self {
            usage: 0.0,
            pressure: 0.0,
            allocation: 0,
            qtable: HashMap::new(),
            epsilon: params.exploration_rate,
            params,
            prev_state: None,
            prev_action: None,
            prev_allocation: 0,
            pressure_history: VecDeque::with_capacity(PRESSURE_HISTORY_LEN),
            start_time: Instant::now(),
            slo_target_ms: None,
        }
    }

    pub fn usage(&self) -> f64 {
        self.usage
    }

    pub fn pressure(&self) -> f64 {
        self.pressure
    }

    pub fn allocation(&self) -> u32 {
        self.allocation
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn record_usage(&mut self, usage: f64) {
        self.usage = usage;
    }

    /// Ingest one observation: the allocation currently applied, the latest
    /// pressure sample, and whether an SLO violation was reported. Runs the
    /// off-policy update against the previous cycle's state/action pair and
    /// decays exploration.
    pub fn observe(&mut self, new_allocation: u32, new_pressure: f64, slo_violated: bool) {
        if self.pressure_history.len() == PRESSURE_HISTORY_LEN {
            self.pressure_history.pop_front();
        }
        self.pressure_history.push_back(new_pressure);

        self.prev_allocation = self.allocation;
        self.allocation = new_allocation;
        self.pressure = new_pressure;

        let reward = self.compute_reward(slo_violated);

        if let (Some(prev_state), Some(prev_action)) =
            (self.prev_state.clone(), self.prev_action)
        {
            let current_state = self.encode_state();
            let max_next_q = self
                .qtable
                .get(&current_state)
                .map(|actions| {
                    actions
                        .values()
                        .copied()
                        .fold(f64::NEG_INFINITY, f64::max)
                })
                .filter(|q| q.is_finite())
                .unwrap_or(0.0);

            let entry = self
                .qtable
                .entry(prev_state)
                .or_default()
                .entry(prev_action.as_str().to_string())
                .or_insert(0.0);
            *entry += self.params.learning_rate
                * (reward + self.params.discount_factor * max_next_q - *entry);
        }

        self.epsilon = (self.epsilon * self.params.exploration_decay)
            .max(self.params.exploration_min);
    }

    /// Scalar reward for the latest observation. Contributions are additive.
    fn compute_reward(&self, slo_violated: bool) -> f64 {
        let mut reward = 0.0;
        let usage = self.usage;
        let allocation = self.allocation as f64;

        if allocation >= usage {
            reward += 10.0;
        } else if usage > 0.0 {
            let shortfall_ratio = (usage - allocation) / usage;
            reward -= shortfall_ratio * 20.0;
        }

        reward -= 30.0 * self.pressure;

        if slo_violated {
            reward -= 100.0;
        }

        if allocation > 2.0 * usage {
            let over_headroom = (allocation - 2.0 * usage) / usage.max(1.0);
            reward -= 5.0 * over_headroom;
        }

        if self.pressure < 0.01 {
            reward += 5.0;
        }

        if self.prev_allocation > 0 {
            let delta =
                (allocation - self.prev_allocation as f64).abs() / self.prev_allocation as f64;
            if delta > 0.2 {
                reward -= 10.0 * (delta - 0.2);
            } else if delta < 0.05 {
                reward += 2.0;
            }
        }

        reward
    }

    /// ε-greedy selection with shadow-price bias, recording the
    /// (state, action) pair for the next off-policy update.
    pub fn select_action(&mut self, shadow_price: f64) -> Action {
        let state = self.encode_state();

        let action = if rand::random::<f64>() < self.epsilon {
            Action::ALL[rand::random_range(0..Action::ALL.len())]
        } else {
            self.greedy_action(&state, shadow_price)
        };

        self.prev_state = Some(state);
        self.prev_action = Some(action);
        action
    }

    /// Argmax over price-adjusted Q-values. A high shadow price penalises
    /// aggressive bidding and favours conservative bidding.
    fn greedy_action(&self, state: &str, shadow_price: f64) -> Action {
        let actions = self.qtable.get(state);
        let mut best = Action::ALL[0];
        let mut best_q = f64::NEG_INFINITY;

        for action in Action::ALL {
            let mut q = actions
                .and_then(|a| a.get(action.as_str()))
                .copied()
                .unwrap_or(0.0);
            if shadow_price > SHADOW_PRICE_BIAS_THRESHOLD {
                match action {
                    Action::Aggressive => q -= 5.0 * shadow_price,
                    Action::Conservative => q += 2.0 * shadow_price,
                    Action::Normal => {}
                }
            }
            if q > best_q {
                best_q = q;
                best = action;
            }
        }
        best
    }

    /// Discrete state string: `usage_bucket:pressure_bucket:alloc_bucket`.
    pub fn encode_state(&self) -> String {
        let usage_bucket = if self.usage < 500.0 {
            "low"
        } else if self.usage > 1000.0 {
            "high"
        } else {
            "medium"
        };
        let pressure_bucket = if self.pressure < 0.1 {
            "none"
        } else if self.pressure < 0.3 {
            "some"
        } else {
            "high"
        };
        let allocation = self.allocation as f64;
        let alloc_bucket = if allocation < self.usage {
            "low"
        } else if allocation > 2.0 * self.usage {
            "excess"
        } else {
            "adequate"
        };
        format!("{}:{}:{}", usage_bucket, pressure_bucket, alloc_bucket)
    }

    /// Average of the last three pressure samples; a strictly decreasing
    /// trend over the window discounts the average.
    pub fn effective_pressure(&self) -> f64 {
        if self.pressure_history.is_empty() {
            return self.pressure;
        }
        let avg: f64 =
            self.pressure_history.iter().sum::<f64>() / self.pressure_history.len() as f64;
        if self.pressure_history.len() == PRESSURE_HISTORY_LEN {
            let h: Vec<f64> = self.pressure_history.iter().copied().collect();
            if h[0] > h[1] && h[1] > h[2] {
                return avg * 0.7;
            }
        }
        avg
    }

    pub fn snapshot(&self) -> LearnerSnapshot {
        LearnerSnapshot {
            qtable: self.qtable.clone(),
            epsilon: self.epsilon,
        }
    }

    pub fn restore(&mut self, snapshot: LearnerSnapshot) {
        self.qtable = snapshot.qtable;
        self.epsilon = snapshot
            .epsilon
            .clamp(self.params.exploration_min, 1.0);
    }

    #[cfg(test)]
    fn q_value(&self, state: &str, action: Action) -> f64 {
        self.qtable
            .get(state)
            .and_then(|a| a.get(action.as_str()))
            .copied()
            .unwrap_or(0.0)
    }
}
