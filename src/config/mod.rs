// # Agent Configuration
//
// All tunables for the node agent. Loaded once at startup from defaults,
// an optional TOML file, and `COREBALANCER_*` environment overrides, in that
// order. There are no runtime reloads; invalid combinations are fatal.

use crate::common::parse_millis;
use crate::error::AgentError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Node agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Name of the node this agent manages. Empty means "derive from hostname".
    pub node_name: String,
    /// Root of the cgroup v2 hierarchy.
    pub cgroup_root: String,
    /// Directory for the embedded state store (desired-state records and
    /// learner snapshots).
    pub state_path: String,

    /// Minimum sampler resolution.
    pub sampling_interval_ms: u64,
    /// Fast reactive loop tick.
    pub fast_interval_ms: u64,
    /// Slow optimisation loop tick.
    pub slow_interval_ms: u64,
    /// Learner persistence tick.
    pub persist_interval_ms: u64,

    /// Hysteresis gate: relative change below this percentage is not written.
    pub min_change_percent: f64,
    /// Reserve taken off available capacity before solving.
    pub system_reserve_percent: f64,
    /// Authoritative node CPU capacity in millicores. Zero means "derive
    /// from the core count".
    pub total_cpu_capacity_millis: u32,
    /// Floor for every bid minimum, human millicore string.
    pub baseline_cpu_per_pod: String,
    /// Absolute floor on any published allocation.
    pub absolute_min_allocation: u32,
    /// Window after workload start during which allocations may only rise.
    pub startup_grace_period_ms: u64,
    /// Pressure level that triggers the fast loop.
    pub throttling_threshold: f64,
    /// Fast-loop boost step bounds.
    pub fast_step_min: f64,
    pub fast_step_max: f64,

    /// Learner hyperparameters.
    pub learning_rate: f64,
    pub discount_factor: f64,
    pub exploration_rate: f64,
    pub exploration_min: f64,
    pub exploration_decay: f64,

    /// Inverts the demand tracker's smoothing asymmetry in the bid builder.
    pub cost_efficiency_mode: bool,
    /// Samples with less than this much CPU time consumed are dropped.
    pub min_usage_usec: u64,
    /// Headroom applied to the bid floor above observed usage.
    pub need_headroom: f64,
    /// Headroom applied to the bid ceiling above demand.
    pub want_headroom: f64,
    /// No single workload may exceed this share of node capacity.
    pub node_share_percent: f64,

    /// Minimum elapsed time between desired-state writes for one workload.
    pub base_cooldown_ms: u64,
    /// Per-call jitter added to the cooldown to desynchronise writes.
    pub cooldown_jitter_ms: u64,
    /// Cooldown honoured by the fast loop.
    pub fast_cooldown_ms: u64,
    /// Per-call timeout on store operations.
    pub api_timeout_ms: u64,
    /// Back-off sleep after a cycle in which most writes failed.
    pub write_backoff_ms: u64,

    /// Namespaces never managed (system, self).
    pub excluded_namespaces: Vec<String>,
    /// Label that opts a workload out of management.
    pub opt_out_label: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            cgroup_root: "/sys/fs/cgroup".to_string(),
            state_path: "./corebalancer-state".to_string(),
            sampling_interval_ms: 1_000,
            fast_interval_ms: 2_000,
            slow_interval_ms: 15_000,
            persist_interval_ms: 30_000,
            min_change_percent: 5.0,
            system_reserve_percent: 10.0,
            total_cpu_capacity_millis: 4_000,
            baseline_cpu_per_pod: "100m".to_string(),
            absolute_min_allocation: 10,
            startup_grace_period_ms: 45_000,
            throttling_threshold: 0.1,
            fast_step_min: 0.20,
            fast_step_max: 0.40,
            learning_rate: 0.1,
            discount_factor: 0.9,
            exploration_rate: 0.2,
            exploration_min: 0.01,
            exploration_decay: 0.995,
            cost_efficiency_mode: false,
            min_usage_usec: 1_000,
            need_headroom: 0.2,
            want_headroom: 0.5,
            node_share_percent: 75.0,
            base_cooldown_ms: 30_000,
            cooldown_jitter_ms: 5_000,
            fast_cooldown_ms: 5_000,
            api_timeout_ms: 5_000,
            write_backoff_ms: 10_000,
            excluded_namespaces: vec![
                "kube-system".to_string(),
                "corebalancer-system".to_string(),
            ],
            opt_out_label: "corebalancer.io/opt-out".to_string(),
        }
    }
}

impl AgentConfig {
    /// Load configuration: defaults, then the TOML file if present, then
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => Self::from_file(p)?,
            _ => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| AgentError::Configuration(format!("{}: {}", path.display(), e)))
    }

    fn apply_env_overrides(&mut self) {
        env_string("COREBALANCER_NODE_NAME", &mut self.node_name);
        env_string("COREBALANCER_CGROUP_ROOT", &mut self.cgroup_root);
        env_string("COREBALANCER_STATE_PATH", &mut self.state_path);
        env_string(
            "COREBALANCER_BASELINE_CPU_PER_POD",
            &mut self.baseline_cpu_per_pod,
        );
        env_string("COREBALANCER_OPT_OUT_LABEL", &mut self.opt_out_label);
        env_u64("COREBALANCER_SAMPLING_INTERVAL_MS", &mut self.sampling_interval_ms);
        env_u64("COREBALANCER_FAST_INTERVAL_MS", &mut self.fast_interval_ms);
        env_u64("COREBALANCER_SLOW_INTERVAL_MS", &mut self.slow_interval_ms);
        env_u64("COREBALANCER_PERSIST_INTERVAL_MS", &mut self.persist_interval_ms);
        env_u64("COREBALANCER_STARTUP_GRACE_PERIOD_MS", &mut self.startup_grace_period_ms);
        env_u64("COREBALANCER_BASE_COOLDOWN_MS", &mut self.base_cooldown_ms);
        env_u64("COREBALANCER_COOLDOWN_JITTER_MS", &mut self.cooldown_jitter_ms);
        env_u64("COREBALANCER_FAST_COOLDOWN_MS", &mut self.fast_cooldown_ms);
        env_u64("COREBALANCER_API_TIMEOUT_MS", &mut self.api_timeout_ms);
        env_u64("COREBALANCER_WRITE_BACKOFF_MS", &mut self.write_backoff_ms);
        env_u64("COREBALANCER_MIN_USAGE_USEC", &mut self.min_usage_usec);
        env_u32(
            "COREBALANCER_TOTAL_CPU_CAPACITY_MILLI",
            &mut self.total_cpu_capacity_millis,
        );
        env_u32(
            "COREBALANCER_ABSOLUTE_MIN_ALLOCATION",
            &mut self.absolute_min_allocation,
        );
        env_f64("COREBALANCER_MIN_CHANGE_PERCENT", &mut self.min_change_percent);
        env_f64(
            "COREBALANCER_SYSTEM_RESERVE_PERCENT",
            &mut self.system_reserve_percent,
        );
        env_f64("COREBALANCER_THROTTLING_THRESHOLD", &mut self.throttling_threshold);
        env_f64("COREBALANCER_FAST_STEP_MIN", &mut self.fast_step_min);
        env_f64("COREBALANCER_FAST_STEP_MAX", &mut self.fast_step_max);
        env_f64("COREBALANCER_LEARNING_RATE", &mut self.learning_rate);
        env_f64("COREBALANCER_DISCOUNT_FACTOR", &mut self.discount_factor);
        env_f64("COREBALANCER_EXPLORATION_RATE", &mut self.exploration_rate);
        env_f64("COREBALANCER_EXPLORATION_MIN", &mut self.exploration_min);
        env_f64("COREBALANCER_EXPLORATION_DECAY", &mut self.exploration_decay);
        env_f64("COREBALANCER_NEED_HEADROOM", &mut self.need_headroom);
        env_f64("COREBALANCER_WANT_HEADROOM", &mut self.want_headroom);
        env_f64("COREBALANCER_NODE_SHARE_PERCENT", &mut self.node_share_percent);
        env_bool("COREBALANCER_COST_EFFICIENCY_MODE", &mut self.cost_efficiency_mode);
        if let Ok(v) = std::env::var("COREBALANCER_EXCLUDED_NAMESPACES") {
            self.excluded_namespaces = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    /// Reject configurations the agent cannot run under. Called once at
    /// startup; runtime code may assume a validated config.
    pub fn validate(&self) -> Result<()> {
        if self.fast_interval_ms == 0 || self.slow_interval_ms == 0 {
            return Err(AgentError::Configuration(
                "loop intervals must be non-zero".to_string(),
            ));
        }
        if self.fast_interval_ms > self.slow_interval_ms {
            return Err(AgentError::Configuration(format!(
                "fast_interval ({} ms) must not exceed slow_interval ({} ms)",
                self.fast_interval_ms, self.slow_interval_ms
            )));
        }
        if self.sampling_interval_ms == 0 {
            return Err(AgentError::Configuration(
                "sampling_interval must be non-zero".to_string(),
            ));
        }
        if self.baseline_cpu_per_pod.trim().is_empty() {
            return Err(AgentError::Configuration(
                "baseline_cpu_per_pod must not be empty".to_string(),
            ));
        }
        parse_millis(&self.baseline_cpu_per_pod).map_err(|_| {
            AgentError::Configuration(format!(
                "baseline_cpu_per_pod is not a cpu quantity: {:?}",
                self.baseline_cpu_per_pod
            ))
        })?;
        if self.fast_step_min > self.fast_step_max {
            return Err(AgentError::Configuration(
                "fast_step_min must not exceed fast_step_max".to_string(),
            ));
        }
        for (name, v) in [
            ("min_change_percent", self.min_change_percent),
            ("system_reserve_percent", self.system_reserve_percent),
            ("node_share_percent", self.node_share_percent),
        ] {
            if !(0.0..=100.0).contains(&v) {
                return Err(AgentError::Configuration(format!(
                    "{} must be within [0, 100], got {}",
                    name, v
                )));
            }
        }
        for (name, v) in [
            ("learning_rate", self.learning_rate),
            ("discount_factor", self.discount_factor),
            ("exploration_rate", self.exploration_rate),
            ("exploration_min", self.exploration_min),
            ("exploration_decay", self.exploration_decay),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(AgentError::Configuration(format!(
                    "{} must be within [0, 1], got {}",
                    name, v
                )));
            }
        }
        Ok(())
    }

    /// Baseline floor in millicores. `validate` guarantees this parses.
    pub fn baseline_millis(&self) -> u32 {
        parse_millis(&self.baseline_cpu_per_pod).unwrap_or(100)
    }

    /// Node capacity in millicores, deriving from the core count when not
    /// configured explicitly.
    pub fn capacity_millis(&self) -> u32 {
        if self.total_cpu_capacity_millis > 0 {
            self.total_cpu_capacity_millis
        } else {
            (num_cpus::get() as u32) * 1000
        }
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling_interval_ms)
    }

    pub fn fast_interval(&self) -> Duration {
        Duration::from_millis(self.fast_interval_ms)
    }

    pub fn slow_interval(&self) -> Duration {
        Duration::from_millis(self.slow_interval_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }

    pub fn startup_grace_period(&self) -> Duration {
        Duration::from_millis(self.startup_grace_period_ms)
    }

    pub fn base_cooldown(&self) -> Duration {
        Duration::from_millis(self.base_cooldown_ms)
    }

    pub fn fast_cooldown(&self) -> Duration {
        Duration::from_millis(self.fast_cooldown_ms)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }

    pub fn write_backoff(&self) -> Duration {
        Duration::from_millis(self.write_backoff_ms)
    }
}

fn env_string(key: &str, target: &mut String) {
    if let Ok(v) = std::env::var(key) {
        *target = v;
    }
}

fn env_u64(key: &str, target: &mut u64) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(parsed) = v.parse() {
            *target = parsed;
        }
    }
}

fn env_u32(key: &str, target: &mut u32) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(parsed) = v.parse() {
            *target = parsed;
        }
    }
}

fn env_f64(key: &str, target: &mut f64) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(parsed) = v.parse() {
            *target = parsed;
        }
    }
}

fn env_bool(key: &str, target: &mut bool) {
    if let Ok(v) = std::env::var(key) {
        *target = matches!(v.as_str(), "1" | "true" | "yes" | "on");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.baseline_millis(), 100);
        assert_eq!(config.capacity_millis(), 4000);
    }

    #[test]
    fn fast_interval_above_slow_is_fatal() {
        let config = AgentConfig {
            fast_interval_ms: 20_000,
            slow_interval_ms: 15_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_baseline_is_fatal() {
        let config = AgentConfig {
            baseline_cpu_per_pod: "".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unparseable_baseline_is_fatal() {
        let config = AgentConfig {
            baseline_cpu_per_pod: "lots".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn percent_bounds_enforced() {
        let config = AgentConfig {
            system_reserve_percent: 150.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip() {
        let config = AgentConfig::default();
        let raw = toml::to_string(&config).unwrap();
        let parsed: AgentConfig = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.slow_interval_ms, config.slow_interval_ms);
        assert_eq!(parsed.excluded_namespaces, config.excluded_namespaces);
    }

    #[test]
    fn zero_capacity_derives_from_cores() {
        let config = AgentConfig {
            total_cpu_capacity_millis: 0,
            ..Default::default()
        };
        assert!(config.capacity_millis() >= 1000);
    }
}
