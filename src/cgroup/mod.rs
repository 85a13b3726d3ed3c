// # Cgroup Sampler
//
// Reads cumulative CPU throttle/usage counters from the kernel control-group
// interface and turns consecutive samples into a bounded pressure signal and
// an instantaneous usage figure. One sampler instance serves every workload
// on the node; a single mutex guards both the resolved-path cache and the
// prior-sample table.

pub mod paths;

use crate::common::WorkloadId;
use crate::error::AgentError;
use crate::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Flat-keyed statistics file inside every cgroup v2 directory.
pub const CPU_STAT_FILE: &str = "cpu.stat";

/// A throttled/used ratio of this much maps to full pressure (1.0).
const THROTTLE_RATIO_SCALE: f64 = 0.1;

/// Bounded backoff for transient filesystem errors: an initial read plus up
/// to three retries at 100/200/400 ms.
const READ_ATTEMPTS: u32 = 4;
const READ_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Cumulative counters from one read of the statistics file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuStat {
    pub usage_usec: u64,
    pub throttled_usec: u64,
}

/// Stored sample used for delta computation on the next read.
#[derive(Debug, Clone, Copy)]
struct PriorSample {
    read_at: Instant,
    stat: CpuStat,
}

/// Result of one sampler read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleOutcome {
    /// No prior sample existed; counters stored, nothing derivable yet.
    First,
    /// A valid delta was computed.
    Ready { pressure: f64, usage_millis: f64 },
    /// The sample was dropped (insufficient CPU time consumed, too-soon
    /// read, or a counter reset). The caller must preserve its prior
    /// smoothed pressure; a drop is never reported as zero pressure.
    Dropped,
}

#[derive(Default)]
struct SamplerState {
    path_cache: HashMap<WorkloadId, PathBuf>,
    prior: HashMap<WorkloadId, PriorSample>,
}

pub struct CgroupSampler {
    root: PathBuf,
    min_usage_usec: u64,
    state: Mutex<SamplerState>,
}

impl CgroupSampler {
    pub fn new(root: impl Into<PathBuf>, min_usage_usec: u64) -> Self {
        Self {
            root: root.into(),
            min_usage_usec,
            state: Mutex::new(SamplerState::default()),
        }
    }

    /// Sample a workload's cgroup and derive pressure and usage from the
    /// delta against the stored prior sample. `interval_hint` is the minimum
    /// resolution: a read arriving sooner than the hint after the prior
    /// sample is dropped without touching stored state.
    pub async fn read_pressure_and_usage(
        &self,
        id: &WorkloadId,
        interval_hint: Duration,
    ) -> Result<SampleOutcome> {
        let dir = self.resolve_dir(id)?;
        let stat = self.read_stat_with_retry(&dir, id).await?;
        let now = Instant::now();

        let mut state = self.state.lock();
        let outcome = match state.prior.get(id).copied() {
            None => {
                state.prior.insert(id.clone(), PriorSample { read_at: now, stat });
                SampleOutcome::First
            }
            Some(prior) => {
                let elapsed = now.duration_since(prior.read_at);
                if elapsed < interval_hint {
                    return Ok(SampleOutcome::Dropped);
                }
                match derive(prior.stat, stat, elapsed, self.min_usage_usec) {
                    Derived::Ready { pressure, usage_millis } => {
                        state.prior.insert(id.clone(), PriorSample { read_at: now, stat });
                        SampleOutcome::Ready { pressure, usage_millis }
                    }
                    Derived::Insufficient => {
                        // Stored sample stays as-is so the consumed CPU time
                        // accumulates toward the next read.
                        SampleOutcome::Dropped
                    }
                    Derived::CounterReset => {
                        debug!(workload = %id, "cgroup counters went backwards, restarting delta");
                        state.prior.insert(id.clone(), PriorSample { read_at: now, stat });
                        SampleOutcome::Dropped
                    }
                }
            }
        };
        Ok(outcome)
    }

    /// Drop cached paths and prior samples for identities no longer live.
    pub fn cleanup(&self, live: &HashSet<WorkloadId>) {
        let mut state = self.state.lock();
        state.path_cache.retain(|id, _| live.contains(id));
        state.prior.retain(|id, _| live.contains(id));
    }

    fn resolve_dir(&self, id: &WorkloadId) -> Result<PathBuf> {
        {
            let state = self.state.lock();
            if let Some(cached) = state.path_cache.get(id) {
                return Ok(cached.clone());
            }
        }
        match paths::resolve(&self.root, id) {
            Some(dir) => {
                self.state.lock().path_cache.insert(id.clone(), dir.clone());
                Ok(dir)
            }
            None => Err(AgentError::CgroupNotFound(id.to_string())),
        }
    }

    /// Read and parse the statistics file, retrying transient filesystem
    /// errors with bounded exponential backoff. Parse errors are not
    /// retryable. A vanished directory invalidates the cached path.
    async fn read_stat_with_retry(&self, dir: &Path, id: &WorkloadId) -> Result<CpuStat> {
        let path = dir.join(CPU_STAT_FILE);
        let mut backoff = READ_BACKOFF_BASE;
        let mut last_err = None;

        for attempt in 1..=READ_ATTEMPTS {
            match std::fs::read_to_string(&path) {
                Ok(raw) => return parse_cpu_stat(&raw),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.state.lock().path_cache.remove(id);
                    return Err(AgentError::CgroupNotFound(id.to_string()));
                }
                Err(e) => {
                    if attempt < READ_ATTEMPTS {
                        warn!(
                            workload = %id,
                            attempt,
                            error = %e,
                            "transient cgroup read failure, backing off"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(AgentError::Io(last_err.unwrap_or_else(|| {
            std::io::Error::other("cgroup read failed")
        })))
    }
}

enum Derived {
    Ready { pressure: f64, usage_millis: f64 },
    Insufficient,
    CounterReset,
}

/// Pure delta derivation, separated from I/O for direct testing.
fn derive(prior: CpuStat, current: CpuStat, elapsed: Duration, min_usage_usec: u64) -> Derived {
    if current.usage_usec < prior.usage_usec || current.throttled_usec < prior.throttled_usec {
        return Derived::CounterReset;
    }
    let delta_used = current.usage_usec - prior.usage_usec;
    if delta_used < min_usage_usec {
        return Derived::Insufficient;
    }
    let delta_throttled = current.throttled_usec - prior.throttled_usec;
    let wall_usec = elapsed.as_micros().max(1) as f64;

    let ratio = delta_throttled as f64 / delta_used as f64;
    let pressure = (ratio / THROTTLE_RATIO_SCALE).clamp(0.0, 1.0);
    let usage_millis = delta_used as f64 / wall_usec * 1000.0;

    Derived::Ready { pressure, usage_millis }
}

/// Parse the flat `key value` lines of a cgroup v2 `cpu.stat` file.
pub fn parse_cpu_stat(raw: &str) -> Result<CpuStat> {
    let mut usage_usec = None;
    let mut throttled_usec = None;

    for line in raw.lines() {
        let mut parts = line.split_whitespace();
        let key = match parts.next() {
            Some(k) => k,
            None => continue,
        };
        if key != "usage_usec" && key != "throttled_usec" {
            continue;
        }
        let value = parts
            .next()
            .ok_or_else(|| AgentError::CgroupParse(format!("missing value for {}", key)))?
            .parse::<u64>()
            .map_err(|_| AgentError::CgroupParse(format!("bad value for {}", key)))?;
        match key {
            "usage_usec" => usage_usec = Some(value),
            _ => throttled_usec = Some(value),
        }
    }

    Ok(CpuStat {
        usage_usec: usage_usec
            .ok_or_else(|| AgentError::CgroupParse("usage_usec missing".to_string()))?,
        // Unthrottled cgroups may omit the throttle counter entirely.
        throttled_usec: throttled_usec.unwrap_or(0),
    })
}
