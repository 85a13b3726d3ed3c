// # Common Types
//
// Shared identifiers, quantity helpers, and policy constants used across all
// corebalancer modules.

use crate::error::AgentError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Policy Constants
// ============================================================================

/// Shadow-price level above which bidding is damped and learner action
/// selection is biased toward conservative actions. Deliberately a policy
/// constant rather than configuration.
pub const SHADOW_PRICE_BIAS_THRESHOLD: f64 = 0.3;

/// No workload is ever allocated more than this, regardless of demand.
pub const HARD_CAP_MILLIS: u32 = 10_000;

/// Upper bound on the solver's reported shadow price.
pub const MAX_SHADOW_PRICE: f64 = 10.0;

/// Fallback applied allocation when nothing has been observed yet.
pub const DEFAULT_ALLOCATION_MILLIS: u32 = 100;

// ============================================================================
// Identifiers
// ============================================================================

/// Stable opaque workload identifier. The orchestration layer guarantees it
/// never changes for the lifetime of the workload.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadId(pub String);

impl WorkloadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkloadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Mutable (namespace, name) pair used for the desired-state record key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// ============================================================================
// Millicore Quantities
// ============================================================================

/// Format integer millicores as the human string used in desired-state
/// records, e.g. `450` -> `"450m"`.
pub fn format_millis(millis: u32) -> String {
    format!("{}m", millis)
}

/// Parse a CPU quantity into integer millicores. Accepts the millicore form
/// (`"450m"`) and the whole-core form (`"2"`, `"1.5"`).
pub fn parse_millis(s: &str) -> Result<u32> {
    let s = s.trim();
    if s.is_empty() {
        return Err(AgentError::InvalidInput("empty cpu quantity".to_string()));
    }

    if let Some(stripped) = s.strip_suffix('m') {
        return stripped
            .parse::<u32>()
            .map_err(|_| AgentError::InvalidInput(format!("bad millicore quantity: {}", s)));
    }

    let cores = s
        .parse::<f64>()
        .map_err(|_| AgentError::InvalidInput(format!("bad cpu quantity: {}", s)))?;
    if !cores.is_finite() || cores < 0.0 {
        return Err(AgentError::InvalidInput(format!("bad cpu quantity: {}", s)));
    }
    Ok((cores * 1000.0).round() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_round_trip() {
        assert_eq!(format_millis(450), "450m");
        assert_eq!(parse_millis("450m").unwrap(), 450);
        assert_eq!(parse_millis("2").unwrap(), 2000);
        assert_eq!(parse_millis("1.5").unwrap(), 1500);
        assert_eq!(parse_millis(" 100m ").unwrap(), 100);
    }

    #[test]
    fn millis_rejects_garbage() {
        assert!(parse_millis("").is_err());
        assert!(parse_millis("m").is_err());
        assert!(parse_millis("-1").is_err());
        assert!(parse_millis("abc").is_err());
    }

    #[test]
    fn workload_id_ordering_is_lexicographic() {
        let mut ids = vec![
            WorkloadId::from("uid-b"),
            WorkloadId::from("uid-a"),
            WorkloadId::from("uid-c"),
        ];
        ids.sort();
        assert_eq!(ids[0].as_str(), "uid-a");
        assert_eq!(ids[2].as_str(), "uid-c");
    }
}
