use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cgroup not found: {0}")]
    CgroupNotFound(String),

    #[error("Cgroup parse error: {0}")]
    CgroupParse(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Version conflict: {0}")]
    Conflict(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sled::Error> for AgentError {
    fn from(e: sled::Error) -> Self {
        AgentError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Transient errors are retried in place by the producing component and
    /// counted into the apply back-off heuristic; everything else surfaces.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgentError::Io(_)
                | AgentError::Store(_)
                | AgentError::Conflict(_)
                | AgentError::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(AgentError::Timeout("store put".into()).is_transient());
        assert!(AgentError::Conflict("version 3 != 4".into()).is_transient());
        assert!(!AgentError::CgroupParse("bad usage_usec".into()).is_transient());
        assert!(!AgentError::Configuration("fast >= slow".into()).is_transient());
    }
}
