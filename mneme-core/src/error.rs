//! Error types for Mneme operations

/// Result type for Mneme operations
pub type Result<T> = std::result::Result<T, MnemeError>;

/// Error types for the registry, coordinator and memory tiers
#[derive(Debug, thiserror::Error)]
pub enum MnemeError {
    /// A chain is missing one or more required task adapters
    #[error("Incomplete chain for archetype '{archetype}': missing tasks {missing:?}")]
    IncompleteChain {
        archetype: String,
        missing: Vec<String>,
    },

    /// Adapter storage location escapes the approved adapter root
    #[error("Invalid adapter path: {0}")]
    InvalidPath(String),

    /// Concurrent or contradictory registry write
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Archetype (or record) not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resident adapters would exceed the capacity ceiling
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Caller-supplied deadline elapsed
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Backing store could not be reached or returned corrupt data
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Hot tier ordinal violation
    #[error("Out-of-order turn for '{agent_id}': expected ordinal {expected}, got {got}")]
    OutOfOrder {
        agent_id: String,
        expected: u64,
        got: u64,
    },

    /// Archetype has live leases and cannot be evicted
    #[error("Archetype in use: {0}")]
    InUse(String),

    /// Archiver queue is full
    #[error("Archive queue full ({depth} records pending)")]
    Backpressure { depth: usize },

    /// Record failed validation
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl MnemeError {
    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MnemeError::Timeout(_)
                | MnemeError::StorageUnavailable(_)
                | MnemeError::Backpressure { .. }
        )
    }

    /// Short machine-readable error kind, used in stats and logs
    pub fn kind(&self) -> &'static str {
        match self {
            MnemeError::IncompleteChain { .. } => "incomplete_chain",
            MnemeError::InvalidPath(_) => "invalid_path",
            MnemeError::Conflict(_) => "conflict",
            MnemeError::NotFound(_) => "not_found",
            MnemeError::CapacityExceeded(_) => "capacity_exceeded",
            MnemeError::Timeout(_) => "timeout",
            MnemeError::StorageUnavailable(_) => "storage_unavailable",
            MnemeError::OutOfOrder { .. } => "out_of_order",
            MnemeError::InUse(_) => "in_use",
            MnemeError::Backpressure { .. } => "backpressure",
            MnemeError::InvalidRecord(_) => "invalid_record",
            MnemeError::Configuration(_) => "configuration",
            MnemeError::Serialization(_) => "serialization",
            MnemeError::Io(_) => "io",
            MnemeError::Other(_) => "other",
        }
    }

    /// Copy of this error for fanning one failure out to several waiters
    pub(crate) fn duplicate(&self) -> MnemeError {
        match self {
            MnemeError::IncompleteChain { archetype, missing } => MnemeError::IncompleteChain {
                archetype: archetype.clone(),
                missing: missing.clone(),
            },
            MnemeError::InvalidPath(s) => MnemeError::InvalidPath(s.clone()),
            MnemeError::Conflict(s) => MnemeError::Conflict(s.clone()),
            MnemeError::NotFound(s) => MnemeError::NotFound(s.clone()),
            MnemeError::CapacityExceeded(s) => MnemeError::CapacityExceeded(s.clone()),
            MnemeError::Timeout(s) => MnemeError::Timeout(s.clone()),
            MnemeError::StorageUnavailable(s) => MnemeError::StorageUnavailable(s.clone()),
            MnemeError::OutOfOrder {
                agent_id,
                expected,
                got,
            } => MnemeError::OutOfOrder {
                agent_id: agent_id.clone(),
                expected: *expected,
                got: *got,
            },
            MnemeError::InUse(s) => MnemeError::InUse(s.clone()),
            MnemeError::Backpressure { depth } => MnemeError::Backpressure { depth: *depth },
            MnemeError::InvalidRecord(s) => MnemeError::InvalidRecord(s.clone()),
            MnemeError::Configuration(s) => MnemeError::Configuration(s.clone()),
            MnemeError::Serialization(e) => MnemeError::Other(format!("Serialization error: {}", e)),
            MnemeError::Io(e) => MnemeError::Io(std::io::Error::new(e.kind(), e.to_string())),
            MnemeError::Other(s) => MnemeError::Other(s.clone()),
        }
    }
}

impl From<String> for MnemeError {
    fn from(s: String) -> Self {
        MnemeError::Other(s)
    }
}

impl From<&str> for MnemeError {
    fn from(s: &str) -> Self {
        MnemeError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for MnemeError {
    fn from(err: anyhow::Error) -> Self {
        MnemeError::Other(err.to_string())
    }
}
