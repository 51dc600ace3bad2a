//! Archetype, task and adapter descriptor types

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::error::{MnemeError, Result};

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").expect("identifier pattern is valid"));

static SEMVER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\d+\.\d+$").expect("version pattern is valid"));

fn validate_identifier(kind: &str, value: &str) -> Result<()> {
    if IDENTIFIER.is_match(value) {
        Ok(())
    } else {
        Err(MnemeError::InvalidRecord(format!(
            "{} '{}' must match [a-z0-9][a-z0-9_-]{{0,63}}",
            kind, value
        )))
    }
}

/// Identity of an archetype ("vampire", "river-spirit")
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArchetypeId(String);

impl ArchetypeId {
    /// Create a validated archetype id
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_identifier("archetype id", &id)?;
        Ok(Self(id))
    }

    /// Borrow the id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ArchetypeId {
    type Error = MnemeError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ArchetypeId> for String {
    fn from(id: ArchetypeId) -> Self {
        id.0
    }
}

impl std::fmt::Display for ArchetypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ArchetypeId {
    type Err = MnemeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Behavioral facet every archetype needs a specialized adapter for.
///
/// The set is fixed and shared across archetypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    /// Temperament and values
    Personality,
    /// Combat behavior
    Combat,
    /// Dialogue style
    Dialogue,
}

impl Task {
    /// Every task slot
    pub const ALL: [Task; 3] = [Task::Personality, Task::Combat, Task::Dialogue];

    /// Get string representation of the task.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Personality => "personality",
            Self::Combat => "combat",
            Self::Dialogue => "dialogue",
        }
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An archetype category of non-player agent behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archetype {
    /// Immutable identity
    pub id: ArchetypeId,
    /// Human-readable name
    pub display_name: String,
    /// Task slots a chain must fill to be complete
    pub required_tasks: BTreeSet<Task>,
}

impl Archetype {
    /// Create an archetype requiring every task slot
    pub fn new(id: ArchetypeId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            required_tasks: Task::ALL.into_iter().collect(),
        }
    }
}

/// Identity of a trained adapter
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AdapterId(String);

impl AdapterId {
    /// Create a validated adapter id
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_identifier("adapter id", &id)?;
        Ok(Self(id))
    }

    /// Borrow the id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AdapterId {
    type Error = MnemeError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<AdapterId> for String {
    fn from(id: AdapterId) -> Self {
        id.0
    }
}

impl std::fmt::Display for AdapterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata for one trained adapter.
///
/// Immutable once published. A new version is a new descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterDescriptor {
    /// Adapter identity
    pub id: AdapterId,
    /// Owning archetype
    pub archetype: ArchetypeId,
    /// Task slot this adapter fills
    pub task: Task,
    /// Location relative to the approved adapter root
    pub path: PathBuf,
    /// Base model the adapter was trained against
    pub base_model: String,
    /// Low-rank dimension
    pub rank: u32,
    /// Estimated accelerator memory footprint
    pub footprint_bytes: u64,
    /// Semantic version (MAJOR.MINOR.PATCH)
    pub version: String,
    /// Training provenance notes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
}

impl AdapterDescriptor {
    /// `id@version`, the immutable publication key
    pub fn versioned_key(&self) -> String {
        format!("{}@{}", self.id, self.version)
    }

    /// Validate fields that do not depend on the filesystem
    pub fn validate(&self) -> Result<()> {
        if !SEMVER.is_match(&self.version) {
            return Err(MnemeError::InvalidRecord(format!(
                "adapter '{}' version '{}' is not MAJOR.MINOR.PATCH",
                self.id, self.version
            )));
        }
        if self.base_model.trim().is_empty() {
            return Err(MnemeError::InvalidRecord(format!(
                "adapter '{}' has no base model",
                self.id
            )));
        }
        Ok(())
    }
}

/// The complete adapter set for one archetype
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchetypeChain {
    /// Archetype this chain serves
    pub archetype: Archetype,
    /// One adapter per task slot
    pub adapters: BTreeMap<Task, AdapterDescriptor>,
    /// Inference runtime the chain targets
    pub runtime_target: String,
    /// When the registry accepted the chain
    pub registered_at: DateTime<Utc>,
}

impl ArchetypeChain {
    /// Archetype id shortcut
    pub fn id(&self) -> &ArchetypeId {
        &self.archetype.id
    }

    /// Required tasks with no descriptor
    pub fn missing_tasks(&self) -> Vec<Task> {
        self.archetype
            .required_tasks
            .iter()
            .filter(|task| !self.adapters.contains_key(task))
            .copied()
            .collect()
    }

    /// A chain is complete when every required task has a descriptor
    pub fn is_complete(&self) -> bool {
        self.missing_tasks().is_empty()
    }

    /// Summed footprint of every adapter in the chain
    pub fn footprint_bytes(&self) -> u64 {
        self.adapters.values().map(|a| a.footprint_bytes).sum()
    }

    /// Adapter serving a task
    pub fn adapter(&self, task: Task) -> Option<&AdapterDescriptor> {
        self.adapters.get(&task)
    }

    /// Same archetype, adapters and target; ignores registration time
    pub fn same_content(&self, other: &ArchetypeChain) -> bool {
        self.archetype == other.archetype
            && self.adapters == other.adapters
            && self.runtime_target == other.runtime_target
    }
}
