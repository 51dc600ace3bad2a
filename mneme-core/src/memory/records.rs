//! Agent memory records shared by every tier

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{MnemeError, Result};

/// One exchange between an agent and a counterpart.
///
/// Unique by `(agent_id, counterpart_id, ordinal)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub agent_id: String,
    pub counterpart_id: String,
    /// Per-(agent, counterpart) sequence number, starting at 1
    pub ordinal: u64,
    pub input: String,
    pub output: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ConversationTurn {
    /// Create a turn stamped with the current time
    pub fn new(
        agent_id: impl Into<String>,
        counterpart_id: impl Into<String>,
        ordinal: u64,
        input: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            counterpart_id: counterpart_id.into(),
            ordinal,
            input: input.into(),
            output: output.into(),
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_ids(&self.agent_id, &self.counterpart_id)?;
        if self.ordinal == 0 {
            return Err(MnemeError::InvalidRecord(format!(
                "turn for '{}' has ordinal 0; ordinals start at 1",
                self.agent_id
            )));
        }
        Ok(())
    }
}

/// Rollup of a closed conversational session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub agent_id: String,
    pub counterpart_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Ordinal range covered, inclusive
    pub first_ordinal: u64,
    pub last_ordinal: u64,
    pub summary: String,
    /// Emotional tone tag ("warm", "hostile", "neutral", ...)
    pub tone: String,
    pub topics: Vec<String>,
    pub decisions: Vec<String>,
}

/// A discrete fact worth remembering. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalientMemory {
    pub id: Uuid,
    pub agent_id: String,
    pub counterpart_id: String,
    /// Category ("betrayal", "gift", "quest", ...)
    pub kind: String,
    pub description: String,
    /// How strongly this should shape behavior, 0.0..=1.0
    pub impact: f64,
    pub recorded_at: DateTime<Utc>,
}

impl SalientMemory {
    /// Create a salient memory with a fresh id
    pub fn new(
        agent_id: impl Into<String>,
        counterpart_id: impl Into<String>,
        kind: impl Into<String>,
        description: impl Into<String>,
        impact: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            counterpart_id: counterpart_id.into(),
            kind: kind.into(),
            description: description.into(),
            impact,
            recorded_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_ids(&self.agent_id, &self.counterpart_id)?;
        if !(0.0..=1.0).contains(&self.impact) {
            return Err(MnemeError::InvalidRecord(format!(
                "salient memory impact {} is outside 0.0..=1.0",
                self.impact
            )));
        }
        Ok(())
    }
}

/// Latest-known relationship and quest state for one pair. Last write wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipSnapshot {
    pub agent_id: String,
    pub counterpart_id: String,
    /// -1.0 (hostile) ..= 1.0 (devoted)
    pub trust: f64,
    /// -1.0 ..= 1.0
    pub affinity: f64,
    pub active_objectives: Vec<String>,
    pub completed_milestones: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl RelationshipSnapshot {
    /// Neutral relationship with no objectives
    pub fn neutral(agent_id: impl Into<String>, counterpart_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            counterpart_id: counterpart_id.into(),
            trust: 0.0,
            affinity: 0.0,
            active_objectives: Vec::new(),
            completed_milestones: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_ids(&self.agent_id, &self.counterpart_id)?;
        for (name, value) in [("trust", self.trust), ("affinity", self.affinity)] {
            if !(-1.0..=1.0).contains(&value) {
                return Err(MnemeError::InvalidRecord(format!(
                    "{} {} is outside -1.0..=1.0",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Anything the cold tier persists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum ArchiveRecord {
    Turn(ConversationTurn),
    Summary(SessionSummary),
    Salient(SalientMemory),
    Relationship(RelationshipSnapshot),
}

impl ArchiveRecord {
    /// Stable identity; writing the same record twice is a no-op
    pub fn record_id(&self) -> String {
        match self {
            ArchiveRecord::Turn(t) => {
                format!("turn:{}:{}:{}", t.agent_id, t.counterpart_id, t.ordinal)
            }
            ArchiveRecord::Summary(s) => format!("summary:{}", s.id),
            ArchiveRecord::Salient(m) => format!("salient:{}", m.id),
            ArchiveRecord::Relationship(r) => format!(
                "rel:{}:{}:{}",
                r.agent_id,
                r.counterpart_id,
                r.updated_at.timestamp_micros()
            ),
        }
    }

    /// Validate the wrapped record
    pub fn validate(&self) -> Result<()> {
        match self {
            ArchiveRecord::Turn(t) => t.validate(),
            ArchiveRecord::Summary(s) => validate_ids(&s.agent_id, &s.counterpart_id),
            ArchiveRecord::Salient(m) => m.validate(),
            ArchiveRecord::Relationship(r) => r.validate(),
        }
    }

    /// Record kind name
    pub fn kind(&self) -> &'static str {
        match self {
            ArchiveRecord::Turn(_) => "turn",
            ArchiveRecord::Summary(_) => "summary",
            ArchiveRecord::Salient(_) => "salient",
            ArchiveRecord::Relationship(_) => "relationship",
        }
    }

    /// Owning agent
    pub fn agent_id(&self) -> &str {
        match self {
            ArchiveRecord::Turn(t) => &t.agent_id,
            ArchiveRecord::Summary(s) => &s.agent_id,
            ArchiveRecord::Salient(m) => &m.agent_id,
            ArchiveRecord::Relationship(r) => &r.agent_id,
        }
    }

    /// Counterpart the record concerns
    pub fn counterpart_id(&self) -> &str {
        match self {
            ArchiveRecord::Turn(t) => &t.counterpart_id,
            ArchiveRecord::Summary(s) => &s.counterpart_id,
            ArchiveRecord::Salient(m) => &m.counterpart_id,
            ArchiveRecord::Relationship(r) => &r.counterpart_id,
        }
    }

    /// When the record was produced
    pub fn recorded_at(&self) -> DateTime<Utc> {
        match self {
            ArchiveRecord::Turn(t) => t.timestamp,
            ArchiveRecord::Summary(s) => s.ended_at,
            ArchiveRecord::Salient(m) => m.recorded_at,
            ArchiveRecord::Relationship(r) => r.updated_at,
        }
    }
}

fn validate_ids(agent_id: &str, counterpart_id: &str) -> Result<()> {
    if agent_id.trim().is_empty() || counterpart_id.trim().is_empty() {
        return Err(MnemeError::InvalidRecord(
            "agent and counterpart ids must be non-empty".to_string(),
        ));
    }
    if agent_id.contains(':') || counterpart_id.contains(':') {
        return Err(MnemeError::InvalidRecord(format!(
            "ids may not contain ':' ('{}', '{}')",
            agent_id, counterpart_id
        )));
    }
    Ok(())
}
