//! Synthetic archetypes and scripted dialogue for evaluation runs

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::archetype::{AdapterDescriptor, AdapterId, Archetype, ArchetypeId, Task};
use crate::error::Result;

const OPENERS: &[&str] = &[
    "Good morning, what are you working on",
    "I heard there was trouble near the mill",
    "Can you repair this old shield",
    "Do you know where the healer lives",
    "The caravan is late again",
    "Have you seen a stranger in a grey cloak",
];

const FOLLOW_UPS: &[&str] = &[
    "What would that cost me",
    "Tell me more about that",
    "Why do you say so",
    "Would you trust him",
    "I promise to bring the ore tomorrow",
    "Fair enough, thank you",
];

/// An archetype requiring every task
pub fn synthetic_archetype(id: &ArchetypeId) -> Archetype {
    Archetype::new(id.clone(), format!("Synthetic {}", id))
}

/// One adapter per task for `id`, each `footprint_bytes` large, stored at
/// `{id}/{task}` under the adapter root
pub fn synthetic_adapters(
    id: &ArchetypeId,
    footprint_bytes: u64,
) -> Result<BTreeMap<Task, AdapterDescriptor>> {
    Task::ALL
        .into_iter()
        .map(|task| {
            let descriptor = AdapterDescriptor {
                id: AdapterId::new(format!("{}-{}", id, task))?,
                archetype: id.clone(),
                task,
                path: PathBuf::from(format!("{}/{}", id, task)),
                base_model: "synthetic-base".to_string(),
                rank: 16,
                footprint_bytes,
                version: "1.0.0".to_string(),
                provenance: Some("synthetic evaluation fixture".to_string()),
            };
            Ok((task, descriptor))
        })
        .collect()
}

/// Scripted input for a simulated agent's `turn`-th line (0-based).
///
/// Every line carries a marker unique to the agent and turn so the harness
/// can tell whether the next memory card saw it.
pub fn scripted_input(agent_index: usize, turn: usize) -> String {
    let line = if turn == 0 {
        OPENERS[agent_index % OPENERS.len()]
    } else {
        FOLLOW_UPS[(agent_index + turn) % FOLLOW_UPS.len()]
    };
    format!("{}? [{}]", line, marker(agent_index, turn))
}

/// Marker embedded by [`scripted_input`]
pub fn marker(agent_index: usize, turn: usize) -> String {
    format!("m{}-{}", agent_index, turn)
}
