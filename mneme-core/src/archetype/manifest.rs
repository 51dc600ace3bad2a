//! Chain manifests: the on-disk form operators register chains from

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use super::types::{AdapterDescriptor, Archetype, ArchetypeId, Task};
use crate::error::{MnemeError, Result};

/// A chain as written by a training pipeline
///
/// ```json
/// {
///   "archetype": "blacksmith",
///   "display_name": "Blacksmith",
///   "runtime_target": "gpu-pool-a",
///   "adapters": [ { "id": "blacksmith-dialogue", "task": "dialogue", ... } ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainManifest {
    pub archetype: ArchetypeId,
    pub display_name: String,
    /// Defaults to every task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_tasks: Option<BTreeSet<Task>>,
    pub runtime_target: String,
    pub adapters: Vec<AdapterDescriptor>,
}

impl ChainManifest {
    /// Read a manifest from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            MnemeError::InvalidRecord(format!(
                "manifest {} is not valid: {}",
                path.display(),
                e
            ))
        })
    }

    /// Split into the arguments of `ArchetypeRegistry::register`.
    ///
    /// # Errors
    ///
    /// [`MnemeError::InvalidRecord`] when two adapters claim the same task.
    pub fn into_parts(self) -> Result<(Archetype, BTreeMap<Task, AdapterDescriptor>, String)> {
        let mut archetype = Archetype::new(self.archetype, self.display_name);
        if let Some(required) = self.required_tasks {
            archetype.required_tasks = required;
        }

        let mut adapters = BTreeMap::new();
        for descriptor in self.adapters {
            let task = descriptor.task;
            if let Some(previous) = adapters.insert(task, descriptor) {
                return Err(MnemeError::InvalidRecord(format!(
                    "manifest for '{}' lists two {} adapters (first: '{}')",
                    archetype.id, task, previous.id
                )));
            }
        }
        Ok((archetype, adapters, self.runtime_target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "archetype": "blacksmith",
        "display_name": "Blacksmith",
        "runtime_target": "gpu-0",
        "adapters": [
            {
                "id": "blacksmith-dialogue",
                "archetype": "blacksmith",
                "task": "dialogue",
                "path": "blacksmith/dialogue",
                "base_model": "base-7b",
                "rank": 16,
                "footprint_bytes": 1024,
                "version": "1.0.0"
            },
            {
                "id": "blacksmith-combat",
                "archetype": "blacksmith",
                "task": "combat",
                "path": "blacksmith/combat",
                "base_model": "base-7b",
                "rank": 16,
                "footprint_bytes": 1024,
                "version": "1.0.0"
            }
        ]
    }"#;

    #[test]
    fn test_manifest_into_parts() {
        let manifest: ChainManifest = serde_json::from_str(MANIFEST).unwrap();
        let (archetype, adapters, target) = manifest.into_parts().unwrap();
        assert_eq!(archetype.id.as_str(), "blacksmith");
        assert_eq!(archetype.required_tasks.len(), Task::ALL.len());
        assert_eq!(adapters.len(), 2);
        assert!(!adapters.contains_key(&Task::Personality));
        assert_eq!(target, "gpu-0");
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let mut manifest: ChainManifest = serde_json::from_str(MANIFEST).unwrap();
        let mut twin = manifest.adapters[0].clone();
        twin.id = crate::archetype::AdapterId::new("blacksmith-dialogue-b").unwrap();
        manifest.adapters.push(twin);
        assert!(matches!(
            manifest.into_parts(),
            Err(MnemeError::InvalidRecord(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("chain.json");
        std::fs::write(&path, MANIFEST).unwrap();
        assert_eq!(ChainManifest::from_file(&path).unwrap().adapters.len(), 2);
        assert!(ChainManifest::from_file(dir.path().join("missing.json")).is_err());
    }
}
