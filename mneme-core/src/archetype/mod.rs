//! Archetype chain registry
//!
//! Types describing archetypes and their adapters, chain manifests, the
//! adapter root containment check, durable snapshots, and the registry.

pub mod manifest;
pub mod path;
pub mod registry;
pub mod snapshot;
pub mod types;

pub use manifest::ChainManifest;
pub use path::AdapterRoot;
pub use registry::{ArchetypeRegistry, MemoryStats, RegistryStats};
pub use snapshot::{FileSnapshotStore, RegistrySnapshot, SnapshotStore, SNAPSHOT_FORMAT_VERSION};
pub use types::{AdapterDescriptor, AdapterId, Archetype, ArchetypeChain, ArchetypeId, Task};
