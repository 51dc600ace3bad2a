//! # Mneme - Archetype Adapters and Tiered Memory for NPCs
//!
//! Mneme keeps large populations of simulated characters running on a
//! shared base model:
//! - An archetype registry of versioned adapter chains, persisted atomically
//! - A coordinator that keeps chains resident under a memory ceiling (LRU)
//! - Hot, warm and cold memory tiers for conversations and relationships
//! - A turn pipeline tying them together, plus a load-test harness
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mneme_core::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = MnemeConfig::load()?;
//!     let system = MnemeSystem::start(config, Arc::new(StubRuntime::new())).await?;
//!
//!     let request = TurnRequest::new(
//!         "smith-1",
//!         "player-7",
//!         "blacksmith".parse()?,
//!         Task::Dialogue,
//!         1,
//!         "Can you mend this blade?",
//!     );
//!     let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
//!     let reply = system.pipeline().respond(request, deadline).await?;
//!     println!("{}", reply.output);
//!
//!     system.shutdown().await
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `cold-surrealdb` (default): embedded SurrealDB backend for the cold tier

pub mod archetype;
pub mod archive;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod eval;
pub mod health;
pub mod memory;
pub mod pipeline;
pub mod resilience;
pub mod singleflight;
pub mod system;

pub use error::{MnemeError, Result};
pub use system::MnemeSystem;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::archetype::{
        AdapterDescriptor, AdapterId, Archetype, ArchetypeChain, ArchetypeId, ArchetypeRegistry,
        ChainManifest, MemoryStats, Task,
    };
    pub use crate::archive::{ColdStore, ColdTierArchiver, InMemoryColdStore};
    pub use crate::config::MnemeConfig;
    pub use crate::coordinator::{AdapterCoordinator, AdapterLease, InferenceRuntime, StubRuntime};
    pub use crate::error::{MnemeError, Result};
    pub use crate::eval::{EvalHarness, ScenarioGates, ScenarioReport};
    pub use crate::health::{HealthReport, HealthStatus};
    pub use crate::memory::{
        ArchiveRecord, ConversationTurn, HotTier, MemoryCard, RelationshipSnapshot,
        SalientMemory, SessionSummary, WarmTierManager,
    };
    pub use crate::pipeline::{TurnPipeline, TurnRequest, TurnResponse};
    pub use crate::system::{MnemeSystem, SystemParts};
}
