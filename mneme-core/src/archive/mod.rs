//! Cold tier: durable archive and the batched archiver feeding it

pub mod archiver;
pub mod store;
#[cfg(feature = "cold-surrealdb")]
pub mod surreal;

pub use archiver::{ArchiverStats, ColdTierArchiver, DeadLetter};
pub use store::{ColdStore, InMemoryColdStore};
#[cfg(feature = "cold-surrealdb")]
pub use surreal::SurrealColdStore;
