//! Adapter coordinator
//!
//! Decides which archetype chains are resident on the inference runtime and
//! issues load/unload calls against a capacity ceiling.

mod manager;
pub mod runtime;

pub use manager::{AdapterCoordinator, AdapterLease, CoordinatorStats};
pub use runtime::{GenerateRequest, InferenceRuntime, StubRuntime};
