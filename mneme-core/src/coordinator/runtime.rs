//! Inference runtime boundary
//!
//! The generative runtime is an external collaborator. The coordinator is the
//! only component that calls `load_adapter`/`unload_adapter`; the turn
//! pipeline calls `generate`.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::archetype::{AdapterDescriptor, AdapterId, ArchetypeId, Task};
use crate::error::{MnemeError, Result};

/// One generation call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Archetype whose adapters should be applied
    pub archetype: ArchetypeId,
    /// Task slot to generate for
    pub task: Task,
    /// Counterpart input for this turn
    pub prompt: String,
    /// Rendered memory card
    pub memory_card: String,
}

/// Generative runtime serving adapters on a shared base model
#[async_trait]
pub trait InferenceRuntime: Send + Sync {
    /// Make an adapter resident on the accelerator
    async fn load_adapter(&self, descriptor: &AdapterDescriptor) -> Result<()>;

    /// Release an adapter
    async fn unload_adapter(&self, id: &AdapterId) -> Result<()>;

    /// Produce a response using the archetype's adapter for the task
    async fn generate(&self, request: GenerateRequest) -> Result<String>;
}

#[derive(Debug, Default)]
struct StubState {
    resident: HashMap<AdapterId, AdapterDescriptor>,
    resident_bytes: u64,
    peak_resident_bytes: u64,
    failing: HashSet<AdapterId>,
}

/// Deterministic in-process runtime.
///
/// Tracks which adapters are resident and how many bytes they occupy, and
/// refuses to generate for an archetype whose adapter is not loaded.
#[derive(Debug, Default)]
pub struct StubRuntime {
    state: Mutex<StubState>,
    load_delay: Duration,
    generate_delay: Duration,
    load_calls: AtomicUsize,
    unload_calls: AtomicUsize,
    generate_calls: AtomicUsize,
}

impl StubRuntime {
    /// Create a runtime with no simulated latency
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate slow adapter loads
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Simulate generation latency
    pub fn with_generate_delay(mut self, delay: Duration) -> Self {
        self.generate_delay = delay;
        self
    }

    /// Make every subsequent load of `id` fail
    pub fn fail_loads_of(&self, id: AdapterId) {
        self.state.lock().failing.insert(id);
    }

    /// Let every load succeed again
    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    /// Number of `load_adapter` calls
    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    /// Number of `unload_adapter` calls
    pub fn unload_calls(&self) -> usize {
        self.unload_calls.load(Ordering::SeqCst)
    }

    /// Number of `generate` calls
    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    /// Bytes currently resident
    pub fn resident_bytes(&self) -> u64 {
        self.state.lock().resident_bytes
    }

    /// Highest resident byte count observed
    pub fn peak_resident_bytes(&self) -> u64 {
        self.state.lock().peak_resident_bytes
    }

    /// Whether an adapter is resident
    pub fn is_resident(&self, id: &AdapterId) -> bool {
        self.state.lock().resident.contains_key(id)
    }
}

#[async_trait]
impl InferenceRuntime for StubRuntime {
    async fn load_adapter(&self, descriptor: &AdapterDescriptor) -> Result<()> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }

        let mut state = self.state.lock();
        if state.failing.contains(&descriptor.id) {
            return Err(MnemeError::Other(format!(
                "runtime rejected adapter '{}'",
                descriptor.id
            )));
        }
        if state
            .resident
            .insert(descriptor.id.clone(), descriptor.clone())
            .is_none()
        {
            state.resident_bytes += descriptor.footprint_bytes;
            state.peak_resident_bytes = state.peak_resident_bytes.max(state.resident_bytes);
        }
        Ok(())
    }

    async fn unload_adapter(&self, id: &AdapterId) -> Result<()> {
        self.unload_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if let Some(descriptor) = state.resident.remove(id) {
            state.resident_bytes -= descriptor.footprint_bytes;
        }
        Ok(())
    }

    async fn generate(&self, request: GenerateRequest) -> Result<String> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        if !self.generate_delay.is_zero() {
            tokio::time::sleep(self.generate_delay).await;
        }

        let loaded = self
            .state
            .lock()
            .resident
            .values()
            .any(|d| d.archetype == request.archetype && d.task == request.task);
        if !loaded {
            return Err(MnemeError::Other(format!(
                "no {} adapter resident for archetype '{}'",
                request.task, request.archetype
            )));
        }

        Ok(format!(
            "[{}/{}] responding to \"{}\"",
            request.archetype, request.task, request.prompt
        ))
    }
}
