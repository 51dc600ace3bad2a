//! Configuration types for Mneme

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{MnemeError, Result};
use crate::eval::ScenarioGates;
use crate::resilience::RetryConfig;

/// One gibibyte, the unit adapter footprints are usually quoted in
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Main configuration for a Mneme deployment
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MnemeConfig {
    /// Archetype chain registry configuration
    pub registry: RegistryConfig,

    /// Adapter coordinator configuration
    pub coordinator: CoordinatorConfig,

    /// Hot (in-process) tier configuration
    pub hot: HotTierConfig,

    /// Warm (shared cache) tier configuration
    pub warm: WarmTierConfig,

    /// Cold (durable archive) tier configuration
    pub cold: ColdTierConfig,

    /// Evaluation harness configuration
    pub eval: EvalConfig,
}

/// Archetype chain registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Durable snapshot file
    pub snapshot_path: PathBuf,

    /// Approved root every adapter path must resolve under
    pub adapter_root: PathBuf,

    /// Staleness bound for cached chains
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,

    /// How long operations wait for the startup snapshot load
    #[serde(with = "humantime_serde")]
    pub init_timeout: Duration,

    /// Whether this instance owns the snapshot file (one writer per deployment)
    pub writer: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from("./data/registry/chains.json"),
            adapter_root: PathBuf::from("./data/adapters"),
            cache_ttl: Duration::from_secs(5),
            init_timeout: Duration::from_secs(10),
            writer: true,
        }
    }
}

/// Adapter coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Ceiling on the summed footprint of resident archetype chains
    pub ceiling_bytes: u64,

    /// Deadline applied when the caller does not supply one
    #[serde(with = "humantime_serde")]
    pub default_deadline: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            ceiling_bytes: 15 * GIB,
            default_deadline: Duration::from_secs(5),
        }
    }
}

/// Hot tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotTierConfig {
    /// Ring buffer length per agent
    pub max_turns: usize,

    /// Idle time after which an agent's window is dropped
    #[serde(with = "humantime_serde")]
    pub idle_ttl: Duration,

    /// Period of the expiry sweep
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for HotTierConfig {
    fn default() -> Self {
        Self {
            max_turns: 20,
            idle_ttl: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Warm tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmTierConfig {
    /// Expiry attached to every warm write
    #[serde(with = "humantime_serde")]
    pub retention: Duration,

    /// Namespace prefix for every key
    pub key_prefix: String,

    /// Recent turns kept per agent
    pub max_recent_turns: usize,

    /// Consecutive store failures before reads bypass the warm tier
    pub breaker_failure_threshold: usize,

    /// How long the bypass lasts before the store is probed again
    #[serde(with = "humantime_serde")]
    pub breaker_reset_timeout: Duration,
}

impl Default for WarmTierConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(21 * 24 * 60 * 60),
            key_prefix: "mneme".to_string(),
            max_recent_turns: 50,
            breaker_failure_threshold: 5,
            breaker_reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Cold tier backend selection
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ColdBackend {
    /// Process-local store, for tests and single-node demos
    #[default]
    Memory,

    /// Embedded SurrealDB
    Surreal {
        /// SurrealDB namespace
        namespace: String,
        /// SurrealDB database
        database: String,
    },
}

/// Cold tier archiver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColdTierConfig {
    /// Durable store backend
    pub backend: ColdBackend,

    /// Bound on records waiting to be archived
    pub queue_capacity: usize,

    /// Records written per batch
    pub batch_size: usize,

    /// Time trigger for partial batches
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Backoff policy for failed batches
    pub retry: RetryConfig,

    /// Dead letters retained for inspection
    pub dead_letter_limit: usize,
}

impl Default for ColdTierConfig {
    fn default() -> Self {
        Self {
            backend: ColdBackend::Memory,
            queue_capacity: 10_000,
            batch_size: 256,
            flush_interval: Duration::from_secs(2),
            retry: RetryConfig::default(),
            dead_letter_limit: 1_000,
        }
    }
}

/// Evaluation harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Acceptance gates
    pub gates: ScenarioGates,

    /// Turns each simulated agent takes
    pub turns_per_agent: usize,

    /// Maximum agents in flight at once
    pub concurrency: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            gates: ScenarioGates::default(),
            turns_per_agent: 3,
            concurrency: 64,
        }
    }
}

impl MnemeConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. Configuration file (mneme.toml or path from MNEME_CONFIG_PATH)
    /// 3. Environment variable overrides (`MNEME_COLD__BATCH_SIZE=64`)
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file is invalid or fails validation.
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(MnemeConfig::default()))
            .merge(Toml::file("mneme.toml"));

        if let Ok(path) = std::env::var("MNEME_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: MnemeConfig = figment
            .merge(Env::prefixed("MNEME_").split("__"))
            .extract()
            .map_err(|e| MnemeError::Configuration(format!("Failed to load configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let config: MnemeConfig = Figment::from(Serialized::defaults(MnemeConfig::default()))
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| {
                MnemeError::Configuration(format!("Failed to load configuration file: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.coordinator.ceiling_bytes == 0 {
            return Err(MnemeError::Configuration(
                "coordinator.ceiling_bytes must be positive".to_string(),
            ));
        }
        if self.hot.max_turns == 0 {
            return Err(MnemeError::Configuration(
                "hot.max_turns must be positive".to_string(),
            ));
        }
        if self.warm.max_recent_turns == 0 {
            return Err(MnemeError::Configuration(
                "warm.max_recent_turns must be positive".to_string(),
            ));
        }
        if self.cold.queue_capacity == 0 || self.cold.batch_size == 0 {
            return Err(MnemeError::Configuration(
                "cold.queue_capacity and cold.batch_size must be positive".to_string(),
            ));
        }
        // Records must reach the cold tier before they age out of the warm tier.
        if self.warm.retention <= self.cold.flush_interval {
            return Err(MnemeError::Configuration(format!(
                "warm.retention ({:?}) must exceed cold.flush_interval ({:?})",
                self.warm.retention, self.cold.flush_interval
            )));
        }
        self.eval.gates.validate()?;
        Ok(())
    }
}
