//! Mneme CLI - registry administration and scenario runs

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use mneme_core::archetype::{ArchetypeId, ArchetypeRegistry, ChainManifest};
use mneme_core::config::MnemeConfig;
use mneme_core::coordinator::StubRuntime;
use mneme_core::error::MnemeError;
use mneme_core::eval::{EvalHarness, synthetic_adapters, synthetic_archetype};
use mneme_core::system::MnemeSystem;

#[derive(Parser)]
#[command(name = "mneme")]
#[command(about = "Archetype adapter registry and NPC memory tiers", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./mneme.toml plus MNEME_* overrides)
    #[arg(short, long, global = true, env = "MNEME_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archetype registry commands
    Registry {
        #[command(subcommand)]
        command: RegistryCommands,
    },
    /// Run a load scenario against the stub runtime
    Eval {
        /// Archetype to drive
        #[arg(short, long)]
        archetype: String,
        /// Simulated agents
        #[arg(short = 'n', long, default_value_t = 500)]
        agents: usize,
        /// Turns per agent (overrides eval.turns_per_agent)
        #[arg(long)]
        turns: Option<usize>,
        /// Per-adapter footprint in bytes for the synthetic chain
        #[arg(long, default_value_t = 64 * 1024 * 1024)]
        footprint: u64,
        /// Simulated generation latency in milliseconds
        #[arg(long, default_value_t = 0)]
        latency_ms: u64,
    },
    /// Print a health report for a freshly started system
    Health,
    /// Version information
    Version,
}

#[derive(Subcommand)]
enum RegistryCommands {
    /// Register a chain from a JSON manifest
    Register {
        /// Manifest path
        manifest: PathBuf,
    },
    /// Print the chain registered for an archetype
    Resolve {
        /// Archetype ID
        archetype: String,
    },
    /// List registered archetypes
    List,
    /// Registry counters and aggregate chain size
    Stats,
}

fn load_config(path: Option<&PathBuf>) -> Result<MnemeConfig> {
    let config = match path {
        Some(path) => MnemeConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MnemeConfig::load()?,
    };
    Ok(config)
}

fn deadline(config: &MnemeConfig) -> Instant {
    Instant::now() + config.coordinator.default_deadline
}

async fn registry_command(config: MnemeConfig, command: RegistryCommands) -> Result<()> {
    let registry = ArchetypeRegistry::open(config.registry.clone()).await?;

    match command {
        RegistryCommands::Register { manifest } => {
            let manifest = ChainManifest::from_file(&manifest)
                .with_context(|| format!("reading manifest {}", manifest.display()))?;
            let (archetype, adapters, runtime_target) = manifest.into_parts()?;
            let chain = registry.register(archetype, adapters, runtime_target).await?;
            info!(archetype = %chain.id(), adapters = chain.adapters.len(), "Chain registered");
            println!("{}", serde_json::to_string_pretty(&chain)?);
        }
        RegistryCommands::Resolve { archetype } => {
            let id: ArchetypeId = archetype.parse()?;
            let chain = registry.resolve(&id, deadline(&config)).await?;
            println!("{}", serde_json::to_string_pretty(&chain)?);
        }
        RegistryCommands::List => {
            for id in registry.archetypes() {
                println!("{}", id);
            }
        }
        RegistryCommands::Stats => {
            let report = serde_json::json!({
                "registry": registry.stats(),
                "chains": registry.memory_stats(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

/// Returns whether every gate passed
async fn eval_command(
    mut config: MnemeConfig,
    archetype: String,
    agents: usize,
    turns: Option<usize>,
    footprint: u64,
    latency_ms: u64,
) -> Result<bool> {
    if let Some(turns) = turns {
        config.eval.turns_per_agent = turns;
    }
    let runtime = StubRuntime::new().with_generate_delay(Duration::from_millis(latency_ms));
    let system = MnemeSystem::start(config.clone(), Arc::new(runtime)).await?;

    let id: ArchetypeId = archetype.parse()?;
    match system.registry().resolve(&id, deadline(&config)).await {
        Ok(_) => {}
        Err(MnemeError::NotFound(_)) => {
            info!(archetype = %id, footprint, "Registering synthetic chain");
            system
                .registry()
                .register(
                    synthetic_archetype(&id),
                    synthetic_adapters(&id, footprint)?,
                    "stub",
                )
                .await?;
        }
        Err(e) => return Err(e.into()),
    }

    let harness = EvalHarness::new(system.pipeline().clone(), config.eval.clone());
    let report = harness.run_scenario(&id, agents).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    for failure in &report.failed_gates {
        eprintln!("gate failed: {}", failure);
    }

    system.shutdown().await?;
    Ok(report.passed)
}

async fn health_command(config: MnemeConfig) -> Result<()> {
    let system = MnemeSystem::start(config, Arc::new(StubRuntime::new())).await?;
    println!("{}", system.health().to_json()?);
    system.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("mneme {}", env!("CARGO_PKG_VERSION"));
            println!("mneme-core {}", mneme_core::VERSION);
        }
        Commands::Registry { command } => {
            registry_command(load_config(cli.config.as_ref())?, command).await?;
        }
        Commands::Eval {
            archetype,
            agents,
            turns,
            footprint,
            latency_ms,
        } => {
            let config = load_config(cli.config.as_ref())?;
            if !eval_command(config, archetype, agents, turns, footprint, latency_ms).await? {
                bail!("scenario failed its gates");
            }
        }
        Commands::Health => {
            health_command(load_config(cli.config.as_ref())?).await?;
        }
    }

    Ok(())
}
