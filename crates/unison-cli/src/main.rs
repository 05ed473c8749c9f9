//! Command-line runner for Unison.

mod settings;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use clap::{Parser, Subcommand};
use unison_core::config::{defaults, env_flag, env_vars};
use unison_devices::{DevicesManager, DriverDefinition, DriverRecord};
use unison_storage::{Store, YamlDirectory};

use crate::settings::Settings;

/// Unison - one attribute model over HTTP, MQTT, Modbus-TCP and BACnet devices.
#[derive(Parser, Debug)]
#[command(name = "unison")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the configuration, start discovery and polling, run until Ctrl-C.
    Run {
        /// Settings file (defaults to ./unison.yaml when present).
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Normalize every driver file in a directory and report errors.
    Validate {
        /// Directory of driver YAML files.
        #[arg(required = true)]
        dir: PathBuf,
    },
    /// Run one polling cycle on a device and print its attributes as JSON.
    Read {
        /// Settings file (defaults to ./unison.yaml when present).
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Device id.
        #[arg(short, long)]
        device: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    match args.command {
        Command::Run { config } => run(config.as_deref()).await,
        Command::Validate { dir } => validate(&dir).await,
        Command::Read { config, device } => read(config.as_deref(), &device).await,
    }
}

fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_env(env_vars::RUST_LOG)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(defaults::LOG_FILTER));

    if env_flag(env_vars::LOG_JSON) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }
}

/// Open the store described by `settings` and load it into a new manager.
async fn load(settings: &Settings) -> Result<(Store, Arc<DevicesManager>)> {
    let store = Store::open_dirs(
        &settings.transports_dir(),
        &settings.drivers_dir(),
        &settings.devices_dir(),
    )
    .await
    .context("Failed to open configuration store")?;

    let manager = DevicesManager::new();
    let report = store
        .bootstrap(&manager)
        .await
        .context("Failed to load configuration")?;
    for failure in &report.failures {
        eprintln!("skipped {} '{}': {}", failure.kind, failure.id, failure.error);
    }
    Ok((store, manager))
}

async fn run(config: Option<&Path>) -> Result<()> {
    let settings = Settings::load(config)?;
    tracing::info!(data_dir = %settings.data_dir.display(), "Starting unison");
    let (store, manager) = load(&settings).await?;

    let discovery = manager.discovery_manager();
    for entry in &settings.discovery {
        discovery
            .register(&entry.driver, &entry.transport)
            .await
            .with_context(|| {
                format!(
                    "Failed to register discovery of '{}' on '{}'",
                    entry.driver, entry.transport
                )
            })?;
    }

    if settings.polling {
        manager.start_polling().await?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");

    if settings.persist_discovered {
        if let Err(e) = store.persist_new_devices(&manager).await {
            tracing::warn!(error = %e, "Failed to persist discovered devices");
        }
    }
    manager.shutdown().await;
    Ok(())
}

async fn validate(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Err(anyhow!("{} is not a directory", dir.display()));
    }
    let repo = YamlDirectory::<DriverRecord>::open(dir).await?;
    let files = repo.load_each().await?;

    let mut failed = 0;
    for (path, record) in &files {
        let outcome = match record {
            Ok(record) => DriverDefinition::from_record(record.clone()).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match outcome {
            Ok(driver) => println!(
                "ok    {} ({}, {} attributes{})",
                path.display(),
                driver.id,
                driver.attributes.len(),
                if driver.discovery.is_some() { ", discovery" } else { "" }
            ),
            Err(e) => {
                failed += 1;
                println!("FAIL  {}: {e}", path.display());
            }
        }
    }

    println!("\n{} driver file(s), {} failed", files.len(), failed);
    if failed > 0 {
        return Err(anyhow!("{failed} driver file(s) failed validation"));
    }
    Ok(())
}

async fn read(config: Option<&Path>, device_id: &str) -> Result<()> {
    let settings = Settings::load(config)?;
    let (_store, manager) = load(&settings).await?;

    let outcome = print_device(&manager, device_id).await;
    manager.shutdown().await;
    outcome
}

async fn print_device(manager: &DevicesManager, device_id: &str) -> Result<()> {
    let report = manager.update_device(device_id).await?;
    for failure in &report.failures {
        eprintln!("{}: {}", failure.attribute, failure.error);
    }
    let device = manager
        .device(device_id)
        .ok_or_else(|| anyhow!("device '{device_id}' disappeared"))?;
    println!("{}", serde_json::to_string_pretty(&device.snapshot())?);
    Ok(())
}
