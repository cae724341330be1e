//! Companion Link service
//!
//! Operator tool for the host's configuration and associated devices.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use companion_service::config::{default_config_path, Config};
use companion_service::devices::{AssociatedDevice, DeviceStorage, JsonDeviceStore};
use companion_service::logging;
use uuid::Uuid;

/// Companion Link service - secure connections to companion devices.
#[derive(Parser, Debug)]
#[command(name = "companiond")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Manage associated devices
    #[command(subcommand)]
    Devices(DevicesCommands),

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for device management.
#[derive(Subcommand, Debug, Clone)]
pub enum DevicesCommands {
    /// List associated devices
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Forget an associated device and its challenge secret
    Remove {
        /// Device ID to remove
        device_id: String,
    },

    /// Allow automatic reconnection to a device
    Enable {
        /// Device ID to enable
        device_id: String,
    },

    /// Stop automatic reconnection to a device
    Disable {
        /// Device ID to disable
        device_id: String,
    },
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write a default configuration file with a fresh host id
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();
    config.validate()?;

    logging::init(cli.verbose, &config.service.log_level);
    tracing::debug!(path = %config_path.display(), "Configuration loaded");

    match cli.command {
        Commands::Devices(cmd) => {
            let store_path = config.device_store_path();
            let store = JsonDeviceStore::open(&store_path)?;

            match cmd {
                DevicesCommands::List { json } => {
                    let devices = store.associated_devices()?;
                    if json {
                        let output = serde_json::to_string_pretty(&devices)
                            .context("Failed to serialize device list")?;
                        println!("{}", output);
                    } else {
                        print_devices_table(&devices, config.users.driver_user_id);
                    }
                }
                DevicesCommands::Remove { device_id } => {
                    let id = parse_device_id(&device_id)?;
                    match store.remove_associated_device(&id)? {
                        Some(_) => println!("Device {} has been removed", id),
                        None => anyhow::bail!("Device {} is not associated", id),
                    }
                }
                DevicesCommands::Enable { device_id } => {
                    let id = parse_device_id(&device_id)?;
                    store.set_connection_enabled(&id, true)?;
                    println!("Automatic connection enabled for {}", id);
                }
                DevicesCommands::Disable { device_id } => {
                    let id = parse_device_id(&device_id)?;
                    store.set_connection_enabled(&id, false)?;
                    println!("Automatic connection disabled for {}", id);
                }
            }
        }
        Commands::Config(cmd) => match cmd {
            ConfigCommands::Show => {
                print!("{}", config.to_toml()?);
            }
            ConfigCommands::Init { force } => {
                if config_path.exists() && !force {
                    anyhow::bail!(
                        "Config file already exists: {} (use --force to overwrite)",
                        config_path.display()
                    );
                }
                let mut fresh = Config::default();
                let host_id = fresh.ensure_host_id();
                fresh.save(&config_path)?;
                println!("Wrote {} (host id {})", config_path.display(), host_id);
            }
        },
    }

    Ok(())
}

/// Parse a device ID given on the command line.
fn parse_device_id(input: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(input.trim()).with_context(|| format!("Invalid device ID: {}", input))
}

fn print_devices_table(devices: &[AssociatedDevice], driver_user_id: i32) {
    if devices.is_empty() {
        println!("No associated devices.");
        return;
    }

    println!(
        "{:<36}  {:<20}  {:<9}  {:<8}",
        "DEVICE ID", "NAME", "ROLE", "AUTO"
    );
    for device in devices {
        let role = if device.user_id == driver_user_id {
            "driver"
        } else {
            "passenger"
        };
        let auto = if device.connection_enabled { "on" } else { "off" };
        println!(
            "{:<36}  {:<20}  {:<9}  {:<8}",
            device.id,
            truncate_str(&device.name, 20),
            role,
            auto
        );
    }
}

/// Truncate a string to at most `max_len` characters, appending "..." if cut.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
