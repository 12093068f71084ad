//! Configuration view and validation commands: `fabtrack config`.

use anyhow::Result;

use super::super::ConfigCommands;
use fabtrack::config::{FabtrackConfig, FabtrackToml};

pub fn cmd_config(config: &FabtrackConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_path();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Fabtrack Configuration");
            println!("======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No fabtrack.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();
            print!("{}", toml::to_string_pretty(&config.toml)?);
            println!();

            // Effective values include env overrides
            println!("Effective values (with env overrides):");
            println!("  port = {}", config.port());
            println!("  db_path = \"{}\"", config.db_path().display());
            println!("  demo_data = {}", config.demo_data());
            println!("  log_json = {}", config.log_json());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No fabtrack.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = FabtrackToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("fabtrack.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !config.config_dir.exists() {
                std::fs::create_dir_all(&config.config_dir)?;
            }

            FabtrackToml::default().save(&config_path)?;

            println!("Created fabtrack.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] port, dev_mode");
            println!("  - [tracker] old_active_job_minutes, session_ttl_minutes");
            println!("  - [bootstrap] admin account and demo_data");
            println!();
        }
    }

    Ok(())
}
