//! CLI command handlers

use anyhow::{Context, Result};
use clap::Subcommand;
use std::path::PathBuf;

use crate::config::{paths, ConfigLoader};

/// Configuration management subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigSubcommand {
    /// Get configuration value
    Get {
        /// Configuration key (e.g., "ambassadorId", "enableEndpoints")
        key: Option<String>,
    },
    /// Set configuration value
    Set {
        /// Configuration key (e.g., "ambassadorId", "enableEndpoints")
        key: String,
        /// Configuration value
        value: String,
    },
    /// List all configuration
    List,
    /// Show configuration file path
    Path,
    /// Validate configuration
    Validate,
}

/// Handle configuration subcommands
pub fn handle_config_command(cmd: ConfigSubcommand, config: Option<PathBuf>) -> Result<()> {
    let config = config.as_deref();

    match cmd {
        ConfigSubcommand::Get { key } => {
            let settings = ConfigLoader::load(config).context("Failed to load configuration")?;

            if let Some(key) = key {
                let value = crate::config::get_config_value(&settings, &key)?;
                println!("{}", value);
            } else {
                let yaml = serde_yaml::to_string(&settings)
                    .context("Failed to serialize configuration")?;
                print!("{}", yaml);
            }
        }
        ConfigSubcommand::Set { key, value } => {
            let mut settings = ConfigLoader::load(config)
                .unwrap_or_else(|_| ConfigLoader::load_defaults());

            crate::config::set_config_value(&mut settings, &key, &value)
                .with_context(|| format!("Failed to set {} = {}", key, value))?;

            match config {
                Some(path) => {
                    ConfigLoader::save(&settings, &path.to_path_buf())
                        .context("Failed to save configuration")?;
                    println!("Configuration saved to {}", path.display());
                }
                None => {
                    ConfigLoader::save_root(&settings).context("Failed to save configuration")?;
                    println!("Configuration saved");
                }
            }
        }
        ConfigSubcommand::List => {
            let settings = ConfigLoader::load(config).context("Failed to load configuration")?;

            let yaml =
                serde_yaml::to_string(&settings).context("Failed to serialize configuration")?;
            print!("{}", yaml);
        }
        ConfigSubcommand::Path => {
            let config_path = config
                .map(|p| p.to_path_buf())
                .unwrap_or_else(paths::root_config_path);
            println!("{}", config_path.display());
        }
        ConfigSubcommand::Validate => match ConfigLoader::validate(config) {
            Ok(()) => {
                println!("Configuration is valid");
            }
            Err(e) => {
                eprintln!("Configuration validation failed: {:#}", e);
                std::process::exit(1);
            }
        },
    }

    Ok(())
}
