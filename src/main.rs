//! edgeconf - gateway configuration reconciliation
//!
//! Reads gateway resources from files or a cluster snapshot, compiles them
//! into the gateway IR, and reports on the result.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use edgeconf::cli::{self, ConfigSubcommand, InputArgs};
use edgeconf::config::ConfigLoader;

/// edgeconf - configuration reconciliation for an Envoy-based API gateway
#[derive(Parser, Debug)]
#[command(name = "edgeconf")]
#[command(about = "Fetch, compile and check API gateway configuration", long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(long, short = 'd', global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

/// Main commands
#[derive(Subcommand, Debug)]
enum Command {
    /// Compile inputs and print the diagnostic overview
    Compile(InputArgs),
    /// Reconstitute the overview from per-source fragments and diff it
    Paranoia(InputArgs),
    /// Print the normalized resource records
    Resources(InputArgs),
    /// Configuration management
    Config {
        /// Settings file to use instead of the root config
        #[arg(long)]
        config: Option<PathBuf>,

        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
    /// Show version information
    Version,
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Config { config, subcommand } => cli::handle_config_command(subcommand, config),
        Command::Version => {
            cli::display_version();
            Ok(())
        }
        Command::Compile(input) => {
            start_logging(args.debug, &input);
            cli::handle_compile(&input)
        }
        Command::Paranoia(input) => {
            start_logging(args.debug, &input);
            cli::handle_paranoia(&input)
        }
        Command::Resources(input) => {
            start_logging(args.debug, &input);
            cli::handle_resources(&input)
        }
    }
}

fn start_logging(debug: bool, input: &InputArgs) {
    let level = ConfigLoader::load(input.config.as_deref())
        .map(|settings| settings.log_level)
        .unwrap_or_else(|_| "warn".to_string());

    if let Some(log_path) = cli::init_logging(debug, &level) {
        eprintln!(
            "Debug logging enabled. Logs written to: {}",
            log_path.display()
        );
    }

    if debug {
        tracing::debug!("Debug logging enabled");
    }
}
