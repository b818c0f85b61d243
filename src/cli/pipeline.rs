//! Fetch, compile and diagnose handlers

use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{ConfigLoader, Settings};
use crate::diag::{self, ErrorLog};
use crate::fetch::ResourceFetcher;
use crate::ir::{Ir, ResourceStore};

/// Where configuration is read from
#[derive(Args, Debug, Clone)]
pub struct InputArgs {
    /// YAML file or directory, or a snapshot JSON file with --watt
    pub path: PathBuf,

    /// Inputs are Kubernetes objects rather than bare gateway resources
    #[arg(long)]
    pub k8s: bool,

    /// Descend into subdirectories
    #[arg(long)]
    pub recurse: bool,

    /// Input is a snapshot payload
    #[arg(long)]
    pub watt: bool,

    /// Settings file to use instead of the root config
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Write output here instead of stdout
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,
}

pub fn load_settings(config: Option<&Path>) -> Result<Arc<Settings>> {
    let settings = ConfigLoader::load(config).context("Failed to load configuration")?;
    tracing::debug!(
        "settings: ambassadorId={}, namespace={}",
        settings.ambassador_id,
        settings.ambassador_namespace
    );
    Ok(Arc::new(settings))
}

/// Run one fetch cycle over `input`
pub fn fetch(input: &InputArgs, settings: Arc<Settings>) -> Result<ResourceFetcher> {
    let mut fetcher = ResourceFetcher::new(settings)?;

    if input.watt {
        let snapshot = std::fs::read_to_string(&input.path)
            .with_context(|| format!("Failed to read snapshot {}", input.path.display()))?;
        fetcher.parse_watt(&snapshot, true);
    } else {
        fetcher.load_from_filesystem(&input.path, input.recurse, input.k8s, true)?;
    }

    tracing::info!(
        "fetched {} resources from {}",
        fetcher.elements().len(),
        input.path.display()
    );
    Ok(fetcher)
}

/// Compile what `fetcher` found, carrying its errors forward
pub fn compile(fetcher: &ResourceFetcher, settings: Arc<Settings>) -> Ir {
    let mut log = ErrorLog::new();
    log.absorb(fetcher.errors());

    let store = ResourceStore::load(fetcher.elements(), settings.clone(), &mut log);
    Ir::compile(store, settings, log)
}

fn write_output(output: Option<&Path>, text: &str) -> Result<()> {
    match output {
        Some(path) => std::fs::write(path, text)
            .with_context(|| format!("Failed to write {}", path.display())),
        None => {
            print!("{}", text);
            Ok(())
        }
    }
}

fn print_errors(log: &ErrorLog) {
    for (rkey, errors) in log.errors() {
        for error in errors {
            eprintln!("{}: {}", rkey, error.text);
        }
    }
}

pub fn handle_compile(input: &InputArgs) -> Result<()> {
    let settings = load_settings(input.config.as_deref())?;
    let fetcher = fetch(input, settings.clone())?;
    let ir = compile(&fetcher, settings);

    let overview = serde_json::to_string_pretty(&ir.overview())
        .context("Failed to serialize overview")?;
    write_output(input.output.as_deref(), &format!("{}\n", overview))?;
    print_errors(ir.errors());

    Ok(())
}

/// Exits 1 if the check finds errors
pub fn handle_paranoia(input: &InputArgs) -> Result<()> {
    let settings = load_settings(input.config.as_deref())?;
    let fetcher = fetch(input, settings.clone())?;
    let ir = compile(&fetcher, settings);

    let report = diag::paranoia_check(&ir);

    if let Some(output) = input.output.as_deref() {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
        write_output(Some(output), &json)?;
    }

    for warning in &report.warnings {
        println!("WARNING: {}", warning);
    }
    for error in &report.errors {
        println!("ERROR: {}", error);
    }

    if !report.is_ok() {
        std::process::exit(1);
    }
    Ok(())
}

pub fn handle_resources(input: &InputArgs) -> Result<()> {
    let settings = load_settings(input.config.as_deref())?;
    let fetcher = fetch(input, settings)?;

    let yaml =
        serde_yaml::to_string(&fetcher.sorted()).context("Failed to serialize resources")?;
    write_output(input.output.as_deref(), &yaml)?;
    print_errors(fetcher.errors());

    Ok(())
}
