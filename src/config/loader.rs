//! Configuration loading logic
//!
//! Handles loading settings from the built-in defaults, a YAML file, environment
//! overrides and the pod labels file, in that order of increasing precedence.

use super::{defaults, paths, schema::Settings};
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

fn label_matcher() -> &'static Regex {
    static MATCHER: OnceLock<Regex> = OnceLock::new();
    MATCHER.get_or_init(|| {
        Regex::new(r#"^([\w\-_./]+)="(.+)"$"#).expect("pod label pattern is a valid regex")
    })
}

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load settings with all layers applied
    ///
    /// Precedence order (highest to lowest):
    /// 1. Pod labels file (only fills `pod_labels`)
    /// 2. Environment variable overrides
    /// 3. Config file (explicit path, or the root config if it exists)
    /// 4. Built-in defaults
    pub fn load(path: Option<&Path>) -> Result<Settings> {
        let mut settings = match path {
            Some(path) => Self::load_file(path)?,
            None => {
                let root = paths::root_config_path();
                if root.exists() {
                    Self::load_file(&root)?
                } else {
                    Self::load_defaults()
                }
            }
        };

        settings = Self::apply_env_overrides(settings);
        Self::load_pod_labels(&mut settings)?;

        Ok(settings)
    }

    /// Load settings from a file
    pub fn load_file(path: &Path) -> Result<Settings> {
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let settings: Settings = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(settings)
    }

    /// Validate configuration by loading it and checking its values
    pub fn validate(path: Option<&Path>) -> Result<()> {
        let settings = Self::load(path).context("Failed to load configuration")?;

        if settings.ambassador_id.trim().is_empty() {
            return Err(anyhow::anyhow!("ambassadorId must not be empty"));
        }

        if settings.ambassador_namespace.trim().is_empty() {
            return Err(anyhow::anyhow!("ambassadorNamespace must not be empty"));
        }

        tracing_subscriber::EnvFilter::try_new(&settings.log_level)
            .with_context(|| format!("Invalid logLevel: {}", settings.log_level))?;

        Ok(())
    }

    /// Load default settings
    pub fn load_defaults() -> Settings {
        defaults::default_settings()
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(settings: Settings) -> Settings {
        Self::apply_overrides(settings, |key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_overrides(
        mut settings: Settings,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Settings {
        if let Some(id) = lookup("AMBASSADOR_ID") {
            settings.ambassador_id = id;
        }

        if let Some(namespace) = lookup("AMBASSADOR_NAMESPACE") {
            settings.ambassador_namespace = namespace;
        }

        // Flag variables count as set when present at all
        if lookup("AMBASSADOR_SINGLE_NAMESPACE").is_some() {
            settings.single_namespace = true;
        }

        if lookup("AMBASSADOR_CERTS_SINGLE_NAMESPACE").is_some() {
            settings.certs_single_namespace = true;
        }

        if lookup("AMBASSADOR_WATCH_ONLY").is_some() {
            settings.watch_only = true;
        }

        if lookup("AMBASSADOR_DISABLE_ENDPOINTS").is_some() {
            settings.enable_endpoints = false;
        }

        if let Some(level) = lookup("EDGECONF_LOG_LEVEL") {
            settings.log_level = level;
        }

        settings
    }

    /// Read pod labels from `pod_labels_path`, if one is configured
    fn load_pod_labels(settings: &mut Settings) -> Result<()> {
        let Some(path) = settings.pod_labels_path.clone() else {
            return Ok(());
        };

        if !path.is_file() {
            tracing::warn!(
                "Pod labels are not mounted at {}; Kubernetes Ingress support is likely to be limited",
                path.display()
            );
            return Ok(());
        }

        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read pod labels: {}", path.display()))?;

        let labels = Self::parse_pod_labels(&contents);
        tracing::debug!("Parsed pod labels: {:?}", labels);
        settings.pod_labels.extend(labels);

        Ok(())
    }

    /// Parse downward-API `key="value"` lines, dropping anything malformed
    pub fn parse_pod_labels(contents: &str) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();

        for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match label_matcher().captures(line) {
                Some(caps) => {
                    labels.insert(caps[1].to_string(), caps[2].to_string());
                }
                None => tracing::warn!("Dropping pod label {}", line),
            }
        }

        labels
    }

    /// Save settings to a file
    pub fn save(settings: &Settings, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            paths::ensure_dir(parent)?;
        }

        let yaml =
            serde_yaml::to_string(settings).context("Failed to serialize configuration to YAML")?;

        std::fs::write(path, yaml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Save root configuration
    pub fn save_root(settings: &Settings) -> Result<()> {
        Self::save(settings, &paths::root_config_path())
    }
}
