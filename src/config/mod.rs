//! Configuration system for edgeconf
//!
//! `Settings` is the configuration context object: the gateway id, its namespace,
//! and the fetch toggles. It is loaded once, wrapped in an `Arc`, and handed to the
//! fetcher and the IR compiler explicitly. Nothing reads process-wide state after
//! loading.

mod defaults;
pub mod loader;
pub mod paths;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::Settings;

/// Get a configuration value by key
pub fn get_config_value(settings: &Settings, key: &str) -> anyhow::Result<String> {
    match key {
        "ambassadorId" => Ok(settings.ambassador_id.clone()),
        "ambassadorNamespace" => Ok(settings.ambassador_namespace.clone()),
        "singleNamespace" => Ok(settings.single_namespace.to_string()),
        "certsSingleNamespace" => Ok(settings.certs_single_namespace.to_string()),
        "watchOnly" => Ok(settings.watch_only.to_string()),
        "enableEndpoints" => Ok(settings.enable_endpoints.to_string()),
        "logLevel" => Ok(settings.log_level.clone()),
        "podLabelsPath" => Ok(settings
            .pod_labels_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()),
        "podLabels" => serde_yaml::to_string(&settings.pod_labels)
            .map_err(|e| anyhow::anyhow!("Failed to serialize podLabels: {}", e)),
        _ => Err(anyhow::anyhow!("Unknown configuration key: {}", key)),
    }
}

/// Set a configuration value by key
pub fn set_config_value(settings: &mut Settings, key: &str, value: &str) -> anyhow::Result<()> {
    use anyhow::Context;
    match key {
        "ambassadorId" => {
            if value.trim().is_empty() {
                return Err(anyhow::anyhow!("ambassadorId must not be empty"));
            }
            settings.ambassador_id = value.to_string();
        }
        "ambassadorNamespace" => {
            settings.ambassador_namespace = value.to_string();
        }
        "singleNamespace" => {
            settings.single_namespace = value
                .parse()
                .context("singleNamespace must be 'true' or 'false'")?;
        }
        "certsSingleNamespace" => {
            settings.certs_single_namespace = value
                .parse()
                .context("certsSingleNamespace must be 'true' or 'false'")?;
        }
        "watchOnly" => {
            settings.watch_only = value
                .parse()
                .context("watchOnly must be 'true' or 'false'")?;
        }
        "enableEndpoints" => {
            settings.enable_endpoints = value
                .parse()
                .context("enableEndpoints must be 'true' or 'false'")?;
        }
        "logLevel" => {
            settings.log_level = value.to_string();
        }
        "podLabelsPath" => {
            if value.is_empty() {
                settings.pod_labels_path = None;
            } else {
                settings.pod_labels_path = Some(value.into());
            }
        }
        "podLabels" => {
            // Comma-separated key=value pairs
            settings.pod_labels = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|pair| {
                    pair.split_once('=')
                        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                        .ok_or_else(|| anyhow::anyhow!("podLabels entry '{}' is not key=value", pair))
                })
                .collect::<anyhow::Result<_>>()?;
        }
        _ => return Err(anyhow::anyhow!("Unknown configuration key: {}", key)),
    }

    Ok(())
}
