//! Configuration schema definitions
//!
//! Defines the gateway identity settings that every processor and the IR
//! compiler receive explicitly.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Gateway identity and fetch behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Id of this gateway instance; resources for other ids are ignored
    #[serde(default = "default_ambassador_id")]
    pub ambassador_id: String,

    /// Namespace the gateway runs in
    #[serde(default = "default_namespace")]
    pub ambassador_namespace: String,

    /// Only watch the gateway's own namespace
    #[serde(default = "default_false")]
    pub single_namespace: bool,

    /// Only accept TLS secrets from the gateway's own namespace
    #[serde(default = "default_false")]
    pub certs_single_namespace: bool,

    /// Skip endpoint resolution for Services
    #[serde(default = "default_false")]
    pub watch_only: bool,

    /// Allow endpoint routing for load balancers that need it
    #[serde(default = "default_true")]
    pub enable_endpoints: bool,

    /// Labels of the gateway's own pod, used to recognize its Service
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_labels: BTreeMap<String, String>,

    /// Downward-API labels file to read pod labels from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_labels_path: Option<PathBuf>,

    /// Log level used when debug logging is off
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default value functions
fn default_ambassador_id() -> String {
    "default".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ambassador_id: default_ambassador_id(),
            ambassador_namespace: default_namespace(),
            single_namespace: default_false(),
            certs_single_namespace: default_false(),
            watch_only: default_false(),
            enable_endpoints: default_true(),
            pod_labels: BTreeMap::new(),
            pod_labels_path: None,
            log_level: default_log_level(),
        }
    }
}

impl Settings {
    /// Settings for a named gateway in a namespace, everything else default
    pub fn for_gateway(ambassador_id: &str, namespace: &str) -> Self {
        Self {
            ambassador_id: ambassador_id.to_string(),
            ambassador_namespace: namespace.to_string(),
            ..Default::default()
        }
    }
}
