//! TLS contexts
//!
//! Contexts come from TLSContext resources and from Hosts that name a TLS
//! secret. Secrets are checked against what the fetch stage actually found.

use super::Provenance;
use super::store::{ResourceStore, StoredConfig};
use crate::diag::ErrorLog;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrTlsContext {
    #[serde(flatten)]
    pub provenance: Provenance,
    pub name: String,
    pub hosts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_chain_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alpn_protocols: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_tls_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tls_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_cleartext_from: Option<i64>,
}

impl IrTlsContext {
    fn empty(rkey: &str, name: &str) -> Self {
        Self {
            provenance: Provenance::new(rkey),
            name: name.to_string(),
            hosts: Vec::new(),
            secret: None,
            secret_namespace: None,
            cert_chain_file: None,
            private_key_file: None,
            alpn_protocols: None,
            min_tls_version: None,
            max_tls_version: None,
            redirect_cleartext_from: None,
        }
    }

    /// Build from a TLSContext resource; `None` if it fails validation
    pub fn from_config(config: &StoredConfig, log: &mut ErrorLog) -> Option<Self> {
        let rkey = Some(config.rkey.as_str());
        let name = config.get_str("name").unwrap_or(&config.name);

        let secret = config.get_str("secret").map(str::to_string);
        let cert_chain_file = config.get_str("cert_chain_file").map(str::to_string);
        let private_key_file = config.get_str("private_key_file").map(str::to_string);

        let mut valid = true;
        if cert_chain_file.is_some() && private_key_file.is_none() {
            log.post_error(
                rkey,
                format!(
                    "TLSContext {}: 'cert_chain_file' requires 'private_key_file' as well",
                    name
                ),
            );
            valid = false;
        }
        if secret.is_some() && cert_chain_file.is_some() {
            log.post_error(
                rkey,
                format!(
                    "TLSContext {}: exactly one of 'secret' and 'cert_chain_file' must be present",
                    name
                ),
            );
            valid = false;
        }
        if !valid {
            return None;
        }

        let mut context = Self::empty(&config.rkey, name);
        context.hosts = string_list(config.get("hosts"));
        context.cert_chain_file = cert_chain_file;
        context.private_key_file = private_key_file;
        context.alpn_protocols = config.get_str("alpn_protocols").map(str::to_string);
        context.min_tls_version = config.get_str("min_tls_version").map(str::to_string);
        context.max_tls_version = config.get_str("max_tls_version").map(str::to_string);

        if let Some(rcf) = config.get("redirect_cleartext_from") {
            let port = match rcf {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            };
            if port.is_none() {
                log.post_error(
                    rkey,
                    format!(
                        "redirect_cleartext_from must give a port number rather than '{}'",
                        rcf
                    ),
                );
            }
            context.redirect_cleartext_from = port;
        }

        if let Some(secret) = secret {
            let namespacing = config.get_bool("secret_namespacing").unwrap_or(true);
            let (secret, namespace) = match secret.split_once('.') {
                Some((secret, namespace)) if namespacing => {
                    (secret.to_string(), namespace.to_string())
                }
                _ => (secret, config.namespace.clone()),
            };
            context.secret = Some(secret);
            context.secret_namespace = Some(namespace);
        }

        Some(context)
    }

    /// Synthesize a context from a Host that carries `tlsSecret`
    pub fn from_host(host: &StoredConfig) -> Option<Self> {
        let secret = host.get("tlsSecret")?.get("name")?.as_str()?;
        let name = format!("{}-context", host.name);

        let mut context = Self::empty(&host.rkey, &name);
        context.hosts = host
            .get_str("hostname")
            .map(|h| vec![h.to_string()])
            .unwrap_or_default();
        context.secret = Some(secret.to_string());
        context.secret_namespace = Some(host.namespace.clone());
        Some(context)
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

/// Every TLS context in the store, keyed by name
pub fn load_tls_contexts(
    store: &ResourceStore,
    log: &mut ErrorLog,
) -> BTreeMap<String, IrTlsContext> {
    let mut contexts: BTreeMap<String, IrTlsContext> = BTreeMap::new();

    let declared = store
        .configs("tls_contexts")
        .filter_map(|config| IrTlsContext::from_config(config, log).map(|c| (config, c)))
        .collect::<Vec<_>>();
    let from_hosts = store
        .configs("hosts")
        .filter_map(|host| IrTlsContext::from_host(host).map(|c| (host, c)));

    for (config, mut context) in declared.into_iter().chain(from_hosts) {
        if let Some(existing) = contexts.get(&context.name) {
            log.post_error(
                Some(&config.rkey),
                format!(
                    "Duplicate TLSContext {}; keeping definition from {}",
                    context.name, existing.provenance.source
                ),
            );
            continue;
        }

        if let (Some(secret), Some(namespace)) = (&context.secret, &context.secret_namespace) {
            if store.find_secret(secret, namespace).is_none() {
                log.post_error(
                    Some(&config.rkey),
                    format!("TLSContext {}: could not find secret {}", context.name, secret),
                );
                context.secret = None;
                context.secret_namespace = None;
            }
        }

        tracing::debug!("TLS context {} from {}", context.name, config.rkey);
        contexts.insert(context.name.clone(), context);
    }

    contexts
}
