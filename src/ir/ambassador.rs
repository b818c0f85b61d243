//! The `ambassador` Module and the listener derived from it

use super::Provenance;
use super::cluster::validate_circuit_breakers;
use super::cluster::validate_load_balancer;
use super::store::ResourceStore;
use crate::diag::ErrorLog;
use serde::Serialize;
use serde_json::Value;

pub const DEFAULT_SERVICE_PORT: i64 = 80;
pub const DEFAULT_ADMIN_PORT: i64 = 8001;

/// Gateway-wide defaults from the `ambassador` Module
#[derive(Debug, Clone, PartialEq)]
pub struct AmbassadorModule {
    /// rkey of the Module, if there is one
    pub source: Option<String>,
    pub service_port: i64,
    pub admin_port: i64,
    pub load_balancer: Option<Value>,
    pub circuit_breakers: Option<Vec<Value>>,
    pub keepalive: Option<Value>,
    pub enable_ipv4: bool,
    pub enable_ipv6: bool,
    pub cluster_idle_timeout_ms: Option<i64>,
    pub cluster_max_connection_lifetime_ms: Option<i64>,
    pub error_response_overrides: Option<Value>,
    pub ip_allow: Option<Value>,
    pub ip_deny: Option<Value>,
    /// Resolver for mappings that don't name one
    pub resolver: Option<String>,
    pub use_ambassador_namespace_for_service_resolution: bool,
}

impl Default for AmbassadorModule {
    fn default() -> Self {
        Self {
            source: None,
            service_port: DEFAULT_SERVICE_PORT,
            admin_port: DEFAULT_ADMIN_PORT,
            load_balancer: None,
            circuit_breakers: None,
            keepalive: None,
            enable_ipv4: true,
            enable_ipv6: false,
            cluster_idle_timeout_ms: None,
            cluster_max_connection_lifetime_ms: None,
            error_response_overrides: None,
            ip_allow: None,
            ip_deny: None,
            resolver: None,
            use_ambassador_namespace_for_service_resolution: false,
        }
    }
}

impl AmbassadorModule {
    /// Read the `ambassador` Module, falling back to defaults field by field
    pub fn from_store(store: &ResourceStore, log: &mut ErrorLog) -> Self {
        let mut module = Self::default();
        let Some(config) = store.module("ambassador") else {
            tracing::debug!("no ambassador Module, using defaults");
            return module;
        };

        let rkey = Some(config.rkey.as_str());
        module.source = Some(config.rkey.clone());

        for (field, target) in [
            ("service_port", &mut module.service_port),
            ("admin_port", &mut module.admin_port),
        ] {
            match config.get(field) {
                None => {}
                Some(value) => match port_value(value) {
                    Some(port) => *target = port,
                    None => log.post_error(
                        rkey,
                        format!("ambassador Module: {} must be a port number, not {}", field, value),
                    ),
                },
            }
        }

        if let Some(lb) = config.get("load_balancer") {
            if validate_load_balancer(lb) {
                module.load_balancer = Some(lb.clone());
            } else {
                log.post_error(
                    rkey,
                    format!("Invalid load_balancer specified: {}", lb),
                );
            }
        }

        if let Some(breakers) = config.get("circuit_breakers") {
            match validate_circuit_breakers(breakers) {
                Some(breakers) => module.circuit_breakers = Some(breakers),
                None => log.post_error(
                    rkey,
                    format!("Invalid circuit_breakers specified: {}", breakers),
                ),
            }
        }

        module.keepalive = config.get("keepalive").cloned();
        module.enable_ipv4 = config.get_bool("enable_ipv4").unwrap_or(module.enable_ipv4);
        module.enable_ipv6 = config.get_bool("enable_ipv6").unwrap_or(module.enable_ipv6);
        module.cluster_idle_timeout_ms = config.get_i64("cluster_idle_timeout_ms");
        module.cluster_max_connection_lifetime_ms =
            config.get_i64("cluster_max_connection_lifetime_ms");
        module.error_response_overrides = config.get("error_response_overrides").cloned();
        module.ip_allow = config.get("ip_allow").cloned();
        module.ip_deny = config.get("ip_deny").cloned();
        module.resolver = config.get_str("resolver").map(str::to_string);
        module.use_ambassador_namespace_for_service_resolution = config
            .get_bool("use_ambassador_namespace_for_service_resolution")
            .unwrap_or(false);

        module
    }

    /// Provenance for elements derived from the Module
    pub fn provenance(&self) -> Provenance {
        match &self.source {
            Some(rkey) => Provenance::new(rkey),
            None => Provenance::internal(),
        }
    }
}

/// Ports may arrive as numbers or numeric strings
fn port_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .filter(|port| (0..=65535).contains(port))
}

/// The single listener
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrListener {
    #[serde(flatten)]
    pub provenance: Provenance,
    pub admin_port: i64,
    pub service_port: i64,
}

impl IrListener {
    pub fn from_module(module: &AmbassadorModule) -> Self {
        Self {
            provenance: module.provenance(),
            admin_port: module.admin_port,
            service_port: module.service_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::fetch::ResourceRecord;
    use serde_json::json;
    use std::sync::Arc;

    fn store_with_module(config: Value) -> (ResourceStore, ErrorLog) {
        let object = json!({
            "apiVersion": "getambassador.io/v2",
            "kind": "Module",
            "name": "ambassador",
            "config": config
        });
        let record = ResourceRecord {
            rkey: "ambassador.default.1".to_string(),
            location: "ambassador.default.1".to_string(),
            kind: "Module".to_string(),
            name: Some("ambassador".to_string()),
            namespace: Some("default".to_string()),
            serialization: String::new(),
            object: object.as_object().cloned().unwrap_or_default(),
        };
        let mut log = ErrorLog::new();
        let store = ResourceStore::load(&[record], Arc::new(Settings::default()), &mut log);
        (store, log)
    }

    #[test]
    fn test_defaults_without_module() {
        let mut log = ErrorLog::new();
        let store = ResourceStore::new(Arc::new(Settings::default()));
        let module = AmbassadorModule::from_store(&store, &mut log);

        assert_eq!(module, AmbassadorModule::default());
        let listener = IrListener::from_module(&module);
        assert_eq!(listener.provenance.source, "--internal--");
        assert_eq!(listener.service_port, 80);
        assert_eq!(listener.admin_port, 8001);
    }

    #[test]
    fn test_module_overrides() {
        let (store, mut log) = store_with_module(json!({
            "service_port": "8080",
            "enable_ipv6": true,
            "load_balancer": {"policy": "round_robin"},
            "resolver": "endpoint"
        }));
        let module = AmbassadorModule::from_store(&store, &mut log);

        assert!(log.is_empty());
        assert_eq!(module.service_port, 8080);
        assert_eq!(module.admin_port, 8001);
        assert!(module.enable_ipv6);
        assert_eq!(module.load_balancer, Some(json!({"policy": "round_robin"})));
        assert_eq!(module.resolver.as_deref(), Some("endpoint"));
        assert!(!module.use_ambassador_namespace_for_service_resolution);
        assert_eq!(
            IrListener::from_module(&module).provenance.source,
            "ambassador.default.1"
        );
    }

    #[test]
    fn test_bad_values_post_errors() {
        let (store, mut log) = store_with_module(json!({
            "admin_port": "http",
            "load_balancer": {"policy": "ring_hash"}
        }));
        let module = AmbassadorModule::from_store(&store, &mut log);

        assert_eq!(module.admin_port, 8001);
        assert_eq!(module.load_balancer, None);
        assert_eq!(log.errors_for("ambassador.default.1").len(), 2);
    }
}
