//! External authentication
//!
//! Folds the `authentication` Module and every AuthService into one filter.
//! Several AuthServices may point at different services (canaries), but they
//! must agree on everything else.

use super::Provenance;
use super::cluster::{ClusterEnv, ClusterRequest, IrCluster, TlsOrigination};
use super::store::{ResourceStore, StoredConfig};
use crate::diag::ErrorLog;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Keys two AuthServices may not disagree on
const SINGLE_VALUED_KEYS: &[&str] = &["path_prefix", "timeout_ms", "cluster", "allow_request_body", "proto"];

/// One auth upstream
#[derive(Debug, Clone, PartialEq)]
pub struct AuthHost {
    pub grpc: bool,
    pub tls: Option<TlsOrigination>,
    /// rkey that declared it
    pub source: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IrAuth {
    pub provenance: Provenance,
    pub namespace: String,
    /// Name of the merged auth cluster, once built
    pub cluster: Option<String>,
    pub hosts: BTreeMap<String, AuthHost>,
    pub proto: String,
    pub path_prefix: Option<String>,
    pub timeout_ms: i64,
    pub connect_timeout_ms: i64,
    pub allow_request_body: bool,
    pub include_body: Option<Value>,
    pub allowed_request_headers: Vec<String>,
    pub allowed_authorization_headers: Vec<String>,
    pub add_auth_headers: Map<String, Value>,
    pub status_on_error: Option<Value>,
    pub failure_mode_allow: bool,
    pub circuit_breakers: Option<Vec<Value>>,
    pub host_rewrite: Option<String>,
    pub stats_name: Option<String>,
    /// First value seen for each single-valued key
    seen: BTreeMap<&'static str, Value>,
}

impl IrAuth {
    fn new(namespace: &str) -> Self {
        Self {
            provenance: Provenance::internal(),
            namespace: namespace.to_string(),
            cluster: None,
            hosts: BTreeMap::new(),
            proto: "http".to_string(),
            path_prefix: None,
            timeout_ms: 5000,
            connect_timeout_ms: 3000,
            allow_request_body: false,
            include_body: None,
            allowed_request_headers: Vec::new(),
            allowed_authorization_headers: Vec::new(),
            add_auth_headers: Map::new(),
            status_on_error: None,
            failure_mode_allow: false,
            circuit_breakers: None,
            host_rewrite: None,
            stats_name: None,
            seen: BTreeMap::new(),
        }
    }

    /// Fold the `authentication` Module and AuthServices; `None` when nothing
    /// names an auth service
    pub fn load(
        store: &ResourceStore,
        module_breakers: Option<&Vec<Value>>,
        log: &mut ErrorLog,
    ) -> Option<Self> {
        let mut auth = Self::new(&store.settings().ambassador_namespace);

        if let Some(module) = store.module("authentication") {
            auth.load_one(module, module_breakers, log);
        }
        for config in store.configs("auth_configs") {
            auth.load_one(config, module_breakers, log);
        }

        if auth.hosts.is_empty() {
            tracing::debug!("IrAuth: no AuthServices, going inactive");
            return None;
        }

        tracing::debug!("IrAuth: going active with {} hosts", auth.hosts.len());
        Some(auth)
    }

    fn load_one(
        &mut self,
        config: &StoredConfig,
        module_breakers: Option<&Vec<Value>>,
        log: &mut ErrorLog,
    ) {
        let rkey = Some(config.rkey.as_str());
        self.namespace = config.namespace.clone();
        if self.provenance.is_internal() {
            self.provenance = Provenance::new(&config.rkey);
        }
        self.provenance.reference(&config.rkey);

        let mut conflicting = Vec::new();
        for &key in SINGLE_VALUED_KEYS {
            let Some(value) = config.get(key).filter(|v| is_truthy(v)) else {
                continue;
            };
            match self.seen.get(key) {
                Some(previous) if previous != value => {
                    log.post_error(
                        rkey,
                        format!(
                            "AuthService cannot support multiple {} values; using {}",
                            key,
                            display(previous)
                        ),
                    );
                    conflicting.push(key);
                }
                Some(_) => {}
                None => {
                    self.seen.insert(key, value.clone());
                }
            }
        }

        // Agreed single-valued keys come from `seen`; the rest from this config
        if let Some(prefix) = self.seen.get("path_prefix").and_then(Value::as_str) {
            self.path_prefix = Some(prefix.to_string());
        }
        if let Some(timeout) = self.seen.get("timeout_ms").and_then(Value::as_i64) {
            self.timeout_ms = timeout;
        }
        if let Some(proto) = self.seen.get("proto").and_then(Value::as_str) {
            self.proto = proto.to_string();
        }
        if !conflicting.contains(&"allow_request_body") {
            self.allow_request_body = config.get_bool("allow_request_body").unwrap_or(false);
        }

        self.include_body = config.get("include_body").cloned();
        self.connect_timeout_ms = config.get_i64("connect_timeout_ms").unwrap_or(3000);
        if let Some(Value::Object(headers)) = config.get("add_auth_headers") {
            self.add_auth_headers = headers.clone();
        }
        if let Some(status) = config.get("status_on_error") {
            self.status_on_error = Some(status.clone());
        }
        if config.get_bool("failure_mode_allow").unwrap_or(false) {
            self.failure_mode_allow = true;
        }
        self.host_rewrite = config.get_str("host_rewrite").map(str::to_string);
        self.stats_name = config.get_str("stats_name").map(str::to_string);
        self.circuit_breakers = config
            .get("circuit_breakers")
            .and_then(super::cluster::validate_circuit_breakers)
            .or_else(|| module_breakers.cloned());

        merge_header_list(
            &mut self.allowed_request_headers,
            config.get("allowed_request_headers"),
        );
        merge_header_list(
            &mut self.allowed_authorization_headers,
            config.get("allowed_authorization_headers"),
        );

        if self.include_body.is_some() && self.allow_request_body {
            log.post_error(
                rkey,
                "AuthService ignoring allow_request_body since include_body is present",
            );
            self.allow_request_body = false;
        }

        if let Some(service) = config.get_str("auth_service") {
            self.hosts.insert(
                service.to_string(),
                AuthHost {
                    grpc: self.proto == "grpc",
                    tls: TlsOrigination::from_value(config.get("tls")),
                    source: config.rkey.clone(),
                },
            );
        }
    }

    /// Build the auth cluster, merging canaries into it.
    ///
    /// Returns `None` if a canary differs in more than its service.
    pub fn build_cluster(&mut self, env: ClusterEnv<'_>, log: &mut ErrorLog) -> Option<IrCluster> {
        let mut merged: Option<IrCluster> = None;
        let mut good = true;

        for (service, host) in &self.hosts {
            let mut request = ClusterRequest::new(service.clone(), self.namespace.clone());
            request.marker = Some("extauth".to_string());
            request.tls = host.tls.clone();
            request.grpc = host.grpc;
            request.host_rewrite = self.host_rewrite.clone();
            request.stats_name = self.stats_name.clone();
            request.circuit_breakers = self.circuit_breakers.clone();
            request.connect_timeout_ms = self.connect_timeout_ms;

            let (cluster, errors) = IrCluster::new(&host.source, request, env);
            for error in errors {
                log.post_error(Some(&host.source), error);
            }
            if cluster.ignore {
                good = false;
                continue;
            }

            match merged.as_mut() {
                None => merged = Some(cluster),
                Some(existing) => {
                    if existing.merge(&cluster).is_err() {
                        log.post_error(
                            Some(&host.source),
                            format!("AuthService: auth canary {} can only change service!", cluster.name),
                        );
                        good = false;
                    }
                }
            }
        }

        let cluster = merged.filter(|_| good)?;
        self.cluster = Some(cluster.name.clone());
        Some(cluster)
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Lowercase and append headers not already present, in sorted order
fn merge_header_list(list: &mut Vec<String>, headers: Option<&Value>) {
    let Some(Value::Array(headers)) = headers else {
        return;
    };
    let mut incoming: Vec<&str> = headers.iter().filter_map(Value::as_str).collect();
    incoming.sort_unstable();

    for header in incoming {
        let header = header.to_lowercase();
        if !list.contains(&header) {
            list.push(header);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::fetch::ResourceRecord;
    use crate::ir::ambassador::AmbassadorModule;
    use serde_json::json;
    use std::sync::Arc;

    fn auth_service(rkey: &str, name: &str, spec: Value) -> ResourceRecord {
        let mut object = json!({
            "apiVersion": "getambassador.io/v2",
            "kind": "AuthService",
            "name": name,
            "namespace": "default"
        });
        if let (Some(object), Value::Object(spec)) = (object.as_object_mut(), spec) {
            object.extend(spec);
        }
        ResourceRecord {
            rkey: rkey.to_string(),
            location: rkey.to_string(),
            kind: "AuthService".to_string(),
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            serialization: String::new(),
            object: object.as_object().cloned().unwrap_or_default(),
        }
    }

    fn load(records: Vec<ResourceRecord>) -> (Option<IrAuth>, ErrorLog) {
        let mut log = ErrorLog::new();
        let store = ResourceStore::load(&records, Arc::new(Settings::default()), &mut log);
        let auth = IrAuth::load(&store, None, &mut log);
        (auth, log)
    }

    #[test]
    fn test_no_auth_service_is_inactive() {
        let (auth, log) = load(Vec::new());
        assert!(auth.is_none());
        assert!(log.is_empty());
    }

    #[test]
    fn test_single_auth_service() {
        let (auth, log) = load(vec![auth_service(
            "auth.default.1",
            "auth",
            json!({
                "auth_service": "extauth:8080",
                "path_prefix": "/extauth",
                "allowed_request_headers": ["X-Foo", "x-bar", "X-FOO"]
            }),
        )]);

        assert!(log.is_empty());
        let mut auth = auth.unwrap();
        assert_eq!(auth.provenance.source, "auth.default.1");
        assert_eq!(auth.path_prefix.as_deref(), Some("/extauth"));
        assert_eq!(auth.timeout_ms, 5000);
        assert_eq!(auth.allowed_request_headers, vec!["x-foo", "x-bar"]);

        let module = AmbassadorModule::default();
        let contexts = BTreeMap::new();
        let env = ClusterEnv {
            module: &module,
            tls_contexts: &contexts,
            enable_endpoints: true,
        };
        let mut log = ErrorLog::new();
        let cluster = auth.build_cluster(env, &mut log).unwrap();
        assert_eq!(cluster.name, "cluster_extauth_extauth_8080_default");
        assert_eq!(auth.cluster.as_deref(), Some(cluster.name.as_str()));
    }

    #[test]
    fn test_conflicting_values_keep_first() {
        let (auth, log) = load(vec![
            auth_service(
                "a.default.1",
                "a",
                json!({"auth_service": "auth-a", "path_prefix": "/a"}),
            ),
            auth_service(
                "b.default.1",
                "b",
                json!({"auth_service": "auth-b", "path_prefix": "/b"}),
            ),
        ]);

        let auth = auth.unwrap();
        assert_eq!(auth.path_prefix.as_deref(), Some("/a"));
        assert_eq!(auth.hosts.len(), 2);
        assert_eq!(
            log.errors_for("b.default.1")[0].text,
            "AuthService cannot support multiple path_prefix values; using /a"
        );
        let refs: Vec<&str> = auth.provenance.referenced_by.iter().map(String::as_str).collect();
        assert_eq!(refs, vec!["a.default.1", "b.default.1"]);
    }

    #[test]
    fn test_include_body_drops_allow_request_body() {
        let (auth, log) = load(vec![auth_service(
            "auth.default.1",
            "auth",
            json!({
                "auth_service": "extauth",
                "allow_request_body": true,
                "include_body": {"max_bytes": 4096, "allow_partial": true}
            }),
        )]);

        assert!(!auth.unwrap().allow_request_body);
        assert_eq!(
            log.errors_for("auth.default.1")[0].text,
            "AuthService ignoring allow_request_body since include_body is present"
        );
    }
}
