//! Upstream clusters
//!
//! A cluster is named from everything that makes it distinct (marker, service,
//! TLS origination, namespace, breakers, endpoint routing), so two resources
//! that ask for the same upstream share it and get merged.

use super::Provenance;
use super::ambassador::AmbassadorModule;
use super::resolver::Target;
use super::tls::IrTlsContext;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use url::Url;

static CLUSTER_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^0-9A-Za-z_]").expect("CLUSTER_NAME_REGEX should be a valid regex pattern")
});

/// Load balancer policies that need endpoint routing
const ENDPOINT_POLICIES: &[&str] = &["round_robin", "least_request", "ring_hash", "maglev"];

/// Whether a `load_balancer` block is well formed
pub fn validate_load_balancer(lb: &Value) -> bool {
    let Some(lb) = lb.as_object() else {
        return false;
    };

    match lb.get("policy").and_then(Value::as_str) {
        Some("round_robin") | Some("least_request") => lb.len() == 1,
        Some("ring_hash") | Some("maglev") => {
            lb.len() == 2
                && (lb
                    .get("cookie")
                    .is_some_and(|cookie| cookie.get("name").is_some())
                    || lb.contains_key("header")
                    || lb.contains_key("source_ip"))
        }
        _ => false,
    }
}

/// Validate circuit breakers and give each one a `_name` derived from its limits.
///
/// Returns `None` if any breaker is malformed.
pub fn validate_circuit_breakers(breakers: &Value) -> Option<Vec<Value>> {
    let breakers = breakers.as_array()?;
    let mut named = Vec::with_capacity(breakers.len());

    for breaker in breakers {
        let mut breaker: Map<String, Value> = breaker.as_object()?.clone();
        if breaker.contains_key("_name") {
            named.push(Value::Object(breaker));
            continue;
        }

        let mut name = String::from("cb");
        match breaker.get("priority") {
            Some(priority) => {
                let priority = priority.as_str()?.to_lowercase();
                if priority != "default" && priority != "high" {
                    return None;
                }
                name.push_str(&priority[..1]);
            }
            None => name.push('n'),
        }

        for (field, abbrev) in [
            ("max_connections", 'c'),
            ("max_pending_requests", 'p'),
            ("max_requests", 'r'),
            ("max_retries", 't'),
        ] {
            if let Some(value) = breaker.get(field) {
                let value = match value {
                    Value::Number(n) => n.as_i64()?,
                    Value::String(s) => s.parse().ok()?,
                    _ => return None,
                };
                name.push(abbrev);
                name.push_str(&value.to_string());
            }
        }

        breaker.insert("_name".to_string(), json!(name));
        named.push(Value::Object(breaker));
    }

    Some(named)
}

/// TLS origination requested by a resource: a context name, or `true` for
/// origination without client certificates
#[derive(Debug, Clone, PartialEq)]
pub enum TlsOrigination {
    Context(String),
    Null,
}

impl TlsOrigination {
    pub fn from_value(value: Option<&Value>) -> Option<Self> {
        match value? {
            Value::String(name) if !name.is_empty() => Some(Self::Context(name.clone())),
            Value::Bool(true) => Some(Self::Null),
            _ => None,
        }
    }
}

/// What a resource asks of a cluster
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterRequest {
    pub service: String,
    pub namespace: String,
    pub marker: Option<String>,
    pub tls: Option<TlsOrigination>,
    pub host_rewrite: Option<String>,
    pub dns_type: String,
    pub grpc: bool,
    pub load_balancer: Option<Value>,
    pub keepalive: Option<Value>,
    pub circuit_breakers: Option<Vec<Value>>,
    pub connect_timeout_ms: i64,
    pub cluster_idle_timeout_ms: Option<i64>,
    pub cluster_max_connection_lifetime_ms: Option<i64>,
    pub enable_ipv4: Option<bool>,
    pub enable_ipv6: Option<bool>,
    pub stats_name: Option<String>,
    pub respect_dns_ttl: bool,
    /// Resolver name; `None` takes the Module's or the routing default
    pub resolver: Option<String>,
}

impl ClusterRequest {
    pub fn new(service: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            namespace: namespace.into(),
            marker: None,
            tls: None,
            host_rewrite: None,
            dns_type: "strict_dns".to_string(),
            grpc: false,
            load_balancer: None,
            keepalive: None,
            circuit_breakers: None,
            connect_timeout_ms: 3000,
            cluster_idle_timeout_ms: None,
            cluster_max_connection_lifetime_ms: None,
            enable_ipv4: None,
            enable_ipv6: None,
            stats_name: None,
            respect_dns_ttl: false,
            resolver: None,
        }
    }
}

/// What a cluster is built against
#[derive(Debug, Clone, Copy)]
pub struct ClusterEnv<'a> {
    pub module: &'a AmbassadorModule,
    pub tls_contexts: &'a BTreeMap<String, IrTlsContext>,
    pub enable_endpoints: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrCluster {
    #[serde(flatten)]
    pub provenance: Provenance,
    pub name: String,
    #[serde(rename = "type")]
    pub dns_type: String,
    pub lb_type: String,
    pub urls: Vec<String>,
    pub service: String,
    pub stats_name: String,
    pub connect_timeout_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_idle_timeout_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_max_connection_lifetime_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keepalive: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breakers: Option<Vec<Value>>,
    pub enable_ipv4: bool,
    pub enable_ipv6: bool,
    pub enable_endpoints: bool,
    pub respect_dns_ttl: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub grpc: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_rewrite: Option<String>,
    pub originate_tls: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_context: Option<String>,
    /// Resolved addresses; `None` routes by DNS through `urls`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<Target>>,
    #[serde(skip)]
    pub resolver: Option<String>,
    #[serde(skip)]
    pub hostname: String,
    #[serde(skip)]
    pub port: u16,
    #[serde(skip)]
    pub namespace: String,
    /// Set when the service cannot be routed to at all
    #[serde(skip)]
    pub ignore: bool,
}

impl IrCluster {
    /// Build a cluster for `request` on behalf of `source`.
    ///
    /// Problems that don't stop the cluster from being built are returned
    /// alongside it for the caller to post.
    pub fn new(source: &str, request: ClusterRequest, env: ClusterEnv<'_>) -> (Self, Vec<String>) {
        let mut errors = Vec::new();
        let mut name_fields: Vec<String> = vec!["cluster".to_string()];
        let mut originate_tls = false;
        let mut ignore = false;

        if let Some(marker) = &request.marker {
            name_fields.push(marker.clone());
        }
        name_fields.push(request.service.clone());

        // The null context always resolves; named ones must exist
        let (ctx_name, ctx_found) = match &request.tls {
            None => (None, false),
            Some(TlsOrigination::Null) => (None, true),
            Some(TlsOrigination::Context(name)) => {
                let found = env.tls_contexts.contains_key(name);
                if !found {
                    errors.push(format!("Originate-TLS context {} is not defined", name));
                }
                (found.then(|| name.clone()), found)
            }
        };

        let mut service = request.service.clone();
        let lower = service.to_lowercase();

        if lower.starts_with("https://") {
            service = service["https://".len()..].to_string();
            originate_tls = true;
            name_fields.push("otls".to_string());
        } else if lower.starts_with("http://") {
            service = service["http://".len()..].to_string();
            if ctx_found {
                errors.push(format!(
                    "Originate-TLS context {} being used even though service {} lists HTTP",
                    ctx_name.as_deref().unwrap_or("null"),
                    service
                ));
                originate_tls = true;
                name_fields.push("otls".to_string());
            }
        } else if ctx_found {
            originate_tls = true;
            name_fields.push("otls".to_string());
            name_fields.push(ctx_name.clone().unwrap_or_else(|| "null".to_string()));
        }

        if let Some(idx) = service.find("://") {
            let scheme = service[..idx].to_string();
            errors.push(format!(
                "service {} has unknown scheme {}, assuming {}",
                service,
                scheme,
                if originate_tls { "HTTPS" } else { "HTTP" }
            ));
            service = service[idx + 3..].to_string();
        }

        if originate_tls {
            if let Some(host_rewrite) = &request.host_rewrite {
                name_fields.push(format!("hr-{}", host_rewrite));
            }
        }

        let (hostname, port) = match Url::parse(&format!("random://{}", service)) {
            Ok(parsed) => {
                if !parsed.path().is_empty() || parsed.query().is_some() || parsed.fragment().is_some() {
                    errors.push(format!(
                        "service {} has extra URL components; ignoring everything but the host and port",
                        service
                    ));
                }
                (
                    parsed.host_str().filter(|h| !h.is_empty()).map(str::to_string),
                    parsed.port().unwrap_or(0),
                )
            }
            Err(url::ParseError::InvalidPort) => {
                errors.push(format!(
                    "found invalid port for service {}. Please specify a valid port between 0 and 65535. Service {} cluster will be ignored, please re-configure",
                    service, service
                ));
                ignore = true;
                (None, 0)
            }
            Err(e) => {
                tracing::debug!("cluster: could not parse service {}: {}", service, e);
                (None, 0)
            }
        };

        name_fields.push(request.namespace.clone());

        let hostname = match hostname {
            Some(hostname) => hostname,
            None => {
                if !ignore {
                    errors.push(format!(
                        "service {} has no hostname and will be ignored; please re-configure",
                        service
                    ));
                }
                ignore = true;
                "unknown".to_string()
            }
        };

        let port = if port == 0 {
            if originate_tls { 443 } else { 80 }
        } else {
            port
        };
        let url = format!("tcp://{}:{}", hostname, port);

        if let Some(breakers) = &request.circuit_breakers {
            let mut unknown = 0;
            for breaker in breakers {
                match breaker.get("_name").and_then(Value::as_str) {
                    Some(name) => name_fields.push(name.to_string()),
                    None => {
                        errors.push(format!("{}: unvalidated circuit breaker {}!", service, breaker));
                        name_fields.push(format!("cbu{}", unknown));
                        unknown += 1;
                    }
                }
            }
        }

        let global_lb = env.module.load_balancer.clone();
        let mut load_balancer = request.load_balancer.clone().or_else(|| global_lb.clone());
        let mut enable_endpoints = false;

        if endpoints_required(load_balancer.as_ref()) {
            if !env.enable_endpoints {
                errors.push(format!(
                    "{}: endpoint routing is not enabled, falling back to {}",
                    service,
                    global_lb
                        .as_ref()
                        .map(Value::to_string)
                        .unwrap_or_else(|| "the default load balancer".to_string())
                ));
                load_balancer = global_lb;
            } else {
                enable_endpoints = true;
                if let Some(lb) = &load_balancer {
                    let policy = lb
                        .get("policy")
                        .and_then(Value::as_str)
                        .unwrap_or("default")
                        .to_lowercase();
                    let mut key_fields = vec!["er".to_string(), policy];
                    if let Some(header) = lb.get("header").and_then(Value::as_str) {
                        key_fields.push("hdr".to_string());
                        key_fields.push(header.to_string());
                    }
                    if let Some(cookie) = lb.pointer("/cookie/name").and_then(Value::as_str) {
                        key_fields.push("cookie".to_string());
                        key_fields.push(cookie.to_string());
                    }
                    if lb.get("source_ip").is_some() {
                        key_fields.push("srcip".to_string());
                    }
                    name_fields.push(key_fields.join("-"));
                }
            }
        }

        let name = CLUSTER_NAME_REGEX
            .replace_all(&name_fields.join("_"), "_")
            .into_owned();

        let stats_name = request
            .stats_name
            .clone()
            .unwrap_or_else(|| CLUSTER_NAME_REGEX.replace_all(&service, "_").into_owned());

        tracing::debug!("cluster {}: url {} otls {}", name, url, originate_tls);

        let cluster = Self {
            provenance: Provenance::new(source),
            name,
            dns_type: request.dns_type,
            lb_type: "round_robin".to_string(),
            urls: vec![url],
            service,
            stats_name,
            connect_timeout_ms: request.connect_timeout_ms,
            cluster_idle_timeout_ms: request
                .cluster_idle_timeout_ms
                .or(env.module.cluster_idle_timeout_ms),
            cluster_max_connection_lifetime_ms: request
                .cluster_max_connection_lifetime_ms
                .or(env.module.cluster_max_connection_lifetime_ms),
            load_balancer,
            keepalive: request.keepalive.or_else(|| env.module.keepalive.clone()),
            circuit_breakers: request.circuit_breakers,
            enable_ipv4: request.enable_ipv4.unwrap_or(env.module.enable_ipv4),
            enable_ipv6: request.enable_ipv6.unwrap_or(env.module.enable_ipv6),
            enable_endpoints,
            respect_dns_ttl: request.respect_dns_ttl,
            grpc: request.grpc,
            host_rewrite: request.host_rewrite,
            originate_tls,
            tls_context: if originate_tls { ctx_name } else { None },
            targets: None,
            resolver: request.resolver,
            hostname,
            port,
            namespace: request.namespace,
            ignore,
        };

        (cluster, errors)
    }

    /// Fold `other` into this cluster. Only URLs, targets and references may differ.
    pub fn merge(&mut self, other: &IrCluster) -> Result<(), String> {
        let mut mismatches = Vec::new();

        if self.dns_type != other.dns_type {
            mismatches.push("type");
        }
        if self.lb_type != other.lb_type {
            mismatches.push("lb_type");
        }
        if self.host_rewrite != other.host_rewrite {
            mismatches.push("host_rewrite");
        }
        if self.tls_context != other.tls_context {
            mismatches.push("tls_context");
        }
        if self.originate_tls != other.originate_tls {
            mismatches.push("originate_tls");
        }
        if self.grpc != other.grpc {
            mismatches.push("grpc");
        }
        if self.connect_timeout_ms != other.connect_timeout_ms {
            mismatches.push("connect_timeout_ms");
        }
        if self.cluster_idle_timeout_ms != other.cluster_idle_timeout_ms {
            mismatches.push("cluster_idle_timeout_ms");
        }
        if self.cluster_max_connection_lifetime_ms != other.cluster_max_connection_lifetime_ms {
            mismatches.push("cluster_max_connection_lifetime_ms");
        }

        if !mismatches.is_empty() {
            return Err(format!(
                "cannot merge cluster {}: mismatched attributes {}",
                other.name,
                mismatches.join(", ")
            ));
        }

        for url in &other.urls {
            if !self.urls.contains(url) {
                self.urls.push(url.clone());
            }
        }
        if let Some(targets) = &other.targets {
            let mine = self.targets.get_or_insert_with(Vec::new);
            for target in targets {
                if !mine.contains(target) {
                    mine.push(target.clone());
                }
            }
        }
        self.provenance.absorb(&other.provenance);

        Ok(())
    }
}

fn endpoints_required(load_balancer: Option<&Value>) -> bool {
    load_balancer
        .and_then(|lb| lb.get("policy"))
        .and_then(Value::as_str)
        .is_some_and(|policy| ENDPOINT_POLICIES.contains(&policy))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(request: ClusterRequest) -> (IrCluster, Vec<String>) {
        build_with(request, &AmbassadorModule::default(), true)
    }

    fn build_with(
        request: ClusterRequest,
        module: &AmbassadorModule,
        enable_endpoints: bool,
    ) -> (IrCluster, Vec<String>) {
        let contexts = BTreeMap::new();
        let env = ClusterEnv {
            module,
            tls_contexts: &contexts,
            enable_endpoints,
        };
        IrCluster::new("qotm.default.1", request, env)
    }

    #[test]
    fn test_plain_service() {
        let (cluster, errors) = build(ClusterRequest::new("qotm", "default"));

        assert!(errors.is_empty());
        assert_eq!(cluster.name, "cluster_qotm_default");
        assert_eq!(cluster.urls, vec!["tcp://qotm:80"]);
        assert_eq!(cluster.stats_name, "qotm");
        assert!(!cluster.originate_tls);
        assert!(!cluster.ignore);
    }

    #[test]
    fn test_https_scheme_originates_tls() {
        let (cluster, errors) = build(ClusterRequest::new("https://secure.example.com", "default"));

        assert!(errors.is_empty());
        assert_eq!(cluster.name, "cluster_https___secure_example_com_otls_default");
        assert_eq!(cluster.urls, vec!["tcp://secure.example.com:443"]);
        assert!(cluster.originate_tls);
        assert_eq!(cluster.stats_name, "secure_example_com");
    }

    #[test]
    fn test_unknown_scheme_and_extra_components() {
        let (cluster, errors) = build(ClusterRequest::new("grpc://backend:9000/path", "default"));

        assert_eq!(cluster.urls, vec!["tcp://backend:9000"]);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("has unknown scheme grpc, assuming HTTP"));
        assert!(errors[1].contains("has extra URL components"));
    }

    #[test]
    fn test_missing_context_is_reported() {
        let mut request = ClusterRequest::new("qotm", "default");
        request.tls = Some(TlsOrigination::Context("upstream".to_string()));
        let (cluster, errors) = build(request);

        assert_eq!(errors, vec!["Originate-TLS context upstream is not defined"]);
        assert!(!cluster.originate_tls);
    }

    #[test]
    fn test_endpoint_routing_naming_and_fallback() {
        let mut request = ClusterRequest::new("qotm:8080", "default");
        request.load_balancer = Some(json!({"policy": "ring_hash", "header": "x-user"}));

        let (cluster, errors) = build(request.clone());
        assert!(errors.is_empty());
        assert!(cluster.enable_endpoints);
        assert_eq!(cluster.name, "cluster_qotm_8080_default_er_ring_hash_hdr_x_user");

        let (cluster, errors) = build_with(request, &AmbassadorModule::default(), false);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("endpoint routing is not enabled"));
        assert!(!cluster.enable_endpoints);
        assert_eq!(cluster.load_balancer, None);
    }

    #[test]
    fn test_merge() {
        let (mut first, _) = build(ClusterRequest::new("qotm", "default"));
        let (mut second, _) = IrCluster::new(
            "other.default.1",
            ClusterRequest::new("qotm", "default"),
            ClusterEnv {
                module: &AmbassadorModule::default(),
                tls_contexts: &BTreeMap::new(),
                enable_endpoints: true,
            },
        );
        second.urls.push("tcp://qotm-canary:80".to_string());
        let target = Target {
            ip: "10.0.0.7".to_string(),
            port: 5000,
            target_kind: None,
        };
        second.targets = Some(vec![target.clone()]);

        assert!(first.merge(&second).is_ok());
        assert_eq!(first.urls, vec!["tcp://qotm:80", "tcp://qotm-canary:80"]);
        assert_eq!(first.targets, Some(vec![target]));
        assert_eq!((first.hostname.as_str(), first.port), ("qotm", 80));
        let refs: Vec<&str> = first.provenance.referenced_by.iter().map(String::as_str).collect();
        assert_eq!(refs, vec!["other.default.1", "qotm.default.1"]);

        second.connect_timeout_ms = 500;
        second.grpc = true;
        assert_eq!(
            first.merge(&second).unwrap_err(),
            "cannot merge cluster cluster_qotm_default: mismatched attributes grpc, connect_timeout_ms"
        );
    }

    #[test]
    fn test_circuit_breaker_names() {
        let breakers = validate_circuit_breakers(&json!([
            {"priority": "high", "max_connections": 100, "max_retries": "3"},
            {"max_requests": 50}
        ]))
        .unwrap();

        assert_eq!(breakers[0]["_name"], "cbhc100t3");
        assert_eq!(breakers[1]["_name"], "cbnr50");
        assert!(validate_circuit_breakers(&json!([{"priority": "low"}])).is_none());
    }

    #[test]
    fn test_load_balancer_validation() {
        assert!(validate_load_balancer(&json!({"policy": "least_request"})));
        assert!(validate_load_balancer(&json!({"policy": "maglev", "cookie": {"name": "s"}})));
        assert!(!validate_load_balancer(&json!({"policy": "ring_hash"})));
        assert!(!validate_load_balancer(&json!({"policy": "random"})));
    }
}
