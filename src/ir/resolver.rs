//! Service resolvers
//!
//! A resolver turns a cluster's service into concrete targets: the service's
//! DNS name, or the addresses the fetch stage joined from Endpoints or Consul.

use super::Provenance;
use super::ambassador::AmbassadorModule;
use super::cluster::{ClusterRequest, IrCluster};
use super::store::ResourceStore;
use crate::diag::ErrorLog;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::IpAddr;

pub const KUBERNETES_SERVICE: &str = "kubernetes-service";
pub const KUBERNETES_ENDPOINT: &str = "kubernetes-endpoint";
pub const ENDPOINT: &str = "endpoint";
pub const CONSUL_ENDPOINT: &str = "consul-endpoint";
pub const CONSUL: &str = "consul";

const DEFAULT_DATACENTER: &str = "dc1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResolverKind {
    #[serde(rename = "KubernetesServiceResolver")]
    KubernetesService,
    #[serde(rename = "KubernetesEndpointResolver")]
    KubernetesEndpoint,
    #[serde(rename = "ConsulResolver")]
    Consul,
}

impl ResolverKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "KubernetesServiceResolver" => Some(Self::KubernetesService),
            "KubernetesEndpointResolver" => Some(Self::KubernetesEndpoint),
            "ConsulResolver" => Some(Self::Consul),
            _ => None,
        }
    }
}

/// One address a cluster routes to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub ip: String,
    pub port: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_kind: Option<String>,
}

impl Target {
    fn new(ip: &str, port: u16, target_kind: &str) -> Self {
        Self {
            ip: ip.to_string(),
            port: i64::from(port),
            target_kind: Some(target_kind.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrServiceResolver {
    #[serde(flatten)]
    pub provenance: Provenance,
    pub name: String,
    pub kind: ResolverKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,
}

impl IrServiceResolver {
    fn internal(name: &str, kind: ResolverKind) -> Self {
        Self {
            provenance: Provenance::internal(),
            name: name.to_string(),
            kind,
            datacenter: (kind == ResolverKind::Consul).then(|| DEFAULT_DATACENTER.to_string()),
        }
    }

    fn aliased(&self, name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..self.clone()
        }
    }

    /// Check that a mapping's service can be resolved this way.
    ///
    /// Returns the error that invalidates the mapping, posting softer notices itself.
    pub fn valid_mapping(
        &self,
        rkey: &str,
        service: &str,
        load_balancer: Option<&Value>,
        log: &mut ErrorLog,
    ) -> Result<(), String> {
        match self.kind {
            ResolverKind::KubernetesService if load_balancer.is_some() => {
                Err("No load_balancer setting is allowed with the KubernetesServiceResolver".to_string())
            }
            ResolverKind::Consul => {
                if service.contains(':') {
                    log.post_notice(
                        Some(rkey),
                        "The Consul resolver does not allow overriding service port; ignoring requested port",
                    );
                }
                if service.contains('.') {
                    return Err("The Consul resolver does not allow dots in service names".to_string());
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Targets for `hostname:port`, or `None` if this resolver has nothing for it
    fn resolve(
        &self,
        store: &ResourceStore,
        module: &AmbassadorModule,
        hostname: &str,
        namespace: &str,
        port: u16,
        log: &mut ErrorLog,
    ) -> Option<Vec<Target>> {
        match self.kind {
            ResolverKind::KubernetesService => Some(vec![Target::new(hostname, port, "DNSname")]),
            ResolverKind::KubernetesEndpoint => {
                let (svc, namespace) = self.parse_service(store, module, hostname, namespace);
                let key = format!("k8s-{}-{}", svc, namespace);
                self.endpoints(store, &key, Some(port), log)
            }
            ResolverKind::Consul => {
                let datacenter = self.datacenter.as_deref().unwrap_or(DEFAULT_DATACENTER);
                let key = format!("consul-{}-{}", hostname, datacenter);
                self.endpoints(store, &key, None, log)
            }
        }
    }

    /// `svc` or `svc.namespace[.cluster...]`, split into service and namespace
    fn parse_service<'a>(
        &self,
        store: &'a ResourceStore,
        module: &AmbassadorModule,
        hostname: &'a str,
        namespace: &'a str,
    ) -> (&'a str, &'a str) {
        let ambassador_namespace = store.settings().ambassador_namespace.as_str();

        if hostname.contains('.') && hostname.parse::<IpAddr>().is_err() {
            let mut parts = hostname.splitn(3, '.');
            let svc = parts.next().unwrap_or(hostname);
            let ns = parts.next().unwrap_or(ambassador_namespace);
            (svc, ns)
        } else if !module.use_ambassador_namespace_for_service_resolution && !namespace.is_empty() {
            (hostname, namespace)
        } else {
            (hostname, ambassador_namespace)
        }
    }

    fn endpoints(
        &self,
        store: &ResourceStore,
        key: &str,
        port: Option<u16>,
        log: &mut ErrorLog,
    ) -> Option<Vec<Target>> {
        let Some(service) = store.config("services", key) else {
            tracing::debug!("resolver {}: {} matches no Service for endpoints", self.name, key);
            return None;
        };

        let endpoints = service
            .get("endpoints")
            .and_then(Value::as_object)
            .filter(|endpoints| !endpoints.is_empty());
        let Some(endpoints) = endpoints else {
            tracing::debug!("resolver {}: {} has no endpoints", self.name, key);
            return None;
        };

        let port_key = port.map_or_else(|| "*".to_string(), |port| port.to_string());
        let targets = endpoints
            .get(&port_key)
            .and_then(|targets| serde_json::from_value::<Vec<Target>>(targets.clone()).ok());

        if targets.is_none() {
            let source = if self.kind == ResolverKind::Consul {
                "consul"
            } else {
                "Kubernetes"
            };
            log.post_error(
                Some(&service.rkey),
                format!(
                    "Service {}: {}:{} matches no endpoints from {}",
                    service.name,
                    key,
                    port.map_or_else(|| "None".to_string(), |p| p.to_string()),
                    source
                ),
            );
        }
        targets
    }
}

/// Every resolver by name, defaults and aliases included
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolverSet {
    resolvers: BTreeMap<String, IrServiceResolver>,
}

impl ResolverSet {
    pub fn load(store: &ResourceStore, log: &mut ErrorLog) -> Self {
        let mut resolvers = BTreeMap::new();

        for config in store.configs("resolvers") {
            let Some(kind) = ResolverKind::parse(&config.kind) else {
                log.post_error(Some(&config.rkey), format!("Resolver kind {} unknown", config.kind));
                continue;
            };
            let datacenter = config.get_str("datacenter").map(str::to_string);
            if kind == ResolverKind::Consul && datacenter.as_deref().is_none_or(str::is_empty) {
                log.post_error(Some(&config.rkey), "ConsulResolver is required to have a datacenter");
                continue;
            }

            tracing::debug!("resolver {}: {:?} from {}", config.name, kind, config.rkey);
            resolvers.insert(
                config.name.clone(),
                IrServiceResolver {
                    provenance: Provenance::new(&config.rkey),
                    name: config.name.clone(),
                    kind,
                    datacenter,
                },
            );
        }

        resolvers
            .entry(KUBERNETES_SERVICE.to_string())
            .or_insert_with(|| IrServiceResolver::internal(KUBERNETES_SERVICE, ResolverKind::KubernetesService));

        let mut set = Self { resolvers };
        set.alias_pair(ENDPOINT, KUBERNETES_ENDPOINT, ResolverKind::KubernetesEndpoint);
        set.alias_pair(CONSUL, CONSUL_ENDPOINT, ResolverKind::Consul);
        set
    }

    /// `short` and `long` name the same resolver unless both are declared
    fn alias_pair(&mut self, short: &str, long: &str, kind: ResolverKind) {
        let declared = match (self.resolvers.get(short), self.resolvers.get(long)) {
            (Some(_), Some(_)) => return,
            (Some(resolver), None) => resolver.aliased(long),
            (None, Some(resolver)) => resolver.aliased(short),
            (None, None) => {
                let resolver = IrServiceResolver::internal(long, kind);
                self.resolvers.insert(short.to_string(), resolver.aliased(short));
                resolver
            }
        };
        self.resolvers.insert(declared.name.clone(), declared);
    }

    pub fn get(&self, name: &str) -> Option<&IrServiceResolver> {
        self.resolvers.get(name)
    }

    pub fn values(&self) -> impl Iterator<Item = &IrServiceResolver> {
        self.resolvers.values()
    }

    /// The resolver a cluster uses: its own, the Module's, or the default
    /// for its routing mode
    pub fn select<'a>(
        explicit: Option<&'a str>,
        module: &'a AmbassadorModule,
        enable_endpoints: bool,
    ) -> &'a str {
        explicit
            .or(module.resolver.as_deref())
            .unwrap_or(if enable_endpoints { ENDPOINT } else { KUBERNETES_SERVICE })
    }

    /// Whether the resolver a mapping names, itself or through the Module,
    /// can serve `request`. A rejection is posted against `rkey`.
    pub fn accepts(
        &self,
        rkey: &str,
        request: &ClusterRequest,
        module: &AmbassadorModule,
        log: &mut ErrorLog,
    ) -> bool {
        let named = request.resolver.as_deref().or(module.resolver.as_deref());
        let Some(resolver) = named.and_then(|name| self.get(name)) else {
            return true;
        };

        match resolver.valid_mapping(rkey, &request.service, request.load_balancer.as_ref(), log) {
            Ok(()) => true,
            Err(e) => {
                log.post_error(Some(rkey), e);
                false
            }
        }
    }

    /// Fill in `cluster.targets`. Clusters left without targets route by DNS.
    pub fn resolve_targets(
        &self,
        cluster: &mut IrCluster,
        store: &ResourceStore,
        module: &AmbassadorModule,
        log: &mut ErrorLog,
    ) {
        if cluster.ignore {
            return;
        }

        if cluster.hostname.parse::<IpAddr>().is_ok() {
            tracing::debug!("cluster {}: {} is already an IP address", cluster.name, cluster.hostname);
            cluster.targets = Some(vec![Target::new(&cluster.hostname, cluster.port, "IPaddr")]);
            return;
        }

        let name = Self::select(cluster.resolver.as_deref(), module, cluster.enable_endpoints);
        let Some(resolver) = self.get(name) else {
            log.post_error(
                Some(&cluster.provenance.source),
                format!("cluster {} has invalid resolver {}", cluster.name, name),
            );
            return;
        };

        let targets = resolver.resolve(
            store,
            module,
            &cluster.hostname,
            &cluster.namespace,
            cluster.port,
            log,
        );
        if targets.is_none() {
            tracing::debug!("accepting cluster with no endpoints: {}", cluster.name);
        }
        cluster.targets = targets;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::fetch::ResourceRecord;
    use crate::ir::cluster::{ClusterEnv, ClusterRequest};
    use serde_json::json;
    use std::sync::Arc;

    fn record(rkey: &str, object: Value) -> ResourceRecord {
        let object = object.as_object().cloned().unwrap_or_default();
        ResourceRecord {
            rkey: rkey.to_string(),
            location: rkey.to_string(),
            kind: object["kind"].as_str().unwrap_or_default().to_string(),
            name: object.get("name").and_then(Value::as_str).map(str::to_string),
            namespace: object
                .get("namespace")
                .and_then(Value::as_str)
                .map(str::to_string),
            serialization: String::new(),
            object,
        }
    }

    fn load(records: Vec<ResourceRecord>) -> (ResourceStore, ResolverSet, ErrorLog) {
        let mut log = ErrorLog::new();
        let store = ResourceStore::load(&records, Arc::new(Settings::default()), &mut log);
        let resolvers = ResolverSet::load(&store, &mut log);
        (store, resolvers, log)
    }

    fn service(name: &str, endpoints: Value) -> ResourceRecord {
        record(
            &format!("k8s-{}-default", name),
            json!({
                "apiVersion": "getambassador.io/v2",
                "kind": "Service",
                "name": name,
                "namespace": "default",
                "endpoints": endpoints
            }),
        )
    }

    fn cluster(hostname: &str, port: u16, resolver: Option<&str>) -> IrCluster {
        let module = AmbassadorModule::default();
        let contexts = BTreeMap::new();
        let mut request = ClusterRequest::new(format!("{}:{}", hostname, port), "default");
        request.resolver = resolver.map(str::to_string);
        let env = ClusterEnv {
            module: &module,
            tls_contexts: &contexts,
            enable_endpoints: true,
        };
        IrCluster::new("qotm.default.1", request, env).0
    }

    #[test]
    fn test_defaults_and_aliases() {
        let (_, resolvers, log) = load(vec![record(
            "consul.default.1",
            json!({"apiVersion": "getambassador.io/v2", "kind": "ConsulResolver", "name": "consul", "namespace": "default", "datacenter": "west"}),
        )]);

        assert!(log.is_empty());
        let names: Vec<&str> = resolvers.values().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["consul", "consul-endpoint", "endpoint", "kubernetes-endpoint", "kubernetes-service"]
        );
        let consul = resolvers.get(CONSUL_ENDPOINT).unwrap();
        assert_eq!(consul.datacenter.as_deref(), Some("west"));
        assert_eq!(consul.provenance.source, "consul.default.1");
        assert_eq!(
            resolvers.get(ENDPOINT).map(|r| r.kind),
            Some(ResolverKind::KubernetesEndpoint)
        );
    }

    #[test]
    fn test_consul_needs_a_datacenter() {
        let (_, resolvers, log) = load(vec![record(
            "consul.default.1",
            json!({"apiVersion": "getambassador.io/v2", "kind": "ConsulResolver", "name": "my-consul", "namespace": "default"}),
        )]);

        assert!(resolvers.get("my-consul").is_none());
        assert_eq!(
            log.errors_for("consul.default.1")[0].text,
            "ConsulResolver is required to have a datacenter"
        );
    }

    #[test]
    fn test_endpoint_targets_by_port() {
        let (store, resolvers, mut log) = load(vec![service(
            "qotm",
            json!({"80": [{"ip": "10.0.0.1", "port": 5000}, {"ip": "10.0.0.2", "port": 5000}]}),
        )]);
        let module = AmbassadorModule::default();

        let mut found = cluster("qotm", 80, Some(ENDPOINT));
        resolvers.resolve_targets(&mut found, &store, &module, &mut log);
        assert_eq!(
            found.targets,
            Some(vec![
                Target { ip: "10.0.0.1".to_string(), port: 5000, target_kind: None },
                Target { ip: "10.0.0.2".to_string(), port: 5000, target_kind: None },
            ])
        );
        assert!(log.is_empty());

        let mut wrong_port = cluster("qotm", 8080, Some(ENDPOINT));
        resolvers.resolve_targets(&mut wrong_port, &store, &module, &mut log);
        assert_eq!(wrong_port.targets, None);
        assert_eq!(
            log.errors_for("k8s-qotm-default")[0].text,
            "Service qotm: k8s-qotm-default:8080 matches no endpoints from Kubernetes"
        );
    }

    #[test]
    fn test_service_and_ip_targets() {
        let (store, resolvers, mut log) = load(vec![]);
        let module = AmbassadorModule::default();

        let mut dns = cluster("qotm", 80, Some(KUBERNETES_SERVICE));
        resolvers.resolve_targets(&mut dns, &store, &module, &mut log);
        assert_eq!(dns.targets, Some(vec![Target::new("qotm", 80, "DNSname")]));

        let mut ip = cluster("10.1.2.3", 9000, Some("no-such-resolver"));
        resolvers.resolve_targets(&mut ip, &store, &module, &mut log);
        assert_eq!(ip.targets, Some(vec![Target::new("10.1.2.3", 9000, "IPaddr")]));

        let mut unknown = cluster("qotm", 80, Some("no-such-resolver"));
        resolvers.resolve_targets(&mut unknown, &store, &module, &mut log);
        assert_eq!(unknown.targets, None);
        assert_eq!(
            log.errors_for("qotm.default.1")[0].text,
            "cluster cluster_qotm_80_default has invalid resolver no-such-resolver"
        );
    }

    #[test]
    fn test_dotted_service_names_pick_their_namespace() {
        let (store, resolvers, mut log) = load(vec![record(
            "k8s-qotm-staging",
            json!({"apiVersion": "getambassador.io/v2", "kind": "Service", "name": "qotm", "namespace": "staging", "endpoints": {"80": [{"ip": "10.2.0.1", "port": 80}]}}),
        )]);
        let module = AmbassadorModule::default();

        let mut dotted = cluster("qotm.staging.svc.cluster.local", 80, Some(ENDPOINT));
        resolvers.resolve_targets(&mut dotted, &store, &module, &mut log);
        assert_eq!(dotted.targets.map(|t| t.len()), Some(1));
    }

    #[test]
    fn test_mapping_validation() {
        let (_, resolvers, mut log) = load(vec![]);
        let lb = json!({"policy": "round_robin"});

        let service = resolvers.get(KUBERNETES_SERVICE).unwrap();
        assert_eq!(
            service.valid_mapping("m.1", "qotm", Some(&lb), &mut log).unwrap_err(),
            "No load_balancer setting is allowed with the KubernetesServiceResolver"
        );

        let consul = resolvers.get(CONSUL).unwrap();
        assert!(consul.valid_mapping("m.2", "qotm:8080", None, &mut log).is_ok());
        assert_eq!(
            log.notices_for("m.2"),
            &["The Consul resolver does not allow overriding service port; ignoring requested port".to_string()]
        );
        assert_eq!(
            consul.valid_mapping("m.3", "qotm.default", None, &mut log).unwrap_err(),
            "The Consul resolver does not allow dots in service names"
        );
    }
}
