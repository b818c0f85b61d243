//! IR compiler
//!
//! Turns the validated resource store into the gateway's intermediate
//! representation: one listener, the TLS contexts, an HTTP filter chain, and
//! weighted HTTP and TCP routes over merged clusters. Every element records
//! where it came from so the diagnostics layer can slice the IR back up by source.
//!
//! Clusters are built in declaration order, so a cluster shared by several
//! mappings is sourced from the first one declared. Routes are sorted after.
//!
//! Structure:
//! - `store.rs` - validation and bucketing of fetched records
//! - `ambassador.rs` - the `ambassador` Module and the listener
//! - `tls.rs` - TLS contexts
//! - `cluster.rs` - upstream clusters and their merge rules
//! - `auth.rs`, `ratelimit.rs`, `error_response.rs`, `ip_policy.rs` - filter sources
//! - `filter.rs` - the filter enum and its data-plane rendering
//! - `mapping.rs` - mappings, groups and routes
//! - `tcp.rs` - TCP mappings and their routes
//! - `resolver.rs` - service resolvers and cluster targets

pub mod ambassador;
pub mod auth;
pub mod cluster;
pub mod error_response;
pub mod filter;
pub mod ip_policy;
pub mod mapping;
pub mod ratelimit;
pub mod resolver;
pub mod store;
pub mod tcp;
pub mod tls;

pub use ambassador::{AmbassadorModule, IrListener};
pub use cluster::{ClusterEnv, IrCluster};
pub use filter::IrFilter;
pub use mapping::{IrRoute, MappingGroup};
pub use resolver::{ResolverSet, Target};
pub use store::{ResourceStore, SOURCE_INTERNAL, Source};
pub use tcp::{IrTcpRoute, TcpMappingGroup};
pub use tls::IrTlsContext;

use crate::config::Settings;
use crate::diag::{ErrorLog, IntermediateSource};
use auth::IrAuth;
use error_response::IrErrorResponse;
use ip_policy::IrIpAllowDeny;
use cluster::ClusterRequest;
use mapping::{IrMapping, RouteCluster};
use ratelimit::IrRateLimit;
use tcp::IrTcpMapping;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Prefix selecting a route group in [`Ir::intermediate_for`]
pub const GROUP_KEY_PREFIX: &str = "grp-";

/// Where an IR element came from and which sources contributed to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provenance {
    #[serde(rename = "_source")]
    pub source: String,
    #[serde(rename = "_referenced_by")]
    pub referenced_by: BTreeSet<String>,
}

impl Provenance {
    pub fn new(rkey: &str) -> Self {
        Self {
            source: rkey.to_string(),
            referenced_by: BTreeSet::from([rkey.to_string()]),
        }
    }

    /// Provenance of defaults nothing declared
    pub fn internal() -> Self {
        Self::new(SOURCE_INTERNAL)
    }

    pub fn is_internal(&self) -> bool {
        self.source == SOURCE_INTERNAL
    }

    pub fn reference(&mut self, rkey: &str) {
        self.referenced_by.insert(rkey.to_string());
    }

    pub fn absorb(&mut self, other: &Provenance) {
        self.referenced_by
            .extend(other.referenced_by.iter().cloned());
    }
}

/// The compiled gateway configuration
#[derive(Debug, Clone)]
pub struct Ir {
    settings: Arc<Settings>,
    store: ResourceStore,
    pub ambassador: AmbassadorModule,
    pub listener: IrListener,
    pub tls_contexts: BTreeMap<String, IrTlsContext>,
    pub filters: Vec<IrFilter>,
    /// Mapping groups in route order
    pub groups: Vec<MappingGroup>,
    pub routes: Vec<IrRoute>,
    pub tcp_groups: Vec<TcpMappingGroup>,
    pub tcp_routes: Vec<IrTcpRoute>,
    pub resolvers: ResolverSet,
    pub clusters: BTreeMap<String, IrCluster>,
    errors: ErrorLog,
}

impl Ir {
    /// Compile `store`. Problems are posted to the IR's error log, never returned.
    pub fn compile(store: ResourceStore, settings: Arc<Settings>, log: ErrorLog) -> Self {
        let mut log = log;

        let ambassador = AmbassadorModule::from_store(&store, &mut log);
        let listener = IrListener::from_module(&ambassador);
        let tls_contexts = tls::load_tls_contexts(&store, &mut log);
        let resolvers = ResolverSet::load(&store, &mut log);

        let mut clusters = BTreeMap::new();
        let env = ClusterEnv {
            module: &ambassador,
            tls_contexts: &tls_contexts,
            enable_endpoints: settings.enable_endpoints,
        };

        let filters = build_filters(&store, &ambassador, env, &mut clusters, &mut log);
        let mut groups = build_groups(&store, &ambassador, &resolvers, &mut log);
        let mut routes = build_routes(&groups, env, &mut clusters, &mut log);

        groups.sort_by(MappingGroup::route_order);
        let position: BTreeMap<&str, usize> = groups
            .iter()
            .enumerate()
            .map(|(i, group)| (group.group_id.as_str(), i))
            .collect();
        routes.sort_by_key(|route| position.get(route.group_id.as_str()).copied());

        let tcp_groups = build_tcp_groups(&store, &ambassador, &resolvers, &mut log);
        let tcp_routes = build_tcp_routes(&tcp_groups, env, &mut clusters, &mut log);

        for cluster in clusters.values_mut() {
            resolvers.resolve_targets(cluster, &store, &ambassador, &mut log);
        }

        tracing::info!(
            "compiled {} clusters, {} routes, {} TCP routes, {} filters ({} errors)",
            clusters.len(),
            routes.len(),
            tcp_routes.len(),
            filters.len(),
            log.error_count()
        );

        Self {
            settings,
            store,
            ambassador,
            listener,
            tls_contexts,
            filters,
            groups,
            routes,
            tcp_groups,
            tcp_routes,
            resolvers,
            clusters,
            errors: log,
        }
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn store(&self) -> &ResourceStore {
        &self.store
    }

    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    /// The whole IR, as the diagnostics layer sees it
    pub fn overview(&self) -> Value {
        let mut overview = Map::new();
        overview.insert("sources".to_string(), Value::Array(self.source_files()));
        for (kind, elements) in self.element_lists() {
            overview.insert(kind.to_string(), Value::Array(elements));
        }
        Value::Object(overview)
    }

    /// The slice of the IR contributed by `key`.
    ///
    /// `key` is `grp-<group_id>`, a source filename, or a single rkey.
    pub fn intermediate_for(&self, key: &str) -> Value {
        let keys: BTreeSet<String> = if let Some(group_id) = key.strip_prefix(GROUP_KEY_PREFIX) {
            let http = self
                .routes
                .iter()
                .filter(|r| r.group_id == group_id)
                .map(|r| &r.provenance);
            let tcp = self
                .tcp_routes
                .iter()
                .filter(|r| r.group_id == group_id)
                .map(|r| &r.provenance);
            let keys: BTreeSet<String> = http
                .chain(tcp)
                .flat_map(|p| {
                    std::iter::once(p.source.clone()).chain(p.referenced_by.iter().cloned())
                })
                .collect();
            if keys.is_empty() {
                return json!({"error": format!("No group matches {}", group_id)});
            }
            keys
        } else if let Some(rkeys) = self.store.location(key) {
            rkeys.iter().cloned().collect()
        } else if self.store.sources().contains_key(key) {
            BTreeSet::from([key.to_string()])
        } else {
            return json!({"error": format!("No source matches {}", key)});
        };

        let mut fragment = Map::new();

        let sources: Vec<Value> = keys
            .iter()
            .filter_map(|rkey| self.store.sources().get(rkey))
            .map(|source| self.source_element(source))
            .collect();
        if !sources.is_empty() {
            fragment.insert("sources".to_string(), Value::Array(sources));
        }

        for (kind, elements) in self.element_lists() {
            let selected: Vec<Value> = elements
                .into_iter()
                .filter(|element| touches(element, &keys))
                .collect();
            if !selected.is_empty() {
                fragment.insert(kind.to_string(), Value::Array(selected));
            }
        }

        Value::Object(fragment)
    }

    fn element_lists(&self) -> Vec<(&'static str, Vec<Value>)> {
        vec![
            ("clusters", to_values(self.clusters.values())),
            (
                "filters",
                self.filters.iter().map(IrFilter::to_overview).collect(),
            ),
            ("listeners", to_values(std::iter::once(&self.listener))),
            ("routes", to_values(self.routes.iter())),
            ("tcp_routes", to_values(self.tcp_routes.iter())),
            ("tls_contexts", to_values(self.tls_contexts.values())),
        ]
    }

    fn object_errors(&self, rkey: &str) -> Value {
        serde_json::to_value(self.errors.errors_for(rkey)).unwrap_or_else(|_| json!([]))
    }

    /// One source object, as it appears in a fragment
    fn source_element(&self, source: &Source) -> Value {
        let mut element = json!({
            "_source": source.rkey,
            "_referenced_by": [source.rkey],
            "filename": source.filename,
            "kind": source.kind,
            "errors": self.object_errors(&source.rkey),
        });
        if let (Some(obj), Some(index)) = (element.as_object_mut(), source.index) {
            obj.insert("index".to_string(), json!(index));
        }
        element
    }

    /// Sources grouped into their files, sorted by filename
    fn source_files(&self) -> Vec<Value> {
        let mut files: BTreeMap<&str, Vec<&Source>> = BTreeMap::new();
        for source in self.store.sources().values() {
            files.entry(source.filename.as_str()).or_default().push(source);
        }

        files
            .into_iter()
            .map(|(filename, sources)| {
                let mut objects = Map::new();
                let mut error_count = 0;
                for source in &sources {
                    error_count += self.errors.errors_for(&source.rkey).len();
                    objects.insert(
                        source.rkey.clone(),
                        json!({
                            "errors": self.object_errors(&source.rkey),
                            "key": source.rkey,
                            "kind": source.kind,
                        }),
                    );
                }
                source_file_entry(filename, sources.len(), error_count, objects)
            })
            .collect()
    }
}

impl IntermediateSource for Ir {
    fn overview(&self) -> Value {
        Ir::overview(self)
    }

    fn intermediate_for(&self, key: &str) -> Value {
        Ir::intermediate_for(self, key)
    }
}

/// A source file summary; shared with the reconstitution in `diag::paranoia`
pub(crate) fn source_file_entry(
    filename: &str,
    count: usize,
    error_count: usize,
    objects: Map<String, Value>,
) -> Value {
    json!({
        "count": count,
        "error_count": error_count,
        "error_plural": if error_count == 1 { "error" } else { "errors" },
        "filename": filename,
        "objects": objects,
        "plural": if count == 1 { "object" } else { "objects" },
    })
}

fn to_values<'a, T: Serialize + 'a>(items: impl Iterator<Item = &'a T>) -> Vec<Value> {
    items
        .filter_map(|item| serde_json::to_value(item).ok())
        .collect()
}

/// True if `element` came from, or is referenced by, any of `keys`
fn touches(element: &Value, keys: &BTreeSet<String>) -> bool {
    let from_source = element
        .get("_source")
        .and_then(Value::as_str)
        .is_some_and(|source| keys.contains(source));

    from_source
        || element
            .get("_referenced_by")
            .and_then(Value::as_array)
            .is_some_and(|refs| {
                refs.iter()
                    .filter_map(Value::as_str)
                    .any(|r| keys.contains(r))
            })
}

/// Add `cluster`, merging into an existing cluster of the same name.
///
/// Returns the name routes should use.
fn add_cluster(
    clusters: &mut BTreeMap<String, IrCluster>,
    cluster: IrCluster,
    log: &mut ErrorLog,
) -> String {
    let name = cluster.name.clone();
    match clusters.get_mut(&name) {
        Some(existing) => {
            if let Err(e) = existing.merge(&cluster) {
                log.post_error(Some(&existing.provenance.source), e.clone());
                log.post_error(Some(&cluster.provenance.source), e);
            }
        }
        None => {
            tracing::debug!("new cluster {} from {}", name, cluster.provenance.source);
            clusters.insert(name.clone(), cluster);
        }
    }
    name
}

fn build_filters(
    store: &ResourceStore,
    ambassador: &AmbassadorModule,
    env: ClusterEnv<'_>,
    clusters: &mut BTreeMap<String, IrCluster>,
    log: &mut ErrorLog,
) -> Vec<IrFilter> {
    let mut filters = Vec::new();

    if let Some(mut auth) = IrAuth::load(store, ambassador.circuit_breakers.as_ref(), log) {
        match auth.build_cluster(env, log) {
            Some(cluster) => {
                add_cluster(clusters, cluster, log);
                filters.push(IrFilter::Auth(auth));
            }
            None => tracing::warn!("AuthService from {} has no usable cluster", auth.provenance.source),
        }
    }

    if let Some(mut ratelimit) = IrRateLimit::load(store, log) {
        match ratelimit.build_cluster(env, log) {
            Some(cluster) => {
                add_cluster(clusters, cluster, log);
                filters.push(IrFilter::RateLimit(ratelimit));
            }
            None => tracing::warn!(
                "RateLimitService from {} has no usable cluster",
                ratelimit.provenance.source
            ),
        }
    }

    if let Some(response) = IrErrorResponse::load(ambassador, log) {
        filters.push(IrFilter::ErrorResponse(response));
    }

    if let Some(policy) = IrIpAllowDeny::load(ambassador, log) {
        filters.push(IrFilter::IpAllowDeny(policy));
    }

    filters
}

/// Group mappings by `group_id`, in declaration order
fn build_groups(
    store: &ResourceStore,
    ambassador: &AmbassadorModule,
    resolvers: &ResolverSet,
    log: &mut ErrorLog,
) -> Vec<MappingGroup> {
    let mut groups: Vec<MappingGroup> = Vec::new();
    let mut index: BTreeMap<String, usize> = BTreeMap::new();

    for config in store.configs("mappings") {
        let Some(mapping) = IrMapping::from_config(config, ambassador, log) else {
            continue;
        };
        if !resolvers.accepts(&mapping.rkey, &mapping.cluster, ambassador, log) {
            continue;
        }

        match index.get(&mapping.group_id) {
            Some(&i) => {
                let rkey = mapping.rkey.clone();
                if let Err(e) = groups[i].add(mapping) {
                    log.post_error(Some(&rkey), e);
                }
            }
            None => {
                index.insert(mapping.group_id.clone(), groups.len());
                groups.push(MappingGroup::new(mapping));
            }
        }
    }

    groups
}

/// Build and add the clusters of one group's mappings, weighted.
///
/// `None` if nothing in the group is routable or the weights don't normalize.
fn group_clusters<'m>(
    group_id: &str,
    provenance: &Provenance,
    label: &str,
    members: impl Iterator<Item = (&'m str, &'m ClusterRequest, Option<u32>)>,
    env: ClusterEnv<'_>,
    clusters: &mut BTreeMap<String, IrCluster>,
    log: &mut ErrorLog,
) -> Option<Vec<RouteCluster>> {
    let mut names = Vec::new();
    let mut requested = Vec::new();

    for (rkey, request, weight) in members {
        let (cluster, errors) = IrCluster::new(rkey, request.clone(), env);
        for error in errors {
            log.post_error(Some(rkey), error);
        }
        if cluster.ignore {
            continue;
        }
        names.push(add_cluster(clusters, cluster, log));
        requested.push(weight);
    }

    if names.is_empty() {
        tracing::debug!("group {} has no usable clusters", group_id);
        return None;
    }

    let Some(weights) = mapping::weights(requested.iter().copied()) else {
        log.post_error(
            Some(&provenance.source),
            format!("Could not normalize mapping weights, ignoring {}", label),
        );
        return None;
    };

    Some(
        names
            .into_iter()
            .zip(weights)
            .map(|(name, weight)| RouteCluster { name, weight })
            .collect(),
    )
}

fn build_routes(
    groups: &[MappingGroup],
    env: ClusterEnv<'_>,
    clusters: &mut BTreeMap<String, IrCluster>,
    log: &mut ErrorLog,
) -> Vec<IrRoute> {
    let mut routes = Vec::new();

    for group in groups {
        let first = &group.mappings[0];
        let members = group
            .mappings
            .iter()
            .map(|m| (m.rkey.as_str(), &m.cluster, m.weight));
        let label = format!("route {}", first.prefix);

        let Some(route_clusters) =
            group_clusters(&group.group_id, &group.provenance, &label, members, env, clusters, log)
        else {
            continue;
        };

        routes.push(IrRoute {
            provenance: group.provenance.clone(),
            group_id: group.group_id.clone(),
            name: first.name.clone(),
            prefix: first.prefix.clone(),
            method: first.method.clone(),
            precedence: first.precedence,
            host: first.host.clone(),
            clusters: route_clusters,
        });
    }

    routes
}

/// Group TCPMappings by `group_id`, in declaration order
fn build_tcp_groups(
    store: &ResourceStore,
    ambassador: &AmbassadorModule,
    resolvers: &ResolverSet,
    log: &mut ErrorLog,
) -> Vec<TcpMappingGroup> {
    let mut groups: Vec<TcpMappingGroup> = Vec::new();
    let mut index: BTreeMap<String, usize> = BTreeMap::new();

    for config in store.configs("tcpmappings") {
        let Some(mapping) = IrTcpMapping::from_config(config, ambassador, log) else {
            continue;
        };
        if !resolvers.accepts(&mapping.rkey, &mapping.cluster, ambassador, log) {
            continue;
        }

        match index.get(&mapping.group_id) {
            Some(&i) => {
                let rkey = mapping.rkey.clone();
                if let Err(e) = groups[i].add(mapping) {
                    log.post_error(Some(&rkey), e);
                }
            }
            None => {
                index.insert(mapping.group_id.clone(), groups.len());
                groups.push(TcpMappingGroup::new(mapping));
            }
        }
    }

    groups
}

fn build_tcp_routes(
    groups: &[TcpMappingGroup],
    env: ClusterEnv<'_>,
    clusters: &mut BTreeMap<String, IrCluster>,
    log: &mut ErrorLog,
) -> Vec<IrTcpRoute> {
    let mut routes = Vec::new();

    for group in groups {
        let first = &group.mappings[0];
        let members = group
            .mappings
            .iter()
            .map(|m| (m.rkey.as_str(), &m.cluster, m.weight));
        let label = format!("TCP route {}", group.bind_to());

        let Some(route_clusters) =
            group_clusters(&group.group_id, &group.provenance, &label, members, env, clusters, log)
        else {
            continue;
        };

        routes.push(IrTcpRoute {
            provenance: group.provenance.clone(),
            group_id: group.group_id.clone(),
            name: first.name.clone(),
            bind_to: group.bind_to(),
            port: first.port,
            host: first.host.clone(),
            clusters: route_clusters,
        });
    }

    routes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::ResourceRecord;

    fn record(rkey: &str, object: Value) -> ResourceRecord {
        let object = object.as_object().cloned().unwrap_or_default();
        ResourceRecord {
            rkey: rkey.to_string(),
            location: rkey.to_string(),
            kind: object["kind"].as_str().unwrap_or_default().to_string(),
            name: object.get("name").and_then(Value::as_str).map(str::to_string),
            namespace: Some("default".to_string()),
            serialization: String::new(),
            object,
        }
    }

    fn mapping(rkey: &str, name: &str, prefix: &str, service: &str) -> ResourceRecord {
        record(
            rkey,
            json!({
                "apiVersion": "getambassador.io/v2",
                "kind": "Mapping",
                "name": name,
                "namespace": "default",
                "prefix": prefix,
                "service": service
            }),
        )
    }

    fn compile(records: Vec<ResourceRecord>) -> Ir {
        let settings = Arc::new(Settings::default());
        let mut log = ErrorLog::new();
        let store = ResourceStore::load(&records, settings.clone(), &mut log);
        Ir::compile(store, settings, log)
    }

    #[test]
    fn test_provenance() {
        let mut p = Provenance::new("a.yaml.1");
        p.reference("b.yaml.1");
        p.absorb(&Provenance::new("c.yaml.1"));

        assert_eq!(p.source, "a.yaml.1");
        assert_eq!(p.referenced_by.len(), 3);
        assert!(!p.is_internal());
        assert!(Provenance::internal().is_internal());
    }

    #[test]
    fn test_canary_shares_a_route() {
        let mut canary = mapping("qotm.yaml.2", "qotm-canary", "/qotm/", "qotm-canary");
        canary.object.insert("weight".to_string(), json!(10));

        let ir = compile(vec![mapping("qotm.yaml.1", "qotm", "/qotm/", "qotm"), canary]);

        assert!(ir.errors().is_empty());
        assert_eq!(ir.routes.len(), 1);
        let route = &ir.routes[0];
        assert_eq!(route.name, "qotm");
        assert_eq!(
            route.clusters,
            vec![
                RouteCluster { name: "cluster_qotm_default".to_string(), weight: 90 },
                RouteCluster { name: "cluster_qotm_canary_default".to_string(), weight: 10 },
            ]
        );
        assert_eq!(
            route.provenance.referenced_by,
            BTreeSet::from(["qotm.yaml.1".to_string(), "qotm.yaml.2".to_string()])
        );
    }

    #[test]
    fn test_shared_cluster_is_referenced_by_both_mappings() {
        let ir = compile(vec![
            mapping("a.yaml.1", "a", "/a/", "shared"),
            mapping("b.yaml.1", "b", "/b/", "shared"),
        ]);

        assert_eq!(ir.clusters.len(), 1);
        let cluster = &ir.clusters["cluster_shared_default"];
        assert_eq!(cluster.provenance.source, "a.yaml.1");
        assert!(cluster.provenance.referenced_by.contains("b.yaml.1"));
    }

    #[test]
    fn test_shared_cluster_source_ignores_route_order() {
        let ir = compile(vec![
            mapping("a.yaml.1", "a", "/a/", "shared"),
            mapping("b.yaml.1", "b", "/much/longer/prefix/", "shared"),
        ]);

        let order: Vec<&str> = ir.routes.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(order, vec!["b", "a"]);
        let groups: Vec<&str> = ir.groups.iter().map(|g| g.group_id.as_str()).collect();
        let routes: Vec<&str> = ir.routes.iter().map(|r| r.group_id.as_str()).collect();
        assert_eq!(groups, routes);
        assert_eq!(ir.clusters["cluster_shared_default"].provenance.source, "a.yaml.1");
    }

    #[test]
    fn test_clusters_default_to_dns_targets() {
        let ir = compile(vec![mapping("qotm.yaml.1", "qotm", "/qotm/", "qotm:5000")]);

        assert_eq!(
            ir.clusters["cluster_qotm_5000_default"].targets,
            Some(vec![Target {
                ip: "qotm".to_string(),
                port: 5000,
                target_kind: Some("DNSname".to_string()),
            }])
        );
    }

    #[test]
    fn test_resolver_rejects_load_balanced_service_mapping() {
        let mut balanced = mapping("lb.yaml.1", "lb", "/lb/", "qotm");
        balanced.object.insert("resolver".to_string(), json!("kubernetes-service"));
        balanced
            .object
            .insert("load_balancer".to_string(), json!({"policy": "round_robin"}));

        let ir = compile(vec![balanced]);

        assert!(ir.routes.is_empty());
        assert_eq!(
            ir.errors().errors_for("lb.yaml.1")[0].text,
            "No load_balancer setting is allowed with the KubernetesServiceResolver"
        );
    }

    #[test]
    fn test_tcp_mappings_share_a_route() {
        let tcp = |rkey: &str, name: &str, service: &str, weight: Option<u64>| {
            let mut record = record(
                rkey,
                json!({
                    "apiVersion": "getambassador.io/v2",
                    "kind": "TCPMapping",
                    "name": name,
                    "namespace": "default",
                    "port": 6379,
                    "service": service
                }),
            );
            if let Some(weight) = weight {
                record.object.insert("weight".to_string(), json!(weight));
            }
            record
        };

        let ir = compile(vec![
            tcp("redis.yaml.1", "redis", "redis:6379", None),
            tcp("redis.yaml.2", "redis-canary", "redis-canary:6379", Some(20)),
        ]);

        assert!(ir.errors().is_empty());
        assert_eq!(ir.tcp_routes.len(), 1);
        let route = &ir.tcp_routes[0];
        assert_eq!(route.bind_to, "0.0.0.0-6379");
        assert_eq!(
            route.clusters,
            vec![
                RouteCluster { name: "cluster_redis_6379_default".to_string(), weight: 80 },
                RouteCluster { name: "cluster_redis_canary_6379_default".to_string(), weight: 20 },
            ]
        );

        let by_group = ir.intermediate_for(&format!("grp-{}", route.group_id));
        assert_eq!(by_group["tcp_routes"][0]["name"], "redis");
        assert_eq!(by_group["clusters"].as_array().map(Vec::len), Some(2));
        assert_eq!(ir.overview()["tcp_routes"][0]["port"], 6379);
    }

    #[test]
    fn test_overview_defaults() {
        let ir = compile(vec![]);
        let overview = ir.overview();

        assert_eq!(overview["sources"], json!([]));
        assert_eq!(overview["filters"], json!([]));
        assert_eq!(
            overview["listeners"],
            json!([{
                "_source": "--internal--",
                "_referenced_by": ["--internal--"],
                "admin_port": 8001,
                "service_port": 80
            }])
        );
    }

    #[test]
    fn test_overview_source_files() {
        let ir = compile(vec![
            mapping("qotm.yaml.1", "qotm", "/qotm/", "qotm"),
            mapping("qotm.yaml.2", "broken", "", "qotm"),
        ]);
        let sources = &ir.overview()["sources"];

        assert_eq!(sources[0]["filename"], "qotm.yaml");
        assert_eq!(sources[0]["count"], 2);
        assert_eq!(sources[0]["plural"], "objects");
        assert_eq!(sources[0]["error_count"], 1);
        assert_eq!(sources[0]["error_plural"], "error");
        assert_eq!(
            sources[0]["objects"]["qotm.yaml.2"]["errors"][0]["text"],
            "Mapping broken is missing required prefix"
        );
    }

    #[test]
    fn test_intermediate_for_keys() {
        let ir = compile(vec![
            mapping("qotm.yaml.1", "qotm", "/qotm/", "qotm"),
            mapping("other.yaml.1", "other", "/other/", "other"),
        ]);

        let single = ir.intermediate_for("qotm.yaml.1");
        assert_eq!(single["sources"].as_array().map(Vec::len), Some(1));
        assert_eq!(single["clusters"][0]["name"], "cluster_qotm_default");
        assert_eq!(single["routes"][0]["prefix"], "/qotm/");
        assert!(single.get("listeners").is_none());

        let by_file = ir.intermediate_for("other.yaml");
        assert_eq!(by_file["sources"][0]["index"], 1);
        assert_eq!(by_file["clusters"][0]["name"], "cluster_other_default");

        let group_id = ir.routes[0].group_id.clone();
        let by_group = ir.intermediate_for(&format!("grp-{}", group_id));
        assert_eq!(by_group["routes"][0]["group_id"], group_id.as_str());

        assert_eq!(
            ir.intermediate_for("nope"),
            json!({"error": "No source matches nope"})
        );
        assert_eq!(
            ir.intermediate_for("grp-nope"),
            json!({"error": "No group matches nope"})
        );
    }
}
