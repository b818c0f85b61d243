//! Service and Endpoints resolution
//!
//! Services are remembered as they arrive (Ingress and Knative processing look
//! them up), Endpoints are reduced to addresses and a port table, and the two are
//! joined in `finalize` into normalized `Service` resources carrying endpoints.
//!
//! Port resolution follows what Kubernetes itself appears to do: a single
//! endpoint port always wins; otherwise `targetPort`, then the port name, then
//! the port number are looked up, falling back to the first numeric key.

use super::context::FetchContext;
use super::dependency::{Dependency, DependencyManager};
use super::processor::KubernetesProcessor;
use super::resource::{NormalizedObject, NormalizedResource};
use crate::models::{KubernetesObject, ResourceIdentity, ResourceKey};
use k8s_openapi::api::core::v1::{Endpoints, Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Label marking the gateway's own Service
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
const AMBASSADOR_SERVICE_COMPONENT: &str = "ambassador-service";
const HELM_CHART_LABEL: &str = "helm.sh/chart";

/// Addresses and port table extracted from one Endpoints object
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredEndpoints {
    pub addresses: Vec<String>,
    /// Port number by both its name and its number as a string
    pub ports: BTreeMap<String, i32>,
}

struct DiscoveredService {
    key: ResourceKey,
    object: KubernetesObject,
    service: Service,
}

/// Handles `v1 Service`
#[derive(Default)]
struct ServiceDiscovery {
    helm_chart: Option<String>,
    discovered: Vec<DiscoveredService>,
}

impl ServiceDiscovery {
    fn is_ambassador_service(obj: &KubernetesObject, service: &Service, cx: &FetchContext) -> bool {
        let labels = obj.labels();
        let component = labels
            .get(COMPONENT_LABEL)
            .map(|c| c.to_lowercase())
            .unwrap_or_default();
        if component != AMBASSADOR_SERVICE_COMPONENT {
            return false;
        }

        if obj.namespace_opt() != Some(cx.settings.ambassador_namespace.as_str()) {
            return false;
        }

        let selector = service
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.as_ref());
        match selector {
            Some(selector) if !selector.is_empty() => selector
                .iter()
                .all(|(key, value)| cx.settings.pod_labels.get(key) == Some(value)),
            _ => false,
        }
    }
}

impl KubernetesProcessor for ServiceDiscovery {
    fn kinds(&self) -> BTreeSet<ResourceIdentity> {
        [ResourceIdentity::new("v1", "Service")].into_iter().collect()
    }

    fn process(&mut self, obj: &KubernetesObject, cx: &mut FetchContext) {
        let service: Service = match serde_json::from_value(obj.to_value()) {
            Ok(service) => service,
            Err(e) => {
                tracing::warn!("could not read Kubernetes Service {}: {}", obj.name(), e);
                return;
            }
        };

        if self.helm_chart.is_none() {
            self.helm_chart = obj.labels().get(HELM_CHART_LABEL).cloned();
        }

        let has_ports = service
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref())
            .is_some_and(|ports| !ports.is_empty());
        if !has_ports {
            tracing::debug!(
                "not saving Kubernetes Service {}.{} with no ports",
                obj.name(),
                obj.namespace_opt().unwrap_or_default()
            );
            return;
        }

        if Self::is_ambassador_service(obj, &service, cx) {
            tracing::debug!("Found Ambassador service: {}", obj.name());
            cx.deps.service.ambassador_service = Some(obj.clone());
        }

        let key = obj.key();
        cx.deps
            .service
            .discovered_services
            .insert(key.clone(), obj.clone());

        let discovered = DiscoveredService {
            key,
            object: obj.clone(),
            service,
        };
        match self.discovered.iter_mut().find(|d| d.key == discovered.key) {
            Some(existing) => *existing = discovered,
            None => self.discovered.push(discovered),
        }
    }
}

/// Handles `v1 Endpoints`
#[derive(Default)]
struct EndpointsDiscovery {
    discovered: BTreeMap<ResourceKey, DiscoveredEndpoints>,
}

impl KubernetesProcessor for EndpointsDiscovery {
    fn kinds(&self) -> BTreeSet<ResourceIdentity> {
        [ResourceIdentity::new("v1", "Endpoints")].into_iter().collect()
    }

    fn process(&mut self, obj: &KubernetesObject, _cx: &mut FetchContext) {
        let endpoints: Endpoints = match serde_json::from_value(obj.to_value()) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                tracing::warn!("could not read Kubernetes Endpoints {}: {}", obj.name(), e);
                return;
            }
        };

        let subsets = endpoints.subsets.unwrap_or_default();
        if subsets.is_empty() {
            tracing::debug!("ignoring Kubernetes Endpoints {} with no subsets", obj.name());
            return;
        }

        // Every address is assumed to listen on every port of its subset
        for subset in subsets {
            let addresses: Vec<String> = subset
                .addresses
                .unwrap_or_default()
                .into_iter()
                .map(|address| address.ip)
                .filter(|ip| !ip.is_empty())
                .collect();

            if addresses.is_empty() {
                continue;
            }

            let mut ports = BTreeMap::new();
            for port in subset.ports.unwrap_or_default() {
                let protocol = port.protocol.as_deref().unwrap_or("TCP").to_uppercase();
                if protocol != "TCP" {
                    continue;
                }

                ports.insert(port.port.to_string(), port.port);
                if let Some(name) = port.name.filter(|n| !n.is_empty()) {
                    ports.insert(name, port.port);
                }
            }

            if ports.is_empty() {
                tracing::debug!(
                    "ignoring K8s Endpoints {} with no routable ports",
                    obj.name()
                );
                continue;
            }

            self.discovered
                .insert(obj.key(), DiscoveredEndpoints { addresses, ports });
        }
    }
}

/// Emits normalized `Service` resources from Services joined with Endpoints
#[derive(Default)]
pub struct ServiceProcessor {
    services: ServiceDiscovery,
    endpoints: EndpointsDiscovery,
}

impl ServiceProcessor {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Resolve the endpoint port for one Service port.
///
/// Returns `None` when the port entry has nothing to look up at all.
pub fn resolve_target_port(port: &ServicePort, endpoint_ports: &BTreeMap<String, i32>) -> Option<i32> {
    if endpoint_ports.len() == 1 {
        return endpoint_ports.values().next().copied();
    }

    let target = port.target_port.as_ref().map(|target| match target {
        IntOrString::Int(n) => n.to_string(),
        IntOrString::String(s) => s.clone(),
    });
    let candidates = [
        target,
        port.name.clone(),
        Some(port.port.to_string()),
    ];

    let mut found_key = false;
    let mut fallback: Option<i32> = None;

    for key in candidates.into_iter().flatten() {
        if key.is_empty() || key == "0" {
            continue;
        }
        found_key = true;

        if fallback.is_none() && key.chars().all(|c| c.is_ascii_digit()) {
            fallback = key.parse().ok();
        }

        if let Some(&target) = endpoint_ports.get(&key).filter(|t| **t != 0) {
            return Some(target);
        }
    }

    if !found_key {
        return None;
    }

    Some(fallback.unwrap_or(port.port))
}

impl KubernetesProcessor for ServiceProcessor {
    fn kinds(&self) -> BTreeSet<ResourceIdentity> {
        let mut kinds = self.services.kinds();
        kinds.extend(self.endpoints.kinds());
        kinds
    }

    fn declare(&self, deps: &mut DependencyManager) {
        deps.register("service").provide(Dependency::Service);
    }

    fn process(&mut self, obj: &KubernetesObject, cx: &mut FetchContext) {
        self.services.try_process(obj, cx);
        self.endpoints.try_process(obj, cx);
    }

    fn finalize(&mut self, cx: &mut FetchContext) {
        let watch_only = cx.settings.watch_only;

        for discovered in &self.services.discovered {
            let name = discovered.object.name();
            let namespace = discovered.object.namespace_opt().unwrap_or("default");
            let key = format!("{}.{}", name, namespace);

            let mut target_ports: Vec<(i32, i32)> = Vec::new();
            let mut target_addrs: Vec<String> = Vec::new();

            if !watch_only {
                let endpoints_key = ResourceKey::new(
                    ResourceIdentity::new("v1", "Endpoints"),
                    discovered.key.namespace.clone(),
                    name,
                );

                match self.endpoints.discovered.get(&endpoints_key) {
                    None => tracing::debug!("{}: no endpoints at all", key),
                    Some(endpoints) => {
                        let ports = discovered
                            .service
                            .spec
                            .as_ref()
                            .and_then(|spec| spec.ports.as_deref())
                            .unwrap_or_default();

                        for (idx, port) in ports.iter().enumerate() {
                            if port.port == 0 {
                                tracing::error!(
                                    "Kubernetes service {} has no port number at index {}?",
                                    key,
                                    idx
                                );
                                continue;
                            }

                            match resolve_target_port(port, &endpoints.ports) {
                                Some(target) => {
                                    tracing::debug!(
                                        "{} port {} #{}: -> {}",
                                        key,
                                        port.port,
                                        idx,
                                        target
                                    );
                                    match target_ports.iter_mut().find(|(src, _)| *src == port.port) {
                                        Some(existing) => existing.1 = target,
                                        None => target_ports.push((port.port, target)),
                                    }
                                }
                                None => tracing::error!(
                                    "Kubernetes service {} port {} has an empty port spec at index {}?",
                                    key,
                                    port.port,
                                    idx
                                ),
                            }
                        }

                        if target_ports.is_empty() {
                            tracing::error!(
                                "Kubernetes service {} has no routable ports at all?",
                                key
                            );
                        }

                        target_addrs.extend(endpoints.addresses.iter().cloned());
                    }
                }
            }

            if target_addrs.is_empty() {
                if !watch_only {
                    tracing::debug!("{} falling back to service routing", key);
                }
                target_addrs.push(key.clone());
            }

            let mut svc_endpoints = Map::new();
            for (src_port, target_port) in &target_ports {
                let targets: Vec<Value> = target_addrs
                    .iter()
                    .map(|ip| json!({"ip": ip, "port": target_port}))
                    .collect();
                svc_endpoints.insert(src_port.to_string(), Value::Array(targets));
            }

            let mut spec = json!({
                "ambassador_id": cx.settings.ambassador_id,
                "endpoints": svc_endpoints,
            });
            if let (Some(chart), Some(spec)) = (&self.services.helm_chart, spec.as_object_mut()) {
                spec.insert("helm_chart".to_string(), json!(chart));
            }

            let object = NormalizedObject::new("Service", name)
                .namespace(namespace)
                .labels(discovered.object.labels())
                .spec(spec);

            cx.emit(NormalizedResource::from_data(
                object,
                Some(format!("k8s-{}-{}", name, namespace)),
            ));
        }
    }
}
