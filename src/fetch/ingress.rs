//! Kubernetes Ingress translation
//!
//! IngressClasses controlled by the gateway are collected first; Ingresses that
//! name one of them (or carry the legacy class annotation) are turned into Host
//! resources for their TLS entries and Mappings for their backends and rules.

use super::context::{FetchContext, StatusUpdate};
use super::dependency::{Dependency, DependencyManager};
use super::processor::KubernetesProcessor;
use super::resource::{NormalizedObject, NormalizedResource};
use crate::models::{KubernetesObject, ResourceIdentity, ResourceKey};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

/// `spec.controller` of IngressClasses handled by this gateway
pub const INGRESS_CONTROLLER: &str = "getambassador.io/ingress-controller";

/// Legacy class annotation
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Label correlating the resources synthesized from one Ingress
pub const INGRESS_ID_LABEL: &str = "a10r-k8s-ingress";

const WILDCARD_LABEL_REGEX: &str = "^[a-z0-9]([-a-z0-9]*[a-z0-9])?";

/// Records IngressClasses whose controller is the gateway
#[derive(Debug, Default)]
pub struct IngressClassProcessor;

impl KubernetesProcessor for IngressClassProcessor {
    fn kinds(&self) -> BTreeSet<ResourceIdentity> {
        ["networking.k8s.io/v1beta1", "networking.k8s.io/v1"]
            .into_iter()
            .map(|version| ResourceIdentity::new(version, "IngressClass"))
            .collect()
    }

    fn declare(&self, deps: &mut DependencyManager) {
        deps.register("ingressclass")
            .provide(Dependency::IngressClasses);
    }

    fn admit(&self, obj: &KubernetesObject, cx: &FetchContext) -> bool {
        let controller = obj
            .spec()
            .get("controller")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();
        if controller != INGRESS_CONTROLLER {
            tracing::debug!(
                "ignoring IngressClass {} without controller - {}",
                obj.name(),
                INGRESS_CONTROLLER
            );
            return false;
        }

        if obj.ambassador_id() != cx.settings.ambassador_id {
            tracing::debug!(
                "IngressClass {} does not have Ambassador ID {}, ignoring...",
                obj.name(),
                cx.settings.ambassador_id
            );
            return false;
        }

        true
    }

    fn process(&mut self, obj: &KubernetesObject, cx: &mut FetchContext) {
        tracing::debug!(
            "Handling IngressClass {} with parameters {}",
            obj.name(),
            obj.spec().get("parameters").unwrap_or(&json!({}))
        );
        cx.incr_count("k8s_ingress_class");
        cx.deps.ingress_classes.insert(obj.name().to_string());
    }
}

/// A backend service reference in either Ingress schema
#[derive(Debug, Clone, PartialEq)]
struct Backend {
    service: String,
    port: Value,
}

impl Backend {
    /// `serviceName`/`servicePort` (v1beta1) or `service.name`/`service.port` (v1)
    fn from_value(backend: &Value) -> Option<Self> {
        if let Some(service) = backend.get("serviceName").and_then(Value::as_str) {
            let port = backend.get("servicePort")?.clone();
            return Some(Self {
                service: service.to_string(),
                port,
            });
        }

        let service = backend.get("service")?;
        let name = service.get("name").and_then(Value::as_str)?;
        let port = service.get("port")?;
        let port = port
            .get("number")
            .or_else(|| port.get("name"))
            .cloned()?;

        Some(Self {
            service: name.to_string(),
            port,
        })
    }
}

/// Translate a `*.example.com` host into an anchored regex
pub fn wildcard_host_regex(host: &str) -> String {
    format!(
        "{}$",
        host.replace('.', "\\.").replacen('*', WILDCARD_LABEL_REGEX, 1)
    )
}

/// Synthesizes Hosts and Mappings from Ingresses
#[derive(Debug, Default)]
pub struct IngressProcessor;

impl IngressProcessor {
    /// Resolve a named service port through the discovered Service, leaving it
    /// unchanged when it cannot be found
    fn resolve_service_port(cx: &FetchContext, namespace: &str, service: &str, port: &Value) -> Value {
        if let Some(n) = port.as_i64() {
            return json!(n);
        }
        if let Some(n) = port.as_str().and_then(|p| p.parse::<i64>().ok()) {
            return json!(n);
        }

        tracing::debug!("Resolving named port '{}' in service '{}'", port, service);

        let key = ResourceKey::new(
            ResourceIdentity::new("v1", "Service"),
            Some(namespace.to_string()),
            service,
        );
        let Some(svc) = cx.deps.service.discovered_services.get(&key) else {
            tracing::debug!("Could not find service '{}'", service);
            return port.clone();
        };

        let ports = svc
            .spec()
            .get("ports")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for svc_port in ports {
            if svc_port.get("name") == Some(port) {
                return svc_port.get("port").cloned().unwrap_or_else(|| port.clone());
            }
        }

        tracing::debug!("Could not find port '{}' in service '{}'", port, service);
        port.clone()
    }

    fn update_status(obj: &KubernetesObject, cx: &mut FetchContext) {
        let namespace = obj.namespace_opt().unwrap_or("default").to_string();

        let service_status = match &cx.deps.service.ambassador_service {
            Some(svc) => Some(svc.status().clone()),
            None => {
                tracing::error!(
                    "Unable to set Ingress {}'s load balancer, could not find Ambassador service",
                    obj.name()
                );
                None
            }
        };

        match service_status {
            Some(status) if !status.is_null() && *obj.status() != status => {
                let update = StatusUpdate {
                    kind: obj.kind().to_string(),
                    namespace: namespace.clone(),
                    status,
                };
                tracing::debug!("Updating Ingress {} status to {:?}", obj.name(), update);
                cx.k8s_status_updates
                    .insert(format!("{}.{}", obj.name(), namespace), update);
            }
            Some(_) => tracing::debug!(
                "Not reconciling Ingress {}: observed and current statuses are in sync",
                obj.name()
            ),
            None => {}
        }
    }
}

fn string_to_port(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_missing(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_i64() == Some(0),
        _ => false,
    }
}

impl KubernetesProcessor for IngressProcessor {
    fn kinds(&self) -> BTreeSet<ResourceIdentity> {
        [
            "extensions/v1beta1",
            "networking.k8s.io/v1beta1",
            "networking.k8s.io/v1",
        ]
        .into_iter()
        .map(|version| ResourceIdentity::new(version, "Ingress"))
        .collect()
    }

    fn declare(&self, deps: &mut DependencyManager) {
        deps.register("ingress")
            .want(Dependency::Secret)
            .want(Dependency::Service)
            .want(Dependency::IngressClasses);
    }

    fn admit(&self, obj: &KubernetesObject, cx: &FetchContext) -> bool {
        let class_name = obj
            .spec()
            .get("ingressClassName")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let has_ingress_class = cx.deps.ingress_classes.contains(class_name);
        let has_class_annotation = obj
            .annotation(INGRESS_CLASS_ANNOTATION)
            .is_some_and(|class| class.to_lowercase() == "ambassador");

        if !(has_ingress_class || has_class_annotation) {
            tracing::debug!(
                "ignoring Ingress {} without annotation ({}: \"ambassador\") or IngressClass controller ({})",
                obj.name(),
                INGRESS_CLASS_ANNOTATION,
                INGRESS_CONTROLLER
            );
            return false;
        }

        if obj.ambassador_id() != cx.settings.ambassador_id {
            tracing::debug!(
                "Ingress {} does not have Ambassador ID {}, ignoring...",
                obj.name(),
                cx.settings.ambassador_id
            );
            return false;
        }

        true
    }

    fn process(&mut self, obj: &KubernetesObject, cx: &mut FetchContext) {
        tracing::debug!("Handling Ingress {}...", obj.name());
        cx.incr_count("k8s_ingress");

        let name = obj.name();
        let namespace = obj.namespace_opt().unwrap_or("default");
        let ambassador_id = obj.ambassador_id().to_string();
        let spec = obj.spec();

        // Only Ingresses that define a Host get an id to match their Mappings with
        let mut ingress_id: Option<String> = None;

        let tls_entries = spec.get("tls").and_then(Value::as_array).cloned().unwrap_or_default();
        for (tls_count, tls) in tls_entries.iter().enumerate() {
            let id = format!("a10r-ingress-{}-{}", name, namespace);
            ingress_id = Some(id.clone());

            let Some(secret) = tls.get("secretName").and_then(Value::as_str) else {
                continue;
            };

            let hosts: Vec<String> = match tls.get("hosts").and_then(Value::as_array) {
                Some(hosts) => hosts.iter().filter_map(Value::as_str).map(str::to_string).collect(),
                None => vec!["*".to_string()],
            };

            for (host_count, host) in hosts.iter().enumerate() {
                let host_spec = json!({
                    "ambassador_id": [ambassador_id],
                    "hostname": host,
                    "acmeProvider": {"authority": "none"},
                    "tlsSecret": {"name": secret},
                    "selector": {"matchLabels": {INGRESS_ID_LABEL: id}},
                    "requestPolicy": {"insecure": {"action": "Route"}},
                });

                let object = NormalizedObject::new("Host", format!("{}-{}-{}", name, tls_count, host_count))
                    .namespace(namespace)
                    .labels(obj.labels())
                    .spec(host_spec);

                tracing::debug!("Generated Host from ingress {}: {:?}", name, object);
                cx.emit(NormalizedResource::from_data(object, None));
            }
        }

        let mut mapping_labels: BTreeMap<String, String> = obj.labels();
        if let Some(id) = &ingress_id {
            mapping_labels.insert(INGRESS_ID_LABEL.to_string(), id.clone());
        }

        let default_backend = spec
            .get("defaultBackend")
            .or_else(|| spec.get("backend"))
            .and_then(Backend::from_value);
        if let Some(backend) = default_backend {
            let object = NormalizedObject::new("Mapping", format!("{}-default-backend", name))
                .namespace(namespace)
                .labels(mapping_labels.clone())
                .spec(json!({
                    "ambassador_id": ambassador_id,
                    "hostname": "*",
                    "prefix": "/",
                    "service": format!("{}.{}:{}", backend.service, namespace, string_to_port(&backend.port)),
                }));

            tracing::debug!("Generated Mapping from Ingress {}: {:?}", name, object);
            cx.emit(NormalizedResource::from_data(object, None));
        }

        let rules = spec.get("rules").and_then(Value::as_array).cloned().unwrap_or_default();
        for (rule_count, rule) in rules.iter().enumerate() {
            let rule_host = rule.get("host").and_then(Value::as_str);
            let paths = rule
                .pointer("/http/paths")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            for (path_count, path) in paths.iter().enumerate() {
                let path_type = path
                    .get("pathType")
                    .and_then(Value::as_str)
                    .unwrap_or("ImplementationSpecific");
                let location = path.get("path").and_then(Value::as_str).unwrap_or("/");

                let Some(backend) = path.get("backend").and_then(Backend::from_value) else {
                    continue;
                };
                let port = Self::resolve_service_port(cx, namespace, &backend.service, &backend.port);

                if backend.service.is_empty() || is_missing(&port) || location.is_empty() {
                    continue;
                }

                // Exact paths are evaluated before prefixes
                let is_exact = path_type == "Exact";
                let precedence = if is_exact { 1 } else { 0 };
                let mut mapping_spec = json!({
                    "ambassador_id": ambassador_id,
                    "prefix": location,
                    "prefix_exact": is_exact,
                    "precedence": precedence,
                    "service": format!("{}.{}:{}", backend.service, namespace, string_to_port(&port)),
                });

                if let Some(fields) = mapping_spec.as_object_mut() {
                    match rule_host {
                        Some(host) if host.starts_with("*.") => {
                            fields.insert("host".to_string(), json!(wildcard_host_regex(host)));
                            fields.insert("host_regex".to_string(), json!(true));
                        }
                        Some(host) => {
                            fields.insert("hostname".to_string(), json!(host));
                        }
                        // Without a Host to select it the Mapping would be dropped
                        None if ingress_id.is_none() => {
                            fields.insert("hostname".to_string(), json!("*"));
                        }
                        None => {}
                    }
                }

                let object = NormalizedObject::new("Mapping", format!("{}-{}-{}", name, rule_count, path_count))
                    .namespace(namespace)
                    .labels(mapping_labels.clone())
                    .spec(mapping_spec);

                tracing::debug!("Generated Mapping from Ingress {}: {:?}", name, object);
                cx.emit(NormalizedResource::from_data(object, None));
            }
        }

        Self::update_status(obj, cx);
    }
}
