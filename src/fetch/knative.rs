//! Knative Ingress translation
//!
//! Each `(host, split)` combination of a Knative Ingress rule becomes one
//! Mapping. Status is written back so Knative can route through the gateway.

use super::context::{FetchContext, StatusUpdate};
use super::dependency::{Dependency, DependencyManager};
use super::processor::KubernetesProcessor;
use super::resource::{NormalizedObject, NormalizedResource};
use crate::models::{KubernetesObject, ResourceIdentity};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Ingress class handled by this gateway
pub const KNATIVE_INGRESS_CLASS: &str = "ambassador.ingress.networking.knative.dev";

/// Annotation selecting a Knative ingress implementation
pub const KNATIVE_CLASS_ANNOTATION: &str = "networking.knative.dev/ingress.class";

const DEFAULT_TIMEOUT: &str = "15s";

static DURATION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)(ns|us|µs|ms|s|m|h)")
        .expect("DURATION_REGEX should be a valid regex pattern")
});

/// Parse a Go duration string (`15s`, `1m30s`, `250ms`) into milliseconds
pub fn parse_duration_ms(duration: &str) -> Option<u64> {
    let duration = duration.trim();
    if duration == "0" {
        return Some(0);
    }

    let mut total = 0f64;
    let mut consumed = 0;
    for caps in DURATION_REGEX.captures_iter(duration) {
        let whole = caps.get(0)?;
        if whole.start() != consumed {
            return None;
        }
        consumed = whole.end();

        let value: f64 = caps[1].parse().ok()?;
        let scale = match &caps[2] {
            "ns" => 1e-6,
            "us" | "µs" => 1e-3,
            "ms" => 1.0,
            "s" => 1_000.0,
            "m" => 60_000.0,
            "h" => 3_600_000.0,
            _ => return None,
        };
        total += value * scale;
    }

    if consumed == 0 || consumed != duration.len() {
        return None;
    }

    Some(total as u64)
}

/// Emits Mappings from Knative Ingresses
#[derive(Debug, Default)]
pub struct KnativeIngressProcessor;

impl KnativeIngressProcessor {
    fn split_specs(obj: &KubernetesObject, rule: &Value) -> Vec<Map<String, Value>> {
        let namespace = obj.namespace_opt().unwrap_or("default");
        let mut specs = Vec::new();

        let paths = rule
            .pointer("/http/paths")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for path in &paths {
            let global_headers = path
                .get("appendHeaders")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();

            let timeout = path
                .get("timeout")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_TIMEOUT);
            let timeout_ms = parse_duration_ms(timeout).unwrap_or_else(|| {
                tracing::warn!(
                    "Knative {} {}: invalid timeout {}, using {}",
                    obj.kind(),
                    obj.name(),
                    timeout,
                    DEFAULT_TIMEOUT
                );
                15_000
            });

            let splits = path.get("splits").and_then(Value::as_array).cloned().unwrap_or_default();
            for split in &splits {
                let Some(service_name) = split
                    .get("serviceName")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                else {
                    continue;
                };

                let service_namespace = split
                    .get("serviceNamespace")
                    .and_then(Value::as_str)
                    .unwrap_or(namespace);
                let service_port = match split.get("servicePort") {
                    Some(Value::String(port)) => port.clone(),
                    Some(port) if !port.is_null() => port.to_string(),
                    _ => "80".to_string(),
                };

                // Split headers override the path's
                let mut headers = global_headers.clone();
                if let Some(split_headers) = split.get("appendHeaders").and_then(Value::as_object) {
                    headers.extend(split_headers.clone());
                }

                let mut spec = Map::new();
                spec.insert(
                    "service".to_string(),
                    json!(format!("{}.{}:{}", service_name, service_namespace, service_port)),
                );
                spec.insert("add_request_headers".to_string(), Value::Object(headers));
                spec.insert(
                    "weight".to_string(),
                    split.get("percent").cloned().unwrap_or(json!(100)),
                );
                spec.insert(
                    "prefix".to_string(),
                    path.get("path").cloned().unwrap_or(json!("/")),
                );
                spec.insert("timeout_ms".to_string(), json!(timeout_ms));
                specs.push(spec);
            }
        }

        specs
    }

    fn emit_mappings(obj: &KubernetesObject, rule_count: usize, rule: &Value, cx: &mut FetchContext) {
        let hosts: Vec<Value> = rule
            .get("hosts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let specs = Self::split_specs(obj, rule);

        let combinations = hosts
            .iter()
            .flat_map(|host| specs.iter().map(move |spec| (host, spec)));

        for (split_count, (host, split_spec)) in combinations.enumerate() {
            let mut spec = Map::new();
            spec.insert("ambassador_id".to_string(), json!(obj.ambassador_id()));
            spec.insert("host".to_string(), host.clone());
            spec.extend(split_spec.clone());

            let mut object =
                NormalizedObject::new("Mapping", format!("{}-{}-{}", obj.name(), rule_count, split_count))
                    .generation(obj.generation())
                    .labels(obj.labels())
                    .spec(Value::Object(spec));
            if let Some(ns) = obj.namespace_opt() {
                object = object.namespace(ns);
            }

            tracing::debug!("Generated Mapping from Knative {}: {:?}", obj.kind(), object);
            cx.emit(NormalizedResource::from_data(object, None));
        }
    }

    fn make_status(generation: i64, lb_domain: Option<&str>) -> Value {
        let now = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let conditions: Vec<Value> = ["LoadBalancerReady", "NetworkConfigured", "Ready"]
            .into_iter()
            .map(|kind| json!({"lastTransitionTime": now, "status": "True", "type": kind}))
            .collect();

        let mut status = json!({
            "observedGeneration": generation,
            "conditions": conditions,
        });

        if let (Some(domain), Some(fields)) = (lb_domain, status.as_object_mut()) {
            let load_balancer = json!({"ingress": [{"domainInternal": domain}]});
            fields.insert("loadBalancer".to_string(), load_balancer.clone());
            fields.insert("privateLoadBalancer".to_string(), load_balancer);
        }

        status
    }

    fn update_status(obj: &KubernetesObject, cx: &mut FetchContext) {
        let observed_generation = obj
            .status()
            .get("observedGeneration")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let has_new_generation = obj.generation() > observed_generation;

        let current_lb_domain = match &cx.deps.service.ambassador_service {
            Some(svc) => Some(format!(
                "{}.{}.svc.cluster.local",
                svc.name(),
                svc.namespace_opt().unwrap_or("default")
            )),
            None => {
                tracing::warn!(
                    "Unable to set Knative {} {}'s load balancer, could not find Ambassador service",
                    obj.kind(),
                    obj.name()
                );
                None
            }
        };

        let observed_lb_domain = obj
            .status()
            .pointer("/privateLoadBalancer/ingress/0/domainInternal")
            .and_then(Value::as_str);
        let has_new_lb_domain = current_lb_domain.as_deref() != observed_lb_domain;

        if !(has_new_generation || has_new_lb_domain) {
            tracing::debug!(
                "Not reconciling Knative {} {}: observed and current generations are in sync",
                obj.kind(),
                obj.name()
            );
            return;
        }

        let namespace = obj.namespace_opt().unwrap_or("default").to_string();
        let update = StatusUpdate {
            kind: obj.gvk().domain(),
            namespace: namespace.clone(),
            status: Self::make_status(obj.generation(), current_lb_domain.as_deref()),
        };
        tracing::info!(
            "Updating Knative {} {} status to {:?}",
            obj.kind(),
            obj.name(),
            update
        );
        cx.k8s_status_updates
            .insert(format!("{}.{}", obj.name(), namespace), update);
    }
}

impl KubernetesProcessor for KnativeIngressProcessor {
    fn kinds(&self) -> BTreeSet<ResourceIdentity> {
        ["Ingress", "ClusterIngress"]
            .into_iter()
            .map(ResourceIdentity::knative_networking)
            .collect()
    }

    fn declare(&self, deps: &mut DependencyManager) {
        deps.register("knative").want(Dependency::Service);
    }

    fn admit(&self, obj: &KubernetesObject, cx: &FetchContext) -> bool {
        // Only an explicit class annotation for another implementation excludes an object
        let class = obj
            .annotation(KNATIVE_CLASS_ANNOTATION)
            .unwrap_or(KNATIVE_INGRESS_CLASS);
        if class.to_lowercase() != KNATIVE_INGRESS_CLASS {
            tracing::debug!(
                "Ignoring Knative {} {}; set {} annotation to {} for ambassador to parse it.",
                obj.kind(),
                obj.name(),
                KNATIVE_CLASS_ANNOTATION,
                KNATIVE_INGRESS_CLASS
            );
            return false;
        }

        if obj.ambassador_id() != cx.settings.ambassador_id {
            tracing::info!(
                "Knative {} {} does not have Ambassador ID {}, ignoring...",
                obj.kind(),
                obj.name(),
                cx.settings.ambassador_id
            );
            return false;
        }

        true
    }

    fn process(&mut self, obj: &KubernetesObject, cx: &mut FetchContext) {
        let rules = obj
            .spec()
            .get("rules")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for (rule_count, rule) in rules.iter().enumerate() {
            Self::emit_mappings(obj, rule_count, rule, cx);
        }

        Self::update_status(obj, cx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use std::sync::Arc;

    fn knative_ingress(annotations: Value) -> KubernetesObject {
        KubernetesObject::new(
            json!({
                "apiVersion": "networking.internal.knative.dev/v1alpha1",
                "kind": "Ingress",
                "metadata": {
                    "name": "helloworld-go",
                    "namespace": "test",
                    "generation": 2,
                    "annotations": annotations
                },
                "spec": {
                    "rules": [{
                        "hosts": ["helloworld-go.test.svc.cluster.local", "helloworld-go.test.example.com"],
                        "http": {"paths": [{
                            "appendHeaders": {"Knative-Serving-Namespace": "test", "X-Global": "a"},
                            "timeout": "1m30s",
                            "splits": [
                                {"serviceName": "hello-v1", "servicePort": 80, "percent": 90},
                                {"serviceName": "hello-v2", "servicePort": 80, "percent": 10,
                                 "appendHeaders": {"X-Global": "b"}}
                            ]
                        }]}
                    }]
                }
            }),
            "default",
        )
        .unwrap()
    }

    #[test]
    fn test_parse_duration_ms() {
        assert_eq!(parse_duration_ms("15s"), Some(15_000));
        assert_eq!(parse_duration_ms("1m30s"), Some(90_000));
        assert_eq!(parse_duration_ms("250ms"), Some(250));
        assert_eq!(parse_duration_ms("1.5h"), Some(5_400_000));
        assert_eq!(parse_duration_ms("fifteen"), None);
        assert_eq!(parse_duration_ms("15s junk"), None);
    }

    #[test]
    fn test_mapping_per_host_and_split() {
        let mut cx = FetchContext::new(Arc::new(Settings::default()));
        KnativeIngressProcessor.try_process(&knative_ingress(json!({})), &mut cx);

        assert_eq!(cx.manager.elements.len(), 4);

        let names: Vec<_> = cx
            .manager
            .elements
            .iter()
            .filter_map(|e| e.name.as_deref())
            .collect();
        assert_eq!(
            names,
            vec![
                "helloworld-go-0-0",
                "helloworld-go-0-1",
                "helloworld-go-0-2",
                "helloworld-go-0-3"
            ]
        );

        let second = &cx.manager.elements[1];
        assert_eq!(second.get_str("host"), Some("helloworld-go.test.svc.cluster.local"));
        assert_eq!(second.get_str("service"), Some("hello-v2.test:80"));
        assert_eq!(second.get("weight"), Some(&json!(10)));
        assert_eq!(second.get("timeout_ms"), Some(&json!(90_000)));
        assert_eq!(second.get("generation"), Some(&json!(2)));
        assert_eq!(
            second.get("add_request_headers"),
            Some(&json!({"Knative-Serving-Namespace": "test", "X-Global": "b"}))
        );
    }

    #[test]
    fn test_other_ingress_class_is_ignored() {
        let mut cx = FetchContext::new(Arc::new(Settings::default()));
        let obj = knative_ingress(json!({KNATIVE_CLASS_ANNOTATION: "istio.ingress.networking.knative.dev"}));

        assert!(KnativeIngressProcessor.try_process(&obj, &mut cx));
        assert!(cx.manager.elements.is_empty());
        assert!(cx.k8s_status_updates.is_empty());
    }

    #[test]
    fn test_status_update_for_new_generation() {
        let mut cx = FetchContext::new(Arc::new(Settings::default()));
        KnativeIngressProcessor.try_process(&knative_ingress(json!({})), &mut cx);

        let update = &cx.k8s_status_updates["helloworld-go.test"];
        assert_eq!(update.kind, "ingress.networking.internal.knative.dev");
        assert_eq!(update.namespace, "test");
        assert_eq!(update.status["observedGeneration"], 2);
        assert_eq!(update.status["conditions"].as_array().map(Vec::len), Some(3));
        assert!(update.status.get("loadBalancer").is_none());
    }
}
