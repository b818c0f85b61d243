//! Fetch-stage behaviour over snapshots, Kubernetes objects and files on disk

use edgeconf::config::Settings;
use edgeconf::fetch::ingress::wildcard_host_regex;
use edgeconf::fetch::{FetchError, ResourceFetcher, ResourceRecord};
use serde_json::{Value, json};
use std::sync::Arc;

fn fetcher() -> ResourceFetcher {
    ResourceFetcher::new(Arc::new(Settings::default())).unwrap()
}

fn records_of_kind<'a>(fetcher: &'a ResourceFetcher, kind: &str) -> Vec<&'a ResourceRecord> {
    fetcher
        .elements()
        .iter()
        .filter(|record| record.kind == kind)
        .collect()
}

fn app_service() -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {"name": "app", "namespace": "default"},
        "spec": {"ports": [{"port": 80, "targetPort": "http"}]}
    })
}

fn app_endpoints() -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Endpoints",
        "metadata": {"name": "app", "namespace": "default"},
        "subsets": [{
            "addresses": [{"ip": "10.0.0.1"}],
            "ports": [{"name": "http", "port": 8080}]
        }]
    })
}

#[test]
fn test_service_with_endpoints_resolves_targets() {
    let mut fetcher = fetcher();
    let watt = json!({
        "Kubernetes": {
            "service": [app_service()],
            "endpoints": [app_endpoints()]
        }
    });

    fetcher.parse_watt(&watt.to_string(), true);

    let services = records_of_kind(&fetcher, "Service");
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].rkey, "k8s-app-default");
    assert_eq!(
        services[0].get("endpoints"),
        Some(&json!({"80": [{"ip": "10.0.0.1", "port": 8080}]}))
    );
    assert!(fetcher.errors().is_empty());
}

#[test]
fn test_unmatched_target_port_falls_back_to_service_port() {
    let mut fetcher = fetcher();
    let mut endpoints = app_endpoints();
    endpoints["subsets"][0]["ports"] = json!([
        {"name": "metrics", "port": 9100},
        {"name": "admin", "port": 9200}
    ]);
    let watt = json!({
        "Kubernetes": {
            "service": [app_service()],
            "endpoints": [endpoints]
        }
    });

    fetcher.parse_watt(&watt.to_string(), true);

    let services = records_of_kind(&fetcher, "Service");
    assert_eq!(
        services[0].get("endpoints"),
        Some(&json!({"80": [{"ip": "10.0.0.1", "port": 80}]}))
    );
}

#[test]
fn test_service_without_endpoints_routes_by_name() {
    let mut fetcher = fetcher();
    let watt = json!({"Kubernetes": {"service": [app_service()]}});

    fetcher.parse_watt(&watt.to_string(), true);

    let services = records_of_kind(&fetcher, "Service");
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].get("endpoints"), Some(&json!({})));
}

#[test]
fn test_disabled_endpoints_are_skipped() {
    let settings = Settings {
        enable_endpoints: false,
        ..Default::default()
    };
    let mut fetcher = ResourceFetcher::new(Arc::new(settings)).unwrap();
    let watt = json!({
        "Kubernetes": {
            "service": [app_service()],
            "endpoints": [app_endpoints()]
        }
    });

    fetcher.parse_watt(&watt.to_string(), true);

    let services = records_of_kind(&fetcher, "Service");
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].get("endpoints"), Some(&json!({})));
}

#[test]
fn test_duplicate_objects_are_processed_once() {
    let mut fetcher = fetcher();
    let watt = json!({"Kubernetes": {"service": [app_service(), app_service()]}});

    fetcher.parse_watt(&watt.to_string(), true);

    assert_eq!(records_of_kind(&fetcher, "Service").len(), 1);
}

#[test]
fn test_wildcard_ingress_becomes_host_regex_mapping() {
    let mut fetcher = fetcher();
    let ingress = json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": {
            "name": "web",
            "namespace": "default",
            "annotations": {"kubernetes.io/ingress.class": "ambassador"}
        },
        "spec": {
            "rules": [{
                "host": "*.example.com",
                "http": {
                    "paths": [{
                        "path": "/",
                        "pathType": "Prefix",
                        "backend": {"service": {"name": "web", "port": {"number": 80}}}
                    }]
                }
            }]
        }
    });

    fetcher.parse_json(&ingress.to_string(), true, None, None, true);

    let mappings = records_of_kind(&fetcher, "Mapping");
    assert_eq!(mappings.len(), 1);

    let mapping = mappings[0];
    assert_eq!(
        mapping.get_str("host"),
        Some(wildcard_host_regex("*.example.com").as_str())
    );
    assert_eq!(mapping.get("host_regex"), Some(&json!(true)));
    assert_eq!(mapping.get_str("prefix"), Some("/"));
    assert_eq!(mapping.get_str("service"), Some("web.default:80"));
    assert!(mapping.get("hostname").is_none());
}

#[test]
fn test_unclaimed_ingress_is_ignored() {
    let mut fetcher = fetcher();
    let ingress = json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": {"name": "web", "namespace": "default"},
        "spec": {
            "defaultBackend": {"service": {"name": "web", "port": {"number": 80}}}
        }
    });

    fetcher.parse_json(&ingress.to_string(), true, None, None, true);

    assert!(fetcher.elements().is_empty());
}

#[test]
fn test_annotations_on_unhandled_kinds_are_ignored() {
    let mut fetcher = fetcher();
    let config_map = json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": "routes",
            "namespace": "default",
            "annotations": {
                "getambassador.io/config": "apiVersion: getambassador.io/v2\nkind: Mapping\nname: hidden\nprefix: /hidden/\nservice: hidden\n"
            }
        }
    });

    fetcher.parse_json(&config_map.to_string(), true, None, None, true);

    assert!(fetcher.elements().is_empty());
}

#[test]
fn test_annotations_on_services_are_emitted() {
    let mut fetcher = fetcher();
    let mut service = app_service();
    service["metadata"]["annotations"] = json!({
        "getambassador.io/config": "apiVersion: getambassador.io/v2\nkind: Mapping\nname: app\nprefix: /app/\nservice: app\n"
    });

    fetcher.parse_json(&service.to_string(), true, None, None, true);

    let mappings = records_of_kind(&fetcher, "Mapping");
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].name.as_deref(), Some("app"));
}

#[test]
fn test_only_knative_ingresses_are_counted() {
    let mut fetcher = fetcher();
    let objects = json!([
        {
            "apiVersion": "networking.internal.knative.dev/v1alpha1",
            "kind": "Ingress",
            "metadata": {"name": "hello", "namespace": "default"},
            "spec": {"rules": []}
        },
        {
            "apiVersion": "networking.internal.knative.dev/v1alpha1",
            "kind": "ClusterIngress",
            "metadata": {"name": "hello-cluster"},
            "spec": {"rules": []}
        }
    ]);

    fetcher.parse_json(&objects.to_string(), true, None, None, true);

    assert_eq!(fetcher.context().get_count("knative_ingress"), 1);
}

#[test]
fn test_opaque_secret_without_known_keys_is_dropped() {
    let mut fetcher = fetcher();
    let secret = json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "Opaque",
        "metadata": {"name": "misc", "namespace": "default"},
        "data": {"password": "aHVudGVyMg=="}
    });

    fetcher.parse_json(&secret.to_string(), true, None, None, true);

    assert!(fetcher.elements().is_empty());
    assert!(fetcher.errors().is_empty());
}

#[test]
fn test_mismatched_ambassador_id_is_filtered() {
    let mut fetcher = fetcher();
    let yaml = r#"
---
apiVersion: getambassador.io/v2
kind: Mapping
name: mine
prefix: /mine/
service: mine
---
apiVersion: getambassador.io/v2
kind: Mapping
name: theirs
ambassador_id: other
prefix: /theirs/
service: theirs
"#;

    fetcher.parse_yaml(yaml, false, None, Some("routes.yaml".to_string()), true);

    let names: Vec<_> = fetcher
        .elements()
        .iter()
        .filter_map(|record| record.name.as_deref())
        .collect();
    assert_eq!(names, vec!["mine"]);
    assert!(fetcher.errors().is_empty());
}

#[test]
fn test_invalid_objects_keep_their_errors() {
    let mut fetcher = fetcher();
    let watt = json!({
        "Invalid": [{
            "apiVersion": "getambassador.io/v2",
            "kind": "Mapping",
            "metadata": {"name": "broken", "namespace": "default"},
            "spec": {"prefix": "/broken/"},
            "errors": "spec.service in body is required"
        }]
    });

    fetcher.parse_watt(&watt.to_string(), true);

    let mappings = records_of_kind(&fetcher, "Mapping");
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].errors(), Some("spec.service in body is required"));
}

#[test]
fn test_consul_service_endpoints() {
    let mut fetcher = fetcher();
    let watt = json!({
        "Consul": {
            "Endpoints": {
                "billing": {
                    "Service": "billing",
                    "Id": "dc2",
                    "Endpoints": [
                        {"ID": "a", "Address": "10.1.0.1", "Port": 9000},
                        {"ID": "b", "Address": "", "Port": 9000}
                    ]
                }
            }
        }
    });

    fetcher.parse_watt(&watt.to_string(), true);

    let services = records_of_kind(&fetcher, "Service");
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].rkey, "consul-billing-dc2");
    assert_eq!(
        services[0].get("endpoints"),
        Some(&json!({"*": [{"ip": "10.1.0.1", "port": 9000, "target_kind": "Consul"}]}))
    );
}

#[test]
fn test_malformed_snapshot_is_posted() {
    let mut fetcher = fetcher();

    fetcher.parse_watt("{not json", true);

    assert!(fetcher.elements().is_empty());
    assert_eq!(fetcher.errors().error_count(), 1);
}

const MAPPING_YAML: &str = r#"
apiVersion: getambassador.io/v2
kind: Mapping
name: NAME
prefix: /NAME/
service: NAME
"#;

fn write_mapping(path: &std::path::Path, name: &str) {
    std::fs::write(path, MAPPING_YAML.replace("NAME", name)).unwrap();
}

#[test]
fn test_load_directory_reads_yaml_only() {
    let dir = tempfile::tempdir().unwrap();
    write_mapping(&dir.path().join("a.yaml"), "a");
    write_mapping(&dir.path().join("b.YAML"), "b");
    std::fs::write(dir.path().join("notes.txt"), "not config").unwrap();
    std::fs::create_dir(dir.path().join("nested")).unwrap();
    write_mapping(&dir.path().join("nested").join("c.yaml"), "c");

    let mut fetcher = fetcher();
    fetcher
        .load_from_filesystem(dir.path(), false, false, true)
        .unwrap();

    let rkeys: Vec<_> = fetcher.elements().iter().map(|r| r.rkey.as_str()).collect();
    assert_eq!(rkeys, vec!["a.yaml.1", "b.YAML.1"]);
}

#[test]
fn test_load_directory_recursively() {
    let dir = tempfile::tempdir().unwrap();
    write_mapping(&dir.path().join("a.yaml"), "a");
    std::fs::create_dir(dir.path().join("nested")).unwrap();
    write_mapping(&dir.path().join("nested").join("c.yaml"), "c");

    let mut fetcher = fetcher();
    fetcher
        .load_from_filesystem(dir.path(), true, false, true)
        .unwrap();

    let mut names: Vec<_> = fetcher
        .elements()
        .iter()
        .filter_map(|r| r.name.as_deref())
        .collect();
    names.sort();
    assert_eq!(names, vec!["a", "c"]);
}

#[test]
fn test_load_single_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("only.yaml");
    write_mapping(&path, "only");

    let mut fetcher = fetcher();
    fetcher.load_from_filesystem(&path, false, false, true).unwrap();

    assert_eq!(fetcher.elements().len(), 1);
    assert_eq!(fetcher.elements()[0].rkey, "only.yaml.1");
}

#[test]
fn test_load_missing_root_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut fetcher = fetcher();

    let result = fetcher.load_from_filesystem(&dir.path().join("absent"), false, false, true);

    assert!(matches!(result, Err(FetchError::Io { .. })));
}

#[test]
fn test_bad_yaml_file_is_posted_and_loading_continues() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.yaml"), "kind: [unclosed").unwrap();
    write_mapping(&dir.path().join("b.yaml"), "b");

    let mut fetcher = fetcher();
    fetcher
        .load_from_filesystem(dir.path(), false, false, true)
        .unwrap();

    assert_eq!(fetcher.elements().len(), 1);
    assert_eq!(fetcher.errors().error_count(), 1);
}
