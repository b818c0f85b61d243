//! Object model behaviour shared by every fetch processor

use edgeconf::models::{
    KubernetesObject, NativeKind, ObjectError, ResourceIdentity, ResourceKey, ResourceScope,
};
use edgeconf::fetch::NormalizedResource;
use serde_json::json;

#[test]
fn test_core_identity_has_no_group() {
    let gvk = ResourceIdentity::new("v1", "Service");
    assert_eq!(gvk.api_group(), None);
    assert_eq!(gvk.version(), "v1");
    assert_eq!(gvk.domain(), "service");
}

#[test]
fn test_grouped_identity_domain() {
    let gvk = ResourceIdentity::new("networking.k8s.io/v1", "Ingress");
    assert_eq!(gvk.api_group(), Some("networking.k8s.io"));
    assert_eq!(gvk.version(), "v1");
    assert_eq!(gvk.domain(), "ingress.networking.k8s.io");
    assert_eq!(gvk.to_string(), "networking.k8s.io/v1 Ingress");
}

#[test]
fn test_native_identity_uses_gateway_api_version() {
    assert_eq!(
        ResourceIdentity::ambassador("Mapping"),
        ResourceIdentity::new("getambassador.io/v2", "Mapping")
    );
}

#[test]
fn test_resource_key_scope_and_display() {
    let namespaced = ResourceKey::new(
        ResourceIdentity::new("v1", "Service"),
        Some("prod".to_string()),
        "api",
    );
    assert_eq!(namespaced.scope(), ResourceScope::Namespace);
    assert_eq!(namespaced.to_string(), "Service/api.prod");

    let cluster = ResourceKey::new(
        ResourceIdentity::new("networking.k8s.io/v1", "IngressClass"),
        None,
        "ambassador",
    );
    assert_eq!(cluster.scope(), ResourceScope::Cluster);
    assert_eq!(cluster.to_string(), "IngressClass/ambassador");
}

#[test]
fn test_object_requires_identity_fields() {
    for raw in [
        json!("not a mapping"),
        json!({"kind": "Service", "metadata": {"name": "a"}}),
        json!({"apiVersion": "v1", "metadata": {"name": "a"}}),
        json!({"apiVersion": "v1", "kind": "Service", "metadata": {}}),
    ] {
        let result = KubernetesObject::new(raw, "default");
        assert!(matches!(result, Err(ObjectError::InvalidObject(_))));
    }
}

#[test]
fn test_automatic_namespace_resolves() {
    let obj = KubernetesObject::new(
        json!({
            "apiVersion": "getambassador.io/v2",
            "kind": "Mapping",
            "metadata": {"name": "m", "namespace": "_automatic_"}
        }),
        "ambassador",
    )
    .unwrap();

    assert_eq!(obj.namespace().unwrap(), "ambassador");
    assert_eq!(obj.key().to_string(), "Mapping/m.ambassador");
}

#[test]
fn test_cluster_scoped_object_has_no_namespace() {
    let obj = KubernetesObject::new(
        json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "IngressClass",
            "metadata": {"name": "ambassador"}
        }),
        "default",
    )
    .unwrap();

    assert_eq!(obj.namespace_opt(), None);
    let err = obj.namespace().unwrap_err();
    assert_eq!(
        err.to_string(),
        "ingressclass.networking.k8s.io ambassador is not namespaced"
    );
}

#[test]
fn test_metadata_accessors() {
    let obj = KubernetesObject::new(
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": "api",
                "namespace": "prod",
                "generation": 4,
                "labels": {"app": "api", "replicas": 3},
                "annotations": {"getambassador.io/ambassador-id": "edge"}
            },
            "spec": {"ports": []}
        }),
        "default",
    )
    .unwrap();

    assert_eq!(obj.generation(), 4);
    assert_eq!(obj.ambassador_id(), "edge");
    assert_eq!(obj.labels().len(), 1);
    assert_eq!(obj.labels().get("app").map(String::as_str), Some("api"));
    assert_eq!(obj.spec(), &json!({"ports": []}));
    assert!(obj.status().is_null());
}

#[test]
fn test_defaults_for_missing_metadata() {
    let obj = KubernetesObject::new(
        json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "s", "namespace": "x"}}),
        "default",
    )
    .unwrap();

    assert_eq!(obj.generation(), 1);
    assert_eq!(obj.ambassador_id(), "default");
    assert!(obj.labels().is_empty());
    assert_eq!(obj.errors(), None);
}

#[test]
fn test_upstream_errors_are_kept() {
    let raw = json!({
        "apiVersion": "getambassador.io/v2",
        "kind": "Mapping",
        "metadata": {"name": "bad", "namespace": "default"},
        "errors": "spec.prefix: Required value"
    });
    let obj = KubernetesObject::new(raw.clone(), "default").unwrap();

    assert_eq!(obj.errors(), Some("spec.prefix: Required value"));
    assert_eq!(obj.to_value(), raw);
}

#[test]
fn test_native_kind_parse_is_case_sensitive() {
    assert_eq!(NativeKind::parse_optional("TLSContext"), Some(NativeKind::TLSContext));
    assert_eq!(NativeKind::parse_optional("tlscontext"), None);
}

#[test]
fn test_errors_survive_normalization() {
    let obj = KubernetesObject::new(
        json!({
            "apiVersion": "getambassador.io/v2",
            "kind": "Mapping",
            "metadata": {"name": "bad", "namespace": "default"},
            "spec": {"prefix": "/bad/", "service": "bad"},
            "errors": "bad config"
        }),
        "default",
    )
    .unwrap();

    let normalized = NormalizedResource::from_resource(&obj);

    assert_eq!(normalized.object["errors"], "bad config");
    assert_eq!(normalized.object["prefix"], "/bad/");
    assert_eq!(normalized.rkey.as_deref(), Some("bad.default"));
}
