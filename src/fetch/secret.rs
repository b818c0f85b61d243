//! TLS secret discovery
//!
//! Secrets are turned straight into normalized `Secret` resources. Their data
//! keys contain dots, which the compiled schema cannot carry, so [`SecretData`]
//! renames them on the way through.

use super::context::FetchContext;
use super::dependency::{Dependency, DependencyManager};
use super::processor::KubernetesProcessor;
use super::resource::{NormalizedObject, NormalizedResource};
use crate::models::{KubernetesObject, ResourceIdentity};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

/// Secret types that may carry TLS material
pub const KNOWN_SECRET_TYPES: &[&str] = &["kubernetes.io/tls", "Opaque", "istio.io/key-and-cert"];

/// Recognized secret data, read under the Kubernetes key and written under the
/// schema field name.
///
/// | data key        | field           |
/// |-----------------|-----------------|
/// | `tls.crt`       | `tls_crt`       |
/// | `tls.key`       | `tls_key`       |
/// | `user.key`      | `user_key`      |
/// | `cert-chain.pem`| `cert_chain_pem`|
/// | `key.pem`       | `key_pem`       |
/// | `root-cert.pem` | `root_cert_pem` |
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretData {
    #[serde(rename(deserialize = "tls.crt"), skip_serializing_if = "Option::is_none")]
    pub tls_crt: Option<Value>,
    #[serde(rename(deserialize = "tls.key"), skip_serializing_if = "Option::is_none")]
    pub tls_key: Option<Value>,
    #[serde(rename(deserialize = "user.key"), skip_serializing_if = "Option::is_none")]
    pub user_key: Option<Value>,
    #[serde(
        rename(deserialize = "cert-chain.pem"),
        skip_serializing_if = "Option::is_none"
    )]
    pub cert_chain_pem: Option<Value>,
    #[serde(rename(deserialize = "key.pem"), skip_serializing_if = "Option::is_none")]
    pub key_pem: Option<Value>,
    #[serde(
        rename(deserialize = "root-cert.pem"),
        skip_serializing_if = "Option::is_none"
    )]
    pub root_cert_pem: Option<Value>,
}

impl SecretData {
    /// Read the recognized keys out of a Secret's `data` map; empty values count as absent
    pub fn from_data(data: &Value) -> Self {
        let mut parsed: SecretData = serde_json::from_value(data.clone()).unwrap_or_default();
        for field in [
            &mut parsed.tls_crt,
            &mut parsed.tls_key,
            &mut parsed.user_key,
            &mut parsed.cert_chain_pem,
            &mut parsed.key_pem,
            &mut parsed.root_cert_pem,
        ] {
            if field.as_ref().is_some_and(is_empty_value) {
                *field = None;
            }
        }
        parsed
    }

    pub fn is_empty(&self) -> bool {
        *self == SecretData::default()
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Emits `Secret` resources for secrets holding TLS material
#[derive(Debug, Default)]
pub struct SecretProcessor;

impl KubernetesProcessor for SecretProcessor {
    fn kinds(&self) -> BTreeSet<ResourceIdentity> {
        [ResourceIdentity::new("v1", "Secret")].into_iter().collect()
    }

    fn declare(&self, deps: &mut DependencyManager) {
        deps.register("secret").provide(Dependency::Secret);
    }

    fn admit(&self, obj: &KubernetesObject, cx: &FetchContext) -> bool {
        let settings = &cx.settings;
        let namespace = obj.namespace_opt().unwrap_or("default");

        !(settings.single_namespace
            && settings.certs_single_namespace
            && namespace != settings.ambassador_namespace)
    }

    fn process(&mut self, obj: &KubernetesObject, cx: &mut FetchContext) {
        let secret_type = obj.get("type").as_str().unwrap_or_default();
        if !KNOWN_SECRET_TYPES.contains(&secret_type) {
            tracing::debug!("ignoring K8s Secret with unknown type {}", secret_type);
            return;
        }

        let namespace = obj.namespace_opt().unwrap_or("default").to_string();
        let rkey = format!("{}.{}", obj.name(), namespace);

        let data = SecretData::from_data(obj.get("data"));
        if data.is_empty() {
            tracing::debug!("ignoring K8s Secret {} with no keys", rkey);
            return;
        }

        let mut spec = Map::new();
        spec.insert("ambassador_id".to_string(), json!(cx.settings.ambassador_id));
        spec.insert("secret_type".to_string(), json!(secret_type));
        if let Ok(Value::Object(fields)) = serde_json::to_value(&data) {
            spec.extend(fields);
        }

        let object = NormalizedObject::new("Secret", obj.name())
            .namespace(namespace)
            .labels(obj.labels())
            .errors(obj.errors().map(str::to_string))
            .spec(Value::Object(spec));

        cx.emit(NormalizedResource::from_data(object, Some(rkey)));
    }
}
