//! Typed view over a raw declarative document

use super::gvk::{ResourceIdentity, ResourceKey};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

static NULL: Value = Value::Null;

/// Annotation carrying the gateway instance an object belongs to
pub const AMBASSADOR_ID_ANNOTATION: &str = "getambassador.io/ambassador-id";

/// Namespace sentinel resolved to the configured gateway namespace
pub const AUTOMATIC_NAMESPACE: &str = "_automatic_";

/// Errors raised while wrapping raw objects
#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    #[error("not a valid object: {0}")]
    InvalidObject(String),

    #[error("{domain} {name} is not namespaced")]
    NotNamespaced { domain: String, name: String },
}

/// Result type for object model operations
pub type ObjectResult<T> = Result<T, ObjectError>;

/// A raw Kubernetes-style object with its identity fields validated
#[derive(Debug, Clone, PartialEq)]
pub struct KubernetesObject {
    raw: Map<String, Value>,
    gvk: ResourceIdentity,
    name: String,
    namespace: Option<String>,
}

impl KubernetesObject {
    /// Wrap a raw document.
    ///
    /// Fails unless the document is a mapping with `apiVersion`, `kind` and
    /// `metadata.name`. A namespace of `_automatic_` resolves to `default_namespace`.
    pub fn new(raw: Value, default_namespace: &str) -> ObjectResult<Self> {
        let Value::Object(raw) = raw else {
            return Err(ObjectError::InvalidObject("not a mapping".to_string()));
        };

        let api_version = raw
            .get("apiVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| ObjectError::InvalidObject("missing apiVersion".to_string()))?;
        let kind = raw
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| ObjectError::InvalidObject("missing kind".to_string()))?;

        let metadata = raw.get("metadata").unwrap_or(&NULL);
        let name = metadata
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ObjectError::InvalidObject("missing metadata.name".to_string()))?;

        let namespace = metadata
            .get("namespace")
            .and_then(Value::as_str)
            .map(|ns| {
                if ns == AUTOMATIC_NAMESPACE {
                    default_namespace.to_string()
                } else {
                    ns.to_string()
                }
            });

        Ok(Self {
            gvk: ResourceIdentity::new(api_version, kind),
            name: name.to_string(),
            namespace,
            raw,
        })
    }

    pub fn gvk(&self) -> &ResourceIdentity {
        &self.gvk
    }

    pub fn kind(&self) -> &str {
        &self.gvk.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace of a namespaced object
    pub fn namespace(&self) -> ObjectResult<&str> {
        self.namespace
            .as_deref()
            .ok_or_else(|| ObjectError::NotNamespaced {
                domain: self.gvk.domain(),
                name: self.name.clone(),
            })
    }

    /// Namespace, or `None` for cluster-scoped objects
    pub fn namespace_opt(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.gvk.clone(), self.namespace.clone(), self.name.clone())
    }

    /// Top-level field, or `Null` when absent
    pub fn get(&self, field: &str) -> &Value {
        self.raw.get(field).unwrap_or(&NULL)
    }

    pub fn metadata(&self) -> &Value {
        self.get("metadata")
    }

    pub fn generation(&self) -> i64 {
        self.metadata()
            .get("generation")
            .and_then(Value::as_i64)
            .unwrap_or(1)
    }

    pub fn annotations(&self) -> &Value {
        self.metadata().get("annotations").unwrap_or(&NULL)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations().get(key).and_then(Value::as_str)
    }

    /// Gateway id from the well-known annotation, `default` when unset
    pub fn ambassador_id(&self) -> &str {
        self.annotation(AMBASSADOR_ID_ANNOTATION).unwrap_or("default")
    }

    /// String-valued labels
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.metadata()
            .get("labels")
            .and_then(Value::as_object)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn spec(&self) -> &Value {
        self.get("spec")
    }

    pub fn status(&self) -> &Value {
        self.get("status")
    }

    /// Upstream validation errors, if the object was flagged invalid
    pub fn errors(&self) -> Option<&str> {
        self.raw.get("errors").and_then(Value::as_str)
    }

    pub fn raw(&self) -> &Map<String, Value> {
        &self.raw
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.raw.clone())
    }
}
