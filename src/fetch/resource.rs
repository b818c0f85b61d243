//! Normalized resources and the manager that records them
//!
//! Processors never append to the element list directly: everything goes through
//! [`ResourceManager::emit`], which enforces the shape, the ambassador id, and the
//! rkey rules before a record is kept.

use super::location::LocationManager;
use crate::config::Settings;
use crate::diag::ErrorLog;
use crate::models::gvk::AMBASSADOR_API_VERSION;
use crate::models::KubernetesObject;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Label tying a normalized resource back to its rkey
pub const AMBASSADOR_CRD_LABEL: &str = "ambassador_crd";

/// `ambassador_id` value accepted by every gateway
const AUTOMATIC_ID: &str = "_automatic_";

/// Fields owned by the normalized form; spec entries with these names are dropped
const RESERVED_FIELDS: &[&str] = &[
    "apiVersion",
    "kind",
    "name",
    "namespace",
    "generation",
    "metadata_labels",
    "errors",
];

/// Named fields of a normalized object, with the spec flattened alongside
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedObject {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    pub metadata_labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<String>,
    #[serde(flatten)]
    pub spec: Map<String, Value>,
}

impl NormalizedObject {
    /// A `getambassador.io/v2` object with no spec
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_version: AMBASSADOR_API_VERSION.to_string(),
            kind: kind.into(),
            name: name.into(),
            namespace: None,
            generation: None,
            metadata_labels: BTreeMap::new(),
            errors: None,
            spec: Map::new(),
        }
    }

    pub fn api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.metadata_labels = labels;
        self
    }

    pub fn errors(mut self, errors: Option<String>) -> Self {
        self.errors = errors;
        self
    }

    /// Set the spec; non-object values and reserved keys are ignored
    pub fn spec(mut self, spec: Value) -> Self {
        if let Value::Object(mut spec) = spec {
            spec.retain(|key, _| !RESERVED_FIELDS.contains(&key.as_str()));
            self.spec = spec;
        }
        self
    }

    /// Default rkey: `name.namespace`, or just the name when cluster-scoped
    pub fn default_rkey(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}.{}", self.name, ns),
            None => self.name.clone(),
        }
    }
}

/// The unit handed to [`ResourceManager::emit`]
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedResource {
    pub object: Value,
    pub rkey: Option<String>,
}

impl NormalizedResource {
    /// Wrap an already-shaped document, as read from YAML or a snapshot
    pub fn from_raw(object: Value, rkey: Option<String>) -> Self {
        Self { object, rkey }
    }

    /// Build from named fields. The rkey defaults to `name.namespace` and is
    /// recorded in the `ambassador_crd` label.
    pub fn from_data(mut object: NormalizedObject, rkey: Option<String>) -> Self {
        let rkey = rkey.unwrap_or_else(|| object.default_rkey());
        object
            .metadata_labels
            .insert(AMBASSADOR_CRD_LABEL.to_string(), rkey.clone());

        let object = serde_json::to_value(&object).unwrap_or_else(|e| {
            tracing::error!("could not serialize normalized object {}: {}", rkey, e);
            Value::Null
        });

        Self {
            object,
            rkey: Some(rkey),
        }
    }

    /// Convert a native CRD object, keeping its apiVersion and any upstream errors
    pub fn from_resource(obj: &KubernetesObject) -> Self {
        let mut object = NormalizedObject::new(obj.kind(), obj.name())
            .api_version(obj.gvk().api_version.clone())
            .generation(obj.generation())
            .labels(obj.labels())
            .errors(obj.errors().map(str::to_string))
            .spec(obj.spec().clone());

        if let Some(ns) = obj.namespace_opt() {
            object = object.namespace(ns);
        }

        Self::from_data(object, None)
    }
}

/// A canonical, provenance-stamped record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceRecord {
    pub rkey: String,
    pub location: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip)]
    pub serialization: String,
    pub object: Map<String, Value>,
}

impl ResourceRecord {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.object.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.object.get(field).and_then(Value::as_str)
    }

    pub fn api_version(&self) -> &str {
        self.get_str("apiVersion").unwrap_or_default()
    }

    /// Upstream errors carried by the object
    pub fn errors(&self) -> Option<&str> {
        self.get_str("errors")
    }
}

/// The single write path for normalized resources
#[derive(Debug)]
pub struct ResourceManager {
    settings: Arc<Settings>,
    pub locations: LocationManager,
    pub elements: Vec<ResourceRecord>,
    pub errors: ErrorLog,
}

impl ResourceManager {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            locations: LocationManager::new(),
            elements: Vec::new(),
            errors: ErrorLog::new(),
        }
    }

    /// Current location, for messages
    pub fn location(&self) -> String {
        self.locations.current().to_string()
    }

    /// Record a resource. The occurrence count advances for everything except
    /// Pragmas.
    pub fn emit(&mut self, resource: NormalizedResource) {
        if self.emit_inner(resource) {
            self.locations.current_mut().ocount += 1;
        }
    }

    fn emit_inner(&mut self, resource: NormalizedResource) -> bool {
        let NormalizedResource { object, rkey } = resource;

        let obj = match object {
            Value::Object(obj) if !obj.is_empty() => obj,
            Value::Null | Value::Object(_) => {
                let text = format!("{} is empty", self.location());
                self.errors.post_error(None, text);
                return true;
            }
            other => {
                let text = format!(
                    "{} is not a dictionary? {}",
                    self.location(),
                    serde_json::to_string_pretty(&other).unwrap_or_default()
                );
                self.errors.post_error(None, text);
                return true;
            }
        };

        if !self.good_ambassador_id(&obj) {
            tracing::debug!(
                "{} ignoring object with mismatched ambassador_id",
                self.location()
            );
            return true;
        }

        let Some(kind) = obj.get("kind").and_then(Value::as_str).map(str::to_string) else {
            let text = format!(
                "{} is missing 'kind'?? {}",
                self.location(),
                serde_json::to_string_pretty(&obj).unwrap_or_default()
            );
            self.errors.post_error(None, text);
            return true;
        };

        if kind == "Pragma" {
            if let Some(source) = obj.get("source").and_then(Value::as_str) {
                self.locations.current_mut().filename = Some(source.to_string());
            }
            return false;
        }

        let base = match rkey {
            Some(rkey) => rkey,
            None => self
                .locations
                .current()
                .filename_or("unknown")
                .to_string(),
        };

        // Services are unique by name and keep a bare rkey
        let rkey = if kind == "Service" {
            base
        } else {
            format!("{}.{}", base, self.locations.current().ocount)
        };

        let serialization = match serde_yaml::to_string(&obj) {
            Ok(serialization) => serialization,
            Err(e) => {
                self.errors
                    .post_error(Some(&rkey), format!("{}: could not serialize: {}", rkey, e));
                return true;
            }
        };

        tracing::debug!(
            "{} PROCESS {} save {}",
            self.location(),
            kind,
            rkey
        );

        self.elements.push(ResourceRecord {
            location: rkey.clone(),
            rkey,
            name: obj.get("name").and_then(Value::as_str).map(str::to_string),
            namespace: obj
                .get("namespace")
                .and_then(Value::as_str)
                .map(str::to_string),
            kind,
            serialization,
            object: obj,
        });

        true
    }

    /// Whether the object's `ambassadorId`/`ambassador_id` admits this gateway
    fn good_ambassador_id(&self, obj: &Map<String, Value>) -> bool {
        let default_id = Value::String("default".to_string());
        let allowed = obj
            .get("ambassadorId")
            .filter(|v| !v.is_null())
            .or_else(|| obj.get("ambassador_id"))
            .unwrap_or(&default_id);

        let ids: Vec<&str> = match allowed {
            Value::String(id) if !id.is_empty() => vec![id.as_str()],
            Value::Array(ids) if !ids.is_empty() => ids.iter().filter_map(Value::as_str).collect(),
            _ => return false,
        };

        if ids == [AUTOMATIC_ID] {
            return true;
        }

        let accepted = ids.contains(&self.settings.ambassador_id.as_str());
        if !accepted {
            tracing::debug!(
                "{} has IDs {:?}, no match with {}",
                obj.get("name").and_then(serde_json::Value::as_str).unwrap_or("-no-name-"),
                ids,
                self.settings.ambassador_id
            );
        }
        accepted
    }
}
