//! Top-level fetch orchestration
//!
//! A [`ResourceFetcher`] reads YAML from the filesystem or a snapshot payload,
//! hands Kubernetes objects to the processors in dependency order, folds in
//! annotation-embedded configuration and Consul services, and leaves the
//! resulting records and error log in its [`FetchContext`].

use super::ambassador::NativeCrdProcessor;
use super::context::FetchContext;
use super::dependency::{CyclicDependencyError, DependencyManager};
use super::ingress::{IngressClassProcessor, IngressProcessor};
use super::knative::KnativeIngressProcessor;
use super::location::LocationGuard;
use super::processor::{
    AggregateProcessor, CountingProcessor, DeduplicatingProcessor, KubernetesProcessor,
};
use super::resource::{NormalizedObject, NormalizedResource, ResourceRecord};
use super::secret::SecretProcessor;
use super::service::ServiceProcessor;
use crate::config::Settings;
use crate::diag::ErrorLog;
use crate::models::{KubernetesObject, ResourceIdentity};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Annotation carrying embedded gateway configuration
pub const CONFIG_ANNOTATION: &str = "getambassador.io/config";

/// Fatal fetch-cycle errors
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Cyclic(#[from] CyclicDependencyError),

    #[error("could not read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for fetch operations
pub type FetchResult<T> = Result<T, FetchError>;

/// Parse a multi-document YAML stream. Empty documents are dropped.
pub fn parse_yaml_documents(serialization: &str) -> Result<Vec<Value>, serde_yaml::Error> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(serialization) {
        let value = Value::deserialize(document)?;
        if !value.is_null() {
            documents.push(value);
        }
    }
    Ok(documents)
}

/// Everything but the context, so a location guard can hold the context
/// while objects are dispatched
struct Pipeline {
    processor: DeduplicatingProcessor<AggregateProcessor>,
    /// `{kind}/{name}.{namespace}` of carriers whose annotations were parsed
    k8s_parsed: HashSet<String>,
    /// Pre-parsed annotation objects from the snapshot, by carrier key
    watt_annotations: Map<String, Value>,
}

impl Pipeline {
    fn handle_k8s(&mut self, cx: &mut FetchContext, raw: Value) {
        let obj = match KubernetesObject::new(raw, &cx.settings.ambassador_namespace) {
            Ok(obj) => obj,
            Err(e) => {
                tracing::debug!("{}: skipping object: {}", cx.location(), e);
                return;
            }
        };

        let processed = {
            let mut guard = LocationGuard::push_reset(cx);
            self.processor.try_process(&obj, &mut guard)
        };
        if processed {
            self.handle_annotations(cx, &obj);
        } else {
            tracing::debug!("{}: skipping K8s {}", cx.location(), obj.gvk());
        }
    }

    fn handle_annotations(&mut self, cx: &mut FetchContext, obj: &KubernetesObject) {
        let namespace = obj.namespace_opt().unwrap_or("default");
        let key = format!("{}/{}.{}", obj.kind(), obj.name(), namespace);

        let objects = match self.watt_annotations.get(&key) {
            Some(Value::Array(objects)) => objects.clone(),
            Some(_) => return,
            None => match obj.annotation(CONFIG_ANNOTATION) {
                Some(config) => match parse_yaml_documents(config) {
                    Ok(objects) => objects,
                    Err(e) => {
                        let text = format!("{}: could not parse YAML: {}", cx.location(), e);
                        cx.errors_mut().post_error(None, text);
                        return;
                    }
                },
                None => return,
            },
        };

        if !self.k8s_parsed.insert(key) {
            return;
        }

        let rkey = format!("{}.{}", obj.name(), namespace);
        let labels = obj.labels();

        let filename = cx.manager.locations.current().filename.clone();
        let mut guard = LocationGuard::push(cx, filename);
        guard.location().mark_annotation();

        for mut object in objects {
            if let Some(fields) = object.as_object_mut() {
                if !labels.is_empty() && !fields.contains_key("metadata_labels") {
                    fields.insert("metadata_labels".to_string(), json!(labels));
                }
            }
            guard.emit(NormalizedResource::from_raw(object, Some(rkey.clone())));
        }
    }

    /// Emit `objects` from `filename` (or the current file)
    fn parse_object(
        &mut self,
        cx: &mut FetchContext,
        objects: Vec<Value>,
        k8s: bool,
        rkey: Option<String>,
        filename: Option<String>,
    ) {
        let filename = filename.or_else(|| cx.manager.locations.current().filename.clone());
        let mut guard = LocationGuard::push(cx, filename);

        for object in objects {
            if k8s {
                self.handle_k8s(&mut guard, object);
            } else {
                guard.emit(NormalizedResource::from_raw(object, rkey.clone()));
            }
        }
    }
}

/// Reads inputs and drives the processors for one fetch cycle
pub struct ResourceFetcher {
    cx: FetchContext,
    pipeline: Pipeline,
    /// Kubernetes kinds that must be processed first, in order
    watt_keys: Vec<String>,
    /// Snapshot deltas, passed through unmodified
    pub deltas: Vec<Value>,
}

impl ResourceFetcher {
    /// Build the processors and resolve their processing order
    pub fn new(settings: Arc<Settings>) -> FetchResult<Self> {
        let knative_ingress = ResourceIdentity::knative_networking("Ingress");

        let processor = DeduplicatingProcessor::new(AggregateProcessor::new(vec![
            Box::new(CountingProcessor::new([knative_ingress], "knative_ingress")),
            Box::new(NativeCrdProcessor),
            Box::new(ServiceProcessor::new()),
            Box::new(KnativeIngressProcessor),
            Box::new(IngressProcessor),
            Box::new(IngressClassProcessor),
            Box::new(SecretProcessor),
        ]));

        let mut deps = DependencyManager::default();
        processor.declare(&mut deps);

        let mut watt_keys: Vec<String> = Vec::new();
        for key in deps.sorted_watt_keys()? {
            watt_keys.push(key.to_string());
            // Endpoints are only useful alongside their Services
            if key == "service" && settings.enable_endpoints {
                watt_keys.push("endpoints".to_string());
            }
        }
        watt_keys.push("ingresses".to_string());
        tracing::debug!("processing Kubernetes kinds in order {:?}", watt_keys);

        Ok(Self {
            cx: FetchContext::new(settings),
            pipeline: Pipeline {
                processor,
                k8s_parsed: HashSet::new(),
                watt_annotations: Map::new(),
            },
            watt_keys,
            deltas: Vec::new(),
        })
    }

    pub fn context(&self) -> &FetchContext {
        &self.cx
    }

    pub fn into_context(self) -> FetchContext {
        self.cx
    }

    pub fn elements(&self) -> &[ResourceRecord] {
        &self.cx.manager.elements
    }

    pub fn errors(&self) -> &ErrorLog {
        &self.cx.manager.errors
    }

    /// Current location, for messages
    pub fn location(&self) -> String {
        self.cx.location()
    }

    /// Records ordered by rkey
    pub fn sorted(&self) -> Vec<&ResourceRecord> {
        let mut records: Vec<_> = self.elements().iter().collect();
        records.sort_by(|a, b| a.rkey.cmp(&b.rkey));
        records
    }

    /// Load `*.yaml` files from a directory, or a single file of any name.
    ///
    /// Unreadable files are posted as errors and skipped; only a missing root
    /// path fails.
    pub fn load_from_filesystem(
        &mut self,
        path: &Path,
        recurse: bool,
        k8s: bool,
        finalize: bool,
    ) -> FetchResult<()> {
        let metadata = std::fs::metadata(path).map_err(|source| FetchError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut inputs: Vec<(PathBuf, String)> = Vec::new();

        if metadata.is_dir() {
            let mut dirs = VecDeque::from([path.to_path_buf()]);

            while let Some(dir) = dirs.pop_front() {
                let entries = match std::fs::read_dir(&dir) {
                    Ok(entries) => entries,
                    Err(e) => {
                        let text = format!("could not read YAML from {}: {}", dir.display(), e);
                        self.cx.errors_mut().post_error(None, text);
                        continue;
                    }
                };

                let mut entries: Vec<PathBuf> = entries
                    .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                    .collect();
                entries.sort();

                for filepath in entries {
                    if recurse && filepath.is_dir() {
                        dirs.push_back(filepath);
                        continue;
                    }

                    if !filepath.is_file() {
                        continue;
                    }

                    let Some(filename) = filepath.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    if !filename.to_lowercase().ends_with(".yaml") {
                        continue;
                    }

                    let filename = filename.to_string();
                    inputs.push((filepath, filename));
                }
            }
        } else {
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            inputs.push((path.to_path_buf(), filename));
        }

        for (filepath, filename) in inputs {
            tracing::debug!("reading {} ({})", filename, filepath.display());

            match std::fs::read_to_string(&filepath) {
                Ok(serialization) => {
                    self.parse_yaml(&serialization, k8s, None, Some(filename), false)
                }
                Err(e) => {
                    let text = format!("could not read YAML from {}: {}", filepath.display(), e);
                    self.cx.errors_mut().post_error(None, text);
                }
            }
        }

        if finalize {
            self.finalize();
        }

        Ok(())
    }

    pub fn parse_yaml(
        &mut self,
        serialization: &str,
        k8s: bool,
        rkey: Option<String>,
        filename: Option<String>,
        finalize: bool,
    ) {
        match parse_yaml_documents(serialization) {
            Ok(objects) => self
                .pipeline
                .parse_object(&mut self.cx, objects, k8s, rkey, filename),
            Err(e) => {
                let text = format!("{}: could not parse YAML: {}", self.location(), e);
                self.cx.errors_mut().post_error(None, text);
            }
        }

        if finalize {
            self.finalize();
        }
    }

    /// A JSON document or a list of them
    pub fn parse_json(
        &mut self,
        serialization: &str,
        k8s: bool,
        rkey: Option<String>,
        filename: Option<String>,
        finalize: bool,
    ) {
        match serde_json::from_str::<Value>(serialization) {
            Ok(value) => {
                let objects = match value {
                    Value::Array(objects) => objects,
                    other => vec![other],
                };
                self.pipeline
                    .parse_object(&mut self.cx, objects, k8s, rkey, filename);
            }
            Err(e) => {
                let text = format!("{}: could not parse YAML: {}", self.location(), e);
                self.cx.errors_mut().post_error(None, text);
            }
        }

        if finalize {
            self.finalize();
        }
    }

    /// Process a snapshot payload with `Kubernetes`, `Invalid`, `Consul` and
    /// `Deltas` sections
    pub fn parse_watt(&mut self, serialization: &str, finalize: bool) {
        if self.cx.settings.pod_labels.is_empty() && self.cx.settings.pod_labels_path.is_some() {
            self.cx.errors_mut().post_error(
                None,
                "Pod labels are not mounted in the Ambassador container; Kubernetes Ingress support is likely to be limited",
            );
        }

        let watt: Value = match serde_json::from_str(serialization) {
            Ok(watt) => watt,
            Err(e) => {
                let text = format!("{}: could not parse WATT: {}", self.location(), e);
                self.cx.errors_mut().post_error(None, text);
                if finalize {
                    self.finalize();
                }
                return;
            }
        };

        self.deltas = watt
            .get("Deltas")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut watt_k8s = watt
            .get("Kubernetes")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        if let Some(Value::Object(annotations)) = watt_k8s.remove("annotations") {
            self.pipeline.watt_annotations = annotations;
        }

        // Invalid objects still carry errors the user needs to see
        let invalid = watt
            .get("Invalid")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for obj in invalid {
            let Some(kind) = obj.get("kind").and_then(Value::as_str).map(str::to_string) else {
                tracing::error!("skipping invalid object with no kind: {}", obj);
                continue;
            };

            let list = watt_k8s.entry(kind).or_insert_with(|| json!([]));
            if !list.is_array() {
                *list = json!([]);
            }
            if let Value::Array(list) = list {
                list.push(obj);
            }
        }

        let mut keys: Vec<String> = Vec::new();
        for key in self.watt_keys.iter().chain(watt_k8s.keys()) {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }

        for key in keys {
            if key == "endpoints" && !self.cx.settings.enable_endpoints {
                tracing::debug!("endpoint routing disabled, skipping Endpoints");
                continue;
            }

            let Some(Value::Array(objects)) = watt_k8s.remove(&key) else {
                continue;
            };
            for obj in objects {
                self.pipeline.handle_k8s(&mut self.cx, obj);
            }
        }

        let consul_endpoints = watt
            .pointer("/Consul/Endpoints")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        for (consul_rkey, consul_object) in &consul_endpoints {
            self.handle_consul_service(consul_rkey, consul_object);
        }

        if finalize {
            self.finalize();
        }
    }

    /// Turn a Consul service straight into a Service resource
    fn handle_consul_service(&mut self, consul_rkey: &str, consul_object: &Value) {
        let name = consul_object
            .get("Service")
            .and_then(Value::as_str)
            .unwrap_or(consul_rkey);
        let endpoints = consul_object
            .get("Endpoints")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if endpoints.is_empty() {
            tracing::debug!("ignoring Consul service {} with no Endpoints", name);
            return;
        }

        // Consul has no port indirection; every endpoint goes under `*`
        let mut targets = Vec::new();
        for endpoint in &endpoints {
            let address = endpoint.get("Address").filter(|a| a.as_str().is_some_and(|a| !a.is_empty()));
            let port = endpoint.get("Port").filter(|p| !p.is_null() && p.as_i64() != Some(0));

            match (address, port) {
                (Some(address), Some(port)) => targets.push(json!({
                    "ip": address,
                    "port": port,
                    "target_kind": "Consul",
                })),
                _ => tracing::debug!(
                    "ignoring Consul service {} endpoint {} missing address info",
                    name,
                    endpoint.get("ID").unwrap_or(&serde_json::Value::Null)
                ),
            }
        }

        let datacenter = consul_object
            .get("Id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .unwrap_or("dc1");

        let mut endpoints_by_port = Map::new();
        if !targets.is_empty() {
            endpoints_by_port.insert("*".to_string(), Value::Array(targets));
        }

        let object = NormalizedObject::new("Service", name).spec(json!({
            "ambassador_id": self.cx.settings.ambassador_id,
            "datacenter": datacenter,
            "endpoints": endpoints_by_port,
        }));

        self.cx.emit(NormalizedResource::from_data(
            object,
            Some(format!("consul-{}-{}", name, datacenter)),
        ));
    }

    /// Let processors emit whatever they deferred
    pub fn finalize(&mut self) {
        self.pipeline.processor.finalize(&mut self.cx);
    }
}
