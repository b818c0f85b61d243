//! Resource store
//!
//! First IR stage: validates fetched records and files them into the buckets the
//! compiler reads from. Every record becomes a source, accepted or not, so its
//! errors stay attributable.

use crate::config::Settings;
use crate::diag::ErrorLog;
use crate::fetch::ResourceRecord;
use crate::models::NativeKind;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// `_source` of elements nothing declared
pub const SOURCE_INTERNAL: &str = "--internal--";

const SUPPORTED_AMBASSADOR_VERSIONS: &[&str] = &["getambassador.io/v2", "getambassador.io/v3alpha1"];

/// Where a record came from, split back into file and occurrence
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Source {
    #[serde(rename = "_source")]
    pub rkey: String,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    pub kind: String,
}

impl Source {
    /// `quote.default.1` is file `quote.default`, index 1; a bare rkey is its own file
    pub fn from_rkey(rkey: &str, kind: &str) -> Self {
        let split = rkey
            .rsplit_once('.')
            .and_then(|(file, index)| index.parse::<u64>().ok().map(|index| (file, index)));

        let (filename, index) = match split {
            Some((file, index)) => (file.to_string(), Some(index)),
            None => (rkey.to_string(), None),
        };

        Self {
            rkey: rkey.to_string(),
            filename,
            index,
            kind: kind.to_string(),
        }
    }
}

/// An accepted configuration element
#[derive(Debug, Clone, PartialEq)]
pub struct StoredConfig {
    pub rkey: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub api_version: String,
    pub object: Map<String, Value>,
    /// Position in the input
    pub sequence: usize,
}

impl StoredConfig {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.object.get(field).filter(|v| !v.is_null())
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(Value::as_bool)
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_i64)
    }
}

/// Validated resources, bucketed for the compiler
#[derive(Debug, Clone)]
pub struct ResourceStore {
    settings: Arc<Settings>,
    modules: BTreeMap<String, StoredConfig>,
    configs: BTreeMap<String, BTreeMap<String, StoredConfig>>,
    sources: BTreeMap<String, Source>,
    locations: BTreeMap<String, Vec<String>>,
}

impl ResourceStore {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            modules: BTreeMap::new(),
            configs: BTreeMap::new(),
            sources: BTreeMap::new(),
            locations: BTreeMap::new(),
        }
    }

    /// Validate and store every record, posting problems to `log`
    pub fn load(records: &[ResourceRecord], settings: Arc<Settings>, log: &mut ErrorLog) -> Self {
        let mut store = Self::new(settings);
        for record in records {
            store.save(record, log);
        }
        store
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Record `record` as a source and, if it validates, store it
    pub fn save(&mut self, record: &ResourceRecord, log: &mut ErrorLog) {
        let source = Source::from_rkey(&record.rkey, &record.kind);
        self.locations
            .entry(source.filename.clone())
            .or_default()
            .push(record.rkey.clone());
        self.sources.insert(record.rkey.clone(), source);

        let api_version = record.api_version();
        let rkey = Some(record.rkey.as_str());

        if api_version.starts_with("getambassador.io/") {
            if !SUPPORTED_AMBASSADOR_VERSIONS.contains(&api_version) {
                log.post_notice(rkey, format!("apiVersion {} is not supported", api_version));
            }
        } else if !api_version.starts_with("networking.internal.knative.dev") {
            log.post_error(rkey, format!("apiVersion {} unsupported", api_version));
            return;
        }

        if let Some(errors) = record.errors() {
            let lines: Vec<&str> = errors
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .collect();
            if !lines.is_empty() {
                log.post_error(rkey, lines.join("; "));
                return;
            }
        }

        let namespace = record
            .namespace
            .clone()
            .unwrap_or_else(|| self.settings.ambassador_namespace.clone());
        let name = record.name.clone().unwrap_or_else(|| record.rkey.clone());

        let mut stored = StoredConfig {
            rkey: record.rkey.clone(),
            kind: record.kind.clone(),
            name,
            namespace,
            api_version: api_version.to_string(),
            object: record.object.clone(),
            sequence: self.sources.len(),
        };

        match record.kind.as_str() {
            "Module" => {
                stored.object = match record.get("config") {
                    Some(Value::Object(config)) => config.clone(),
                    _ => Map::new(),
                };
                self.save_named("modules", stored, log);
            }
            "Service" => self.save_by_rkey("services", stored),
            "Secret" => self.save_by_rkey("secrets", stored),
            "Ingress" => self.save_by_rkey("ingresses", stored),
            kind => match NativeKind::parse_optional(kind).and_then(|k| k.storage_bucket()) {
                Some(bucket) => self.save_named(bucket, stored, log),
                None => {
                    let bucket = kind.to_lowercase();
                    tracing::debug!("{}: saving {} under {}", stored.rkey, kind, bucket);
                    self.save_named(&bucket, stored, log);
                }
            },
        }
    }

    fn save_by_rkey(&mut self, bucket: &str, stored: StoredConfig) {
        self.configs
            .entry(bucket.to_string())
            .or_default()
            .insert(stored.rkey.clone(), stored);
    }

    fn save_named(&mut self, bucket: &str, mut stored: StoredConfig, log: &mut ErrorLog) {
        let storage = if bucket == "modules" {
            &mut self.modules
        } else {
            self.configs.entry(bucket.to_string()).or_default()
        };

        if let Some(existing) = storage.get(&stored.name) {
            if existing.namespace == stored.namespace {
                log.post_error(
                    Some(&stored.rkey),
                    format!(
                        "{} defines {} {}, which is already defined by {}",
                        stored.rkey, stored.kind, stored.name, existing.rkey
                    ),
                );
                return;
            }
            stored.name = format!("{}.{}", stored.name, stored.namespace);
        }

        tracing::debug!("{}: saving {} {}", stored.rkey, stored.kind, stored.name);
        storage.insert(stored.name.clone(), stored);
    }

    pub fn module(&self, name: &str) -> Option<&StoredConfig> {
        self.modules.get(name)
    }

    /// Elements of a bucket in the order they were declared
    pub fn configs(&self, bucket: &str) -> impl Iterator<Item = &StoredConfig> {
        let mut configs: Vec<&StoredConfig> = self
            .configs
            .get(bucket)
            .into_iter()
            .flat_map(BTreeMap::values)
            .collect();
        configs.sort_by_key(|config| config.sequence);
        configs.into_iter()
    }

    pub fn config(&self, bucket: &str, key: &str) -> Option<&StoredConfig> {
        self.configs.get(bucket).and_then(|b| b.get(key))
    }

    /// The Secret named `name` in `namespace`
    pub fn find_secret(&self, name: &str, namespace: &str) -> Option<&StoredConfig> {
        self.configs("secrets")
            .find(|s| s.name == name && s.namespace == namespace)
    }

    pub fn sources(&self) -> &BTreeMap<String, Source> {
        &self.sources
    }

    /// rkeys recorded from `filename`
    pub fn location(&self, filename: &str) -> Option<&[String]> {
        self.locations.get(filename).map(Vec::as_slice)
    }
}
