//! Reconstitution check
//!
//! Rebuilds the overview from the per-source fragments of the IR and diffs the
//! two. Any difference means some element's provenance does not account for
//! where it actually came from.

use crate::ir::SOURCE_INTERNAL;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};

/// Whatever can produce an overview and per-source fragments of it
#[cfg_attr(test, mockall::automock)]
pub trait IntermediateSource {
    /// The complete overview
    fn overview(&self) -> Value;

    /// The fragment contributed by one source key
    fn intermediate_for(&self, key: &str) -> Value;
}

/// Outcome of a reconstitution check
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParanoiaReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Reconstituted lists, before filtering
    pub reconstituted: Map<String, Value>,
}

impl ParanoiaReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Identity of an element within its kind; `None` for kinds with no identity
fn uniqueness(kind: &str, element: &Value) -> Option<String> {
    let field = |name: &str| match element.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };

    match kind {
        "breakers" | "outliers" | "filters" | "tls_contexts" => Some(field("name")),
        "tls" => Some("TLS".to_string()),
        "listeners" => Some(format!("{}-{}", field("service_port"), field("admin_port"))),
        "routes" | "tcp_routes" => Some(field("group_id")),
        "sources" => Some(match element.get("index") {
            Some(index) if !index.is_null() => format!("{}.{}", field("filename"), index),
            _ => field("filename"),
        }),
        _ => None,
    }
}

/// Sort key used when flattening: the kind's identity, else `name`
fn sort_key(kind: &str, element: &Value) -> String {
    uniqueness(kind, element).unwrap_or_else(|| {
        element
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    })
}

fn source_of(element: &Value) -> &str {
    element
        .get("_source")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

fn referenced_by(element: &mut Value) -> Option<&mut Vec<Value>> {
    element
        .get_mut("_referenced_by")
        .and_then(Value::as_array_mut)
}

#[derive(Default)]
struct Reconstitution {
    clusters: BTreeMap<String, Value>,
    others: BTreeMap<String, BTreeMap<String, Value>>,
    missing_uniqueness: BTreeSet<String>,
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl Reconstitution {
    fn merge_cluster(&mut self, source_key: &str, cluster: &Value) {
        let cname = cluster
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let Some(existing) = self.clusters.get_mut(&cname) else {
            let mut cluster = cluster.clone();
            if let Some(obj) = cluster.as_object_mut() {
                obj.insert("_referenced_by".to_string(), json!([source_key]));
            }
            self.clusters.insert(cname, cluster);
            return;
        };

        let rsource = source_of(existing).to_string();

        if let Some(refs) = referenced_by(existing) {
            if refs.iter().any(|r| r == source_key) {
                self.errors.push(format!(
                    "{}: already appears in cluster {}?",
                    source_key, cname
                ));
            } else {
                refs.push(json!(source_key));
            }
        }

        let (Some(new), Some(old)) = (cluster.as_object(), existing.as_object()) else {
            return;
        };

        for (ckey, value) in new {
            if ckey == "_referenced_by" {
                continue;
            }
            if old.get(ckey) != Some(value) {
                self.errors.push(format!(
                    "{}: cluster {} doesn't match {} for {}",
                    source_key, cname, rsource, ckey
                ));
            }
        }

        for rkey in old.keys() {
            if !new.contains_key(rkey) {
                self.errors.push(format!(
                    "{}: cluster {} is missing key {} from source {}",
                    source_key, cname, rkey, rsource
                ));
            }
        }
    }

    fn merge_other(&mut self, source_key: &str, kind: &str, elements: &[Value]) {
        for element in elements {
            let Some(u) = uniqueness(kind, element) else {
                if self.missing_uniqueness.insert(kind.to_string()) {
                    tracing::warn!("no uniqueness function for {}", kind);
                    self.warnings.push(format!("missing uniqifier for {}", kind));
                }
                return;
            };

            let merged = self.others.entry(kind.to_string()).or_default();
            match merged.get_mut(&u) {
                None => {
                    merged.insert(u, element.clone());
                }
                Some(existing) if source_of(existing) != source_of(element) => {
                    self.errors.push(format!(
                        "{}: {} {} already defined by {}",
                        source_key,
                        kind,
                        u,
                        pretty(existing)
                    ));
                }
                Some(existing) => {
                    let osrc = source_of(element).to_string();
                    if let Some(refs) = referenced_by(existing) {
                        if !refs.iter().any(|r| *r == osrc) {
                            refs.push(json!(osrc));
                        }
                    }
                }
            }
        }
    }

    fn absorb(&mut self, source_key: &str, fragment: &Value) {
        let Some(fragment) = fragment.as_object() else {
            return;
        };

        if let Some(error) = fragment.get("error").and_then(Value::as_str) {
            self.errors.push(format!("{}: {}", source_key, error));
            return;
        }

        for (kind, elements) in fragment {
            let elements = match elements {
                Value::Array(elements) => elements.as_slice(),
                other => std::slice::from_ref(other),
            };

            if kind == "clusters" {
                for cluster in elements {
                    self.merge_cluster(source_key, cluster);
                }
            } else {
                self.merge_other(source_key, kind, elements);
            }
        }
    }

    /// Flip the merged maps back into sorted lists
    fn into_lists(self) -> (Map<String, Value>, Vec<String>, Vec<String>) {
        let mut lists = Map::new();

        if !self.clusters.is_empty() {
            let clusters = self
                .clusters
                .into_values()
                .map(|mut cluster| {
                    if let Some(refs) = referenced_by(&mut cluster) {
                        refs.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
                    }
                    cluster
                })
                .collect();
            lists.insert("clusters".to_string(), Value::Array(clusters));
        }

        for (kind, merged) in self.others {
            if kind == "sources" {
                lists.insert(kind, Value::Array(reassemble_sources(merged)));
                continue;
            }

            let mut elements: Vec<Value> = merged.into_values().collect();
            elements.sort_by_key(|e| sort_key(&kind, e));
            lists.insert(kind, Value::Array(elements));
        }

        (lists, self.errors, self.warnings)
    }
}

/// Group per-object source elements back into file summaries
fn reassemble_sources(objects: BTreeMap<String, Value>) -> Vec<Value> {
    let mut files: BTreeMap<String, (usize, usize, Map<String, Value>)> = BTreeMap::new();

    for (source_key, obj) in objects {
        let filename = obj
            .get("filename")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let errors = obj.get("errors").cloned().unwrap_or_else(|| json!([]));
        let (count, error_count, entries) = files.entry(filename).or_default();

        *count += 1;
        *error_count += errors.as_array().map_or(0, Vec::len);
        entries.insert(
            source_key.clone(),
            json!({
                "errors": errors,
                "key": source_key,
                "kind": obj.get("kind").cloned().unwrap_or(Value::Null),
            }),
        );
    }

    files
        .into_iter()
        .map(|(filename, (count, error_count, objects))| {
            crate::ir::source_file_entry(&filename, count, error_count, objects)
        })
        .collect()
}

/// Drop internal bookkeeping so both sides compare on declared sources only
fn filter_lists(lists: &Map<String, Value>) -> Map<String, Value> {
    let mut filtered = Map::new();

    for (kind, value) in lists {
        if is_empty(value) {
            continue;
        }

        let elements = match value {
            Value::Array(elements) => elements.clone(),
            other => vec![other.clone()],
        };

        let mut kept: Vec<Value> = elements
            .into_iter()
            .filter(|e| source_of(e) != SOURCE_INTERNAL)
            .map(|mut e| {
                if let Some(refs) = referenced_by(&mut e) {
                    refs.retain(|r| r != SOURCE_INTERNAL);
                }
                e
            })
            .collect();

        if kept.is_empty() {
            continue;
        }

        kept.sort_by_key(|e| sort_key(kind, e));
        filtered.insert(kind.clone(), Value::Array(kept));
    }

    filtered
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Line diff of two texts, `-` for `old` only, `+` for `new` only
pub fn line_diff(old: &str, new: &str) -> String {
    let a: Vec<&str> = old.lines().collect();
    let b: Vec<&str> = new.lines().collect();

    // lcs[i][j] is the common subsequence length of a[i..] and b[j..]
    let mut lcs = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            lcs[i][j] = if a[i] == b[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] == b[j] {
            out.push(format!(" {}", a[i]));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            out.push(format!("-{}", a[i]));
            i += 1;
        } else {
            out.push(format!("+{}", b[j]));
            j += 1;
        }
    }
    out.extend(a[i..].iter().map(|line| format!("-{}", line)));
    out.extend(b[j..].iter().map(|line| format!("+{}", line)));

    out.join("\n")
}

/// Reconstitute the overview of `source` from its fragments and compare.
///
/// Never fails; every problem is returned in the report.
pub fn check(source: &dyn IntermediateSource) -> ParanoiaReport {
    let overview = source.overview();
    let mut reconstitution = Reconstitution::default();

    let source_keys: Vec<String> = overview
        .get("sources")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|file| file.get("objects").and_then(Value::as_object))
        .flat_map(|objects| objects.keys().cloned())
        .collect();

    tracing::debug!("reconstituting from {} sources", source_keys.len());

    for source_key in &source_keys {
        let fragment = source.intermediate_for(source_key);
        reconstitution.absorb(source_key, &fragment);
    }

    let (mut lists, mut errors, warnings) = reconstitution.into_lists();

    if !lists.contains_key("listeners") {
        lists.insert(
            "listeners".to_string(),
            json!([{
                "_source": SOURCE_INTERNAL,
                "admin_port": crate::ir::ambassador::DEFAULT_ADMIN_PORT,
                "service_port": crate::ir::ambassador::DEFAULT_SERVICE_PORT
            }]),
        );
    }
    if !lists.contains_key("filters") {
        lists.insert("filters".to_string(), json!([]));
    }

    let empty = Map::new();
    let filtered_overview = filter_lists(overview.as_object().unwrap_or(&empty));
    let filtered_reconstituted = filter_lists(&lists);

    if filtered_overview != filtered_reconstituted {
        let ov = pretty(&Value::Object(filtered_overview));
        let rc = pretty(&Value::Object(filtered_reconstituted));
        tracing::warn!("overview and reconstituted diagnostics differ");
        errors.push(format!(
            "mismatch between overview and reconstituted diagnostics\n-- DIFF --\n{}\n-- OVERVIEW --\n{}\n\n-- RECONSTITUTED --\n{}\n",
            line_diff(&ov, &rc),
            ov,
            rc
        ));
    }

    ParanoiaReport {
        errors,
        warnings,
        reconstituted: lists,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(name: &str, source: &str, weight: u32) -> Value {
        json!({
            "_source": source,
            "_referenced_by": [source],
            "name": name,
            "weight": weight
        })
    }

    fn sources(keys: &[(&str, &str, u64)]) -> Value {
        let mut files: BTreeMap<&str, Map<String, Value>> = BTreeMap::new();
        for (file, rkey, _) in keys {
            files.entry(*file).or_default().insert(
                rkey.to_string(),
                json!({"errors": [], "key": rkey, "kind": "Mapping"}),
            );
        }
        Value::Array(
            files
                .into_iter()
                .map(|(file, objects)| {
                    let count = objects.len();
                    crate::ir::source_file_entry(file, count, 0, objects)
                })
                .collect(),
        )
    }

    fn source_element(file: &str, rkey: &str, index: u64) -> Value {
        json!({
            "_source": rkey,
            "_referenced_by": [rkey],
            "filename": file,
            "index": index,
            "kind": "Mapping",
            "errors": []
        })
    }

    #[test]
    fn test_uniqueness() {
        assert_eq!(
            uniqueness("listeners", &json!({"service_port": 80, "admin_port": 8001})),
            Some("80-8001".to_string())
        );
        assert_eq!(
            uniqueness("sources", &json!({"filename": "a.yaml", "index": 2})),
            Some("a.yaml.2".to_string())
        );
        assert_eq!(
            uniqueness("sources", &json!({"filename": "svc.default"})),
            Some("svc.default".to_string())
        );
        assert_eq!(uniqueness("tls", &json!({})), Some("TLS".to_string()));
        assert_eq!(
            uniqueness("tcp_routes", &json!({"group_id": "bb", "name": "redis"})),
            Some("bb".to_string())
        );
        assert_eq!(uniqueness("gizmos", &json!({"name": "x"})), None);
        assert_eq!(sort_key("gizmos", &json!({"name": "x"})), "x");
    }

    #[test]
    fn test_filter_lists() {
        let lists = json!({
            "filters": [],
            "listeners": [{"_source": "--internal--", "admin_port": 8001, "service_port": 80}],
            "tls": {"_source": "a.yaml.1", "_referenced_by": ["--internal--", "a.yaml.1"]},
            "routes": [
                {"_source": "b.yaml.1", "group_id": "bb"},
                {"_source": "a.yaml.1", "group_id": "aa"}
            ]
        });
        let filtered = filter_lists(lists.as_object().unwrap());

        assert!(!filtered.contains_key("filters"));
        assert!(!filtered.contains_key("listeners"));
        assert_eq!(
            filtered["tls"],
            json!([{"_source": "a.yaml.1", "_referenced_by": ["a.yaml.1"]}])
        );
        assert_eq!(filtered["routes"][0]["group_id"], "aa");
    }

    #[test]
    fn test_line_diff() {
        assert_eq!(line_diff("a\nb\nc", "a\nc\nd"), " a\n-b\n c\n+d");
        assert_eq!(line_diff("same", "same"), " same");
    }

    #[test]
    fn test_consistent_fragments_pass() {
        let mut mock = MockIntermediateSource::new();
        let mut shared = cluster("cluster_qotm", "a.yaml.1", 100);
        shared["_referenced_by"] = json!(["a.yaml.1", "b.yaml.1"]);

        let overview = json!({
            "sources": sources(&[("a.yaml", "a.yaml.1", 1), ("b.yaml", "b.yaml.1", 1)]),
            "clusters": [shared.clone()],
            "filters": [],
            "listeners": [{"_source": "--internal--", "_referenced_by": ["--internal--"], "admin_port": 8001, "service_port": 80}]
        });
        mock.expect_overview().return_const(overview);

        let fragment_a = json!({
            "sources": [source_element("a.yaml", "a.yaml.1", 1)],
            "clusters": [shared.clone()]
        });
        let fragment_b = json!({
            "sources": [source_element("b.yaml", "b.yaml.1", 1)],
            "clusters": [shared]
        });
        mock.expect_intermediate_for()
            .times(2)
            .returning(move |key| match key {
                "a.yaml.1" => fragment_a.clone(),
                _ => fragment_b.clone(),
            });

        let report = check(&mock);

        assert!(report.is_ok(), "{:?}", report.errors);
        assert!(report.warnings.is_empty());
        assert_eq!(
            report.reconstituted["clusters"][0]["_referenced_by"],
            json!(["a.yaml.1", "b.yaml.1"])
        );
    }

    #[test]
    fn test_cluster_conflict_names_both_sources() {
        let mut mock = MockIntermediateSource::new();
        mock.expect_overview().return_const(json!({
            "sources": sources(&[("a.yaml", "a.yaml.1", 1), ("b.yaml", "b.yaml.1", 1)]),
        }));
        mock.expect_intermediate_for().returning(|key| match key {
            "a.yaml.1" => json!({"clusters": [cluster("foo", "a.yaml.1", 100)]}),
            _ => json!({"clusters": [cluster("foo", "a.yaml.1", 50)]}),
        });

        let report = check(&mock);
        let conflicts: Vec<&String> = report
            .errors
            .iter()
            .filter(|e| e.contains("doesn't match"))
            .collect();

        assert_eq!(
            conflicts,
            vec!["b.yaml.1: cluster foo doesn't match a.yaml.1 for weight"]
        );
    }

    #[test]
    fn test_unknown_kind_warns_once() {
        let mut mock = MockIntermediateSource::new();
        mock.expect_overview().return_const(json!({
            "sources": sources(&[("a.yaml", "a.yaml.1", 1), ("a.yaml", "a.yaml.2", 2)]),
        }));
        mock.expect_intermediate_for()
            .returning(|_| json!({"gizmos": [{"_source": "a.yaml.1", "name": "g"}]}));

        let report = check(&mock);

        assert_eq!(report.warnings, vec!["missing uniqifier for gizmos"]);
        assert!(!report.reconstituted.contains_key("gizmos"));
    }

    #[test]
    fn test_missing_listener_gets_default() {
        let mut mock = MockIntermediateSource::new();
        mock.expect_overview().return_const(json!({
            "sources": [],
            "listeners": [{"admin_port": 8001, "service_port": 80, "_source": "--internal--"}]
        }));
        mock.expect_intermediate_for().never();

        let report = check(&mock);

        assert!(report.is_ok(), "{:?}", report.errors);
        assert_eq!(
            report.reconstituted["listeners"],
            json!([{"_source": "--internal--", "admin_port": 8001, "service_port": 80}])
        );
        assert_eq!(report.reconstituted["filters"], json!([]));
    }

    #[test]
    fn test_element_claimed_by_two_sources() {
        let mut mock = MockIntermediateSource::new();
        mock.expect_overview().return_const(json!({
            "sources": sources(&[("a.yaml", "a.yaml.1", 1), ("b.yaml", "b.yaml.1", 1)]),
        }));
        mock.expect_intermediate_for().returning(|key| {
            json!({"tls_contexts": [{"_source": key, "name": "ctx"}]})
        });

        let report = check(&mock);

        assert!(
            report
                .errors
                .iter()
                .any(|e| e.starts_with("b.yaml.1: tls_contexts ctx already defined by"))
        );
    }
}
