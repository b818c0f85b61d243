//! HTTP mappings and the groups that become routes
//!
//! Mappings that match the same requests (method, prefix, headers, precedence)
//! share a `group_id` and are routed together, splitting traffic by weight.

use super::Provenance;
use super::cluster::{ClusterRequest, TlsOrigination, validate_circuit_breakers, validate_load_balancer};
use super::ambassador::AmbassadorModule;
use super::store::StoredConfig;
use crate::diag::ErrorLog;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;

/// Keys every mapping in a group must agree on
pub const CORE_MAPPING_KEYS: &[&str] = &[
    "bypass_auth",
    "bypass_error_response_overrides",
    "circuit_breakers",
    "cluster_timeout_ms",
    "connect_timeout_ms",
    "cluster_idle_timeout_ms",
    "cluster_max_connection_lifetime_ms",
    "group_id",
    "headers",
    "keepalive",
    "labels",
    "load_balancer",
    "method",
    "prefix",
    "prefix_regex",
    "prefix_exact",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderMatch {
    pub name: String,
    /// `None` matches on presence alone
    pub value: Option<String>,
    pub regex: bool,
}

impl HeaderMatch {
    fn length(&self) -> usize {
        self.name.len() + self.value.as_deref().map_or(0, str::len) + usize::from(self.regex)
    }

    fn key(&self) -> String {
        match &self.value {
            Some(value) => format!("{}-{}", self.name, value),
            None => self.name.clone(),
        }
    }
}

/// Ordering of routes: higher sorts first
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct RouteWeight {
    pub precedence: i64,
    pub prefix_len: usize,
    pub headers_len: usize,
    pub prefix: String,
    pub method: String,
    pub header_keys: Vec<String>,
}

/// A validated Mapping
#[derive(Debug, Clone, PartialEq)]
pub struct IrMapping {
    pub rkey: String,
    pub name: String,
    pub namespace: String,
    pub prefix: String,
    pub method: String,
    pub headers: Vec<HeaderMatch>,
    pub host: Option<String>,
    pub precedence: i64,
    pub weight: Option<u32>,
    pub group_id: String,
    pub route_weight: RouteWeight,
    pub cluster: ClusterRequest,
    /// Core key values, for group agreement
    core: Vec<(&'static str, Value)>,
}

impl IrMapping {
    /// Validate a Mapping; errors are posted against its rkey
    pub fn from_config(
        config: &StoredConfig,
        module: &AmbassadorModule,
        log: &mut ErrorLog,
    ) -> Option<Self> {
        let rkey = Some(config.rkey.as_str());

        let mut missing = Vec::new();
        for field in ["prefix", "service"] {
            if config.get_str(field).is_none_or(str::is_empty) {
                missing.push(field);
            }
        }
        if !missing.is_empty() {
            log.post_error(
                rkey,
                format!("Mapping {} is missing required {}", config.name, missing.join(" and ")),
            );
            return None;
        }
        let prefix = config.get_str("prefix").unwrap_or_default().to_string();
        let service = config.get_str("service").unwrap_or_default().to_string();

        let load_balancer = config.get("load_balancer").cloned();
        if let Some(lb) = &load_balancer {
            if !validate_load_balancer(lb) {
                log.post_error(
                    rkey,
                    format!("Invalid load_balancer specified: {}, invalidating mapping", lb),
                );
                return None;
            }
        }

        let circuit_breakers = match config.get("circuit_breakers") {
            Some(breakers) => match validate_circuit_breakers(breakers) {
                Some(breakers) => Some(breakers),
                None => {
                    log.post_error(
                        rkey,
                        format!(
                            "Invalid circuit_breakers specified: {}, invalidating mapping",
                            breakers
                        ),
                    );
                    return None;
                }
            },
            None => module.circuit_breakers.clone(),
        };

        let weight = match config.get("weight") {
            None => None,
            Some(value) => match value.as_u64().filter(|w| *w <= 100) {
                Some(w) => Some(w as u32),
                None => {
                    log.post_error(
                        rkey,
                        format!("Mapping {} has invalid weight {}", config.name, value),
                    );
                    return None;
                }
            },
        };

        let method = config.get_str("method").unwrap_or("GET").to_uppercase();
        let precedence = config.get_i64("precedence").unwrap_or(0);

        let mut headers = header_matches(config.get("headers"), false);
        headers.extend(header_matches(config.get("regex_headers"), true));

        // `hostname: "*"` matches every host
        let host = config
            .get_str("host")
            .or_else(|| config.get_str("hostname"))
            .filter(|h| *h != "*")
            .map(str::to_string);
        if let Some(host) = &host {
            headers.push(HeaderMatch {
                name: ":authority".to_string(),
                value: Some(host.clone()),
                regex: config.get_bool("host_regex").unwrap_or(false),
            });
        }

        let group_id = group_id(&method, &prefix, &headers, precedence);
        let route_weight = RouteWeight {
            precedence,
            prefix_len: prefix.len(),
            headers_len: headers.iter().map(HeaderMatch::length).sum(),
            prefix: prefix.clone(),
            method: method.clone(),
            header_keys: headers.iter().map(HeaderMatch::key).collect(),
        };

        let mut cluster = ClusterRequest::new(service, config.namespace.clone());
        cluster.tls = TlsOrigination::from_value(config.get("tls"));
        if let Some(dns_type) = config.get_str("dns_type") {
            cluster.dns_type = dns_type.to_string();
        }
        cluster.host_rewrite = config.get_str("host_rewrite").map(str::to_string);
        cluster.grpc = config.get_bool("grpc").unwrap_or(false);
        cluster.load_balancer = load_balancer;
        cluster.keepalive = config.get("keepalive").cloned();
        cluster.circuit_breakers = circuit_breakers;
        cluster.connect_timeout_ms = config.get_i64("connect_timeout_ms").unwrap_or(3000);
        cluster.cluster_idle_timeout_ms = config.get_i64("cluster_idle_timeout_ms");
        cluster.cluster_max_connection_lifetime_ms =
            config.get_i64("cluster_max_connection_lifetime_ms");
        cluster.enable_ipv4 = config.get_bool("enable_ipv4");
        cluster.enable_ipv6 = config.get_bool("enable_ipv6");
        cluster.stats_name = config.get_str("stats_name").map(str::to_string);
        cluster.respect_dns_ttl = config.get_bool("respect_dns_ttl").unwrap_or(false);
        cluster.resolver = config.get_str("resolver").map(str::to_string);

        let core = CORE_MAPPING_KEYS
            .iter()
            .map(|&key| {
                let value = match key {
                    "group_id" => Value::String(group_id.clone()),
                    "method" => Value::String(method.clone()),
                    _ => config.get(key).cloned().unwrap_or(Value::Null),
                };
                (key, value)
            })
            .collect();

        Some(Self {
            rkey: config.rkey.clone(),
            name: config.name.clone(),
            namespace: config.namespace.clone(),
            prefix,
            method,
            headers,
            host,
            precedence,
            weight,
            group_id,
            route_weight,
            cluster,
            core,
        })
    }
}

fn header_matches(value: Option<&Value>, regex: bool) -> Vec<HeaderMatch> {
    let Some(Value::Object(headers)) = value else {
        return Vec::new();
    };

    headers
        .iter()
        .map(|(name, value)| HeaderMatch {
            name: name.clone(),
            value: match value {
                Value::String(s) => Some(s.clone()),
                Value::Bool(true) | Value::Null => None,
                other => Some(other.to_string()),
            },
            regex,
        })
        .collect()
}

/// Hex SHA-256 over everything that decides which requests a mapping matches
pub fn group_id(method: &str, prefix: &str, headers: &[HeaderMatch], precedence: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"HTTP-");
    hasher.update(method.as_bytes());
    hasher.update(prefix.as_bytes());
    for header in headers {
        hasher.update(header.name.as_bytes());
        if let Some(value) = &header.value {
            hasher.update(value.as_bytes());
        }
    }
    if precedence != 0 {
        hasher.update(precedence.to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Mappings sharing a `group_id`
#[derive(Debug, Clone, PartialEq)]
pub struct MappingGroup {
    pub group_id: String,
    pub provenance: Provenance,
    pub mappings: Vec<IrMapping>,
    pub group_weight: RouteWeight,
}

impl MappingGroup {
    pub fn new(mapping: IrMapping) -> Self {
        Self {
            group_id: mapping.group_id.clone(),
            provenance: Provenance::new(&mapping.rkey),
            group_weight: mapping.route_weight.clone(),
            mappings: vec![mapping],
        }
    }

    /// Add a mapping whose core keys agree with the group
    pub fn add(&mut self, mapping: IrMapping) -> Result<(), String> {
        let first = &self.mappings[0];
        let mismatches: Vec<String> = first
            .core
            .iter()
            .zip(&mapping.core)
            .filter(|((_, a), (_, b))| a != b)
            .map(|((key, a), (_, b))| format!("{}: {} != {}", key, a, b))
            .collect();

        if !mismatches.is_empty() {
            return Err(format!(
                "cannot accept new mapping {} with mismatched {}",
                mapping.name,
                mismatches.join(", ")
            ));
        }

        if mapping.route_weight > self.group_weight {
            self.group_weight = mapping.route_weight.clone();
        }
        self.provenance.reference(&mapping.rkey);
        self.mappings.push(mapping);
        Ok(())
    }

    /// Weights for each mapping, in order.
    ///
    /// Explicit weights are kept; whatever is left of 100 is shared by the
    /// unweighted mappings, the last taking the remainder. `None` if the
    /// explicit weights already exceed 100.
    pub fn normalized_weights(&self) -> Option<Vec<u32>> {
        weights(self.mappings.iter().map(|m| m.weight))
    }

    /// Routes sort by descending group weight
    pub fn route_order(a: &MappingGroup, b: &MappingGroup) -> Ordering {
        b.group_weight
            .cmp(&a.group_weight)
            .then_with(|| a.group_id.cmp(&b.group_id))
    }
}

pub(crate) fn weights(requested: impl Iterator<Item = Option<u32>> + Clone) -> Option<Vec<u32>> {
    let assigned: u32 = requested.clone().flatten().sum();
    if assigned > 100 {
        return None;
    }

    let unweighted = requested.clone().filter(Option::is_none).count() as u32;
    let mut remaining = 100 - assigned;
    let mut left = unweighted;

    Some(
        requested
            .map(|weight| match weight {
                Some(weight) => weight,
                None => {
                    let share = if left == 1 { remaining } else { remaining / left };
                    remaining -= share;
                    left -= 1;
                    share
                }
            })
            .collect(),
    )
}

/// A weighted cluster on a route
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteCluster {
    pub name: String,
    pub weight: u32,
}

/// A group as routed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrRoute {
    #[serde(flatten)]
    pub provenance: Provenance,
    pub group_id: String,
    pub name: String,
    pub prefix: String,
    pub method: String,
    pub precedence: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub clusters: Vec<RouteCluster>,
}
