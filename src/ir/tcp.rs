//! TCP mappings
//!
//! A TCPMapping forwards a listener port to a service with no HTTP routing.
//! Mappings on the same address, port and host form one group and split
//! connections by weight.

use super::Provenance;
use super::ambassador::AmbassadorModule;
use super::cluster::{ClusterRequest, TlsOrigination, validate_circuit_breakers};
use super::mapping::RouteCluster;
use super::store::StoredConfig;
use crate::diag::ErrorLog;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Keys every TCPMapping in a group must agree on
pub const CORE_TCP_MAPPING_KEYS: &[&str] = &[
    "address",
    "circuit_breakers",
    "enable_ipv4",
    "enable_ipv6",
    "group_id",
    "host",
    "idle_timeout_ms",
    "labels",
    "port",
    "tls",
];

#[derive(Debug, Clone, PartialEq)]
pub struct IrTcpMapping {
    pub rkey: String,
    pub name: String,
    pub namespace: String,
    pub port: u16,
    pub address: Option<String>,
    /// SNI host, when the port is shared
    pub host: Option<String>,
    pub weight: Option<u32>,
    pub group_id: String,
    pub cluster: ClusterRequest,
    core: Vec<(&'static str, Value)>,
}

impl IrTcpMapping {
    pub fn from_config(
        config: &StoredConfig,
        module: &AmbassadorModule,
        log: &mut ErrorLog,
    ) -> Option<Self> {
        let rkey = Some(config.rkey.as_str());

        let mut missing = Vec::new();
        if config.get("port").is_none() {
            missing.push("port");
        }
        if config.get_str("service").is_none_or(str::is_empty) {
            missing.push("service");
        }
        if !missing.is_empty() {
            log.post_error(
                rkey,
                format!("TCPMapping {} is missing required {}", config.name, missing.join(" and ")),
            );
            return None;
        }

        let port = match config.get_i64("port").and_then(|p| u16::try_from(p).ok()) {
            Some(port) if port > 0 => port,
            _ => {
                log.post_error(
                    rkey,
                    format!(
                        "TCPMapping {} has invalid port {}",
                        config.name,
                        config.get("port").map(Value::to_string).unwrap_or_default()
                    ),
                );
                return None;
            }
        };

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
                        format!("TCPMapping {} has invalid weight {}", config.name, value),
                    );
                    return None;
                }
            },
        };

        let address = config.get_str("address").map(str::to_string);
        let host = config.get_str("host").map(str::to_string);
        let group_id = tcp_group_id(address.as_deref(), port, host.as_deref());

        let service = config.get_str("service").unwrap_or_default();
        let mut cluster = ClusterRequest::new(service, config.namespace.clone());
        cluster.tls = TlsOrigination::from_value(config.get("tls"));
        cluster.circuit_breakers = circuit_breakers;
        cluster.enable_ipv4 = config.get_bool("enable_ipv4");
        cluster.enable_ipv6 = config.get_bool("enable_ipv6");
        cluster.stats_name = config.get_str("stats_name").map(str::to_string);
        cluster.resolver = config.get_str("resolver").map(str::to_string);

        let core = CORE_TCP_MAPPING_KEYS
            .iter()
            .map(|&key| {
                let value = match key {
                    "group_id" => Value::String(group_id.clone()),
                    _ => config.get(key).cloned().unwrap_or(Value::Null),
                };
                (key, value)
            })
            .collect();

        Some(Self {
            rkey: config.rkey.clone(),
            name: config.name.clone(),
            namespace: config.namespace.clone(),
            port,
            address,
            host,
            weight,
            group_id,
            cluster,
            core,
        })
    }
}

/// Hex SHA-256 over the address, port and host a TCPMapping listens on
pub fn tcp_group_id(address: Option<&str>, port: u16, host: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"TCP-");
    hasher.update(address.unwrap_or("*").as_bytes());
    hasher.update(port.to_string().as_bytes());
    if let Some(host) = host {
        hasher.update(host.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// TCPMappings sharing a `group_id`
#[derive(Debug, Clone, PartialEq)]
pub struct TcpMappingGroup {
    pub group_id: String,
    pub provenance: Provenance,
    pub mappings: Vec<IrTcpMapping>,
}

impl TcpMappingGroup {
    pub fn new(mapping: IrTcpMapping) -> Self {
        Self {
            group_id: mapping.group_id.clone(),
            provenance: Provenance::new(&mapping.rkey),
            mappings: vec![mapping],
        }
    }

    pub fn add(&mut self, mapping: IrTcpMapping) -> Result<(), String> {
        let mismatches: Vec<String> = self.mappings[0]
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

        self.provenance.reference(&mapping.rkey);
        self.mappings.push(mapping);
        Ok(())
    }

    /// `address-port`, the listener this group needs
    pub fn bind_to(&self) -> String {
        let first = &self.mappings[0];
        format!("{}-{}", first.address.as_deref().unwrap_or("0.0.0.0"), first.port)
    }
}

/// A TCP group as routed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrTcpRoute {
    #[serde(flatten)]
    pub provenance: Provenance,
    pub group_id: String,
    pub name: String,
    pub bind_to: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub clusters: Vec<RouteCluster>,
}
