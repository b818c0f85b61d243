//! Rate limiting
//!
//! At most one RateLimitService is honoured; the first in name order wins.

use super::Provenance;
use super::cluster::{ClusterEnv, ClusterRequest, IrCluster, TlsOrigination};
use super::store::ResourceStore;
use crate::diag::ErrorLog;

pub const DEFAULT_DOMAIN: &str = "ambassador";
pub const DEFAULT_TIMEOUT_MS: i64 = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct IrRateLimit {
    pub provenance: Provenance,
    pub namespace: String,
    pub service: String,
    pub domain: String,
    pub timeout_ms: i64,
    pub failure_mode_deny: bool,
    pub tls: Option<TlsOrigination>,
    /// Name of the rate limit cluster, once built
    pub cluster: Option<String>,
}

impl IrRateLimit {
    pub fn load(store: &ResourceStore, log: &mut ErrorLog) -> Option<Self> {
        let mut configs = store.configs("ratelimit_configs");
        let config = configs.next()?;

        for extra in configs {
            log.post_error(
                Some(&extra.rkey),
                format!("only one RateLimitService is supported; ignoring {}", extra.rkey),
            );
        }

        let Some(service) = config.get_str("service") else {
            log.post_error(
                Some(&config.rkey),
                format!("RateLimitService {}: service is required", config.name),
            );
            return None;
        };

        Some(Self {
            provenance: Provenance::new(&config.rkey),
            namespace: config.namespace.clone(),
            service: service.to_string(),
            domain: config
                .get_str("domain")
                .unwrap_or(DEFAULT_DOMAIN)
                .to_string(),
            timeout_ms: config.get_i64("timeout_ms").unwrap_or(DEFAULT_TIMEOUT_MS),
            failure_mode_deny: config.get_bool("failure_mode_deny").unwrap_or(false),
            tls: TlsOrigination::from_value(config.get("tls")),
            cluster: None,
        })
    }

    /// The gRPC cluster for the rate limit service
    pub fn build_cluster(&mut self, env: ClusterEnv<'_>, log: &mut ErrorLog) -> Option<IrCluster> {
        let mut request = ClusterRequest::new(self.service.clone(), self.namespace.clone());
        request.marker = Some("ratelimit".to_string());
        request.tls = self.tls.clone();
        request.grpc = true;

        let (cluster, errors) = IrCluster::new(&self.provenance.source, request, env);
        for error in errors {
            log.post_error(Some(&self.provenance.source), error);
        }
        if cluster.ignore {
            return None;
        }

        self.cluster = Some(cluster.name.clone());
        Some(cluster)
    }
}
