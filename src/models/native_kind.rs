//! Native gateway resource kinds
//!
//! Centralized enum for the gateway's own CRD kinds, which are passed through the
//! fetch stage unchanged apart from normalization.

use std::fmt;
use std::str::FromStr;

/// Enumeration of the gateway's native CRD kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeKind {
    AuthService,
    ConsulResolver,
    Host,
    KubernetesEndpointResolver,
    KubernetesServiceResolver,
    LogService,
    Mapping,
    Module,
    RateLimitService,
    TCPMapping,
    TLSContext,
    TracingService,
}

impl NativeKind {
    /// Get the kind name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            NativeKind::AuthService => "AuthService",
            NativeKind::ConsulResolver => "ConsulResolver",
            NativeKind::Host => "Host",
            NativeKind::KubernetesEndpointResolver => "KubernetesEndpointResolver",
            NativeKind::KubernetesServiceResolver => "KubernetesServiceResolver",
            NativeKind::LogService => "LogService",
            NativeKind::Mapping => "Mapping",
            NativeKind::Module => "Module",
            NativeKind::RateLimitService => "RateLimitService",
            NativeKind::TCPMapping => "TCPMapping",
            NativeKind::TLSContext => "TLSContext",
            NativeKind::TracingService => "TracingService",
        }
    }

    /// Try to parse a string into a NativeKind, returning None if invalid
    pub fn parse_optional(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    /// Get all native kinds
    pub fn all() -> &'static [Self] {
        &[
            NativeKind::AuthService,
            NativeKind::ConsulResolver,
            NativeKind::Host,
            NativeKind::KubernetesEndpointResolver,
            NativeKind::KubernetesServiceResolver,
            NativeKind::LogService,
            NativeKind::Mapping,
            NativeKind::Module,
            NativeKind::RateLimitService,
            NativeKind::TCPMapping,
            NativeKind::TLSContext,
            NativeKind::TracingService,
        ]
    }

    /// Storage bucket the IR input stage files this kind under.
    ///
    /// Modules are handled separately and have no bucket.
    pub fn storage_bucket(&self) -> Option<&'static str> {
        match self {
            NativeKind::AuthService => Some("auth_configs"),
            NativeKind::ConsulResolver
            | NativeKind::KubernetesEndpointResolver
            | NativeKind::KubernetesServiceResolver => Some("resolvers"),
            NativeKind::Host => Some("hosts"),
            NativeKind::LogService => Some("log_services"),
            NativeKind::Mapping => Some("mappings"),
            NativeKind::Module => None,
            NativeKind::RateLimitService => Some("ratelimit_configs"),
            NativeKind::TCPMapping => Some("tcpmappings"),
            NativeKind::TLSContext => Some("tls_contexts"),
            NativeKind::TracingService => Some("tracing_configs"),
        }
    }
}

impl fmt::Display for NativeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<NativeKind> for String {
    fn from(kind: NativeKind) -> Self {
        kind.as_str().to_string()
    }
}

impl FromStr for NativeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NativeKind::all()
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("Unknown native resource kind: {}", s))
    }
}
