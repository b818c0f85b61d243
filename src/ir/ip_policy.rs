//! IP allow/deny lists from the `ambassador` Module

use super::Provenance;
use super::ambassador::AmbassadorModule;
use crate::diag::ErrorLog;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpAction {
    Allow,
    Deny,
}

impl IpAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpAction::Allow => "ALLOW",
            IpAction::Deny => "DENY",
        }
    }
}

/// Which address a rule matches against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpSource {
    /// The directly connected peer
    Peer,
    /// The client address after trusted proxies
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpPrincipal {
    pub source: IpSource,
    pub address: IpAddr,
    pub prefix_len: u8,
}

impl IpPrincipal {
    /// Parse `addr` or `addr/len`
    pub fn parse(source: IpSource, cidr: &str) -> Option<Self> {
        let (address, prefix_len) = match cidr.split_once('/') {
            Some((address, len)) => (address, Some(len)),
            None => (cidr, None),
        };
        let address: IpAddr = address.trim().parse().ok()?;
        let max_len = if address.is_ipv4() { 32 } else { 128 };
        let prefix_len = match prefix_len {
            Some(len) => len.trim().parse::<u8>().ok().filter(|len| *len <= max_len)?,
            None => max_len,
        };

        Some(Self {
            source,
            address,
            prefix_len,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IrIpAllowDeny {
    pub provenance: Provenance,
    pub action: IpAction,
    pub principals: Vec<IpPrincipal>,
}

impl IrIpAllowDeny {
    pub fn load(module: &AmbassadorModule, log: &mut ErrorLog) -> Option<Self> {
        let rkey = module.source.as_deref();

        let (action, entries) = match (&module.ip_allow, &module.ip_deny) {
            (None, None) => return None,
            (Some(_), Some(_)) => {
                log.post_error(rkey, "IP allow/deny: ip_allow and ip_deny may not both be present");
                return None;
            }
            (Some(allow), None) => (IpAction::Allow, allow),
            (None, Some(deny)) => (IpAction::Deny, deny),
        };

        let Some(entries) = entries.as_array() else {
            log.post_error(rkey, "IP allow/deny: rules must be a list");
            return None;
        };

        let mut principals = Vec::new();
        for entry in entries {
            let parsed = [("peer", IpSource::Peer), ("remote", IpSource::Remote)]
                .into_iter()
                .find_map(|(key, source)| entry.get(key).map(|v| (source, v)));

            let Some((source, value)) = parsed else {
                log.post_error(rkey, format!("IP allow/deny: rule {} needs peer or remote", entry));
                continue;
            };

            match value.as_str().and_then(|cidr| IpPrincipal::parse(source, cidr)) {
                Some(principal) => principals.push(principal),
                None => {
                    let shown = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
                    log.post_error(rkey, format!("IP allow/deny: invalid CIDR {}", shown));
                }
            }
        }

        if principals.is_empty() {
            return None;
        }

        Some(Self {
            provenance: module.provenance(),
            action,
            principals,
        })
    }
}
