//! The HTTP filter chain
//!
//! Each filter the compiler can produce is one variant; [`IrFilter::render`]
//! turns any of them into the `{name, config}` form the v3 data plane takes.

use super::Provenance;
use super::auth::IrAuth;
use super::error_response::IrErrorResponse;
use super::ip_policy::{IpSource, IrIpAllowDeny};
use super::ratelimit::IrRateLimit;
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, PartialEq)]
pub enum IrFilter {
    Auth(IrAuth),
    RateLimit(IrRateLimit),
    ErrorResponse(IrErrorResponse),
    IpAllowDeny(IrIpAllowDeny),
}

impl IrFilter {
    /// Envoy filter name
    pub fn name(&self) -> &'static str {
        match self {
            IrFilter::Auth(_) => "envoy.filters.http.ext_authz",
            IrFilter::RateLimit(_) => "envoy.filters.http.ratelimit",
            IrFilter::ErrorResponse(_) => "envoy.filters.http.response_map",
            IrFilter::IpAllowDeny(_) => "envoy.filters.http.rbac",
        }
    }

    pub fn provenance(&self) -> &Provenance {
        match self {
            IrFilter::Auth(auth) => &auth.provenance,
            IrFilter::RateLimit(rl) => &rl.provenance,
            IrFilter::ErrorResponse(er) => &er.provenance,
            IrFilter::IpAllowDeny(ip) => &ip.provenance,
        }
    }

    /// `{name, config}` for the data plane
    pub fn render(&self) -> Value {
        let config = match self {
            IrFilter::Auth(auth) => render_auth(auth),
            IrFilter::RateLimit(rl) => json!({
                "domain": rl.domain,
                "request_type": "both",
                "timeout": duration(rl.timeout_ms),
                "failure_mode_deny": rl.failure_mode_deny,
                "rate_limit_service": {
                    "transport_api_version": "V3",
                    "grpc_service": {
                        "envoy_grpc": {"cluster_name": rl.cluster}
                    }
                }
            }),
            IrFilter::ErrorResponse(er) => json!({"mappers": er.mappers}),
            IrFilter::IpAllowDeny(ip) => render_ip_policy(ip),
        };

        json!({"name": self.name(), "config": config})
    }

    /// The rendered filter with its provenance, as shown in the overview
    pub fn to_overview(&self) -> Value {
        let mut rendered = self.render();
        if let (Some(obj), Ok(Value::Object(provenance))) = (
            rendered.as_object_mut(),
            serde_json::to_value(self.provenance()),
        ) {
            obj.extend(provenance);
        }
        rendered
    }
}

/// `1500` -> `"1.500s"`
fn duration(ms: i64) -> String {
    format!("{}.{:03}s", ms / 1000, ms % 1000)
}

fn header_patterns(headers: &[String]) -> Value {
    let patterns: Vec<Value> = headers
        .iter()
        .map(|h| json!({"exact": h, "ignore_case": true}))
        .collect();
    json!({"patterns": patterns})
}

fn render_auth(auth: &IrAuth) -> Value {
    let mut config = Map::new();

    if auth.proto == "grpc" {
        config.insert(
            "grpc_service".to_string(),
            json!({
                "envoy_grpc": {"cluster_name": auth.cluster},
                "timeout": duration(auth.timeout_ms)
            }),
        );
        config.insert("transport_api_version".to_string(), json!("V3"));
    } else {
        let authority = auth.hosts.keys().next().cloned().unwrap_or_default();
        let headers_to_add: Vec<Value> = auth
            .add_auth_headers
            .iter()
            .map(|(key, value)| json!({"key": key, "value": value}))
            .collect();

        let mut http_service = json!({
            "server_uri": {
                "uri": format!("http://{}", authority),
                "cluster": auth.cluster,
                "timeout": duration(auth.timeout_ms)
            },
            "path_prefix": auth.path_prefix.clone().unwrap_or_default(),
            "authorization_request": {
                "allowed_headers": header_patterns(&auth.allowed_request_headers),
                "headers_to_add": headers_to_add
            },
            "authorization_response": {
                "allowed_upstream_headers": header_patterns(&auth.allowed_authorization_headers),
                "allowed_client_headers": header_patterns(&auth.allowed_authorization_headers)
            }
        });
        if let Some(obj) = http_service.as_object_mut() {
            if auth.path_prefix.is_none() {
                obj.remove("path_prefix");
            }
        }
        config.insert("http_service".to_string(), http_service);
    }

    config.insert("failure_mode_allow".to_string(), json!(auth.failure_mode_allow));

    if let Some(body) = &auth.include_body {
        config.insert(
            "with_request_body".to_string(),
            json!({
                "max_request_bytes": body.get("max_bytes").cloned().unwrap_or(json!(4096)),
                "allow_partial_message": body.get("allow_partial").cloned().unwrap_or(json!(false))
            }),
        );
    } else if auth.allow_request_body {
        config.insert(
            "with_request_body".to_string(),
            json!({"max_request_bytes": 4096, "allow_partial_message": true}),
        );
    }

    if let Some(status) = &auth.status_on_error {
        config.insert("status_on_error".to_string(), status.clone());
    }

    Value::Object(config)
}

fn render_ip_policy(ip: &IrIpAllowDeny) -> Value {
    let principals: Vec<Value> = ip
        .principals
        .iter()
        .map(|p| {
            let key = match p.source {
                IpSource::Peer => "direct_remote_ip",
                IpSource::Remote => "remote_ip",
            };
            json!({key: {"address_prefix": p.address.to_string(), "prefix_len": p.prefix_len}})
        })
        .collect();

    let policy = format!("ambassador-ip-{}", ip.action.as_str().to_lowercase());
    json!({
        "rules": {
            "action": ip.action.as_str(),
            "policies": {
                policy: {
                    "permissions": [{"any": true}],
                    "principals": principals
                }
            }
        }
    })
}
