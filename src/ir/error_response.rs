//! Custom error response bodies
//!
//! Rules come from the `ambassador` Module's `error_response_overrides`. A bad
//! rule is reported and skipped; the rest still apply.

use super::Provenance;
use super::ambassador::AmbassadorModule;
use crate::diag::ErrorLog;
use serde_json::{Map, Value, json};

/// Runtime key Envoy requires on the status comparison; never set at runtime
const STATUS_RUNTIME_KEY: &str = "_donotsetthiskey";

#[derive(Debug, Clone, PartialEq)]
pub struct IrErrorResponse {
    pub provenance: Provenance,
    pub mappers: Vec<Value>,
}

impl IrErrorResponse {
    /// `None` when nothing is configured or no rule survives validation
    pub fn load(module: &AmbassadorModule, log: &mut ErrorLog) -> Option<Self> {
        let config = module.error_response_overrides.as_ref()?;
        let rkey = module.source.as_deref();

        let Some(rules) = config.as_array() else {
            log.post_error(
                rkey,
                "IRErrorResponse: error_response_overrides: field must be an array",
            );
            return None;
        };
        if rules.is_empty() {
            log.post_error(
                rkey,
                "IRErrorResponse: error_response_overrides: no mappers, nothing to do",
            );
            return None;
        }

        let mut mappers = Vec::new();
        for rule in rules {
            match mapper_for(rule) {
                Ok(mapper) => mappers.push(mapper),
                Err(e) => log.post_error(rkey, format!("IRErrorResponse: {}", e)),
            }
        }

        if mappers.is_empty() {
            log.post_error(
                rkey,
                "IRErrorResponse: no valid error response mappers could be parsed",
            );
            return None;
        }

        tracing::debug!("IRErrorResponse: loaded {} mappers", mappers.len());
        Some(Self {
            provenance: module.provenance(),
            mappers,
        })
    }
}

fn mapper_for(rule: &Value) -> Result<Value, String> {
    let status = match rule.get("on_status_code") {
        None | Some(Value::Null) => return Err("on_status_code: field must exist".to_string()),
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(_) => None,
    }
    .ok_or_else(|| "on_status_code: field must be an integer".to_string())?;

    if !(400..600).contains(&status) {
        return Err("on_status_code: field must be an integer >= 400 and < 600".to_string());
    }

    let body = match rule.get("body") {
        None | Some(Value::Null) => return Err("body: field must exist".to_string()),
        Some(Value::Object(body)) => body,
        Some(other) => return Err(format!("body: field must be an object, found {}", other)),
    };

    let text_format_source = body.get("text_format_source").filter(|v| !v.is_null());
    let text_format = body.get("text_format").filter(|v| !v.is_null());
    let json_format = body.get("json_format").filter(|v| !v.is_null());

    let formats_set = [text_format_source, text_format, json_format]
        .iter()
        .filter(|f| f.is_some())
        .count();
    if formats_set > 1 {
        return Err(format!(
            "only one of \"text_format\", \"json_format\", or \"text_format_source\" may be set, found {} of these fields set.",
            formats_set
        ));
    }

    let mut body_format = Map::new();
    if let Some(source) = text_format_source {
        if source.get("filename").and_then(Value::as_str).is_none() {
            return Err(format!(
                "text_format_source field must be an object with a single filename field, found \"{}\"",
                source
            ));
        }
        body_format.insert("text_format_source".to_string(), source.clone());
    } else if let Some(text) = text_format {
        let text = match text {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        body_format.insert("text_format".to_string(), json!(text));
    } else if let Some(json_format) = json_format {
        if !json_format.is_object() {
            return Err(format!(
                "json_format field must be an object, found \"{}\"",
                json_format
            ));
        }
        body_format.insert("json_format".to_string(), json_format.clone());
    } else {
        return Err(format!(
            "could not find a valid format field in body \"{}\"",
            Value::Object(body.clone())
        ));
    }

    if let Some(content_type) = body.get("content_type").filter(|v| !v.is_null()) {
        if !content_type.is_string() {
            return Err("content_type: field must be a string".to_string());
        }
        body_format.insert("content_type".to_string(), content_type.clone());
    }

    Ok(json!({
        "filter": {
            "status_code_filter": {
                "comparison": {
                    "op": "EQ",
                    "value": {
                        "default_value": status.to_string(),
                        "runtime_key": STATUS_RUNTIME_KEY
                    }
                }
            }
        },
        "body_format_override": body_format
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(overrides: Value) -> AmbassadorModule {
        AmbassadorModule {
            source: Some("ambassador.default.1".to_string()),
            error_response_overrides: Some(overrides),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_rules() {
        let mut log = ErrorLog::new();
        let response = IrErrorResponse::load(
            &module(json!([
                {"on_status_code": 404, "body": {"text_format": "not here"}},
                {"on_status_code": "503", "body": {"json_format": {"error": "%RESPONSE_CODE%"}, "content_type": "application/json"}}
            ])),
            &mut log,
        )
        .unwrap();

        assert!(log.is_empty());
        assert_eq!(response.mappers.len(), 2);
        assert_eq!(
            response.mappers[1]["filter"]["status_code_filter"]["comparison"]["value"]["default_value"],
            "503"
        );
        assert_eq!(
            response.mappers[1]["body_format_override"]["content_type"],
            "application/json"
        );
    }

    #[test]
    fn test_bad_rules_are_skipped() {
        let mut log = ErrorLog::new();
        let response = IrErrorResponse::load(
            &module(json!([
                {"on_status_code": 302, "body": {"text_format": "moved"}},
                {"on_status_code": 500, "body": {"text_format": "a", "json_format": {}}},
                {"on_status_code": 500, "body": {"text_format": "oops"}}
            ])),
            &mut log,
        )
        .unwrap();

        assert_eq!(response.mappers.len(), 1);
        let errors = log.errors_for("ambassador.default.1");
        assert_eq!(errors.len(), 2);
        assert_eq!(
            errors[0].text,
            "IRErrorResponse: on_status_code: field must be an integer >= 400 and < 600"
        );
    }

    #[test]
    fn test_not_an_array() {
        let mut log = ErrorLog::new();
        assert!(IrErrorResponse::load(&module(json!({"on_status_code": 404})), &mut log).is_none());
        assert_eq!(log.error_count(), 1);
    }
}
