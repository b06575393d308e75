//! Normalization of OData payloads and SAP error bodies.

use crate::registry::ODataVersion;
use serde_json::Value;
use url::Url;

const MAX_TEXT_ERROR_LEN: usize = 500;

/// Records carried by a payload: v2 `d.results` (or a single `d` entity),
/// v4 `value` (or the entity itself).
pub fn records(payload: &Value, version: ODataVersion) -> Option<Vec<Value>> {
    match version {
        ODataVersion::V2 => {
            let d = payload.get("d")?;
            match d.get("results") {
                Some(Value::Array(items)) => Some(items.clone()),
                _ if d.is_object() => Some(vec![strip_metadata(d)]),
                _ => None,
            }
        }
        ODataVersion::V4 => match payload.get("value") {
            Some(Value::Array(items)) => Some(items.clone()),
            Some(_) => None,
            None if payload.is_object() => Some(vec![strip_metadata(payload)]),
            None => None,
        },
    }
}

fn strip_metadata(entity: &Value) -> Value {
    match entity {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !k.starts_with("@odata.") && k.as_str() != "__metadata")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Absolute URL of the next page, if the server announced one.
pub fn next_link(payload: &Value, version: ODataVersion, current: &Url) -> Option<Url> {
    let raw = match version {
        ODataVersion::V2 => payload.get("d")?.get("__next")?.as_str()?,
        ODataVersion::V4 => payload.get("@odata.nextLink")?.as_str()?,
    };
    current.join(raw).ok()
}

/// A 2xx body that still carries an `error` object.
pub fn embedded_error(payload: &Value) -> Option<String> {
    let error = payload.get("error")?;
    error.is_object().then(|| format_error_object(error))
}

/// Human-readable message from a SAP error response body.
///
/// Understands the v2 shape (`error.message.value`, `innererror.errordetails`)
/// and the v4 shape (`error.message`, `error.details`). Anything else falls
/// back to the (truncated) raw text.
pub fn sap_error_message(status: u16, body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return format!("HTTP {}: No content", status);
    }
    if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
        if let Some(error) = json.get("error").filter(|e| e.is_object()) {
            return format_error_object(error);
        }
    }
    truncate(trimmed, MAX_TEXT_ERROR_LEN)
}

fn format_error_object(error: &Value) -> String {
    let code = error.get("code").and_then(Value::as_str).unwrap_or_default();
    let message = match error.get("message") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(m)) => m
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    };

    let mut text = match (code.is_empty(), message.is_empty()) {
        (false, false) => format!("[{}] {}", code, message),
        (true, false) => message,
        (false, true) => format!("[{}]", code),
        (true, true) => "SAP returned an error without a message".to_string(),
    };

    let details = detail_messages(error);
    if !details.is_empty() {
        text.push_str(" (");
        text.push_str(&details.join("; "));
        text.push(')');
    }
    text
}

fn detail_messages(error: &Value) -> Vec<String> {
    let v2 = error
        .get("innererror")
        .and_then(|i| i.get("errordetails"))
        .and_then(Value::as_array);
    let v4 = error.get("details").and_then(Value::as_array);
    let top = error
        .get("message")
        .and_then(|m| m.as_str().or_else(|| m.get("value").and_then(Value::as_str)))
        .unwrap_or_default();

    let mut out: Vec<String> = Vec::new();
    for detail in v2.into_iter().chain(v4).flatten() {
        if let Some(msg) = detail.get("message").and_then(Value::as_str) {
            if msg != top && !out.iter().any(|m| m == msg) {
                out.push(msg.to_string());
            }
        }
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{}...", cut)
}
