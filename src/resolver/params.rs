//! Enforcement of a tool's declared parameters on LLM-extracted values.

use super::ParamValue;
use crate::error::{Error, ErrorContext};
use crate::registry::{ParamKind, ParameterSpec, ToolDefinition};
use crate::Result;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;

const MAX_VALUE_LEN: usize = 256;

static SYSTEM_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]{1,10}$").expect("valid regex"));

/// Checks extracted values against the chosen tool's `parameters`.
///
/// Unknown names are dropped, never forwarded. Missing required values and
/// values that do not fit their kind or pattern are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParameterValidator;

impl ParameterValidator {
    pub fn validate(
        &self,
        tool: &ToolDefinition,
        raw: &BTreeMap<String, Value>,
        system: Option<String>,
    ) -> Result<(BTreeMap<String, ParamValue>, Option<String>)> {
        for name in raw.keys().filter(|k| tool.parameter(k).is_none()) {
            tracing::debug!(tool = %tool.name, parameter = %name, "Dropping undeclared parameter");
        }

        let mut out = BTreeMap::new();
        for spec in &tool.parameters {
            match raw.get(&spec.name).filter(|v| !v.is_null()) {
                Some(value) => {
                    out.insert(spec.name.clone(), coerce(spec, value)?);
                }
                None if spec.required => {
                    return Err(param_error(spec, "required parameter is missing", None));
                }
                None => {}
            }
        }

        let system_id = if tool.requires_system {
            Some(system_id(system)?)
        } else {
            None
        };
        Ok((out, system_id))
    }
}

fn system_id(system: Option<String>) -> Result<String> {
    let raw = system.map(|s| s.trim().to_string()).unwrap_or_default();
    if raw.is_empty() {
        return Err(Error::parameter_with_context(
            "this tool needs a SAP system id and none was given",
            ErrorContext::new().with_field_path("system_id"),
        ));
    }
    if !SYSTEM_ID.is_match(&raw) {
        return Err(Error::parameter_with_context(
            format!("invalid SAP system id '{}'", raw),
            ErrorContext::new()
                .with_field_path("system_id")
                .with_details("expected 1 to 10 letters or digits"),
        ));
    }
    Ok(raw.to_uppercase())
}

fn coerce(spec: &ParameterSpec, value: &Value) -> Result<ParamValue> {
    let coerced = match spec.kind {
        ParamKind::String => match value {
            Value::String(s) => ParamValue::Text(s.trim().to_string()),
            Value::Number(n) => ParamValue::Text(n.to_string()),
            Value::Bool(b) => ParamValue::Text(b.to_string()),
            _ => return Err(kind_error(spec, value)),
        },
        ParamKind::Integer => match value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => ParamValue::Integer(i),
                None => match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                        ParamValue::Integer(f as i64)
                    }
                    _ => return Err(kind_error(spec, value)),
                },
            },
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(ParamValue::Integer)
                .map_err(|_| kind_error(spec, value))?,
            _ => return Err(kind_error(spec, value)),
        },
        ParamKind::Number => match value {
            Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => ParamValue::Integer(i),
                (None, Some(f)) => ParamValue::Number(f),
                _ => return Err(kind_error(spec, value)),
            },
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(ParamValue::Number)
                .ok_or_else(|| kind_error(spec, value))?,
            _ => return Err(kind_error(spec, value)),
        },
        ParamKind::Boolean => match value {
            Value::Bool(b) => ParamValue::Bool(*b),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "x" => ParamValue::Bool(true),
                "false" | "no" | "" => ParamValue::Bool(false),
                _ => return Err(kind_error(spec, value)),
            },
            _ => return Err(kind_error(spec, value)),
        },
        ParamKind::Date => match value {
            Value::String(s) => {
                ParamValue::Text(normalize_date(s.trim()).ok_or_else(|| kind_error(spec, value))?)
            }
            _ => return Err(kind_error(spec, value)),
        },
    };

    if let ParamValue::Text(text) = &coerced {
        check_text(spec, text)?;
    }
    Ok(coerced)
}

/// `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM:SS` or RFC 3339 (converted to UTC).
fn normalize_date(s: &str) -> Option<String> {
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(
            dt.with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
}

fn check_text(spec: &ParameterSpec, text: &str) -> Result<()> {
    if text.chars().count() > MAX_VALUE_LEN {
        return Err(param_error(
            spec,
            "value is too long",
            Some(format!("at most {} characters", MAX_VALUE_LEN)),
        ));
    }
    if text.chars().any(char::is_control) {
        return Err(param_error(spec, "value contains control characters", None));
    }
    if let Some(pattern) = &spec.pattern {
        let re = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
            param_error(spec, "declared pattern does not compile", Some(e.to_string()))
        })?;
        if !re.is_match(text) {
            return Err(param_error(
                spec,
                "value does not match the declared pattern",
                Some(pattern.clone()),
            ));
        }
    }
    Ok(())
}

fn kind_error(spec: &ParameterSpec, value: &Value) -> Error {
    param_error(
        spec,
        "value does not match the declared kind",
        Some(format!("expected {:?}, got {}", spec.kind, value)),
    )
}

fn param_error(spec: &ParameterSpec, msg: &str, details: Option<String>) -> Error {
    let mut ctx = ErrorContext::new().with_field_path(format!("parameters.{}", spec.name));
    if let Some(details) = details {
        ctx = ctx.with_details(details);
    }
    Error::parameter_with_context(format!("parameter '{}': {}", spec.name, msg), ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ParamBinding, ServiceConfig, ToolDraft};
    use chrono::Utc;
    use serde_json::json;

    fn tool(requires_system: bool) -> ToolDefinition {
        let mut draft = ToolDraft::new(
            "get_table_schema",
            "Returns the DDIC schema of a table",
            ServiceConfig {
                service_name: "ZTABLE_SRV".into(),
                service_namespace: None,
                entity_name: "Fields".into(),
                odata_version: Default::default(),
                http_method: Default::default(),
                default_filters: None,
                default_select: vec![],
                default_expand: vec![],
            },
        )
        .with_parameter(ParameterSpec {
            name: "table".into(),
            description: "Table name".into(),
            kind: ParamKind::String,
            required: true,
            pattern: Some("[A-Z0-9_/]{1,30}".into()),
            binding: ParamBinding::Filter {
                field: "TableName".into(),
                operator: Default::default(),
            },
        })
        .with_parameter(ParameterSpec {
            name: "rows".into(),
            description: "Row limit".into(),
            kind: ParamKind::Integer,
            required: false,
            pattern: None,
            binding: ParamBinding::Query { option: "$top".into() },
        });
        draft.requires_system = requires_system;
        draft.into_definition(Utc::now())
    }

    fn raw(v: serde_json::Value) -> BTreeMap<String, Value> {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_valid_parameters_and_system() {
        let (params, system) = ParameterValidator
            .validate(
                &tool(true),
                &raw(json!({"table": "MAKT", "rows": "5", "bogus": 1})),
                Some("d2a".into()),
            )
            .unwrap();
        assert_eq!(params["table"], ParamValue::Text("MAKT".into()));
        assert_eq!(params["rows"], ParamValue::Integer(5));
        assert!(!params.contains_key("bogus"));
        assert_eq!(system.as_deref(), Some("D2A"));
    }

    #[test]
    fn test_missing_required_parameter() {
        let err = ParameterValidator
            .validate(&tool(false), &raw(json!({"rows": 1})), None)
            .unwrap_err();
        assert!(matches!(err, Error::ParameterValidation { .. }));
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("parameters.table")
        );
    }

    #[test]
    fn test_pattern_and_kind_mismatch() {
        let t = tool(false);
        assert!(ParameterValidator
            .validate(&t, &raw(json!({"table": "makt; drop"})), None)
            .is_err());
        assert!(ParameterValidator
            .validate(&t, &raw(json!({"table": "MAKT", "rows": "many"})), None)
            .is_err());
    }

    #[test]
    fn test_system_rules() {
        let t = tool(true);
        let ok = raw(json!({"table": "MAKT"}));
        assert!(ParameterValidator.validate(&t, &ok, None).is_err());
        assert!(ParameterValidator
            .validate(&t, &ok, Some("D2A-100".into()))
            .is_err());

        let (_, system) = ParameterValidator
            .validate(&tool(false), &ok, Some("D2A".into()))
            .unwrap();
        assert_eq!(system, None);
    }

    #[test]
    fn test_dates_are_normalized() {
        assert_eq!(normalize_date("2026-03-01").as_deref(), Some("2026-03-01"));
        assert_eq!(
            normalize_date("2026-03-01T10:00:00+02:00").as_deref(),
            Some("2026-03-01T08:00:00Z")
        );
        assert_eq!(
            normalize_date("2026-03-01T10:00:00").as_deref(),
            Some("2026-03-01T10:00:00")
        );
        assert!(normalize_date("01.03.2026").is_none());
    }
}
