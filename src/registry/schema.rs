//! Tool definition validator using JSON Schema

use crate::error::{Error, ErrorContext};
use crate::registry::model::{HttpMethod, ParamBinding, ToolDraft, ToolPatch};
use crate::Result;
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::collections::HashSet;

/// Parameter name reserved for the SAP system id.
pub const SYSTEM_ID_PARAM: &str = "system_id";

/// System query options that only make sense on GET.
const READ_ONLY_OPTIONS: &[&str] = &[
    "filter", "select", "expand", "top", "skip", "orderby", "inlinecount", "count", "search",
    "format", "skiptoken",
];

/// Validates tool definitions against the fixed embedded schema plus semantic rules
/// the schema cannot express.
pub struct ToolSchemaValidator {
    schema: JSONSchema,
}

impl ToolSchemaValidator {
    pub fn new() -> Result<Self> {
        let schema_value: Value = serde_json::from_str(Self::embedded_schema_v1())?;
        let schema = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&schema_value)
            .map_err(|e| Error::configuration(format!("Failed to compile tool schema: {}", e)))?;
        Ok(Self { schema })
    }

    fn embedded_schema_v1() -> &'static str {
        include_str!("tool_schema_v1.json")
    }

    /// Validates raw JSON and converts it into a draft.
    pub fn parse_draft(&self, value: Value) -> Result<ToolDraft> {
        self.validate_value(&value)?;
        let draft: ToolDraft = serde_json::from_value(value).map_err(|e| {
            Error::validation_with_context(
                e.to_string(),
                ErrorContext::new().with_source("tool_schema"),
            )
        })?;
        Self::validate_semantics(&draft)?;
        Ok(draft)
    }

    /// Parses a partial update. The merged result is validated at commit time.
    pub fn parse_patch(&self, value: Value) -> Result<ToolPatch> {
        if !value.is_object() {
            return Err(Error::validation("patch body must be a JSON object"));
        }
        if value.get("name").is_some() {
            return Err(Error::validation_with_context(
                "tool name cannot be changed",
                ErrorContext::new().with_field_path("name"),
            ));
        }
        serde_json::from_value(value).map_err(|e| {
            Error::validation_with_context(
                e.to_string(),
                ErrorContext::new().with_source("tool_schema"),
            )
        })
    }

    /// Full validation of a typed draft.
    pub fn validate_draft(&self, draft: &ToolDraft) -> Result<()> {
        let value = serde_json::to_value(draft)?;
        self.validate_value(&value)?;
        Self::validate_semantics(draft)
    }

    pub fn validate_value(&self, value: &Value) -> Result<()> {
        if let Err(errors) = self.schema.validate(value) {
            let mut first_path = None;
            let msgs: Vec<String> = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if first_path.is_none() {
                        first_path = Some(path.clone());
                    }
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{}: {}", path, e)
                    }
                })
                .collect();
            let mut context = ErrorContext::new().with_source("tool_schema");
            if let Some(path) = first_path.filter(|p| !p.is_empty()) {
                context = context.with_field_path(pointer_to_dotted(&path));
            }
            return Err(Error::validation_with_context(
                format!("tool definition rejected: {}", msgs.join("; ")),
                context,
            ));
        }
        Ok(())
    }

    fn validate_semantics(draft: &ToolDraft) -> Result<()> {
        let mut seen = HashSet::new();
        let mut keys = 0usize;
        let mut unnamed_keys = 0usize;
        let method = draft.service_config.http_method;

        for (idx, spec) in draft.parameters.iter().enumerate() {
            let field = |suffix: &str| format!("parameters[{}].{}", idx, suffix);

            if spec.name == SYSTEM_ID_PARAM {
                return Err(Error::validation_with_context(
                    "system_id is reserved and supplied by the resolver",
                    ErrorContext::new().with_field_path(field("name")),
                ));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(Error::validation_with_context(
                    format!("duplicate parameter '{}'", spec.name),
                    ErrorContext::new().with_field_path(field("name")),
                ));
            }
            if let Some(pattern) = &spec.pattern {
                regex::Regex::new(pattern).map_err(|e| {
                    Error::validation_with_context(
                        format!("invalid pattern for '{}'", spec.name),
                        ErrorContext::new()
                            .with_field_path(field("pattern"))
                            .with_details(e.to_string()),
                    )
                })?;
            }

            if let ParamBinding::Query { option } = &spec.binding {
                if option.trim_start_matches('$').eq_ignore_ascii_case("filter") {
                    return Err(Error::validation_with_context(
                        format!(
                            "'{}' cannot feed $filter directly; use a filter binding",
                            spec.name
                        ),
                        ErrorContext::new().with_field_path(field("binding.option")),
                    ));
                }
            }

            match (&spec.binding, method) {
                (ParamBinding::Filter { .. }, HttpMethod::Post) => {
                    return Err(Error::validation_with_context(
                        format!("POST tools cannot bind '{}' to $filter", spec.name),
                        ErrorContext::new().with_field_path(field("binding")),
                    ));
                }
                (ParamBinding::Query { option }, HttpMethod::Post)
                    if READ_ONLY_OPTIONS.contains(&option.trim_start_matches('$')) =>
                {
                    return Err(Error::validation_with_context(
                        format!("POST tools cannot use query option '{}'", option),
                        ErrorContext::new().with_field_path(field("binding.option")),
                    ));
                }
                (ParamBinding::Body { .. }, HttpMethod::Get) => {
                    return Err(Error::validation_with_context(
                        format!("GET tools cannot bind '{}' to the request body", spec.name),
                        ErrorContext::new().with_field_path(field("binding")),
                    ));
                }
                (ParamBinding::Key { field: key_field }, _) => {
                    keys += 1;
                    if key_field.is_none() {
                        unnamed_keys += 1;
                    }
                }
                _ => {}
            }
        }

        if keys > 1 && unnamed_keys > 0 {
            return Err(Error::validation_with_context(
                "composite keys need a field name on every key binding",
                ErrorContext::new().with_field_path("parameters"),
            ));
        }

        if let Some(filter) = &draft.service_config.default_filters {
            if filter.matches('\'').count() % 2 != 0 || !balanced_parens(filter) {
                return Err(Error::validation_with_context(
                    "default_filters is not a well-formed filter expression",
                    ErrorContext::new().with_field_path("service_config.default_filters"),
                ));
            }
        }

        Ok(())
    }
}

fn balanced_parens(expr: &str) -> bool {
    let mut depth = 0i32;
    let mut in_literal = false;
    for c in expr.chars() {
        match c {
            '\'' => in_literal = !in_literal,
            '(' if !in_literal => depth += 1,
            ')' if !in_literal => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

/// `/service_config/odata_version` -> `service_config.odata_version`
fn pointer_to_dotted(pointer: &str) -> String {
    pointer.trim_start_matches('/').replace('/', ".")
}
