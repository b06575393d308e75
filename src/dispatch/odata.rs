//! OData request compilation.
//!
//! A tool's `service_config` plus the resolved parameters become one
//! [`ODataRequest`]. The shape of the request is decided by a closed
//! [`CallPlan`] keyed on `(odata_version, http_method)`.

use crate::error::{Error, ErrorContext};
use crate::registry::{
    FilterOperator, HttpMethod, ODataVersion, ParamBinding, ParamKind, ParameterSpec,
    ServiceConfig, ToolDefinition,
};
use crate::resolver::ParamValue;
use crate::Result;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use url::Url;

/// System query options; keys without the `$` are normalized to carry it.
const SYSTEM_OPTIONS: &[&str] = &[
    "filter", "select", "expand", "top", "skip", "orderby", "inlinecount", "count", "search",
    "format", "skiptoken", "apply",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallPlan {
    V2Get,
    V4Get,
    V2Post,
    V4Post,
}

impl CallPlan {
    pub fn for_service(cfg: &ServiceConfig) -> Self {
        match (cfg.odata_version, cfg.http_method) {
            (ODataVersion::V2, HttpMethod::Get) => CallPlan::V2Get,
            (ODataVersion::V4, HttpMethod::Get) => CallPlan::V4Get,
            (ODataVersion::V2, HttpMethod::Post) => CallPlan::V2Post,
            (ODataVersion::V4, HttpMethod::Post) => CallPlan::V4Post,
        }
    }

    pub fn version(self) -> ODataVersion {
        match self {
            CallPlan::V2Get | CallPlan::V2Post => ODataVersion::V2,
            CallPlan::V4Get | CallPlan::V4Post => ODataVersion::V4,
        }
    }

    pub fn method(self) -> HttpMethod {
        match self {
            CallPlan::V2Get | CallPlan::V4Get => HttpMethod::Get,
            CallPlan::V2Post | CallPlan::V4Post => HttpMethod::Post,
        }
    }

    /// Whether `$` system query options are sent.
    fn sends_system_options(self) -> bool {
        matches!(self, CallPlan::V2Get | CallPlan::V4Get)
    }

    /// v2 gateways answer Atom unless told otherwise.
    fn forces_json_format(self) -> bool {
        matches!(self, CallPlan::V2Get)
    }

    fn service_segments(self, cfg: &ServiceConfig) -> Vec<String> {
        let service = split_path(&cfg.service_name);
        match self {
            CallPlan::V2Get | CallPlan::V2Post => ["sap", "opu", "odata", "sap"]
                .iter()
                .map(|s| s.to_string())
                .chain(service)
                .collect(),
            CallPlan::V4Get | CallPlan::V4Post => ["sap", "opu", "odata4", "sap"]
                .iter()
                .map(|s| s.to_string())
                .chain(split_path(cfg.namespace()))
                .chain(["srvd_a2x".to_string(), "sap".to_string()])
                .chain(service)
                .chain(["0001".to_string()])
                .collect(),
        }
    }
}

/// A compiled call.
#[derive(Debug, Clone, PartialEq)]
pub struct ODataRequest {
    pub plan: CallPlan,
    /// Service document URL, used for the CSRF token fetch.
    pub service_root: Url,
    pub url: Url,
    pub body: Option<Value>,
}

impl ODataRequest {
    pub fn method(&self) -> HttpMethod {
        self.plan.method()
    }
}

/// Builds the request for `tool` against a system rooted at `base_url`.
pub fn build_request(
    base_url: &Url,
    sap_client: Option<&str>,
    tool: &ToolDefinition,
    params: &BTreeMap<String, ParamValue>,
) -> Result<ODataRequest> {
    let cfg = &tool.service_config;
    let plan = CallPlan::for_service(cfg);
    let version = plan.version();

    let mut service_root = base_url.clone();
    {
        let mut segments = service_root.path_segments_mut().map_err(|_| {
            Error::configuration(format!("base URL '{}' cannot carry a path", base_url))
        })?;
        segments.pop_if_empty();
        segments.extend(plan.service_segments(cfg));
    }

    let mut entity_segments = split_path(&cfg.entity_name);
    let key = key_predicate(tool, params, version)?;
    if let Some(key) = key {
        match entity_segments.first_mut() {
            Some(first) => first.push_str(&key),
            None => {
                return Err(Error::configuration(format!(
                    "tool '{}' has an empty entity_name",
                    tool.name
                )))
            }
        }
    }

    let mut url = service_root.clone();
    {
        let mut segments = url.path_segments_mut().map_err(|_| {
            Error::configuration(format!("base URL '{}' cannot carry a path", base_url))
        })?;
        segments.extend(entity_segments);
    }

    let options = QueryOptions::collect(plan, tool, params)?;
    {
        let mut pairs = url.query_pairs_mut();
        if let Some(client) = sap_client {
            pairs.append_pair("sap-client", client);
        }
        for (k, v) in &options.pairs {
            pairs.append_pair(k, v);
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }
    if let Some(client) = sap_client {
        service_root.query_pairs_mut().append_pair("sap-client", client);
    }

    let body = match plan.method() {
        HttpMethod::Post => Some(request_body(tool, params)),
        HttpMethod::Get => None,
    };

    Ok(ODataRequest {
        plan,
        service_root,
        url,
        body,
    })
}

/// Ordered query options of one call.
struct QueryOptions {
    pairs: Vec<(String, String)>,
}

impl QueryOptions {
    fn collect(
        plan: CallPlan,
        tool: &ToolDefinition,
        params: &BTreeMap<String, ParamValue>,
    ) -> Result<Self> {
        let cfg = &tool.service_config;
        let version = plan.version();

        let mut filters: Vec<String> = Vec::new();
        let mut select: Vec<String> = cfg.default_select.clone();
        let mut expand: Vec<String> = cfg.default_expand.clone();
        let mut others: BTreeMap<String, String> = BTreeMap::new();

        if let Some(f) = cfg.default_filters.as_deref().filter(|f| !f.trim().is_empty()) {
            filters.push(f.trim().to_string());
        }

        for (name, value) in &tool.defaults.query_parameters {
            merge_option(&option_key(name), value, &mut filters, &mut select, &mut expand, &mut others);
        }

        for spec in &tool.parameters {
            let Some(value) = params.get(&spec.name) else {
                continue;
            };
            match &spec.binding {
                ParamBinding::Filter { field, operator } => {
                    if let Some(clause) = filter_clause(spec, field, *operator, value, version)? {
                        filters.push(clause);
                    }
                }
                ParamBinding::Query { option } => {
                    let key = option_key(option);
                    if key == "$filter" {
                        return Err(Error::parameter_with_context(
                            format!("'{}' cannot be sent as a raw $filter", spec.name),
                            ErrorContext::new().with_field_path(spec.name.clone()),
                        ));
                    }
                    merge_option(
                        &key,
                        &value.to_string(),
                        &mut filters,
                        &mut select,
                        &mut expand,
                        &mut others,
                    );
                }
                ParamBinding::Key { .. } | ParamBinding::Body { .. } => {}
            }
        }

        let mut pairs = Vec::new();
        if plan.sends_system_options() {
            if !filters.is_empty() {
                pairs.push(("$filter".to_string(), and_all(&filters)));
            }
            if !select.is_empty() {
                pairs.push(("$select".to_string(), dedup(select).join(",")));
            }
            if !expand.is_empty() {
                pairs.push(("$expand".to_string(), dedup(expand).join(",")));
            }
            if plan.forces_json_format() && !others.contains_key("$format") {
                others.insert("$format".to_string(), "json".to_string());
            }
            pairs.extend(others);
        } else {
            let dropped: Vec<String> = others
                .keys()
                .filter(|k| k.starts_with('$'))
                .cloned()
                .chain((!filters.is_empty()).then(|| "$filter".to_string()))
                .chain((!select.is_empty()).then(|| "$select".to_string()))
                .chain((!expand.is_empty()).then(|| "$expand".to_string()))
                .collect();
            if !dropped.is_empty() {
                tracing::warn!(
                    tool = %tool.name,
                    options = ?dropped,
                    "Dropping system query options on POST call"
                );
            }
            pairs.extend(others.into_iter().filter(|(k, _)| !k.starts_with('$')));
        }

        Ok(Self { pairs })
    }
}

fn merge_option(
    key: &str,
    value: &str,
    filters: &mut Vec<String>,
    select: &mut Vec<String>,
    expand: &mut Vec<String>,
    others: &mut BTreeMap<String, String>,
) {
    match key {
        "$filter" => {
            if !value.trim().is_empty() {
                filters.push(value.trim().to_string());
            }
        }
        "$select" => select.extend(split_list(value)),
        "$expand" => expand.extend(split_list(value)),
        _ => {
            others.insert(key.to_string(), value.to_string());
        }
    }
}

/// `top` -> `$top`; custom options such as `sap-language` pass unchanged.
fn option_key(name: &str) -> String {
    let bare = name.trim_start_matches('$');
    if SYSTEM_OPTIONS.contains(&bare.to_ascii_lowercase().as_str()) {
        format!("${}", bare.to_ascii_lowercase())
    } else {
        name.to_string()
    }
}

fn split_list(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn dedup(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

fn and_all(clauses: &[String]) -> String {
    if clauses.len() == 1 {
        return clauses[0].clone();
    }
    clauses
        .iter()
        .map(|c| format!("({})", c))
        .collect::<Vec<_>>()
        .join(" and ")
}

fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// OData string literal: single quotes doubled.
pub fn quote_string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Typed literal for `value` as declared by `spec`.
pub fn literal(spec: &ParameterSpec, value: &ParamValue, version: ODataVersion) -> Result<String> {
    let mismatch = || {
        Error::parameter_with_context(
            format!("value for '{}' does not match its declared kind", spec.name),
            ErrorContext::new()
                .with_field_path(format!("parameters.{}", spec.name))
                .with_details(format!("expected {:?}, got {}", spec.kind, value)),
        )
    };

    match (spec.kind, value) {
        (ParamKind::String, v) => Ok(quote_string(&v.to_string())),
        (ParamKind::Integer, ParamValue::Integer(i)) => Ok(i.to_string()),
        (ParamKind::Number, ParamValue::Integer(i)) => Ok(i.to_string()),
        (ParamKind::Number, ParamValue::Number(n)) if n.is_finite() => Ok(n.to_string()),
        (ParamKind::Boolean, ParamValue::Bool(b)) => Ok(b.to_string()),
        (ParamKind::Date, ParamValue::Text(d)) => Ok(date_literal(d, version)),
        _ => Err(mismatch()),
    }
}

/// v2 wants `datetime'…'`; v4 takes bare `Edm.Date` / `Edm.DateTimeOffset`.
fn date_literal(value: &str, version: ODataVersion) -> String {
    let has_time = value.contains('T');
    match version {
        ODataVersion::V2 => {
            let stamp = if has_time {
                value.trim_end_matches('Z').to_string()
            } else {
                format!("{}T00:00:00", value)
            };
            format!("datetime'{}'", stamp)
        }
        ODataVersion::V4 => {
            if has_time && !value.ends_with('Z') && !value.contains('+') {
                format!("{}Z", value)
            } else {
                value.to_string()
            }
        }
    }
}

fn string_function(
    function: &str,
    field: &str,
    needle: &str,
    version: ODataVersion,
) -> String {
    let lit = quote_string(needle);
    match (function, version) {
        ("contains", ODataVersion::V2) => format!("substringof({},{}) eq true", lit, field),
        (f, ODataVersion::V2) => format!("{}({},{}) eq true", f, field, lit),
        (f, ODataVersion::V4) => format!("{}({},{})", f, field, lit),
    }
}

/// One `$filter` clause, or `None` when the value matches everything (`*`).
pub fn filter_clause(
    spec: &ParameterSpec,
    field: &str,
    operator: FilterOperator,
    value: &ParamValue,
    version: ODataVersion,
) -> Result<Option<String>> {
    let text_only = |op: &str| -> Result<String> {
        if spec.kind != ParamKind::String {
            return Err(Error::parameter_with_context(
                format!("operator '{}' needs a string parameter", op),
                ErrorContext::new().with_field_path(format!("parameters.{}", spec.name)),
            ));
        }
        Ok(value.to_string())
    };
    let compare = |symbol: &str| -> Result<String> {
        Ok(format!("{} {} {}", field, symbol, literal(spec, value, version)?))
    };

    let clause = match operator {
        FilterOperator::Contains => string_function("contains", field, &text_only("contains")?, version),
        FilterOperator::StartsWith => {
            string_function("startswith", field, &text_only("startswith")?, version)
        }
        FilterOperator::EndsWith => string_function("endswith", field, &text_only("endswith")?, version),
        FilterOperator::Eq if spec.kind == ParamKind::String => {
            let text = value.to_string();
            let lead = text.starts_with('*');
            let trail = text.ends_with('*');
            let inner = text.trim_matches('*');
            if (lead || trail) && inner.is_empty() {
                return Ok(None);
            }
            match (lead, trail) {
                (true, true) => string_function("contains", field, inner, version),
                (false, true) => string_function("startswith", field, inner, version),
                (true, false) => string_function("endswith", field, inner, version),
                (false, false) => format!("{} eq {}", field, quote_string(&text)),
            }
        }
        FilterOperator::Eq => compare("eq")?,
        FilterOperator::Ne => compare("ne")?,
        FilterOperator::Gt => compare("gt")?,
        FilterOperator::Ge => compare("ge")?,
        FilterOperator::Lt => compare("lt")?,
        FilterOperator::Le => compare("le")?,
    };
    Ok(Some(clause))
}

fn key_predicate(
    tool: &ToolDefinition,
    params: &BTreeMap<String, ParamValue>,
    version: ODataVersion,
) -> Result<Option<String>> {
    let keys: Vec<(&ParameterSpec, Option<&String>)> = tool
        .parameters
        .iter()
        .filter_map(|p| match &p.binding {
            ParamBinding::Key { field } => Some((p, field.as_ref())),
            _ => None,
        })
        .collect();
    if keys.is_empty() {
        return Ok(None);
    }

    let present: Vec<_> = keys
        .iter()
        .filter_map(|(spec, field)| params.get(&spec.name).map(|v| (*spec, *field, v)))
        .collect();
    if present.is_empty() {
        return Ok(None);
    }
    if present.len() != keys.len() {
        let missing: Vec<&str> = keys
            .iter()
            .filter(|(spec, _)| !params.contains_key(&spec.name))
            .map(|(spec, _)| spec.name.as_str())
            .collect();
        return Err(Error::parameter_with_context(
            format!("incomplete entity key, missing: {}", missing.join(", ")),
            ErrorContext::new().with_field_path("parameters"),
        ));
    }

    if let [(spec, None, value)] = present.as_slice() {
        return Ok(Some(format!("({})", literal(spec, value, version)?)));
    }

    let mut parts = Vec::with_capacity(present.len());
    for (spec, field, value) in present {
        let field = field.map(String::as_str).unwrap_or(spec.name.as_str());
        parts.push(format!("{}={}", field, literal(spec, value, version)?));
    }
    Ok(Some(format!("({})", parts.join(","))))
}

fn request_body(tool: &ToolDefinition, params: &BTreeMap<String, ParamValue>) -> Value {
    let mut body: Map<String, Value> = tool
        .defaults
        .request_body
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for spec in &tool.parameters {
        if let ParamBinding::Body { field } = &spec.binding {
            if let Some(value) = params.get(&spec.name) {
                body.insert(field.clone(), value.to_json());
            }
        }
    }
    Value::Object(body)
}
