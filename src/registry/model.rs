//! Tool definition types and the on-disk registry document.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// OData protocol version spoken by a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ODataVersion {
    V2,
    #[default]
    V4,
}

impl fmt::Display for ODataVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ODataVersion::V2 => f.write_str("v2"),
            ODataVersion::V4 => f.write_str("v4"),
        }
    }
}

/// HTTP method a tool issues against its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }

    /// GET calls can be repeated without side effects.
    pub fn is_idempotent(&self) -> bool {
        matches!(self, HttpMethod::Get)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and how a tool reaches SAP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub service_name: String,
    /// Namespace segment of OData v4 service paths. Defaults to `service_name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_namespace: Option<String>,
    /// Entity set, function import or custom path below the service root.
    pub entity_name: String,
    #[serde(default)]
    pub odata_version: ODataVersion,
    #[serde(default)]
    pub http_method: HttpMethod,
    /// Raw `$filter` expression AND-ed into every call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_filters: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default_select: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default_expand: Vec<String>,
}

impl ServiceConfig {
    pub fn namespace(&self) -> &str {
        self.service_namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(&self.service_name)
    }
}

/// Value type of a declared parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    #[default]
    String,
    Integer,
    Number,
    Boolean,
    Date,
}

/// Comparison used when a parameter feeds `$filter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    #[default]
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    StartsWith,
    EndsWith,
}

/// How an extracted parameter value lands in the OData request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamBinding {
    /// `field <op> literal` clause in `$filter`.
    Filter {
        field: String,
        #[serde(default)]
        operator: FilterOperator,
    },
    /// Entity key predicate, e.g. `Entity('X')` or `Entity(A='X',B=1)`.
    Key {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
    /// System or custom query option (`select`, `expand`, `top`, `sap-language`, ...).
    Query { option: String },
    /// Field of the JSON request body (POST tools).
    Body { field: String },
}

/// A parameter the tool accepts from the query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
    /// Regular expression the (string form of the) value must fully match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub binding: ParamBinding,
}

/// Defaults merged into every call of a tool.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolDefaults {
    #[serde(default)]
    pub query_parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub request_body: BTreeMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

/// A committed, versioned tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub service_config: ServiceConfig,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default = "default_true")]
    pub requires_system: bool,
    #[serde(default)]
    pub defaults: ToolDefaults,
    #[serde(default)]
    pub prompt_hints: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Set by soft delete. Archived tools are always disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ToolDefinition {
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// Marks a mutation: bumps the version and moves `updated_at` strictly forward.
    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = advance(self.updated_at, now);
    }
}

/// Returns `now`, or one microsecond past `previous` when the clock has not moved.
pub(crate) fn advance(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

/// Input for creating a tool or fully replacing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolDraft {
    pub name: String,
    pub description: String,
    pub service_config: ServiceConfig,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default = "default_true")]
    pub requires_system: bool,
    #[serde(default)]
    pub defaults: ToolDefaults,
    #[serde(default)]
    pub prompt_hints: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ToolDraft {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        service_config: ServiceConfig,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            service_config,
            parameters: Vec::new(),
            requires_system: true,
            defaults: ToolDefaults::default(),
            prompt_hints: Vec::new(),
            enabled: true,
        }
    }

    pub fn with_parameter(mut self, spec: ParameterSpec) -> Self {
        self.parameters.push(spec);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub(crate) fn into_definition(self, now: DateTime<Utc>) -> ToolDefinition {
        ToolDefinition {
            name: self.name,
            description: self.description,
            service_config: self.service_config,
            parameters: self.parameters,
            requires_system: self.requires_system,
            defaults: self.defaults,
            prompt_hints: self.prompt_hints,
            enabled: self.enabled,
            archived_at: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replaces the mutable fields of `existing`, keeping identity and history.
    pub(crate) fn replace_into(self, existing: &ToolDefinition, now: DateTime<Utc>) -> ToolDefinition {
        let mut next = ToolDefinition {
            name: existing.name.clone(),
            description: self.description,
            service_config: self.service_config,
            parameters: self.parameters,
            requires_system: self.requires_system,
            defaults: self.defaults,
            prompt_hints: self.prompt_hints,
            enabled: self.enabled,
            archived_at: if self.enabled { None } else { existing.archived_at },
            version: existing.version,
            created_at: existing.created_at,
            updated_at: existing.updated_at,
        };
        next.touch(now);
        next
    }
}

impl From<&ToolDefinition> for ToolDraft {
    fn from(def: &ToolDefinition) -> Self {
        Self {
            name: def.name.clone(),
            description: def.description.clone(),
            service_config: def.service_config.clone(),
            parameters: def.parameters.clone(),
            requires_system: def.requires_system,
            defaults: def.defaults.clone(),
            prompt_hints: def.prompt_hints.clone(),
            enabled: def.enabled,
        }
    }
}

/// Partial update; absent fields are left untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_config: Option<ServiceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Vec<ParameterSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_system: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<ToolDefaults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_hints: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl ToolPatch {
    pub fn is_empty(&self) -> bool {
        self == &ToolPatch::default()
    }

    /// The draft that results from applying this patch to `existing`.
    pub(crate) fn apply_to(self, existing: &ToolDefinition) -> ToolDraft {
        let mut draft = ToolDraft::from(existing);
        if let Some(v) = self.description {
            draft.description = v;
        }
        if let Some(v) = self.service_config {
            draft.service_config = v;
        }
        if let Some(v) = self.parameters {
            draft.parameters = v;
        }
        if let Some(v) = self.requires_system {
            draft.requires_system = v;
        }
        if let Some(v) = self.defaults {
            draft.defaults = v;
        }
        if let Some(v) = self.prompt_hints {
            draft.prompt_hints = v;
        }
        if let Some(v) = self.enabled {
            draft.enabled = v;
        }
        draft
    }
}

/// Soft delete archives and disables; hard delete removes the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteMode {
    Soft,
    #[default]
    Hard,
}

/// A registry mutation. `expected_version` enables optimistic concurrency.
#[derive(Debug, Clone)]
pub enum RegistryChange {
    Create(ToolDraft),
    Replace {
        draft: ToolDraft,
        expected_version: Option<u64>,
    },
    Patch {
        name: String,
        patch: ToolPatch,
        expected_version: Option<u64>,
    },
    SetEnabled {
        name: String,
        enabled: bool,
        expected_version: Option<u64>,
    },
    Delete {
        name: String,
        mode: DeleteMode,
        expected_version: Option<u64>,
    },
}

impl RegistryChange {
    pub fn tool_name(&self) -> &str {
        match self {
            RegistryChange::Create(draft) | RegistryChange::Replace { draft, .. } => &draft.name,
            RegistryChange::Patch { name, .. }
            | RegistryChange::SetEnabled { name, .. }
            | RegistryChange::Delete { name, .. } => name,
        }
    }
}

/// Result of a committed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeOutcome {
    pub name: String,
    /// New tool version; `None` after a hard delete.
    pub version: Option<u64>,
    pub registry_version: u64,
}

/// The whole registry as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryDocument {
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tools: BTreeMap<String, ToolDefinition>,
}

impl RegistryDocument {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            version: 0,
            created_at: now,
            updated_at: now,
            tools: BTreeMap::new(),
        }
    }

    pub fn enabled_tools(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.values().filter(|t| t.enabled)
    }

    pub fn stats(&self) -> RegistryStats {
        let enabled = self.tools.values().filter(|t| t.enabled).count();
        let archived = self.tools.values().filter(|t| t.is_archived()).count();
        RegistryStats {
            total_tools: self.tools.len(),
            enabled_tools: enabled,
            disabled_tools: self.tools.len() - enabled,
            archived_tools: archived,
            registry_version: self.version,
            last_updated: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_tools: usize,
    pub enabled_tools: usize,
    pub disabled_tools: usize,
    pub archived_tools: usize,
    pub registry_version: u64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryExport {
    pub version: u64,
    pub exported_at: DateTime<Utc>,
    pub tools: BTreeMap<String, ToolDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryImport {
    pub tools: BTreeMap<String, ToolDraft>,
    #[serde(default)]
    pub replace_existing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
    pub registry_version: u64,
}
