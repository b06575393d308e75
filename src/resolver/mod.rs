//! Intent resolution: free-text query to one tool invocation.
//!
//! The LLM only proposes scored choices. Which choice (if any) wins is decided
//! here by [`SelectionPolicy`], and the chosen tool's declared parameters are
//! enforced by [`ParameterValidator`]. Downstream code only ever sees a
//! [`Resolution`] or a parameter validation error.

pub mod llm;
pub mod params;
pub mod policy;

pub use llm::{
    CandidateView, ChatCompletionsClient, LlmSelection, LlmService, SelectionRequest, ToolChoice,
};
pub use params::ParameterValidator;
pub use policy::{PolicyOutcome, SelectionPolicy};

use crate::registry::schema::SYSTEM_ID_PARAM;
use crate::registry::ToolDefinition;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A validated call parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
}

impl ParamValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ParamValue::Bool(b) => serde_json::Value::Bool(*b),
            ParamValue::Integer(i) => serde_json::Value::from(*i),
            ParamValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ParamValue::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Integer(i) => write!(f, "{}", i),
            ParamValue::Number(n) => write!(f, "{}", n),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

/// One tool call ready for dispatch. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedInvocation {
    pub tool_name: String,
    pub parameters: BTreeMap<String, ParamValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_id: Option<String>,
}

/// Closed set of resolution outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Resolution {
    Resolved(ResolvedInvocation),
    NoMatch { reason: String },
    AmbiguousIntent { candidates: Vec<String> },
}

pub struct IntentResolver {
    llm: Arc<dyn LlmService>,
    policy: SelectionPolicy,
    params: ParameterValidator,
    default_system: Option<String>,
}

impl IntentResolver {
    pub fn new(llm: Arc<dyn LlmService>) -> Self {
        Self {
            llm,
            policy: SelectionPolicy::default(),
            params: ParameterValidator,
            default_system: None,
        }
    }

    pub fn with_policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_default_system(mut self, system: Option<String>) -> Self {
        self.default_system = system;
        self
    }

    /// Maps `query` onto one of `candidates`.
    ///
    /// `system_override` (from the caller) beats a system named in the query,
    /// which beats the configured default.
    #[tracing::instrument(name = "resolve", skip_all, fields(candidates = candidates.len()))]
    pub async fn resolve(
        &self,
        query: &str,
        candidates: &[ToolDefinition],
        system_override: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Resolution> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::parameter_with_context(
                "query must not be empty",
                crate::ErrorContext::new().with_field_path("query"),
            ));
        }
        if candidates.is_empty() {
            return Ok(Resolution::NoMatch {
                reason: "no enabled tools are registered".to_string(),
            });
        }

        let request = SelectionRequest {
            query: query.to_string(),
            candidates: candidates.iter().map(CandidateView::from).collect(),
        };
        let selection = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            out = self.llm.select(&request) => out?,
        };

        let choice = match self.policy.choose(&selection, candidates) {
            PolicyOutcome::Chosen(choice) => choice,
            PolicyOutcome::NoMatch(reason) => {
                tracing::info!(%reason, "Query matched no tool");
                return Ok(Resolution::NoMatch { reason });
            }
            PolicyOutcome::Ambiguous(names) => {
                tracing::info!(candidates = ?names, "Query is ambiguous");
                return Ok(Resolution::AmbiguousIntent { candidates: names });
            }
        };

        let tool = candidates
            .iter()
            .find(|t| t.name == choice.tool_name)
            .ok_or_else(|| Error::not_found(format!("tool '{}'", choice.tool_name)))?;

        let system = system_override
            .map(str::to_string)
            .or(choice.system_id.clone())
            .or_else(|| {
                choice
                    .parameters
                    .get(SYSTEM_ID_PARAM)
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .or_else(|| self.default_system.clone());
        let (parameters, system_id) = self.params.validate(tool, &choice.parameters, system)?;

        tracing::info!(
            tool = %tool.name,
            confidence = choice.confidence,
            system = ?system_id,
            "Query resolved"
        );
        Ok(Resolution::Resolved(ResolvedInvocation {
            tool_name: tool.name.clone(),
            parameters,
            system_id,
        }))
    }
}
