//! LLM-backed tool selection.
//!
//! [`LlmService`] is the seam: production uses [`ChatCompletionsClient`]
//! (OpenAI-compatible chat completions in JSON mode), tests plug in scripted
//! implementations.

use crate::config::{LlmAuthScheme, LlmConfig};
use crate::error::{Error, ErrorContext};
use crate::registry::{HttpMethod, ODataVersion, ParamKind, ToolDefinition};
use crate::Result;
use async_trait::async_trait;
use keyring::Entry;
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;
use url::Url;

const MAX_ERROR_BODY: usize = 300;

static FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)\s*```").expect("valid regex"));
static BARE_OBJECT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{[\s\S]*\}").expect("valid regex"));

/// What the LLM sees of one tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateView {
    pub name: String,
    pub description: String,
    pub service: String,
    pub odata_version: ODataVersion,
    pub http_method: HttpMethod,
    pub requires_system: bool,
    pub parameters: Vec<CandidateParam>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub prompt_hints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateParam {
    pub name: String,
    pub description: String,
    pub kind: ParamKind,
    pub required: bool,
}

impl From<&ToolDefinition> for CandidateView {
    fn from(def: &ToolDefinition) -> Self {
        Self {
            name: def.name.clone(),
            description: def.description.clone(),
            service: format!(
                "{}/{}",
                def.service_config.service_name, def.service_config.entity_name
            ),
            odata_version: def.service_config.odata_version,
            http_method: def.service_config.http_method,
            requires_system: def.requires_system,
            parameters: def
                .parameters
                .iter()
                .map(|p| CandidateParam {
                    name: p.name.clone(),
                    description: p.description.clone(),
                    kind: p.kind,
                    required: p.required,
                })
                .collect(),
            prompt_hints: def.prompt_hints.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectionRequest {
    pub query: String,
    pub candidates: Vec<CandidateView>,
}

/// The answer format the LLM is asked to produce.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LlmSelection {
    /// True when no listed tool fits the query.
    #[serde(default)]
    pub no_match: bool,
    /// Short explanation, mostly useful with `no_match`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Candidate tools, best first.
    #[serde(default)]
    pub choices: Vec<ToolChoice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolChoice {
    pub tool_name: String,
    /// Between 0 and 1.
    pub confidence: f64,
    /// Parameter values keyed by the tool's declared parameter names.
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// SAP system id (e.g. `D2A`) if the query names one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_id: Option<String>,
}

#[async_trait]
pub trait LlmService: Send + Sync {
    async fn select(&self, request: &SelectionRequest) -> Result<LlmSelection>;
}

pub struct ChatCompletionsClient {
    http: reqwest::Client,
    endpoint: Url,
    model: Option<String>,
    api_key: Option<String>,
    auth_scheme: LlmAuthScheme,
    temperature: f32,
}

impl ChatCompletionsClient {
    pub fn from_config(cfg: &LlmConfig) -> Result<Self> {
        let endpoint = chat_endpoint(&cfg.endpoint)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| Error::configuration(format!("Failed to create LLM HTTP client: {}", e)))?;

        let api_key = cfg
            .api_key
            .clone()
            .or_else(|| env::var(&cfg.api_key_env).ok())
            .or_else(|| {
                Entry::new("sap-odata-agent", "llm")
                    .ok()
                    .and_then(|e| e.get_password().ok())
            });
        if api_key.is_none() {
            tracing::warn!(env = %cfg.api_key_env, "No LLM API key configured; sending unauthenticated requests");
        }

        Ok(Self {
            http,
            endpoint,
            model: cfg.model.clone(),
            api_key,
            auth_scheme: cfg.auth_scheme,
            temperature: cfg.temperature,
        })
    }

    fn request_body(&self, request: &SelectionRequest) -> Result<Value> {
        let schema = serde_json::to_value(schemars::schema_for!(LlmSelection))?;
        let system = format!(
            "You route questions about SAP systems to tools. Each tool wraps one SAP OData \
             endpoint. Pick the tools that can answer the user's query and extract their \
             parameters using the declared parameter names only. Rate each choice with a \
             confidence between 0 and 1. If no tool fits, set no_match to true and leave \
             choices empty. Put a SAP system id mentioned in the query (for example D2A) into \
             system_id. Answer with a single JSON object matching this JSON schema:\n{}",
            schema
        );
        let user = serde_json::to_string(&json!({
            "query": request.query,
            "tools": request.candidates,
        }))?;

        let mut body = json!({
            "temperature": self.temperature,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });
        if let Some(model) = &self.model {
            body["model"] = json!(model);
        }
        Ok(body)
    }
}

#[async_trait]
impl LlmService for ChatCompletionsClient {
    async fn select(&self, request: &SelectionRequest) -> Result<LlmSelection> {
        let body = self.request_body(request)?;
        let mut req = self.http.post(self.endpoint.clone()).json(&body);
        if let Some(key) = &self.api_key {
            req = match self.auth_scheme {
                LlmAuthScheme::Bearer => req.bearer_auth(key),
                LlmAuthScheme::ApiKey => req.header("api-key", key),
            };
        }

        let resp = req.send().await.map_err(|e| {
            Error::llm_with_context(
                "LLM request failed",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("chat_completions"),
            )
        })?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| {
            Error::llm_with_context(
                "LLM response could not be read",
                ErrorContext::new().with_details(e.to_string()),
            )
        })?;
        if !status.is_success() {
            let snippet: String = text.chars().take(MAX_ERROR_BODY).collect();
            return Err(Error::llm_with_context(
                format!("LLM service answered HTTP {}", status.as_u16()),
                ErrorContext::new()
                    .with_details(snippet)
                    .with_source("chat_completions"),
            ));
        }

        let envelope: Value = serde_json::from_str(&text).map_err(|e| {
            Error::llm_with_context(
                "LLM response is not JSON",
                ErrorContext::new().with_details(e.to_string()),
            )
        })?;
        let content = envelope
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::llm_with_context(
                    "LLM response has no message content",
                    ErrorContext::new().with_field_path("choices[0].message.content"),
                )
            })?;

        let selection = parse_selection(content)?;
        tracing::debug!(
            no_match = selection.no_match,
            choices = selection.choices.len(),
            "LLM selection received"
        );
        Ok(selection)
    }
}

/// Parses the model's answer, tolerating markdown fences and surrounding prose.
pub fn parse_selection(content: &str) -> Result<LlmSelection> {
    let text = content.trim();
    let candidates = std::iter::once(text)
        .chain(FENCED_JSON.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str()))
        .chain(BARE_OBJECT.find(text).map(|m| m.as_str()));

    let mut last_err = None;
    for candidate in candidates {
        match serde_json::from_str::<LlmSelection>(candidate) {
            Ok(sel) => return Ok(sel),
            Err(e) => last_err = Some(e),
        }
    }
    Err(Error::llm_with_context(
        "LLM answer does not match the selection format",
        ErrorContext::new().with_details(
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "empty answer".to_string()),
        ),
    ))
}

fn chat_endpoint(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).map_err(|e| {
        Error::configuration_with_context(
            "invalid LLM endpoint",
            ErrorContext::new()
                .with_field_path("llm.endpoint")
                .with_details(e.to_string()),
        )
    })?;
    if !url.path().trim_end_matches('/').ends_with("/chat/completions") {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| Error::configuration("LLM endpoint cannot carry a path"))?;
        segments.pop_if_empty().extend(["chat", "completions"]);
    }
    Ok(url)
}
