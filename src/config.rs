//! Agent configuration.
//!
//! Loaded from an optional YAML file, then overridden by `SAP_AGENT_*`
//! environment variables, then validated. Secrets are never required to be in
//! the file: system credentials and the LLM key can come from the environment
//! or the OS keyring.

use crate::dispatch::RetryPolicy;
use crate::error::{Error, ErrorContext};
use crate::resolver::SelectionPolicy;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const DEFAULT_CONFIG_FILE: &str = "sap-odata-agent.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub llm: LlmConfig,
    pub systems: BTreeMap<String, SystemConfig>,
    pub dispatch: DispatchConfig,
    /// System used when neither the caller nor the query names one.
    pub default_system: Option<String>,
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            registry: RegistryConfig::default(),
            llm: LlmConfig::default(),
            systems: BTreeMap::new(),
            dispatch: DispatchConfig::default(),
            default_system: None,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub path: PathBuf,
    /// Defaults to `backups/` next to the registry file.
    pub backup_dir: Option<PathBuf>,
    pub keep_backups: usize,
    /// Reload the registry when the file changes on disk.
    pub watch: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/tool_registry.json"),
            backup_dir: None,
            keep_backups: crate::registry::DEFAULT_KEEP_BACKUPS,
            watch: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LlmAuthScheme {
    /// `Authorization: Bearer <key>`.
    #[default]
    Bearer,
    /// `api-key: <key>` (Azure OpenAI).
    ApiKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Chat completions URL, or a base URL that `/chat/completions` is appended to.
    pub endpoint: String,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub auth_scheme: LlmAuthScheme,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub confidence_threshold: f64,
    pub ambiguity_margin: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            model: Some("gpt-4o-mini".to_string()),
            api_key: None,
            api_key_env: "SAP_AGENT_LLM_API_KEY".to_string(),
            auth_scheme: LlmAuthScheme::Bearer,
            timeout_secs: 60,
            temperature: 0.0,
            confidence_threshold: 0.6,
            ambiguity_margin: 0.1,
        }
    }
}

impl LlmConfig {
    pub fn selection_policy(&self) -> SelectionPolicy {
        SelectionPolicy::new(self.confidence_threshold, self.ambiguity_margin)
    }
}

/// Credentials for one SAP system.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    #[default]
    None,
    Basic {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        /// Env var holding the password. Defaults to `SAP_<ID>_PASSWORD`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password_env: Option<String>,
    },
    Bearer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        /// Env var holding the token. Defaults to `SAP_<ID>_TOKEN`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_env: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub base_url: String,
    /// `sap-client` sent with every request.
    pub client: Option<String>,
    pub auth: AuthConfig,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub pool_max_idle_per_host: usize,
    pub accept_invalid_certs: bool,
    pub proxy: Option<String>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            client: None,
            auth: AuthConfig::None,
            timeout_secs: 60,
            connect_timeout_secs: 10,
            pool_max_idle_per_host: 8,
            accept_invalid_certs: false,
            proxy: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_retries: u32,
    pub min_delay_ms: u32,
    pub max_delay_ms: u32,
    pub max_pages: u32,
    /// Upper bound for one whole query (resolution plus dispatch).
    pub query_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            min_delay_ms: 200,
            max_delay_ms: 2000,
            max_pages: 20,
            query_timeout_secs: 90,
        }
    }
}

impl DispatchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            min_delay_ms: self.min_delay_ms,
            max_delay_ms: self.max_delay_ms,
        }
    }
}

impl AgentConfig {
    /// Reads `path` (or `sap-odata-agent.yaml` in the working directory if it
    /// exists), applies environment overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        cfg.apply_env();
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                "failed to read config file",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source(path.display().to_string()),
            )
        })?;
        Self::from_yaml(&text).map_err(|e| match e {
            Error::Configuration { message, context } => Error::Configuration {
                message,
                context: context.with_source(path.display().to_string()),
            },
            other => other,
        })
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| {
            Error::configuration_with_context(
                "invalid config file",
                ErrorContext::new().with_details(e.to_string()),
            )
        })
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_string("SAP_AGENT_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = env_string("SAP_AGENT_REGISTRY_PATH") {
            self.registry.path = PathBuf::from(v);
        }
        if let Some(v) = env_string("SAP_AGENT_BACKUP_DIR") {
            self.registry.backup_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env_parse("SAP_AGENT_KEEP_BACKUPS") {
            self.registry.keep_backups = v;
        }
        if let Some(v) = env_parse("SAP_AGENT_WATCH_REGISTRY") {
            self.registry.watch = v;
        }
        if let Some(v) = env_string("SAP_AGENT_LLM_ENDPOINT") {
            self.llm.endpoint = v;
        }
        if let Some(v) = env_string("SAP_AGENT_LLM_MODEL") {
            self.llm.model = Some(v);
        }
        if let Some(v) = env_parse("SAP_AGENT_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = v;
        }
        if let Some(v) = env_parse("SAP_AGENT_CONFIDENCE_THRESHOLD") {
            self.llm.confidence_threshold = v;
        }
        if let Some(v) = env_parse("SAP_AGENT_MAX_RETRIES") {
            self.dispatch.max_retries = v;
        }
        if let Some(v) = env_parse("SAP_AGENT_MAX_PAGES") {
            self.dispatch.max_pages = v;
        }
        if let Some(v) = env_parse("SAP_AGENT_QUERY_TIMEOUT_SECS") {
            self.dispatch.query_timeout_secs = v;
        }
        if let Some(v) =
            env_string("SAP_AGENT_DEFAULT_SYSTEM").or_else(|| env_string("SAP_DEFAULT_SYSTEM_ID"))
        {
            self.default_system = Some(v);
        }
        if let Some(v) = env_string("SAP_AGENT_LOG_LEVEL") {
            self.log_level = v;
        }
    }

    fn normalize(&mut self) {
        self.systems = std::mem::take(&mut self.systems)
            .into_iter()
            .map(|(id, sys)| (id.trim().to_uppercase(), sys))
            .collect();
        self.default_system = self
            .default_system
            .take()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty());
    }

    pub fn validate(&self) -> Result<()> {
        self.bind_addr()?;

        if self.llm.endpoint.trim().is_empty() {
            return Err(config_error("llm.endpoint", "must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.llm.confidence_threshold) {
            return Err(config_error("llm.confidence_threshold", "must be between 0 and 1"));
        }
        if !(0.0..=1.0).contains(&self.llm.ambiguity_margin) {
            return Err(config_error("llm.ambiguity_margin", "must be between 0 and 1"));
        }
        if self.registry.keep_backups == 0 {
            return Err(config_error("registry.keep_backups", "must be at least 1"));
        }
        if self.dispatch.max_pages == 0 {
            return Err(config_error("dispatch.max_pages", "must be at least 1"));
        }
        if self.dispatch.query_timeout_secs == 0 {
            return Err(config_error("dispatch.query_timeout_secs", "must be at least 1"));
        }
        if self.dispatch.min_delay_ms > self.dispatch.max_delay_ms {
            return Err(config_error(
                "dispatch.min_delay_ms",
                "must not exceed dispatch.max_delay_ms",
            ));
        }

        for (id, sys) in &self.systems {
            if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) || id.len() > 10 {
                return Err(config_error(
                    &format!("systems.{}", id),
                    "system ids are 1 to 10 letters or digits",
                ));
            }
            let url = url::Url::parse(&sys.base_url).map_err(|e| {
                config_error(&format!("systems.{}.base_url", id), &e.to_string())
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(config_error(
                    &format!("systems.{}.base_url", id),
                    "must be an http(s) URL",
                ));
            }
        }

        if let Some(default) = &self.default_system {
            if !self.systems.contains_key(default) {
                return Err(config_error(
                    "default_system",
                    &format!("'{}' is not a configured system", default),
                ));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .map_err(|_| config_error("server.bind", "expected host:port"))
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(%key, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

fn config_error(field: &str, msg: &str) -> Error {
    Error::configuration_with_context(
        format!("invalid configuration: {} {}", field, msg),
        ErrorContext::new().with_field_path(field),
    )
}
