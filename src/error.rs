use crate::dispatch::TransportError;
use crate::error_code::ErrorCode;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// Field path that caused the error (e.g., "service_config.odata_version", "parameters.table")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "tool_store", "parameter_validator")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Unified error type for the registry, resolver and dispatcher.
#[derive(Debug, Error)]
pub enum Error {
    /// A tool definition was rejected before commit.
    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    /// A call parameter was rejected before dispatch.
    #[error("Parameter validation error: {message}{}", format_context(.context))]
    ParameterValidation {
        message: String,
        context: ErrorContext,
    },

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Tool '{name}' already exists")]
    AlreadyExists { name: String },

    #[error("Tool '{name}' is disabled")]
    ToolDisabled { name: String },

    /// A concurrent mutation committed first.
    #[error("Registry conflict on '{name}': expected version {expected}, current version is {current_version}")]
    RegistryConflict {
        name: String,
        expected: u64,
        current_version: u64,
    },

    #[error("Network transport error: {0}")]
    Transport(#[from] TransportError),

    /// SAP answered with a 4xx/5xx and an error body.
    #[error("SAP error: HTTP {status}: {message}")]
    Upstream {
        status: u16,
        message: String,
        body: Option<serde_json::Value>,
    },

    #[error("LLM service error: {message}{}", format_context(.context))]
    Llm {
        message: String,
        context: ErrorContext,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Query cancelled")]
    Cancelled,

    #[error("Timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Storage error: {message}{}", format_context(.context))]
    Storage {
        message: String,
        context: ErrorContext,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new validation error with structured context
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::validation_with_context(msg, ErrorContext::new())
    }

    /// Create a new parameter validation error with structured context
    pub fn parameter_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::ParameterValidation {
            message: msg.into(),
            context,
        }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn llm_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Llm {
            message: msg.into(),
            context,
        }
    }

    pub fn storage_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Storage {
            message: msg.into(),
            context,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound { what: what.into() }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Validation { context, .. }
            | Error::ParameterValidation { context, .. }
            | Error::Llm { context, .. }
            | Error::Configuration { context, .. }
            | Error::Storage { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Stable code for API responses.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Validation { .. } => ErrorCode::InvalidDefinition,
            Error::ParameterValidation { .. } => ErrorCode::InvalidParameter,
            Error::NotFound { .. } => ErrorCode::NotFound,
            Error::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            Error::ToolDisabled { .. } => ErrorCode::ToolDisabled,
            Error::RegistryConflict { .. } => ErrorCode::RegistryConflict,
            Error::Transport(TransportError::Timeout(_)) => ErrorCode::Timeout,
            Error::Transport(_) => ErrorCode::Transport,
            Error::Upstream { .. } => ErrorCode::Upstream,
            Error::Llm { .. } => ErrorCode::LlmUnavailable,
            Error::Configuration { .. } => ErrorCode::Configuration,
            Error::Cancelled => ErrorCode::Cancelled,
            Error::Timeout { .. } => ErrorCode::Timeout,
            Error::Storage { .. } | Error::Io(_) | Error::Serialization(_) => ErrorCode::Internal,
        }
    }

    /// Message safe to hand to API callers.
    ///
    /// Internal and network failures are collapsed to a generic sentence with the
    /// error code; everything else keeps its display text. SAP errors expose only
    /// the extracted SAP message.
    pub fn public_message(&self) -> String {
        match self {
            Error::Upstream { message, .. } => message.clone(),
            Error::Transport(TransportError::Timeout(_)) => {
                format!("SAP system did not answer in time ({})", self.code().code())
            }
            Error::Transport(_) => format!("SAP system unreachable ({})", self.code().code()),
            Error::Llm { .. } => format!("LLM service unavailable ({})", self.code().code()),
            Error::Storage { .. } | Error::Io(_) | Error::Serialization(_) => {
                "internal registry error".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Whether the dispatcher may retry the attempt that produced this error.
    pub fn is_retryable(&self) -> bool {
        self.code().retryable()
    }
}
