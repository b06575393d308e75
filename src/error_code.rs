//! Stable error codes shared by the query and admin surfaces.
//!
//! Every [`crate::Error`] and every terminal resolution outcome maps onto one of
//! these codes, so that API clients can branch on a fixed vocabulary instead of
//! parsing messages.
//!
//! ## Error Code Categories
//!
//! | Prefix | Category    | Description                                 |
//! |--------|-------------|---------------------------------------------|
//! | E1xxx  | client      | Malformed definitions or call parameters    |
//! | E2xxx  | resolution  | The query could not be mapped to one tool   |
//! | E3xxx  | upstream    | SAP or LLM side failures                    |
//! | E4xxx  | operational | Concurrency conflicts and cancellation      |
//! | E5xxx  | setup       | Configuration problems                      |
//! | E9xxx  | internal    | Catch-all                                   |
//!
//! ## Example
//!
//! ```rust
//! use sap_odata_agent::error_code::ErrorCode;
//!
//! let code = ErrorCode::from_sap_status(503);
//! assert_eq!(code.code(), "E3001");
//! assert_eq!(code.http_status(), 502);
//! ```

use std::fmt;

/// Canonical error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// E1001: Tool definition failed schema or semantic validation
    InvalidDefinition,
    /// E1002: Extracted or supplied call parameter failed validation
    InvalidParameter,
    /// E1003: Tool or backup does not exist
    NotFound,
    /// E1004: Tool name already taken
    AlreadyExists,
    /// E1005: Tool exists but is disabled
    ToolDisabled,
    /// E2001: No registered tool matched the query
    NoMatch,
    /// E2002: Several tools matched the query equally well
    AmbiguousIntent,
    /// E3001: SAP answered with an error payload
    Upstream,
    /// E3002: Network failure talking to SAP
    Transport,
    /// E3003: The call or query exceeded its deadline
    Timeout,
    /// E3004: The LLM service failed or returned garbage
    LlmUnavailable,
    /// E4001: Concurrent registry mutation lost the race
    RegistryConflict,
    /// E4002: The caller cancelled the query
    Cancelled,
    /// E5001: Missing or invalid configuration
    Configuration,
    /// E9999: Anything else
    Internal,
}

impl ErrorCode {
    /// Returns the canonical code string (e.g., `"E1001"`).
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidDefinition => "E1001",
            Self::InvalidParameter => "E1002",
            Self::NotFound => "E1003",
            Self::AlreadyExists => "E1004",
            Self::ToolDisabled => "E1005",
            Self::NoMatch => "E2001",
            Self::AmbiguousIntent => "E2002",
            Self::Upstream => "E3001",
            Self::Transport => "E3002",
            Self::Timeout => "E3003",
            Self::LlmUnavailable => "E3004",
            Self::RegistryConflict => "E4001",
            Self::Cancelled => "E4002",
            Self::Configuration => "E5001",
            Self::Internal => "E9999",
        }
    }

    /// Returns the snake_case name used in JSON error bodies.
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidDefinition => "validation_error",
            Self::InvalidParameter => "parameter_validation_error",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::ToolDisabled => "tool_disabled",
            Self::NoMatch => "no_match",
            Self::AmbiguousIntent => "ambiguous_intent",
            Self::Upstream => "upstream_error",
            Self::Transport => "transport_error",
            Self::Timeout => "timeout",
            Self::LlmUnavailable => "llm_unavailable",
            Self::RegistryConflict => "registry_conflict",
            Self::Cancelled => "cancelled",
            Self::Configuration => "configuration_error",
            Self::Internal => "internal",
        }
    }

    /// HTTP status the server answers with for this code.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidDefinition => 400,
            Self::InvalidParameter | Self::NoMatch | Self::AmbiguousIntent => 422,
            Self::NotFound => 404,
            Self::AlreadyExists | Self::RegistryConflict => 409,
            Self::ToolDisabled => 403,
            Self::Upstream | Self::LlmUnavailable => 502,
            Self::Transport | Self::Timeout => 504,
            Self::Cancelled => 499,
            Self::Configuration | Self::Internal => 500,
        }
    }

    /// Whether a dispatcher may retry the call that produced this code.
    ///
    /// Only transport-level failures qualify; SAP error payloads are final.
    #[inline]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Transport | Self::Timeout)
    }

    /// Returns the category: `"client"`, `"resolution"`, `"upstream"`,
    /// `"operational"`, `"setup"` or `"internal"`.
    #[inline]
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidDefinition
            | Self::InvalidParameter
            | Self::NotFound
            | Self::AlreadyExists
            | Self::ToolDisabled => "client",
            Self::NoMatch | Self::AmbiguousIntent => "resolution",
            Self::Upstream | Self::Transport | Self::Timeout | Self::LlmUnavailable => "upstream",
            Self::RegistryConflict | Self::Cancelled => "operational",
            Self::Configuration => "setup",
            Self::Internal => "internal",
        }
    }

    /// Classifies an HTTP status returned by a SAP system.
    ///
    /// Any 4xx/5xx answer is an upstream error. Gateway timeouts are still
    /// answers from SAP's web dispatcher and therefore not retryable here.
    pub fn from_sap_status(status: u16) -> Self {
        match status {
            200..=299 => Self::Internal,
            _ => Self::Upstream,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
