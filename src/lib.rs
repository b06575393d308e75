//! # sap-odata-agent
//!
//! Natural-language front-end over SAP OData services.
//!
//! A query such as *"Get table schema for MAKT from D2A system"* is mapped by an
//! LLM onto one tool from a hot-reloadable registry, the tool's declared
//! parameters are enforced, and the resulting OData call is executed against
//! the named SAP system.
//!
//! ## Overview
//!
//! - Tools are data, not code: each one is a JSON definition describing an
//!   OData service, entity, version, HTTP method and parameter bindings.
//! - The registry is edited at runtime (admin API, CLI or by hand on disk) and
//!   every reader sees a consistent snapshot.
//! - The LLM only proposes; the resolver decides, and never guesses when the
//!   answer is unclear.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sap_odata_agent::config::AgentConfig;
//! use sap_odata_agent::gateway::QueryRequest;
//! use sap_odata_agent::runtime::AgentRuntime;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> sap_odata_agent::Result<()> {
//!     let config = AgentConfig::load(None)?;
//!     let runtime = AgentRuntime::builder(config).build().await?;
//!
//!     let outcome = runtime
//!         .queries()
//!         .run(
//!             QueryRequest::new("Get table schema for MAKT from D2A system"),
//!             CancellationToken::new(),
//!         )
//!         .await;
//!     println!("{}", serde_json::to_string_pretty(&outcome)?);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`registry`] | Tool definitions, persistence, backups, hot reload |
//! | [`resolver`] | LLM-backed intent resolution and parameter enforcement |
//! | [`dispatch`] | OData request compilation, per-system HTTP pool, execution |
//! | [`gateway`] | One query end to end, with deadline and cancellation |
//! | [`server`] | axum query and admin endpoints |
//! | [`config`] | YAML configuration with environment overrides |

pub mod config;
pub mod dispatch;
pub mod error_code;
pub mod gateway;
pub mod logging;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod server;

// Re-export main types for convenience
pub use config::AgentConfig;
pub use dispatch::{CallResult, Dispatcher};
pub use gateway::{QueryOutcome, QueryRequest, QueryService};
pub use registry::{RegistryManager, ToolDefinition, ToolDraft};
pub use resolver::{IntentResolver, Resolution, ResolvedInvocation};
pub use runtime::AgentRuntime;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
