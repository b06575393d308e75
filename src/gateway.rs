//! One natural-language query, end to end.
//!
//! [`QueryService`] walks each invocation through
//! `Received -> Resolving -> (Resolved | NoMatch | AmbiguousIntent)` and, for a
//! resolved query, `Dispatching -> (Succeeded | Failed)`. The whole walk runs
//! under a deadline and a cancellation token shared with the LLM and SAP calls.

use crate::dispatch::{CallResult, DispatchOptions, Dispatcher};
use crate::error_code::ErrorCode;
use crate::registry::RegistryManager;
use crate::resolver::{IntentResolver, Resolution};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    Received,
    Resolving,
    Resolved,
    NoMatch,
    AmbiguousIntent,
    Dispatching,
    Succeeded,
    Failed,
}

impl InvocationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::NoMatch | Self::AmbiguousIntent | Self::Succeeded | Self::Failed
        )
    }

    /// Allowed edges of the invocation state machine.
    pub fn can_transition_to(self, next: InvocationState) -> bool {
        use InvocationState::*;
        matches!(
            (self, next),
            (Received, Resolving)
                | (Resolving, Resolved)
                | (Resolving, NoMatch)
                | (Resolving, AmbiguousIntent)
                | (Resolved, Dispatching)
                | (Dispatching, Succeeded)
                | (Received | Resolving | Resolved | Dispatching, Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    /// Overrides any system named in the query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_id: Option<String>,
    #[serde(default)]
    pub all_pages: bool,
    /// Per-request deadline, capped by the configured query timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            system_id: None,
            all_pages: false,
            timeout_ms: None,
        }
    }

    pub fn with_system(mut self, system_id: impl Into<String>) -> Self {
        self.system_id = Some(system_id.into());
        self
    }
}

/// What the caller gets back. `result` carries either the SAP payload or the
/// error message, never both.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryOutcome {
    pub request_id: String,
    pub state: InvocationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "code_str")]
    pub code: Option<ErrorCode>,
    #[serde(flatten)]
    pub result: CallResult,
}

fn code_str<S: serde::Serializer>(
    code: &Option<ErrorCode>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    match code {
        Some(c) => s.serialize_str(c.code()),
        None => s.serialize_none(),
    }
}

impl QueryOutcome {
    /// HTTP status the query endpoint answers with.
    pub fn http_status(&self) -> u16 {
        self.code.map_or(200, |c| c.http_status())
    }
}

struct Invocation {
    request_id: String,
    state: InvocationState,
    tool_name: Option<String>,
    system_id: Option<String>,
}

impl Invocation {
    fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            state: InvocationState::Received,
            tool_name: None,
            system_id: None,
        }
    }

    fn advance(&mut self, next: InvocationState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!(from = ?self.state, to = ?next, "Invocation state change");
        self.state = next;
    }

    fn finish(
        mut self,
        state: InvocationState,
        code: Option<ErrorCode>,
        result: CallResult,
        candidates: Vec<String>,
    ) -> QueryOutcome {
        self.advance(state);
        QueryOutcome {
            request_id: self.request_id,
            state: self.state,
            tool_name: self.tool_name,
            system_id: self.system_id,
            candidates,
            code,
            result,
        }
    }

    fn fail(self, err: &Error) -> QueryOutcome {
        let code = err.code();
        if code.http_status() >= 500 {
            tracing::warn!(error = %err, code = code.code(), "Query failed");
        } else {
            tracing::info!(error = %err, code = code.code(), "Query rejected");
        }
        self.finish(
            InvocationState::Failed,
            Some(code),
            CallResult::from_error(err),
            Vec::new(),
        )
    }
}

pub struct QueryService {
    registry: Arc<RegistryManager>,
    resolver: IntentResolver,
    dispatcher: Dispatcher,
    timeout: Duration,
}

impl QueryService {
    pub fn new(
        registry: Arc<RegistryManager>,
        resolver: IntentResolver,
        dispatcher: Dispatcher,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            resolver,
            dispatcher,
            timeout,
        }
    }

    pub fn registry(&self) -> &Arc<RegistryManager> {
        &self.registry
    }

    /// Runs one query. Never returns an error: failures are part of the outcome.
    pub async fn run(&self, request: QueryRequest, cancel: CancellationToken) -> QueryOutcome {
        let mut inv = Invocation::new();
        let span = tracing::info_span!("query", request_id = %inv.request_id);

        let deadline = request
            .timeout_ms
            .map(Duration::from_millis)
            .map_or(self.timeout, |d| d.min(self.timeout));
        let started = Instant::now();
        let token = cancel.child_token();

        let result = tokio::time::timeout(deadline, self.drive(&request, &mut inv, &token))
            .instrument(span.clone())
            .await;
        let _enter = span.enter();

        match result {
            Ok(Ok(Finished::Succeeded(response))) => inv.finish(
                InvocationState::Succeeded,
                None,
                CallResult::ok(response),
                Vec::new(),
            ),
            Ok(Ok(Finished::NoMatch(reason))) => inv.finish(
                InvocationState::NoMatch,
                Some(ErrorCode::NoMatch),
                CallResult::failed(format!("No tool matches the query: {}", reason)),
                Vec::new(),
            ),
            Ok(Ok(Finished::Ambiguous(candidates))) => inv.finish(
                InvocationState::AmbiguousIntent,
                Some(ErrorCode::AmbiguousIntent),
                CallResult::failed(format!(
                    "The query matches several tools equally well: {}",
                    candidates.join(", ")
                )),
                candidates,
            ),
            Ok(Err(err)) => inv.fail(&err),
            Err(_) => {
                token.cancel();
                inv.fail(&Error::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
        }
    }

    async fn drive(
        &self,
        request: &QueryRequest,
        inv: &mut Invocation,
        cancel: &CancellationToken,
    ) -> Result<Finished> {
        inv.advance(InvocationState::Resolving);
        let candidates = self.registry.resolve_candidates();
        let resolution = self
            .resolver
            .resolve(&request.query, &candidates, request.system_id.as_deref(), cancel)
            .await?;

        let invocation = match resolution {
            Resolution::Resolved(invocation) => invocation,
            Resolution::NoMatch { reason } => return Ok(Finished::NoMatch(reason)),
            Resolution::AmbiguousIntent { candidates } => {
                return Ok(Finished::Ambiguous(candidates))
            }
        };
        inv.advance(InvocationState::Resolved);
        inv.tool_name = Some(invocation.tool_name.clone());
        inv.system_id = invocation.system_id.clone();

        inv.advance(InvocationState::Dispatching);
        let options = DispatchOptions {
            all_pages: request.all_pages,
        };
        let response = self.dispatcher.execute(&invocation, &options, cancel).await?;
        Ok(Finished::Succeeded(response))
    }
}

enum Finished {
    Succeeded(crate::dispatch::ODataResponse),
    NoMatch(String),
    Ambiguous(Vec<String>),
}
