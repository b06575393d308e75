//! SAP call dispatcher.
//!
//! Turns a [`ResolvedInvocation`] into one (or, with pagination, several)
//! OData HTTP calls and normalizes the answer into a [`CallResult`].

pub mod odata;
pub mod pool;
pub mod response;
pub mod retry;

pub use odata::{build_request, CallPlan, ODataRequest};
pub use pool::{ConnectionPool, SystemClient};
pub use retry::RetryPolicy;

use crate::error::{Error, ErrorContext};
use crate::registry::{HttpMethod, RegistryManager};
use crate::resolver::ResolvedInvocation;
use crate::Result;
use retry::Decision;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

const CSRF_HEADER: &str = "x-csrf-token";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    fn classify(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout(e.to_string())
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else {
            TransportError::Http(e)
        }
    }
}

/// Normalized successful answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ODataResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_count: Option<usize>,
    pub pages: u32,
    /// Set when more pages exist than were fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_link: Option<String>,
    /// Raw body of the first page.
    pub payload: Value,
    pub request_url: String,
}

/// Uniform result envelope: exactly one of `response` / `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ODataResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallResult {
    pub fn ok(response: ODataResponse) -> Self {
        Self {
            success: true,
            response: Some(response),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            response: None,
            error: Some(message.into()),
        }
    }

    pub fn from_error(err: &Error) -> Self {
        Self::failed(err.public_message())
    }
}

impl From<Result<ODataResponse>> for CallResult {
    fn from(result: Result<ODataResponse>) -> Self {
        match result {
            Ok(resp) => CallResult::ok(resp),
            Err(e) => CallResult::from_error(&e),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOptions {
    /// Follow next links up to the configured page limit.
    #[serde(default)]
    pub all_pages: bool,
}

pub struct Dispatcher {
    registry: Arc<RegistryManager>,
    pool: Arc<ConnectionPool>,
    retry: RetryPolicy,
    max_pages: u32,
    default_system: Option<String>,
}

impl Dispatcher {
    pub fn new(registry: Arc<RegistryManager>, pool: Arc<ConnectionPool>) -> Self {
        Self {
            registry,
            pool,
            retry: RetryPolicy::default(),
            max_pages: 20,
            default_system: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// System used by tools that do not take a `system_id`.
    pub fn with_default_system(mut self, system: Option<String>) -> Self {
        self.default_system = system;
        self
    }

    pub async fn invoke(
        &self,
        invocation: &ResolvedInvocation,
        options: &DispatchOptions,
        cancel: &CancellationToken,
    ) -> CallResult {
        self.execute(invocation, options, cancel).await.into()
    }

    /// Like [`Dispatcher::invoke`] but keeps the typed error.
    #[tracing::instrument(
        name = "dispatch",
        skip_all,
        fields(tool = %invocation.tool_name, system = ?invocation.system_id)
    )]
    pub async fn execute(
        &self,
        invocation: &ResolvedInvocation,
        options: &DispatchOptions,
        cancel: &CancellationToken,
    ) -> Result<ODataResponse> {
        let started = Instant::now();
        let tool = self.registry.lookup_enabled(&invocation.tool_name)?;

        let system_id = if tool.requires_system {
            invocation.system_id.clone().ok_or_else(|| {
                Error::parameter_with_context(
                    format!("tool '{}' needs a SAP system id", tool.name),
                    ErrorContext::new().with_field_path("system_id"),
                )
            })?
        } else {
            self.default_system.clone().ok_or_else(|| {
                Error::configuration(format!(
                    "tool '{}' takes no system id and no default system is configured",
                    tool.name
                ))
            })?
        };
        let client = self.pool.acquire(&system_id)?;

        let request = build_request(
            &client.base_url,
            client.sap_client.as_deref(),
            &tool,
            &invocation.parameters,
        )?;
        let version = request.plan.version();
        let method = request.method();
        tracing::debug!(plan = ?request.plan, url = %request.url, "Compiled OData request");

        let csrf = match method {
            HttpMethod::Post => fetch_csrf_token(&client, &request.service_root, cancel).await?,
            HttpMethod::Get => None,
        };

        let (status, payload) = self
            .send_with_retry(&client, method, &request.url, request.body.as_ref(), csrf.as_deref(), cancel)
            .await?;

        let mut records = response::records(&payload, version);
        let mut pages = 1u32;
        let mut next = match method {
            HttpMethod::Get => {
                same_system(&client, response::next_link(&payload, version, &request.url))
            }
            HttpMethod::Post => None,
        };

        while options.all_pages && pages < self.max_pages {
            let Some(mut url) = next.take() else {
                break;
            };
            if let Some(sap_client) = client.sap_client.as_deref() {
                if !url.query_pairs().any(|(k, _)| k == "sap-client") {
                    url.query_pairs_mut().append_pair("sap-client", sap_client);
                }
            }
            let (_, page) = self
                .send_with_retry(&client, HttpMethod::Get, &url, None, None, cancel)
                .await?;
            pages += 1;
            if let (Some(all), Some(more)) = (records.as_mut(), response::records(&page, version)) {
                all.extend(more);
            }
            next = same_system(&client, response::next_link(&page, version, &url));
        }

        if let Some(link) = &next {
            tracing::debug!(pages, next = %link, "More pages available");
        }

        let record_count = records.as_ref().map(Vec::len);
        tracing::info!(
            status,
            pages,
            records = ?record_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "SAP call succeeded"
        );

        Ok(ODataResponse {
            status,
            records,
            record_count,
            pages,
            next_link: next.map(String::from),
            payload,
            request_url: request.url.to_string(),
        })
    }

    async fn send_with_retry(
        &self,
        client: &SystemClient,
        method: HttpMethod,
        url: &Url,
        body: Option<&Value>,
        csrf: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(u16, Value)> {
        let mut attempt: u32 = 0;
        loop {
            let result = cancellable(cancel, send_once(client, method, url, body, csrf)).await?;
            match result {
                Ok(ok) => return Ok(ok),
                Err(err) => match self.retry.decide(&err, attempt, method) {
                    Decision::Retry { delay } => {
                        tracing::warn!(
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Transient SAP transport failure, retrying"
                        );
                        cancellable(cancel, tokio::time::sleep(delay)).await?;
                        attempt += 1;
                    }
                    Decision::Fail => {
                        tracing::warn!(attempts = attempt + 1, error = %err, "SAP call failed");
                        return Err(err);
                    }
                },
            }
        }
    }
}

/// Next links are only followed on the system that issued them; its
/// credentials go with every request.
fn same_system(client: &SystemClient, link: Option<Url>) -> Option<Url> {
    let url = link?;
    if client.owns(&url) {
        Some(url)
    } else {
        tracing::warn!(
            system = %client.id,
            host = url.host_str().unwrap_or_default(),
            "Ignoring next link to a foreign host"
        );
        None
    }
}

async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        out = fut => Ok(out),
    }
}

async fn send_once(
    client: &SystemClient,
    method: HttpMethod,
    url: &Url,
    body: Option<&Value>,
    csrf: Option<&str>,
) -> Result<(u16, Value)> {
    let http_method = match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
    };
    let mut req = client.request(http_method, url.clone());
    if let Some(body) = body {
        req = req.json(body);
    }
    if let Some(token) = csrf {
        req = req.header(CSRF_HEADER, token);
    }

    let resp = req
        .send()
        .await
        .map_err(|e| Error::Transport(TransportError::classify(e)))?;
    let status = resp.status().as_u16();
    let text = resp
        .text()
        .await
        .map_err(|e| Error::Transport(TransportError::classify(e)))?;

    if !(200..300).contains(&status) {
        let body = serde_json::from_str::<Value>(&text)
            .ok()
            .or_else(|| (!text.trim().is_empty()).then(|| Value::String(text.clone())));
        return Err(Error::Upstream {
            status,
            message: response::sap_error_message(status, &text),
            body,
        });
    }

    if text.trim().is_empty() {
        return Ok((status, Value::Null));
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(payload) => {
            if let Some(message) = response::embedded_error(&payload) {
                return Err(Error::Upstream {
                    status,
                    message,
                    body: Some(payload),
                });
            }
            Ok((status, payload))
        }
        Err(_) => Ok((status, Value::String(text))),
    }
}

/// Fetches a CSRF token from the service document. `None` when the system sends none.
async fn fetch_csrf_token(
    client: &SystemClient,
    service_root: &Url,
    cancel: &CancellationToken,
) -> Result<Option<String>> {
    let req = client
        .request(reqwest::Method::GET, service_root.clone())
        .header(CSRF_HEADER, "Fetch");
    let resp = cancellable(cancel, req.send())
        .await?
        .map_err(|e| Error::Transport(TransportError::classify(e)))?;

    let status = resp.status().as_u16();
    let token = resp
        .headers()
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.eq_ignore_ascii_case("required"))
        .map(str::to_string);

    if !(200..300).contains(&status) {
        let text = resp.text().await.unwrap_or_default();
        return Err(Error::Upstream {
            status,
            message: format!(
                "CSRF token fetch failed: {}",
                response::sap_error_message(status, &text)
            ),
            body: None,
        });
    }
    if token.is_none() {
        tracing::warn!(system = %client.id, "SAP system returned no CSRF token; sending POST without one");
    }
    Ok(token)
}
