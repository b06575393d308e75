//! HTTP surface: `POST /query` plus the `/admin` registry endpoints.

pub mod admin;
pub mod error;
pub mod query;

pub use error::{ApiError, ApiResult};

use crate::gateway::QueryService;
use crate::registry::RegistryManager;
use crate::runtime::AgentRuntime;
use crate::Result;
use axum::routing::post;
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RegistryManager>,
    pub queries: Arc<QueryService>,
}

impl AppState {
    pub fn from_runtime(runtime: &AgentRuntime) -> Self {
        Self {
            registry: runtime.registry().clone(),
            queries: runtime.queries().clone(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/query", post(query::run_query))
        .nest("/admin", admin::routes())
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Serves on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "Listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("Server stopped");
    Ok(())
}

/// Binds the configured address and serves until Ctrl-C.
pub async fn run(runtime: &AgentRuntime) -> Result<()> {
    let addr = runtime.config().bind_addr()?;
    let listener = TcpListener::bind(addr).await?;
    serve(listener, AppState::from_runtime(runtime), async {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::warn!("Ctrl-C handler unavailable; serving until killed");
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown requested");
    })
    .await
}
