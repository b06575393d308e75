use super::error::ApiError;
use super::AppState;
use crate::error::{Error, ErrorContext};
use crate::gateway::QueryRequest;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio_util::sync::CancellationToken;

/// `POST /query`. The status code mirrors the outcome; the body is always a
/// result envelope with either `response` or `error`.
pub async fn run_query(
    State(state): State<AppState>,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return ApiError(Error::parameter_with_context(
                "query request must be JSON with a 'query' string",
                ErrorContext::new().with_details(rejection.body_text()),
            ))
            .into_response()
        }
    };

    // A dropped connection drops this future and the guard with it.
    let token = CancellationToken::new();
    let _guard = token.clone().drop_guard();

    let outcome = state.queries.run(request, token).await;
    let status =
        StatusCode::from_u16(outcome.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(outcome)).into_response()
}
