//! Registry administration endpoints, mounted under `/admin`.

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::error::{Error, ErrorContext};
use crate::registry::{
    BackupInfo, ChangeOutcome, DeleteMode, ImportReport, RegistryChange, RegistryExport,
    RegistryImport, RegistryStats, ToolDefinition,
};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/tools", get(list_tools).post(create_tool))
        .route(
            "/tools/:name",
            get(get_tool)
                .put(replace_tool)
                .patch(patch_tool)
                .delete(delete_tool),
        )
        .route("/tools/:name/enable", post(enable_tool))
        .route("/tools/:name/disable", post(disable_tool))
        .route("/stats", get(stats))
        .route("/reload", post(reload))
        .route("/export", get(export))
        .route("/import", post(import))
        .route("/backups", get(list_backups))
        .route("/backups/:file/restore", post(restore_backup))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    enabled_only: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct VersionParams {
    expected_version: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteParams {
    #[serde(default)]
    mode: DeleteMode,
    expected_version: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct VersionBody {
    registry_version: u64,
}

async fn list_tools(
    State(state): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> ApiResult<Json<Vec<ToolDefinition>>> {
    let Query(params) = params?;
    Ok(Json(state.registry.list(params.enabled_only)))
}

async fn get_tool(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ToolDefinition>> {
    Ok(Json(state.registry.get(&name)?))
}

async fn create_tool(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ChangeOutcome>)> {
    let Json(value) = body?;
    let draft = state.registry.parse_draft(value)?;
    let outcome = state.registry.apply(RegistryChange::Create(draft)).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn replace_tool(
    State(state): State<AppState>,
    Path(name): Path<String>,
    params: Result<Query<VersionParams>, QueryRejection>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<ChangeOutcome>> {
    let Query(params) = params?;
    let Json(value) = body?;
    let draft = state.registry.parse_draft(value)?;
    if draft.name != name {
        return Err(ApiError(Error::validation_with_context(
            format!("body names tool '{}' but the URL names '{}'", draft.name, name),
            ErrorContext::new().with_field_path("name"),
        )));
    }
    let outcome = state
        .registry
        .apply(RegistryChange::Replace {
            draft,
            expected_version: params.expected_version,
        })
        .await?;
    Ok(Json(outcome))
}

async fn patch_tool(
    State(state): State<AppState>,
    Path(name): Path<String>,
    params: Result<Query<VersionParams>, QueryRejection>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<ChangeOutcome>> {
    let Query(params) = params?;
    let Json(value) = body?;
    let patch = state.registry.parse_patch(value)?;
    let outcome = state
        .registry
        .apply(RegistryChange::Patch {
            name,
            patch,
            expected_version: params.expected_version,
        })
        .await?;
    Ok(Json(outcome))
}

async fn delete_tool(
    State(state): State<AppState>,
    Path(name): Path<String>,
    params: Result<Query<DeleteParams>, QueryRejection>,
) -> ApiResult<Json<ChangeOutcome>> {
    let Query(params) = params?;
    let outcome = state
        .registry
        .apply(RegistryChange::Delete {
            name,
            mode: params.mode,
            expected_version: params.expected_version,
        })
        .await?;
    Ok(Json(outcome))
}

async fn enable_tool(
    state: State<AppState>,
    name: Path<String>,
    params: Result<Query<VersionParams>, QueryRejection>,
) -> ApiResult<Json<ChangeOutcome>> {
    set_enabled(state, name, params, true).await
}

async fn disable_tool(
    state: State<AppState>,
    name: Path<String>,
    params: Result<Query<VersionParams>, QueryRejection>,
) -> ApiResult<Json<ChangeOutcome>> {
    set_enabled(state, name, params, false).await
}

async fn set_enabled(
    State(state): State<AppState>,
    Path(name): Path<String>,
    params: Result<Query<VersionParams>, QueryRejection>,
    enabled: bool,
) -> ApiResult<Json<ChangeOutcome>> {
    let Query(params) = params?;
    let outcome = state
        .registry
        .apply(RegistryChange::SetEnabled {
            name,
            enabled,
            expected_version: params.expected_version,
        })
        .await?;
    Ok(Json(outcome))
}

async fn stats(State(state): State<AppState>) -> Json<RegistryStats> {
    Json(state.registry.stats())
}

async fn reload(State(state): State<AppState>) -> ApiResult<Json<VersionBody>> {
    let registry_version = state.registry.reload().await?;
    Ok(Json(VersionBody { registry_version }))
}

async fn export(State(state): State<AppState>) -> Json<RegistryExport> {
    Json(state.registry.export())
}

async fn import(
    State(state): State<AppState>,
    body: Result<Json<RegistryImport>, JsonRejection>,
) -> ApiResult<Json<ImportReport>> {
    let Json(import) = body?;
    Ok(Json(state.registry.import(import).await?))
}

async fn list_backups(State(state): State<AppState>) -> ApiResult<Json<Vec<BackupInfo>>> {
    Ok(Json(state.registry.backups().await?))
}

async fn restore_backup(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> ApiResult<Json<VersionBody>> {
    let registry_version = state.registry.restore(&file).await?;
    Ok(Json(VersionBody { registry_version }))
}
