use std::net::SocketAddr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;

use arbor_core::ControlError;
use arbor_runtime::TerminalError;
use arbor_types::{
    AiRequest, CreateFileRequest, DeleteRequest, FileContent, RenameRequest,
    TerminalInputRequest, TerminalResizeRequest, TerminalSessionCreateRequest,
};
use arbor_workspace::WorkspaceError;

use crate::AppState;

/// Read endpoint refuses files larger than this; tools have their own caps.
const HTTP_READ_CAP: u64 = 256 * 1024;

#[derive(Debug, Serialize)]
struct ErrorDetail {
    detail: String,
}

/// Error envelope shared by every endpoint: HTTP status + `{detail}`.
struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorDetail {
                detail: self.detail,
            }),
        )
            .into_response()
    }
}

impl From<WorkspaceError> for ApiError {
    fn from(err: WorkspaceError) -> Self {
        match err {
            WorkspaceError::PathEscape { .. } => {
                ApiError::new(StatusCode::BAD_REQUEST, "path escape")
            }
            WorkspaceError::NotFound { .. } => {
                ApiError::new(StatusCode::NOT_FOUND, err.to_string())
            }
            WorkspaceError::TooLarge { .. } => {
                ApiError::new(StatusCode::PAYLOAD_TOO_LARGE, err.to_string())
            }
            WorkspaceError::Io(_) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        }
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        let status = match err {
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::Conflict { .. } => StatusCode::CONFLICT,
        };
        ApiError::new(status, err.to_string())
    }
}

impl From<TerminalError> for ApiError {
    fn from(err: TerminalError) -> Self {
        match err {
            TerminalError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, err.to_string()),
            TerminalError::BadShell => ApiError::new(StatusCode::BAD_REQUEST, err.to_string()),
            TerminalError::Workspace(inner) => inner.into(),
            TerminalError::Io(_) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        }
    }
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures_pending().await;
            }
        })
        .await?;
    Ok(())
}

async fn futures_pending() {
    std::future::pending::<()>().await
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/files/tree", get(file_tree))
        .route("/api/files/read", get(file_read))
        .route("/api/files/write", post(file_write))
        .route("/api/files/create", post(file_create))
        .route("/api/files/delete", post(file_delete))
        .route("/api/files/rename", post(file_rename))
        .route("/api/ai/providers", get(list_providers))
        .route("/api/ai/chat", post(ai_chat))
        .route("/api/ai/runs/start", post(run_start))
        .route("/api/ai/runs/{id}", get(run_get))
        .route("/api/ai/runs/{id}/continue", post(run_continue))
        .route("/api/ai/runs/{id}/reply", post(run_reply))
        .route("/api/ai/runs/{id}/pause", post(run_pause))
        .route("/api/ai/runs/{id}/resume", post(run_resume))
        .route("/api/ai/runs/{id}/cancel", post(run_cancel))
        .route("/api/terminal/sessions", post(terminal_create))
        .route("/api/terminal/sessions/{id}/input", post(terminal_input))
        .route("/api/terminal/sessions/{id}/output", get(terminal_output))
        .route("/api/terminal/sessions/{id}/resize", post(terminal_resize))
        .route("/api/terminal/sessions/{id}", delete(terminal_close))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

#[derive(Debug, Deserialize, Default)]
struct PathQuery {
    #[serde(default)]
    path: String,
}

async fn file_tree(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let items = state.workspace.list_tree(&query.path)?;
    Ok(Json(items))
}

async fn file_read(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let size = state.workspace.file_size(&query.path).await?;
    if size > HTTP_READ_CAP {
        return Err(WorkspaceError::TooLarge {
            path: query.path,
            size,
            limit: HTTP_READ_CAP,
        }
        .into());
    }
    let content = state.workspace.read_file(&query.path).await?;
    Ok(Json(content))
}

async fn file_write(
    State(state): State<AppState>,
    Json(req): Json<FileContent>,
) -> Result<impl IntoResponse, ApiError> {
    state.workspace.write_file(&req.path, &req.content).await?;
    let content = state.workspace.read_file(&req.path).await?;
    Ok(Json(content))
}

async fn file_create(
    State(state): State<AppState>,
    Json(req): Json<CreateFileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .workspace
        .create_item(&req.path, req.is_dir, &req.content)
        .await?;
    Ok(Json(json!({"success": true, "path": req.path})))
}

async fn file_delete(
    State(state): State<AppState>,
    Json(req): Json<DeleteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.workspace.delete_item(&req.path).await?;
    Ok(Json(json!({"success": true})))
}

async fn file_rename(
    State(state): State<AppState>,
    Json(req): Json<RenameRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .workspace
        .rename_item(&req.old_path, &req.new_path)
        .await?;
    Ok(Json(json!({"success": true})))
}

async fn list_providers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.providers.list())
}

/// One-shot chat: create a run and execute exactly one tick synchronously.
async fn ai_chat(State(state): State<AppState>, Json(req): Json<AiRequest>) -> impl IntoResponse {
    Json(state.engine.chat(req).await)
}

async fn run_start(State(state): State<AppState>, Json(req): Json<AiRequest>) -> impl IntoResponse {
    let run_id = state.engine.start(req).await;
    Json(json!({"run_id": run_id}))
}

async fn run_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.engine.get(&id).await?;
    Ok(Json(snapshot))
}

async fn run_continue(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.engine.continue_run(&id).await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct ReplyRequest {
    message: String,
}

async fn run_reply(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ReplyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.engine.reply(&id, req.message).await?;
    Ok(Json(response))
}

async fn run_pause(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.pause(&id).await?))
}

async fn run_resume(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.resume(&id).await?))
}

async fn run_cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.cancel(&id).await?))
}

async fn terminal_create(
    State(state): State<AppState>,
    Json(req): Json<TerminalSessionCreateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let info = state.terminals.create(&req.cwd, &req.shell).await?;
    Ok(Json(info))
}

async fn terminal_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TerminalInputRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.data.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "input data cannot be empty",
        ));
    }
    state.terminals.write_input(&id, &req.data).await?;
    Ok(Json(json!({"success": true})))
}

async fn terminal_output(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let output = state.terminals.read_output(&id).await?;
    Ok(Json(output))
}

async fn terminal_resize(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TerminalResizeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.terminals.resize(&id, req.cols, req.rows).await?;
    Ok(Json(json!({"success": true})))
}

async fn terminal_close(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.terminals.close(&id).await?;
    Ok(Json(json!({"success": true})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_errors_map_to_spec_statuses() {
        let err: ApiError = WorkspaceError::PathEscape {
            path: "../x".to_string(),
        }
        .into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.detail, "path escape");

        let err: ApiError = WorkspaceError::NotFound {
            path: "a.txt".to_string(),
        }
        .into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err: ApiError = WorkspaceError::TooLarge {
            path: "big.bin".to_string(),
            size: 1,
            limit: 0,
        }
        .into();
        assert_eq!(err.status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn control_errors_map_to_404_and_409() {
        let err: ApiError = ControlError::NotFound("r1".to_string()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err: ApiError = ControlError::Conflict {
            run_id: "r1".to_string(),
            status: arbor_types::RunStatus::Completed,
        }
        .into();
        assert_eq!(err.status, StatusCode::CONFLICT);
    }
}
