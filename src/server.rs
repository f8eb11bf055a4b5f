use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing::{get, patch, post}, Json, Router};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tracing::info;

use crate::context_data::{ContextData, TokenBreakdown};
use crate::error::ContextError;
use crate::models::{LinkId, NewFile, Role, SessionId};
use crate::service::{ContextService, FileLinkUpdate, ServiceStats};
use crate::settings::{ContextSettings, ContextSettingsPatch};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ContextService>,
}

pub struct ApiError(ContextError);

impl From<ContextError> for ApiError {
    fn from(e: ContextError) -> Self { Self(e) }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ContextError::FileLinkNotFound { .. } => StatusCode::NOT_FOUND,
            ContextError::DuplicateDisplayName { .. } => StatusCode::CONFLICT,
            ContextError::Config(_) | ContextError::Parse(_) => StatusCode::BAD_REQUEST,
            ContextError::Store(_) | ContextError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
struct ContextResponse {
    #[serde(flatten)]
    data: ContextData,
    file_count: usize,
    message_count: usize,
    total_characters: usize,
    tokens: TokenBreakdown,
}

async fn get_context(State(state): State<AppState>, Path(id): Path<SessionId>) -> Json<ContextResponse> {
    let data = state.service.get_context_data(id).await;
    Json(ContextResponse {
        file_count: data.file_count(),
        message_count: data.message_count(),
        total_characters: data.total_characters(),
        tokens: data.token_breakdown(),
        data,
    })
}

async fn get_context_document(State(state): State<AppState>, Path(id): Path<SessionId>) -> ApiResult<Response> {
    let document = state.service.get_context_document(id).await?;
    Ok(([(axum::http::header::CONTENT_TYPE, "application/json")], document.to_string()).into_response())
}

#[derive(Debug, Serialize)]
struct TokenCountResponse {
    tokens: usize,
}

async fn get_token_count(State(state): State<AppState>, Path(id): Path<SessionId>) -> Json<TokenCountResponse> {
    Json(TokenCountResponse { tokens: state.service.get_context_token_count(id).await })
}

#[derive(Debug, Deserialize)]
pub struct AddMessageBody {
    pub role: Role,
    pub content: String,
}

async fn add_message(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Json(body): Json<AddMessageBody>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let message = state.service.add_message(id, body.role, body.content).await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "estimated_tokens": message.estimated_tokens() }))))
}

async fn list_files(State(state): State<AppState>, Path(id): Path<SessionId>) -> ApiResult<Json<serde_json::Value>> {
    let files = state.service.list_files(id).await?;
    Ok(Json(serde_json::json!({ "files": files })))
}

#[derive(Debug, Serialize)]
struct AddFileResponse {
    link_id: LinkId,
}

async fn add_file(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Json(body): Json<NewFile>,
) -> ApiResult<(StatusCode, Json<AddFileResponse>)> {
    let link_id = state.service.add_file(id, body).await?;
    Ok((StatusCode::CREATED, Json(AddFileResponse { link_id })))
}

async fn patch_file(
    State(state): State<AppState>,
    Path((id, link_id)): Path<(SessionId, LinkId)>,
    Json(update): Json<FileLinkUpdate>,
) -> ApiResult<StatusCode> {
    state.service.update_file(id, link_id, update).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_file(
    State(state): State<AppState>,
    Path((id, link_id)): Path<(SessionId, LinkId)>,
) -> ApiResult<StatusCode> {
    state.service.remove_file(id, link_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn refresh(State(state): State<AppState>, Path(id): Path<SessionId>) -> StatusCode {
    state.service.refresh(id, Some("refresh requested over http"));
    StatusCode::ACCEPTED
}

async fn clear(State(state): State<AppState>, Path(id): Path<SessionId>) -> StatusCode {
    state.service.clear_session(id).await;
    StatusCode::NO_CONTENT
}

async fn get_settings(State(state): State<AppState>) -> Json<ContextSettings> {
    Json(state.service.settings())
}

async fn patch_settings(
    State(state): State<AppState>,
    Json(patch): Json<ContextSettingsPatch>,
) -> ApiResult<Json<ContextSettings>> {
    Ok(Json(state.service.update_settings(patch)?))
}

async fn stats(State(state): State<AppState>) -> Json<ServiceStats> {
    Json(state.service.stats().await)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/sessions/:id/context", get(get_context))
        .route("/v1/sessions/:id/context/document", get(get_context_document))
        .route("/v1/sessions/:id/context/tokens", get(get_token_count))
        .route("/v1/sessions/:id/messages", post(add_message))
        .route("/v1/sessions/:id/files", get(list_files).post(add_file))
        .route("/v1/sessions/:id/files/:link_id", patch(patch_file).delete(delete_file))
        .route("/v1/sessions/:id/refresh", post(refresh))
        .route("/v1/sessions/:id/clear", post(clear))
        .route("/v1/settings", get(get_settings).patch(patch_settings))
        .route("/v1/stats", get(stats))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
