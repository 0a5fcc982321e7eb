//! HTTP surface
//!
//! Thin axum layer over the session store. Every route resolves to a normal
//! JSON body; only genuinely unexpected conditions surface as a 500.

use crate::agent::RunOutcome;
use crate::error::AgentError;
use crate::session::{SessionInfo, SessionStore};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

/// Build the application router.
pub fn router(store: Arc<SessionStore>) -> Router {
    Router::new()
        .route("/sessions", post(create_session).get(history))
        .route("/sessions/{id}/query", post(run_query))
        .route("/sessions/{id}/clarify", post(clarify))
        .route("/sessions/{id}/conversations", get(conversations))
        .route("/sessions/{id}/tools", post(register_tool))
        .route("/sessions/{id}/tools/synthesize", post(synthesize_tool))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

/// Error wrapper mapping the core taxonomy onto status codes.
struct ApiError(AgentError);

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        Self(err)
    }
}

pub(crate) fn status_for(err: &AgentError) -> StatusCode {
    match err {
        AgentError::BadRequest(_) | AgentError::InvalidTool(_) => StatusCode::BAD_REQUEST,
        AgentError::Capability { .. } | AgentError::Oracle(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("internal error at the web boundary: {}", self.0);
        }
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct CreatedSession {
    session_id: String,
}

async fn create_session() -> Json<CreatedSession> {
    Json(CreatedSession {
        session_id: SessionStore::mint_session_id(),
    })
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(default)]
    document_url: Option<String>,
}

async fn run_query(
    State(store): State<Arc<SessionStore>>,
    Path(id): Path<String>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<RunOutcome>, ApiError> {
    let outcome = store
        .run_query(&id, &request.query, request.document_url.as_deref())
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct ClarifyRequest {
    definitions: String,
    #[serde(default)]
    feedback: String,
    re_evaluate: bool,
}

async fn clarify(
    State(store): State<Arc<SessionStore>>,
    Path(id): Path<String>,
    Json(request): Json<ClarifyRequest>,
) -> Result<Json<RunOutcome>, ApiError> {
    let outcome = store
        .provide_clarification(
            &id,
            &request.definitions,
            &request.feedback,
            request.re_evaluate,
        )
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Serialize)]
struct ConversationsResponse {
    conversations: Vec<(String, String)>,
}

async fn conversations(
    State(store): State<Arc<SessionStore>>,
    Path(id): Path<String>,
) -> Result<Json<ConversationsResponse>, ApiError> {
    let conversations = store.conversation_log(&id).await?;
    Ok(Json(ConversationsResponse { conversations }))
}

#[derive(Debug, Deserialize)]
struct RegisterToolRequest {
    name: String,
    description: String,
    code: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
}

async fn register_tool(
    State(store): State<Arc<SessionStore>>,
    Path(id): Path<String>,
    Json(request): Json<RegisterToolRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    store
        .register_plugin_tool(&id, &request.name, &request.description, &request.code)
        .await?;
    Ok(Json(StatusResponse { status: "ok" }))
}

#[derive(Debug, Deserialize)]
struct SynthesizeToolRequest {
    name: String,
    description: String,
}

async fn synthesize_tool(
    State(store): State<Arc<SessionStore>>,
    Path(id): Path<String>,
    Json(request): Json<SynthesizeToolRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    store
        .synthesize_tool(&id, &request.name, &request.description)
        .await?;
    Ok(Json(StatusResponse { status: "ok" }))
}

async fn history(State(store): State<Arc<SessionStore>>) -> Json<Vec<SessionInfo>> {
    Json(store.history().await)
}
