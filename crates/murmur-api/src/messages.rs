use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use murmur_core::{Access, ChatError, Identity, run_blocking};
use murmur_types::api::SendMessageRequest;
use murmur_types::models::Attachment;

use crate::error::reject;
use crate::state::AppState;

const MAX_PAGE: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor: id of the oldest message of the previous page.
    pub before: Option<Uuid>,
}

fn default_limit() -> u32 {
    50
}

/// POST /conversations/{id}/messages: returns once the message is stored
/// and published. The assistant reply, if any, follows in the background.
pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let attachment = req
        .attachment
        .map(|a| Attachment::new(a.url, a.name, a.size, a.mime_type));
    let content = req.content.unwrap_or_default();

    let message = state
        .courier
        .deliver(conversation_id, identity.user_id, content, attachment)
        .await
        .map_err(reject)?;

    Ok((StatusCode::CREATED, Json(message)))
}

/// GET /conversations/{id}/messages: oldest-first page of history.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, StatusCode> {
    let guard = state.guard.clone();
    let ledger = state.courier.ledger().clone();
    let conversations = state.conversations.clone();
    let limit = query.limit.clamp(1, MAX_PAGE);

    let messages = run_blocking(move || {
        if !conversations.exists(conversation_id)? {
            return Err(ChatError::NotFound("conversation"));
        }
        guard.authorize(identity.user_id, conversation_id, Access::Read)?;
        ledger.history(conversation_id, limit, query.before)
    })
    .await
    .map_err(reject)?;

    Ok(Json(messages))
}
