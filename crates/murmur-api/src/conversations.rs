use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use murmur_core::{Access, ChatError, Identity, run_blocking};
use murmur_types::api::CreateConversationRequest;

use crate::error::reject;
use crate::state::AppState;

/// POST /conversations: open (or find) the direct conversation with a user.
/// 201 when it was created by this call, 200 when it already existed.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let conversations = state.conversations.clone();
    let (conversation, created) =
        run_blocking(move || conversations.create_direct(identity.user_id, req.participant_id))
            .await
            .map_err(reject)?;

    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(conversation)))
}

/// GET /conversations: the caller's conversations, most recent first.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, StatusCode> {
    let conversations = state.conversations.clone();
    let summaries = run_blocking(move || conversations.list_for(identity.user_id))
        .await
        .map_err(reject)?;
    Ok(Json(summaries))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, StatusCode> {
    let (guard, conversations) = (state.guard.clone(), state.conversations.clone());
    let conversation = run_blocking(move || {
        let conversation = conversations
            .get(conversation_id)?
            .ok_or(ChatError::NotFound("conversation"))?;
        guard.authorize(identity.user_id, conversation_id, Access::Read)?;
        Ok(conversation)
    })
    .await
    .map_err(reject)?;
    Ok(Json(conversation))
}
