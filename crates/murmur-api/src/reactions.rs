use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use murmur_core::Identity;
use murmur_types::api::ToggleReactionRequest;

use crate::error::reject;
use crate::state::AppState;

/// POST /messages/{id}/reactions: toggle the caller's reaction.
pub async fn toggle_reaction(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<ToggleReactionRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let message = state
        .courier
        .react(message_id, identity.user_id, req.emoji)
        .await
        .map_err(reject)?;
    Ok(Json(message))
}
