use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use murmur_core::Identity;
use murmur_types::api::{ReceiptRequest, ReceiptResponse};

use crate::error::reject;
use crate::state::AppState;

/// POST /conversations/{id}/receipts: explicit delivered/read acknowledgement.
pub async fn acknowledge(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<ReceiptRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.message_ids.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let acked = state
        .courier
        .acknowledge(conversation_id, identity.user_id, req.message_ids, req.kind)
        .await
        .map_err(reject)?;

    Ok(Json(ReceiptResponse { updated: acked.len() }))
}
