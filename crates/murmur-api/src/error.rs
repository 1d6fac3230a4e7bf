use axum::http::StatusCode;
use tracing::error;

use murmur_core::ChatError;

/// Map a domain failure to the status the caller sees.
pub fn reject(e: ChatError) -> StatusCode {
    match e {
        ChatError::Auth(_) => StatusCode::UNAUTHORIZED,
        ChatError::Forbidden => StatusCode::FORBIDDEN,
        ChatError::Validation(_) => StatusCode::BAD_REQUEST,
        ChatError::NotFound(_) => StatusCode::NOT_FOUND,
        ChatError::Persistence(e) => {
            error!("Persistence failure: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
