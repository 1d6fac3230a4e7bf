use axum::{
    Extension, Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::warn;

use murmur_core::{Identity, run_blocking};
use murmur_types::api::UserSearchResult;

use crate::error::reject;
use crate::state::AppState;

const SEARCH_LIMIT: u32 = 10;

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

/// GET /users/search?q=: case-insensitive match on display name.
pub async fn search_users(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, StatusCode> {
    let q = query.q.trim().to_string();
    if q.is_empty() {
        return Ok(Json(Vec::<UserSearchResult>::new()));
    }

    let db = state.db.clone();
    let rows = run_blocking(move || Ok(db.search_users(&q, &identity.user_id.to_string(), SEARCH_LIMIT)?))
        .await
        .map_err(reject)?;

    let results = rows
        .into_iter()
        .filter_map(|row| match row.id.parse() {
            Ok(id) => Some(UserSearchResult {
                id,
                username: row.username,
                online: row.online,
            }),
            Err(e) => {
                warn!("Corrupt user id '{}': {}", row.id, e);
                None
            }
        })
        .collect::<Vec<_>>();

    Ok(Json(results))
}
