use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::debug;

use murmur_gateway::connection;

use crate::middleware::credential;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct GatewayQuery {
    pub token: Option<String>,
}

/// GET /gateway: upgrade to a realtime session.
///
/// A token in the header, the cookie or `?token=` authenticates the upgrade
/// itself; without one the client must send `identify` first.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = credential(&headers).or(query.token.filter(|t| !t.is_empty()));
    let gateway = state.gateway.clone();

    match token {
        Some(token) => match state.issuer.verify(&token) {
            Ok(identity) => ws
                .on_upgrade(move |socket| {
                    connection::handle_connection_authenticated(socket, gateway, identity)
                })
                .into_response(),
            Err(e) => {
                debug!("Gateway upgrade rejected: {}", e);
                StatusCode::UNAUTHORIZED.into_response()
            }
        },
        None => ws
            .on_upgrade(move |socket| connection::handle_connection(socket, gateway))
            .into_response(),
    }
}
