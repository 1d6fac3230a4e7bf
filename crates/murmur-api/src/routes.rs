use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::files::{MAX_FILE_SIZE, UPLOADS_PREFIX};
use crate::middleware::require_auth;
use crate::state::AppState;
use crate::{auth, conversations, files, gateway, messages, reactions, receipts, users};

/// The full HTTP surface: REST routes, the gateway upgrade and stored uploads.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route(
            "/conversations",
            get(conversations::list_conversations).post(conversations::create_conversation),
        )
        .route("/conversations/{conversation_id}", get(conversations::get_conversation))
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route("/conversations/{conversation_id}/receipts", post(receipts::acknowledge))
        .route("/messages/{message_id}/reactions", post(reactions::toggle_reaction))
        .route("/users/search", get(users::search_users))
        .route(
            "/upload",
            post(files::upload_file).layer(DefaultBodyLimit::max(MAX_FILE_SIZE)),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state.clone());

    let ws_route = Router::new()
        .route("/gateway", get(gateway::ws_upgrade))
        .with_state(state.clone());

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .nest_service(UPLOADS_PREFIX, ServeDir::new(state.uploads.root()))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
