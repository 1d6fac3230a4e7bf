use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use murmur_core::run_blocking;
use murmur_types::api::{LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};

use crate::error::reject;
use crate::middleware::TOKEN_COOKIE;
use crate::state::AppState;

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let email = req.email.trim().to_lowercase();
    let username = req.username.trim().to_string();

    // Validate input
    if username.len() < 3 || username.len() > 32 {
        return Err(StatusCode::BAD_REQUEST);
    }
    if req.password.len() < 8 {
        return Err(StatusCode::BAD_REQUEST);
    }
    if !email.contains('@') {
        return Err(StatusCode::BAD_REQUEST);
    }
    if email == state.reserved_email.to_lowercase() {
        return Err(StatusCode::CONFLICT);
    }

    // Check if email or username is taken
    let taken = {
        let db = state.db.clone();
        let (email, username) = (email.clone(), username.clone());
        run_blocking(move || {
            Ok(db.get_user_by_email(&email)?.is_some() || db.get_user_by_username(&username)?.is_some())
        })
        .await
        .map_err(reject)?
    };
    if taken {
        return Err(StatusCode::CONFLICT);
    }

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| {
            error!("Password hashing failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .to_string();

    let user_id = Uuid::new_v4();
    let now = murmur_db::timestamp(chrono::Utc::now());
    {
        let db = state.db.clone();
        let (email, username) = (email.clone(), username.clone());
        run_blocking(move || {
            db.create_user(&user_id.to_string(), &email, &username, &password_hash, &now)?;
            Ok(())
        })
        .await
        // Lost a race with a concurrent registration
        .map_err(|_| StatusCode::CONFLICT)?;
    }

    let token = state.issuer.issue(user_id, &username).map_err(|e| {
        error!("Token signing failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    info!("Registered {} ({})", username, user_id);

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user_id,
            username,
            token,
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let email = req.email.trim().to_lowercase();
    let db = state.db.clone();
    let user = run_blocking(move || Ok(db.get_user_by_email(&email)?))
        .await
        .map_err(reject)?
        .ok_or(StatusCode::UNAUTHORIZED)?;

    // The assistant row carries a hash that never parses
    let parsed_hash = PasswordHash::new(&user.password).map_err(|_| StatusCode::UNAUTHORIZED)?;

    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    let user_id: Uuid = user.id.parse().map_err(|e| {
        warn!("Corrupt user id '{}': {}", user.id, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let token = state.issuer.issue(user_id, &user.username).map_err(|e| {
        error!("Token signing failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let presence = state.presence.clone();
    match run_blocking(move || presence.set_online(user_id)).await {
        Ok(Some(updated)) => state.gateway.announce_presence(&updated).await,
        Ok(None) => {}
        Err(e) => warn!("Marking {} online failed: {}", user_id, e),
    }

    let cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        TOKEN_COOKIE,
        token,
        state.issuer.validity().num_seconds()
    );

    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(LoginResponse {
            user_id,
            username: user.username,
            token,
        }),
    ))
}
