mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use murmur_api::files::BlobStore;
use murmur_api::{AppStateInner, router};
use murmur_assistant::{
    AutoResponder, CannedReply, GenerationError, MistralClient, Responder, TextGenerator,
    ensure_assistant_user,
};
use murmur_core::{ConversationStore, Ledger, TokenIssuer};
use murmur_gateway::{Courier, Dispatcher};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Arc::new(murmur_db::Database::open(&config.db_path)?);
    let assistant = ensure_assistant_user(&db, &config.assistant_email, &config.assistant_name)?;
    info!("Assistant is {} ({})", assistant.username, assistant.user_id);

    let generator: Arc<dyn TextGenerator> = match MistralClient::new(
        config.completion_url.clone(),
        config.completion_model.clone(),
        config.api_key.clone(),
        config.responder.generation_timeout,
    ) {
        Ok(client) => Arc::new(client),
        Err(GenerationError::NotConfigured) => {
            warn!("MISTRAL_API_KEY not set, the assistant will answer with a canned notice");
            Arc::new(CannedReply)
        }
        Err(e) => return Err(e.into()),
    };

    // Delivery path and the reply workers behind it
    let (feed, replies) = AutoResponder::channel(&config.responder, &assistant);
    let courier = Courier::new(Ledger::new(db.clone()), Dispatcher::new()).with_feed(feed);
    let responder = AutoResponder::spawn(
        Responder::new(
            courier.clone(),
            ConversationStore::new(db.clone()),
            generator,
            assistant.clone(),
            config.responder.clone(),
        ),
        replies,
    );

    let state = AppStateInner::new(
        db,
        TokenIssuer::new(config.jwt_secret.clone(), config.token_ttl),
        courier,
        BlobStore::new(config.upload_dir.clone()),
        assistant.email.clone(),
    );
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Murmur server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped, draining assistant replies");
    responder.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
