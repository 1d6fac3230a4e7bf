#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use murmur_api::files::BlobStore;
use murmur_api::{AppState, AppStateInner, router};
use murmur_assistant::context::ContextTurn;
use murmur_assistant::{
    AssistantIdentity, AutoResponder, GenerationError, Responder, ResponderConfig, TextGenerator,
    ensure_assistant_user,
};
use murmur_core::{ConversationStore, Ledger, TokenIssuer};
use murmur_db::Database;
use murmur_gateway::{Courier, Dispatcher};

pub const REPLY: &str = "Hi from the assistant";

/// Answers every prompt with the same text.
pub struct FixedReply(pub &'static str);

#[async_trait]
impl TextGenerator for FixedReply {
    async fn complete(
        &self,
        _system_prompt: &str,
        _context: &[ContextTurn],
        _message: &str,
    ) -> Result<String, GenerationError> {
        Ok(self.0.to_string())
    }
}

pub struct Harness {
    pub state: AppState,
    pub app: Router,
    pub assistant: AssistantIdentity,
    pub responder: AutoResponder,
    pub upload_root: PathBuf,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_generator(Arc::new(FixedReply(REPLY)))
    }

    pub fn with_generator(generator: Arc<dyn TextGenerator>) -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let assistant = ensure_assistant_user(&db, "assistant@murmur.test", "Murmur AI").unwrap();

        let config = ResponderConfig::default();
        let (feed, receiver) = AutoResponder::channel(&config, &assistant);
        let courier = Courier::new(Ledger::new(db.clone()), Dispatcher::new()).with_feed(feed);
        let responder = AutoResponder::spawn(
            Responder::new(
                courier.clone(),
                ConversationStore::new(db.clone()),
                generator,
                assistant.clone(),
                config,
            ),
            receiver,
        );

        let upload_root = std::env::temp_dir().join(format!("murmur-test-{}", Uuid::new_v4()));
        let state = AppStateInner::new(
            db,
            TokenIssuer::new("test-secret", chrono::Duration::days(7)),
            courier,
            BlobStore::new(&upload_root),
            assistant.email.clone(),
        );

        Self {
            app: router(state.clone()),
            state,
            assistant,
            responder,
            upload_root,
        }
    }

    pub async fn call(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let req = match body {
            Some(body) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        self.send(req).await
    }

    pub async fn send(&self, req: Request<Body>) -> (StatusCode, Value) {
        let resp = self.app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    /// Register `name` and return (user id, token).
    pub async fn register(&self, name: &str) -> (Uuid, String) {
        let (status, body) = self
            .call(
                Method::POST,
                "/auth/register",
                None,
                Some(serde_json::json!({
                    "email": format!("{name}@example.com"),
                    "username": name,
                    "password": "correct horse battery",
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "register {name}: {body}");
        (
            body["user_id"].as_str().unwrap().parse().unwrap(),
            body["token"].as_str().unwrap().to_string(),
        )
    }

    /// Open the direct conversation between the token's owner and `other`.
    pub async fn open_conversation(&self, token: &str, other: Uuid) -> Uuid {
        let (status, body) = self
            .call(
                Method::POST,
                "/conversations",
                Some(token),
                Some(serde_json::json!({ "participant_id": other })),
            )
            .await;
        assert!(status.is_success(), "open conversation: {status} {body}");
        body["id"].as_str().unwrap().parse().unwrap()
    }

    pub async fn send_text(&self, token: &str, conversation: Uuid, content: &str) -> (StatusCode, Value) {
        self.call(
            Method::POST,
            &format!("/conversations/{conversation}/messages"),
            Some(token),
            Some(serde_json::json!({ "content": content })),
        )
        .await
    }

    pub async fn history(&self, token: &str, conversation: Uuid) -> Vec<Value> {
        let (status, body) = self
            .call(
                Method::GET,
                &format!("/conversations/{conversation}/messages"),
                Some(token),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        body.as_array().unwrap().clone()
    }

    /// Poll history until it holds at least `n` messages.
    pub async fn wait_for_history(&self, token: &str, conversation: Uuid, n: usize) -> Vec<Value> {
        for _ in 0..200 {
            let history = self.history(token, conversation).await;
            if history.len() >= n {
                return history;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.history(token, conversation).await
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.upload_root);
    }
}
