use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use murmur_db::Database;

/// Never a valid PHC string, so password login as the assistant always fails.
const UNUSABLE_PASSWORD: &str = "!";

/// The distinguished assistant user, recognized by its reserved email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantIdentity {
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
}

impl AssistantIdentity {
    pub fn is_assistant(&self, user_id: Uuid) -> bool {
        self.user_id == user_id
    }
}

/// Resolve the assistant row by `email`, creating it on first start.
pub fn ensure_assistant_user(db: &Database, email: &str, username: &str) -> Result<AssistantIdentity> {
    if let Some(row) = db.get_user_by_email(email)? {
        let user_id = Uuid::parse_str(&row.id).context("assistant row has a malformed id")?;
        return Ok(AssistantIdentity {
            user_id,
            username: row.username,
            email: row.email,
        });
    }

    let user_id = Uuid::new_v4();
    let now = murmur_db::timestamp(Utc::now());
    db.create_user(&user_id.to_string(), email, username, UNUSABLE_PASSWORD, &now)
        .with_context(|| format!("failed to create assistant user {}", username))?;
    info!("Created assistant user {} ({})", username, user_id);

    Ok(AssistantIdentity {
        user_id,
        username: username.to_string(),
        email: email.to_string(),
    })
}
