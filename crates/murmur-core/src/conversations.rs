use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use murmur_db::Database;
use murmur_types::models::{Conversation, ConversationSummary, Participant};

use crate::convert;
use crate::error::{ChatResult, ValidationError};

/// Query shaping for conversations and their memberships.
#[derive(Clone)]
pub struct ConversationStore {
    db: Arc<Database>,
}

/// Order-independent key for a user pair.
pub fn direct_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{}:{}", lo, hi)
}

impl ConversationStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Idempotent per unordered pair. Returns (conversation, created).
    pub fn create_direct(&self, caller: Uuid, other: Uuid) -> ChatResult<(Conversation, bool)> {
        if caller == other {
            return Err(ValidationError::SelfConversation.into());
        }
        if self.db.get_user_by_id(&other.to_string())?.is_none() {
            return Err(ValidationError::MissingParticipant.into());
        }

        let now = murmur_db::timestamp(Utc::now());
        let (id, created) = self.db.create_direct_conversation(
            &Uuid::new_v4().to_string(),
            &direct_key(caller, other),
            &caller.to_string(),
            &other.to_string(),
            &now,
        )?;

        if created {
            info!("Direct conversation {} opened between {} and {}", id, caller, other);
        }

        let conversation = self
            .get(convert::id(&id, "conversation id"))?
            .ok_or(crate::ChatError::NotFound("conversation"))?;
        Ok((conversation, created))
    }

    pub fn get(&self, conversation_id: Uuid) -> ChatResult<Option<Conversation>> {
        let cid = conversation_id.to_string();
        let Some(row) = self.db.get_conversation(&cid)? else {
            return Ok(None);
        };

        let participants = self
            .db
            .get_members(&cid)?
            .into_iter()
            .map(convert::participant)
            .collect();

        Ok(Some(Conversation {
            id: conversation_id,
            is_group: row.is_group,
            created_at: convert::time(&row.created_at, "conversation created_at"),
            last_activity: convert::time(&row.last_activity, "conversation last_activity"),
            participants,
        }))
    }

    pub fn exists(&self, conversation_id: Uuid) -> ChatResult<bool> {
        Ok(self.db.get_conversation(&conversation_id.to_string())?.is_some())
    }

    pub fn participants(&self, conversation_id: Uuid) -> ChatResult<Vec<Participant>> {
        Ok(self
            .db
            .get_members(&conversation_id.to_string())?
            .into_iter()
            .map(convert::participant)
            .collect())
    }

    /// The caller's conversations, most recently active first, with the
    /// other participant of direct conversations decorated with presence.
    pub fn list_for(&self, user_id: Uuid) -> ChatResult<Vec<ConversationSummary>> {
        let rows = self.db.list_conversations(&user_id.to_string())?;

        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let mut members: HashMap<String, Vec<Participant>> = HashMap::new();
        for m in self.db.get_members_for_conversations(&ids)? {
            members
                .entry(m.conversation_id.clone())
                .or_default()
                .push(convert::participant(m));
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let participants = members.remove(&row.id).unwrap_or_default();
                let other = if row.is_group {
                    None
                } else {
                    participants.iter().find(|p| p.user_id != user_id).cloned()
                };

                let last_message = match (row.last_content, row.last_attachment_name) {
                    (Some(content), _) if !content.is_empty() => Some(content),
                    (Some(_), Some(name)) => Some(name),
                    _ => None,
                };
                let last_message_at = row
                    .last_message_at
                    .as_deref()
                    .unwrap_or(&row.last_activity)
                    .to_string();

                ConversationSummary {
                    id: convert::id(&row.id, "conversation id"),
                    is_group: row.is_group,
                    other,
                    last_message,
                    last_message_at: convert::time(&last_message_at, "last message time"),
                    unread_count: row.unread_count.max(0) as u64,
                    participants,
                }
            })
            .collect())
    }

    /// Users sharing at least one conversation with `user_id`.
    pub fn peers(&self, user_id: Uuid) -> ChatResult<Vec<Uuid>> {
        Ok(self
            .db
            .get_peer_ids(&user_id.to_string())?
            .iter()
            .map(|raw| convert::id(raw, "peer id"))
            .collect())
    }
}
