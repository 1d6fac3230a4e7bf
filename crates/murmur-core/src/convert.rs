//! Row -> model conversions. Corrupt ids and timestamps are logged and
//! defaulted rather than failing a whole page of results.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use murmur_db::models::{MemberRow, MessageRow, ReactionRow, ReceiptRow, UserRow};
use murmur_types::models::{Attachment, MemberRole, Message, Participant, User};

pub fn id(raw: &str, what: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", what, raw, e);
        Uuid::default()
    })
}

pub fn time(raw: &str, what: &str) -> DateTime<Utc> {
    murmur_db::parse_timestamp(raw).unwrap_or_else(|| {
        warn!("Corrupt {} '{}'", what, raw);
        DateTime::default()
    })
}

pub fn user(row: UserRow) -> User {
    User {
        id: id(&row.id, "user id"),
        username: row.username,
        online: row.online,
        last_seen: row.last_seen.as_deref().and_then(murmur_db::parse_timestamp),
        created_at: time(&row.created_at, "user created_at"),
    }
}

pub fn participant(row: MemberRow) -> Participant {
    Participant {
        user_id: id(&row.user_id, "member user_id"),
        username: row.username,
        role: MemberRole::parse(&row.role),
        online: row.online,
        last_seen: row.last_seen.as_deref().and_then(murmur_db::parse_timestamp),
    }
}

/// Reactions and receipts grouped per message id.
#[derive(Default)]
pub struct MessageState {
    reactions: HashMap<String, BTreeMap<String, BTreeSet<Uuid>>>,
    delivered: HashMap<String, BTreeSet<Uuid>>,
    read: HashMap<String, BTreeSet<Uuid>>,
}

impl MessageState {
    pub fn new(reactions: Vec<ReactionRow>, receipts: Vec<ReceiptRow>) -> Self {
        let mut state = Self::default();
        for r in reactions {
            state
                .reactions
                .entry(r.message_id)
                .or_default()
                .entry(r.emoji)
                .or_default()
                .insert(id(&r.user_id, "reaction user_id"));
        }
        for r in receipts {
            let target = match r.kind.as_str() {
                "delivered" => &mut state.delivered,
                "read" => &mut state.read,
                other => {
                    warn!("Unknown receipt kind '{}' on message '{}'", other, r.message_id);
                    continue;
                }
            };
            target
                .entry(r.message_id)
                .or_default()
                .insert(id(&r.user_id, "receipt user_id"));
        }
        state
    }

    pub fn message(&mut self, row: MessageRow) -> Message {
        let attachment = match (row.attachment_url, row.attachment_name) {
            (Some(url), Some(name)) => Some(Attachment::new(
                url,
                name,
                row.attachment_size.unwrap_or(0).max(0) as u64,
                row.attachment_mime.unwrap_or_else(|| "application/octet-stream".into()),
            )),
            _ => None,
        };

        Message {
            id: id(&row.id, "message id"),
            conversation_id: id(&row.conversation_id, "message conversation_id"),
            sender_id: id(&row.sender_id, "message sender_id"),
            sender_username: row.sender_username,
            content: row.content,
            attachment,
            created_at: time(&row.created_at, "message created_at"),
            seq: row.seq,
            delivered_to: self.delivered.remove(&row.id).unwrap_or_default(),
            read_by: self.read.remove(&row.id).unwrap_or_default(),
            reactions: self.reactions.remove(&row.id).unwrap_or_default(),
        }
    }
}
