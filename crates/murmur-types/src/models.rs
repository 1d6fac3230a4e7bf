use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    Member,
}

impl MemberRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Member => "member",
        }
    }

    /// Unknown tags read back as `Member`; the role is advisory only.
    pub fn parse(s: &str) -> Self {
        match s {
            "owner" => Self::Owner,
            _ => Self::Member,
        }
    }
}

/// A conversation member, decorated with live presence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: Uuid,
    pub username: String,
    pub role: MemberRole,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub is_group: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub participants: Vec<Participant>,
}

/// One row of a user's conversation list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub is_group: bool,
    /// The other participant of a direct conversation.
    pub other: Option<Participant>,
    pub last_message: Option<String>,
    pub last_message_at: DateTime<Utc>,
    pub unread_count: u64,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    File,
}

impl AttachmentKind {
    pub fn from_mime(mime_type: &str) -> Self {
        if mime_type.starts_with("image/") {
            Self::Image
        } else {
            Self::File
        }
    }
}

/// Descriptor of an uploaded blob. The file itself lives in the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub kind: AttachmentKind,
}

impl Attachment {
    pub fn new(url: String, name: String, size: u64, mime_type: String) -> Self {
        let kind = AttachmentKind::from_mime(&mime_type);
        Self {
            url,
            name,
            size,
            mime_type,
            kind,
        }
    }
}

/// A stored message as rendered to clients.
///
/// `seq` is the ledger's insertion sequence; together with `created_at` it
/// defines the canonical order inside a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub sender_username: String,
    pub content: String,
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
    pub seq: i64,
    #[serde(default)]
    pub delivered_to: BTreeSet<Uuid>,
    #[serde(default)]
    pub read_by: BTreeSet<Uuid>,
    #[serde(default)]
    pub reactions: BTreeMap<String, BTreeSet<Uuid>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptKind {
    Delivered,
    Read,
}

impl ReceiptKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_kind_follows_mime() {
        let a = Attachment::new("/uploads/a.png".into(), "a.png".into(), 12, "image/png".into());
        assert_eq!(a.kind, AttachmentKind::Image);

        let b = Attachment::new("/uploads/b.pdf".into(), "b.pdf".into(), 12, "application/pdf".into());
        assert_eq!(b.kind, AttachmentKind::File);
    }

    #[test]
    fn unknown_role_reads_as_member() {
        assert_eq!(MemberRole::parse("owner"), MemberRole::Owner);
        assert_eq!(MemberRole::parse("admin"), MemberRole::Member);
    }
}
