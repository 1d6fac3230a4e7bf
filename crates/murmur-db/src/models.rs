/// Database row types. These map directly to SQLite rows and are kept
/// distinct from murmur-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub email: String,
    pub username: String,
    pub password: String,
    pub online: bool,
    pub last_seen: Option<String>,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: String,
    pub is_group: bool,
    pub created_at: String,
    pub last_activity: String,
}

pub struct MemberRow {
    pub conversation_id: String,
    pub user_id: String,
    pub username: String,
    pub role: String,
    pub online: bool,
    pub last_seen: Option<String>,
    pub last_read_seq: i64,
}

/// A conversation as seen from one member's list, with last message preview
/// and unread count computed in the query.
pub struct ConversationListRow {
    pub id: String,
    pub is_group: bool,
    pub created_at: String,
    pub last_activity: String,
    pub last_content: Option<String>,
    pub last_attachment_name: Option<String>,
    pub last_message_at: Option<String>,
    pub unread_count: i64,
}

pub struct MessageRow {
    pub seq: i64,
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub content: String,
    pub attachment_url: Option<String>,
    pub attachment_name: Option<String>,
    pub attachment_size: Option<i64>,
    pub attachment_mime: Option<String>,
    pub created_at: String,
}

/// Insert payload for the messages table.
pub struct NewMessage<'a> {
    pub id: &'a str,
    pub conversation_id: &'a str,
    pub sender_id: &'a str,
    pub content: &'a str,
    pub attachment_url: Option<&'a str>,
    pub attachment_name: Option<&'a str>,
    pub attachment_size: Option<i64>,
    pub attachment_mime: Option<&'a str>,
    pub now: &'a str,
}

pub struct ReactionRow {
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
}

pub struct ReceiptRow {
    pub message_id: String,
    pub user_id: String,
    pub kind: String,
}
