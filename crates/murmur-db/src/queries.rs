use crate::models::{
    ConversationListRow, ConversationRow, MemberRow, MessageRow, NewMessage, ReactionRow,
    ReceiptRow, UserRow,
};
use crate::Database;
use anyhow::Result;
use rusqlite::{Connection, Row};

const USER_COLUMNS: &str = "id, email, username, password, online, last_seen, created_at";

const MESSAGE_COLUMNS: &str = "m.seq, m.id, m.conversation_id, m.sender_id, u.username, m.content,
     m.attachment_url, m.attachment_name, m.attachment_size, m.attachment_mime, m.created_at";

const MEMBER_COLUMNS: &str =
    "ms.conversation_id, ms.user_id, u.username, ms.role, u.online, u.last_seen, ms.last_read_seq";

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        id: &str,
        email: &str,
        username: &str,
        password_hash: &str,
        now: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, email, username, password, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                (id, email, username, password_hash, now),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "email", email))
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    /// Case-insensitive substring match on username, excluding one user.
    pub fn search_users(&self, query: &str, exclude_id: &str, limit: u32) -> Result<Vec<UserRow>> {
        let pattern = format!("%{}%", escape_like(query));
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users
                 WHERE username LIKE ?1 ESCAPE '\\' AND id != ?2
                 ORDER BY username
                 LIMIT ?3"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![pattern, exclude_id, limit], map_user)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Returns false if the user does not exist.
    pub fn set_presence(&self, id: &str, online: bool, last_seen: Option<&str>) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE users SET online = ?2, last_seen = COALESCE(?3, last_seen) WHERE id = ?1",
                rusqlite::params![id, online, last_seen],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn touch_last_seen(&self, id: &str, now: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE users SET last_seen = ?2 WHERE id = ?1",
                (id, now),
            )?;
            Ok(changed > 0)
        })
    }

    // -- Conversations --

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, is_group, created_at, last_activity FROM conversations WHERE id = ?1",
                [id],
                map_conversation,
            )
            .optional()
        })
    }

    /// Find-or-create the direct conversation keyed by `direct_key`.
    /// Returns (conversation_id, created).
    pub fn create_direct_conversation(
        &self,
        id: &str,
        direct_key: &str,
        owner_id: &str,
        member_id: &str,
        now: &str,
    ) -> Result<(String, bool)> {
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;

            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM conversations WHERE direct_key = ?1",
                    [direct_key],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(existing_id) = existing {
                return Ok((existing_id, false));
            }

            tx.execute(
                "INSERT INTO conversations (id, is_group, direct_key, created_by, created_at, last_activity)
                 VALUES (?1, 0, ?2, ?3, ?4, ?4)",
                (id, direct_key, owner_id, now),
            )?;
            tx.execute(
                "INSERT INTO memberships (user_id, conversation_id, role, joined_at) VALUES (?1, ?2, 'owner', ?3)",
                (owner_id, id, now),
            )?;
            tx.execute(
                "INSERT INTO memberships (user_id, conversation_id, role, joined_at) VALUES (?1, ?2, 'member', ?3)",
                (member_id, id, now),
            )?;
            tx.commit()?;

            Ok((id.to_string(), true))
        })
    }

    pub fn get_members(&self, conversation_id: &str) -> Result<Vec<MemberRow>> {
        self.get_members_for_conversations(&[conversation_id.to_string()])
    }

    /// Batch-fetch memberships (with user presence) for a set of conversations.
    pub fn get_members_for_conversations(&self, conversation_ids: &[String]) -> Result<Vec<MemberRow>> {
        if conversation_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {MEMBER_COLUMNS}
                 FROM memberships ms
                 JOIN users u ON u.id = ms.user_id
                 WHERE ms.conversation_id IN ({})
                 ORDER BY ms.joined_at, ms.role DESC",
                placeholders(conversation_ids.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(conversation_ids.iter()), map_member)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn is_member(&self, user_id: &str, conversation_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM memberships WHERE user_id = ?1 AND conversation_id = ?2",
                    (user_id, conversation_id),
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Conversations of one user, most recently active first.
    ///
    /// Unread = messages from others after the member's last-read marker.
    pub fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationListRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.is_group, c.created_at, c.last_activity,
                        lm.content, lm.attachment_name, lm.created_at,
                        (SELECT COUNT(*) FROM messages x
                          WHERE x.conversation_id = c.id
                            AND x.sender_id != ?1
                            AND x.seq > ms.last_read_seq)
                 FROM memberships ms
                 JOIN conversations c ON c.id = ms.conversation_id
                 LEFT JOIN messages lm ON lm.seq = (
                     SELECT seq FROM messages
                      WHERE conversation_id = c.id
                      ORDER BY created_at DESC, seq DESC
                      LIMIT 1)
                 WHERE ms.user_id = ?1
                 ORDER BY c.last_activity DESC",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(ConversationListRow {
                        id: row.get(0)?,
                        is_group: row.get(1)?,
                        created_at: row.get(2)?,
                        last_activity: row.get(3)?,
                        last_content: row.get(4)?,
                        last_attachment_name: row.get(5)?,
                        last_message_at: row.get(6)?,
                        unread_count: row.get(7)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Distinct users sharing at least one conversation with `user_id`.
    pub fn get_peer_ids(&self, user_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT other.user_id
                 FROM memberships mine
                 JOIN memberships other ON other.conversation_id = mine.conversation_id
                 WHERE mine.user_id = ?1 AND other.user_id != ?1",
            )?;
            let ids = stmt
                .query_map([user_id], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    /// Moves the member's last-read marker forward; never backwards.
    pub fn advance_read_marker(&self, user_id: &str, conversation_id: &str, seq: i64) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE memberships SET last_read_seq = MAX(last_read_seq, ?3)
                 WHERE user_id = ?1 AND conversation_id = ?2",
                rusqlite::params![user_id, conversation_id, seq],
            )?;
            Ok(())
        })
    }

    // -- Messages --

    /// Append a message and bump the conversation's last activity in one
    /// transaction. Returns `None` if the conversation no longer exists.
    ///
    /// The stored `created_at` is never earlier than the conversation's last
    /// activity, which keeps per-conversation timestamps monotonic.
    pub fn insert_message(&self, msg: &NewMessage<'_>) -> Result<Option<MessageRow>> {
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;

            let last_activity: Option<String> = tx
                .query_row(
                    "SELECT last_activity FROM conversations WHERE id = ?1",
                    [msg.conversation_id],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(last_activity) = last_activity else {
                return Ok(None);
            };

            let created_at = if msg.now >= last_activity.as_str() {
                msg.now.to_string()
            } else {
                last_activity
            };

            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, content,
                     attachment_url, attachment_name, attachment_size, attachment_mime, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    msg.id,
                    msg.conversation_id,
                    msg.sender_id,
                    msg.content,
                    msg.attachment_url,
                    msg.attachment_name,
                    msg.attachment_size,
                    msg.attachment_mime,
                    created_at,
                ],
            )?;
            let seq = tx.last_insert_rowid();

            tx.execute(
                "UPDATE conversations SET last_activity = MAX(last_activity, ?2) WHERE id = ?1",
                (msg.conversation_id, &created_at),
            )?;

            let row = tx.query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages m
                     LEFT JOIN users u ON m.sender_id = u.id
                     WHERE m.seq = ?1"
                ),
                [seq],
                map_message,
            )?;

            tx.commit()?;
            Ok(Some(row))
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages m
                     LEFT JOIN users u ON m.sender_id = u.id
                     WHERE m.id = ?1"
                ),
                [id],
                map_message,
            )
            .optional()
        })
    }

    /// The newest `limit` messages strictly before the `before` cursor
    /// (created_at, seq), returned oldest-first.
    pub fn get_messages(
        &self,
        conversation_id: &str,
        limit: u32,
        before: Option<(&str, i64)>,
    ) -> Result<Vec<MessageRow>> {
        let (before_at, before_seq) = before.unzip();
        self.with_conn(|conn| {
            // JOIN users to fetch sender username in a single query
            let mut stmt = conn.prepare(&format!(
                "SELECT * FROM (
                     SELECT {MESSAGE_COLUMNS}
                     FROM messages m
                     LEFT JOIN users u ON m.sender_id = u.id
                     WHERE m.conversation_id = ?1
                       AND (?3 IS NULL OR m.created_at < ?3 OR (m.created_at = ?3 AND m.seq < ?4))
                     ORDER BY m.created_at DESC, m.seq DESC
                     LIMIT ?2
                 ) ORDER BY created_at ASC, seq ASC"
            ))?;

            let rows = stmt
                .query_map(
                    rusqlite::params![conversation_id, limit, before_at, before_seq],
                    map_message,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Of the given ids, the (id, seq) pairs that belong to `conversation_id`.
    pub fn filter_message_ids(
        &self,
        conversation_id: &str,
        message_ids: &[String],
    ) -> Result<Vec<(String, i64)>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT id, seq FROM messages WHERE conversation_id = ? AND id IN ({})",
                placeholders(message_ids.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let params = std::iter::once(conversation_id).chain(message_ids.iter().map(String::as_str));
            let rows = stmt
                .query_map(rusqlite::params_from_iter(params), |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Reactions --

    /// Toggle a reaction: removes if it exists, inserts if not.
    /// Returns true if the reaction was added.
    pub fn toggle_reaction(&self, message_id: &str, user_id: &str, emoji: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let removed = conn.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                (message_id, user_id, emoji),
            )?;

            if removed > 0 {
                return Ok(false);
            }

            conn.execute(
                "INSERT INTO reactions (message_id, user_id, emoji) VALUES (?1, ?2, ?3)",
                (message_id, user_id, emoji),
            )?;
            Ok(true)
        })
    }

    /// Batch-fetch reactions for a set of message IDs.
    pub fn get_reactions_for_messages(&self, message_ids: &[String]) -> Result<Vec<ReactionRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT message_id, user_id, emoji FROM reactions WHERE message_id IN ({})
                 ORDER BY created_at",
                placeholders(message_ids.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(message_ids.iter()), |row| {
                    Ok(ReactionRow {
                        message_id: row.get(0)?,
                        user_id: row.get(1)?,
                        emoji: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Receipts --

    /// Record delivered/read acknowledgements. Returns how many were new.
    pub fn add_receipts(&self, message_ids: &[String], user_id: &str, kind: &str) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut added = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO receipts (message_id, user_id, kind) VALUES (?1, ?2, ?3)",
                )?;
                for message_id in message_ids {
                    added += stmt.execute((message_id, user_id, kind))?;
                }
            }
            tx.commit()?;
            Ok(added)
        })
    }

    pub fn get_receipts_for_messages(&self, message_ids: &[String]) -> Result<Vec<ReceiptRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT message_id, user_id, kind FROM receipts WHERE message_id IN ({})",
                placeholders(message_ids.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(message_ids.iter()), |row| {
                    Ok(ReceiptRow {
                        message_id: row.get(0)?,
                        user_id: row.get(1)?,
                        kind: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = ?1"))?;
    stmt.query_row([value], map_user).optional()
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        email: row.get(1)?,
        username: row.get(2)?,
        password: row.get(3)?,
        online: row.get(4)?,
        last_seen: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn map_conversation(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        is_group: row.get(1)?,
        created_at: row.get(2)?,
        last_activity: row.get(3)?,
    })
}

fn map_member(row: &Row<'_>) -> rusqlite::Result<MemberRow> {
    Ok(MemberRow {
        conversation_id: row.get(0)?,
        user_id: row.get(1)?,
        username: row.get(2)?,
        role: row.get(3)?,
        online: row.get(4)?,
        last_seen: row.get(5)?,
        last_read_seq: row.get(6)?,
    })
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        seq: row.get(0)?,
        id: row.get(1)?,
        conversation_id: row.get(2)?,
        sender_id: row.get(3)?,
        sender_username: row.get::<_, Option<String>>(4)?.unwrap_or_else(|| "unknown".to_string()),
        content: row.get(5)?,
        attachment_url: row.get(6)?,
        attachment_name: row.get(7)?,
        attachment_size: row.get(8)?,
        attachment_mime: row.get(9)?,
        created_at: row.get(10)?,
    })
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
