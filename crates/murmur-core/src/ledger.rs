use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use murmur_db::Database;
use murmur_db::models::{MessageRow, NewMessage};
use murmur_types::models::{Attachment, Message, ReceiptKind};

use crate::convert::MessageState;
use crate::error::{ChatError, ChatResult, ValidationError};
use crate::guard::{Access, MembershipGuard};

/// Append-only message record. The only writer of messages.
#[derive(Clone)]
pub struct Ledger {
    db: Arc<Database>,
    guard: MembershipGuard,
}

impl Ledger {
    pub fn new(db: Arc<Database>) -> Self {
        let guard = MembershipGuard::new(db.clone());
        Self { db, guard }
    }

    pub fn guard(&self) -> &MembershipGuard {
        &self.guard
    }

    /// Validate, persist and return the canonical stored message.
    ///
    /// The stored order is strictly after every message already in the
    /// conversation.
    pub fn append(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
        attachment: Option<Attachment>,
    ) -> ChatResult<Message> {
        if content.is_empty() && attachment.is_none() {
            return Err(ValidationError::EmptyMessage.into());
        }

        let cid = conversation_id.to_string();
        if self.db.get_conversation(&cid)?.is_none() {
            return Err(ChatError::NotFound("conversation"));
        }
        self.guard.authorize(sender_id, conversation_id, Access::Write)?;

        let id = Uuid::new_v4().to_string();
        let sid = sender_id.to_string();
        let now = murmur_db::timestamp(Utc::now());
        let attachment_size = attachment.as_ref().map(|a| a.size.min(i64::MAX as u64) as i64);

        let row = self
            .db
            .insert_message(&NewMessage {
                id: &id,
                conversation_id: &cid,
                sender_id: &sid,
                content,
                attachment_url: attachment.as_ref().map(|a| a.url.as_str()),
                attachment_name: attachment.as_ref().map(|a| a.name.as_str()),
                attachment_size,
                attachment_mime: attachment.as_ref().map(|a| a.mime_type.as_str()),
                now: &now,
            })?
            // Conversation removed between the check and the insert
            .ok_or(ChatError::NotFound("conversation"))?;

        debug!("Message {} appended to {} (seq {})", id, cid, row.seq);
        Ok(MessageState::default().message(row))
    }

    pub fn get(&self, message_id: Uuid) -> ChatResult<Message> {
        let row = self
            .db
            .get_message(&message_id.to_string())?
            .ok_or(ChatError::NotFound("message"))?;
        Ok(self.hydrate(vec![row])?.remove(0))
    }

    /// Up to `limit` messages, oldest-first. With `before`, only messages
    /// ordered strictly before that message are returned; the cursor message
    /// itself is excluded by identity.
    pub fn history(
        &self,
        conversation_id: Uuid,
        limit: u32,
        before: Option<Uuid>,
    ) -> ChatResult<Vec<Message>> {
        let cid = conversation_id.to_string();
        if self.db.get_conversation(&cid)?.is_none() {
            return Err(ChatError::NotFound("conversation"));
        }

        let cursor = match before {
            Some(message_id) => {
                let row = self
                    .db
                    .get_message(&message_id.to_string())?
                    .filter(|row| row.conversation_id == cid)
                    .ok_or(ChatError::NotFound("message"))?;
                Some((row.created_at, row.seq))
            }
            None => None,
        };

        let rows = self.db.get_messages(
            &cid,
            limit,
            cursor.as_ref().map(|(at, seq)| (at.as_str(), *seq)),
        )?;
        self.hydrate(rows)
    }

    /// Toggle `user_id` in the set for `emoji`; an emptied set disappears.
    pub fn react(&self, message_id: Uuid, user_id: Uuid, emoji: &str) -> ChatResult<Message> {
        let emoji = emoji.trim();
        if emoji.is_empty() {
            return Err(ValidationError::EmptyEmoji.into());
        }

        let mid = message_id.to_string();
        let row = self
            .db
            .get_message(&mid)?
            .ok_or(ChatError::NotFound("message"))?;
        let conversation_id = crate::convert::id(&row.conversation_id, "message conversation_id");
        self.guard.authorize(user_id, conversation_id, Access::Write)?;

        let added = self.db.toggle_reaction(&mid, &user_id.to_string(), emoji)?;
        debug!(
            "Reaction {} {} on {} by {}",
            emoji,
            if added { "added" } else { "removed" },
            mid,
            user_id
        );

        Ok(self.hydrate(vec![row])?.remove(0))
    }

    /// Explicit delivered/read acknowledgement. Adds the caller to the
    /// respective set of every listed message; `Read` also advances the
    /// caller's last-read marker. Returns the acknowledged ids.
    pub fn acknowledge(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        message_ids: &[Uuid],
        kind: ReceiptKind,
    ) -> ChatResult<Vec<Uuid>> {
        self.guard.authorize(user_id, conversation_id, Access::Read)?;

        let mut wanted: Vec<String> = message_ids.iter().map(Uuid::to_string).collect();
        wanted.sort();
        wanted.dedup();

        let found = self
            .db
            .filter_message_ids(&conversation_id.to_string(), &wanted)?;
        if found.len() != wanted.len() {
            return Err(ValidationError::ForeignMessage.into());
        }

        let uid = user_id.to_string();
        let added = self.db.add_receipts(&wanted, &uid, kind.as_str())?;

        if kind == ReceiptKind::Read {
            if let Some(max_seq) = found.iter().map(|(_, seq)| *seq).max() {
                self.db
                    .advance_read_marker(&uid, &conversation_id.to_string(), max_seq)?;
            }
        }

        info!(
            "{} marked {} message(s) {} in {} ({} new)",
            user_id,
            wanted.len(),
            kind.as_str(),
            conversation_id,
            added
        );

        Ok(wanted
            .iter()
            .map(|raw| crate::convert::id(raw, "message id"))
            .collect())
    }

    fn hydrate(&self, rows: Vec<MessageRow>) -> ChatResult<Vec<Message>> {
        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let reactions = self.db.get_reactions_for_messages(&ids)?;
        let receipts = self.db.get_receipts_for_messages(&ids)?;
        let mut state = MessageState::new(reactions, receipts);
        Ok(rows.into_iter().map(|row| state.message(row)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversations::ConversationStore;
    use crate::testutil;

    struct Fixture {
        ledger: Ledger,
        conversation: Uuid,
        ana: Uuid,
        ben: Uuid,
        cy: Uuid,
    }

    fn fixture() -> Fixture {
        let db = testutil::db();
        let ana = testutil::user(&db, "ana");
        let ben = testutil::user(&db, "ben");
        let cy = testutil::user(&db, "cy");
        let (conversation, _) = ConversationStore::new(db.clone()).create_direct(ana, ben).unwrap();
        Fixture {
            ledger: Ledger::new(db),
            conversation: conversation.id,
            ana,
            ben,
            cy,
        }
    }

    #[test]
    fn append_orders_after_previous_messages() {
        let f = fixture();
        let mut last_seq = 0;
        let mut last_at = chrono::DateTime::<Utc>::default();
        for i in 0..20 {
            let sender = if i % 2 == 0 { f.ana } else { f.ben };
            let msg = f.ledger.append(f.conversation, sender, &format!("m{i}"), None).unwrap();
            assert!(msg.seq > last_seq);
            assert!(msg.created_at >= last_at);
            last_seq = msg.seq;
            last_at = msg.created_at;
        }

        let history = f.ledger.history(f.conversation, 50, None).unwrap();
        assert_eq!(history.len(), 20);
        assert_eq!(history[0].content, "m0");
        assert_eq!(history[19].content, "m19");
        assert_eq!(history[1].sender_username, "ben");
    }

    #[test]
    fn empty_message_is_rejected() {
        let f = fixture();
        assert!(matches!(
            f.ledger.append(f.conversation, f.ana, "", None),
            Err(ChatError::Validation(ValidationError::EmptyMessage))
        ));
    }

    #[test]
    fn whitespace_is_content() {
        let f = fixture();
        let msg = f.ledger.append(f.conversation, f.ana, "  ", None).unwrap();
        assert_eq!(msg.content, "  ");
        assert_eq!(f.ledger.history(f.conversation, 10, None).unwrap().len(), 1);
    }

    #[test]
    fn attachment_alone_is_enough() {
        let f = fixture();
        let attachment = Attachment::new(
            "/uploads/x.png".into(),
            "x.png".into(),
            42,
            "image/png".into(),
        );
        let msg = f
            .ledger
            .append(f.conversation, f.ana, "", Some(attachment.clone()))
            .unwrap();
        assert_eq!(msg.content, "");
        assert_eq!(msg.attachment, Some(attachment));
    }

    #[test]
    fn non_members_cannot_append() {
        let f = fixture();
        assert!(matches!(
            f.ledger.append(f.conversation, f.cy, "hi", None),
            Err(ChatError::Forbidden)
        ));
        assert!(matches!(
            f.ledger.append(Uuid::new_v4(), f.ana, "hi", None),
            Err(ChatError::NotFound("conversation"))
        ));
    }

    #[test]
    fn history_before_excludes_the_cursor() {
        let f = fixture();
        let m1 = f.ledger.append(f.conversation, f.ana, "one", None).unwrap();
        let m2 = f.ledger.append(f.conversation, f.ben, "two", None).unwrap();
        let m3 = f.ledger.append(f.conversation, f.ana, "three", None).unwrap();

        let context = f.ledger.history(f.conversation, 10, Some(m3.id)).unwrap();
        let ids: Vec<_> = context.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![m1.id, m2.id]);

        let limited = f.ledger.history(f.conversation, 1, Some(m3.id)).unwrap();
        assert_eq!(limited[0].id, m2.id);
    }

    #[test]
    fn react_toggles() {
        let f = fixture();
        let msg = f.ledger.append(f.conversation, f.ana, "hi", None).unwrap();

        let once = f.ledger.react(msg.id, f.ben, "👍").unwrap();
        assert!(once.reactions["👍"].contains(&f.ben));

        let other = f.ledger.react(msg.id, f.ana, "👍").unwrap();
        assert_eq!(other.reactions["👍"].len(), 2);

        f.ledger.react(msg.id, f.ana, "👍").unwrap();
        let twice = f.ledger.react(msg.id, f.ben, "👍").unwrap();
        assert!(!twice.reactions.contains_key("👍"));

        assert!(matches!(f.ledger.react(msg.id, f.cy, "👍"), Err(ChatError::Forbidden)));
        assert!(matches!(
            f.ledger.react(msg.id, f.ben, " "),
            Err(ChatError::Validation(ValidationError::EmptyEmoji))
        ));
    }

    #[test]
    fn read_receipts_fill_sets() {
        let f = fixture();
        let m1 = f.ledger.append(f.conversation, f.ana, "one", None).unwrap();
        let m2 = f.ledger.append(f.conversation, f.ana, "two", None).unwrap();

        let acked = f
            .ledger
            .acknowledge(f.conversation, f.ben, &[m1.id, m2.id, m1.id], ReceiptKind::Read)
            .unwrap();
        assert_eq!(acked.len(), 2);

        let reloaded = f.ledger.get(m2.id).unwrap();
        assert!(reloaded.read_by.contains(&f.ben));
        assert!(reloaded.delivered_to.is_empty());
    }

    #[test]
    fn receipts_reject_foreign_messages() {
        let f = fixture();
        let result = f
            .ledger
            .acknowledge(f.conversation, f.ben, &[Uuid::new_v4()], ReceiptKind::Delivered);
        assert!(matches!(
            result,
            Err(ChatError::Validation(ValidationError::ForeignMessage))
        ));
    }
}
