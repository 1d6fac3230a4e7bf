use serde::{Deserialize, Serialize};
use uuid::Uuid;

use murmur_types::models::Message;

/// Stands in for the text of an attachment-only message.
pub const ATTACHMENT_PLACEHOLDER: &str = "Shared a file";

/// Stored instead of an empty generation.
pub const FALLBACK_REPLY: &str = "I'm speechless.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged entry of the context window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextTurn {
    pub role: Role,
    pub content: String,
}

/// The text the generator sees for a message.
pub fn prompt_for(message: &Message) -> &str {
    if message.content.trim().is_empty() && message.attachment.is_some() {
        ATTACHMENT_PLACEHOLDER
    } else {
        &message.content
    }
}

/// Tag `history` (oldest-first, trigger already excluded) by sender.
pub fn build_context(history: &[Message], assistant_id: Uuid) -> Vec<ContextTurn> {
    history
        .iter()
        .map(|message| ContextTurn {
            role: if message.sender_id == assistant_id {
                Role::Assistant
            } else {
                Role::User
            },
            content: prompt_for(message).to_string(),
        })
        .collect()
}

/// The reply to store for a generation result.
pub fn reply_text(generated: String) -> String {
    if generated.trim().is_empty() {
        FALLBACK_REPLY.to_string()
    } else {
        generated
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use chrono::Utc;
    use murmur_types::models::Attachment;

    use super::*;

    fn message(sender_id: Uuid, content: &str, attachment: Option<Attachment>) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::nil(),
            sender_id,
            sender_username: "someone".into(),
            content: content.into(),
            attachment,
            created_at: Utc::now(),
            seq: 1,
            delivered_to: BTreeSet::new(),
            read_by: BTreeSet::new(),
            reactions: BTreeMap::new(),
        }
    }

    #[test]
    fn roles_follow_the_assistant_identity() {
        let (human, bot) = (Uuid::new_v4(), Uuid::new_v4());
        let history = vec![message(human, "hello", None), message(bot, "hi there", None)];

        let context = build_context(&history, bot);
        assert_eq!(
            context,
            vec![
                ContextTurn { role: Role::User, content: "hello".into() },
                ContextTurn { role: Role::Assistant, content: "hi there".into() },
            ]
        );
    }

    #[test]
    fn attachment_only_messages_use_the_placeholder() {
        let attachment = Attachment::new("/uploads/a.pdf".into(), "a.pdf".into(), 3, "application/pdf".into());
        let shared = message(Uuid::new_v4(), "", Some(attachment));
        assert_eq!(prompt_for(&shared), ATTACHMENT_PLACEHOLDER);

        let captioned = message(Uuid::new_v4(), "see this", shared.attachment.clone());
        assert_eq!(prompt_for(&captioned), "see this");
    }

    #[test]
    fn blank_generations_fall_back() {
        assert_eq!(reply_text("  \n".into()), FALLBACK_REPLY);
        assert_eq!(reply_text("Sure!".into()), "Sure!");
    }

    #[test]
    fn roles_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
    }
}
