use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, ReceiptKind};

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Session is authenticated and registered
    #[serde(rename = "ready")]
    Ready {
        user_id: Uuid,
        username: String,
        session_id: Uuid,
    },

    /// A message was stored by the ledger
    #[serde(rename = "message.created")]
    MessageCreated { message: Message },

    /// A participant started or stopped typing
    #[serde(rename = "typing.changed")]
    TypingChanged {
        conversation_id: Uuid,
        user_id: Uuid,
        username: String,
        typing: bool,
    },

    /// A user came online or went offline
    #[serde(rename = "presence.changed")]
    PresenceChanged {
        user_id: Uuid,
        username: String,
        online: bool,
        last_seen: Option<DateTime<Utc>>,
    },

    /// The reaction map of a message changed
    #[serde(rename = "reaction.updated")]
    ReactionUpdated {
        conversation_id: Uuid,
        message_id: Uuid,
        reactions: BTreeMap<String, BTreeSet<Uuid>>,
    },

    /// A participant acknowledged delivery or reading of messages
    #[serde(rename = "receipt.updated")]
    ReceiptUpdated {
        conversation_id: Uuid,
        user_id: Uuid,
        kind: ReceiptKind,
        message_ids: Vec<Uuid>,
    },

    /// A subscribe command was honored
    #[serde(rename = "subscribed")]
    Subscribed { conversation_id: Uuid },

    /// A command was rejected
    #[serde(rename = "error")]
    Error { message: String },
}

impl GatewayEvent {
    /// Returns the conversation this event is scoped to, if any.
    /// Events that return `None` are addressed to user channels.
    pub fn conversation_id(&self) -> Option<Uuid> {
        match self {
            Self::MessageCreated { message } => Some(message.conversation_id),
            Self::TypingChanged { conversation_id, .. } => Some(*conversation_id),
            Self::ReactionUpdated { conversation_id, .. } => Some(*conversation_id),
            Self::ReceiptUpdated { conversation_id, .. } => Some(*conversation_id),
            Self::Subscribed { conversation_id } => Some(*conversation_id),
            _ => None,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Subscribe to conversation channels. Each id is checked against membership.
    Subscribe { conversation_ids: Vec<Uuid> },

    /// Leave conversation channels
    Unsubscribe { conversation_ids: Vec<Uuid> },

    /// Indicate typing in a conversation; expires after the idle window
    StartTyping { conversation_id: Uuid },

    /// Explicit end of typing
    StopTyping { conversation_id: Uuid },
}
