use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use murmur_db::Database;

use crate::error::{ChatError, ChatResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Membership is the only authorization gate for a conversation.
#[derive(Clone)]
pub struct MembershipGuard {
    db: Arc<Database>,
}

impl MembershipGuard {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Any member may read and write, so both access kinds run the same check.
    pub fn authorize(&self, user_id: Uuid, conversation_id: Uuid, access: Access) -> ChatResult<()> {
        if self
            .db
            .is_member(&user_id.to_string(), &conversation_id.to_string())?
        {
            return Ok(());
        }

        debug!("{:?} access to {} denied for {}", access, conversation_id, user_id);
        Err(ChatError::Forbidden)
    }
}
