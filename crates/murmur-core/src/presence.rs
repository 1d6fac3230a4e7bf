use std::sync::Arc;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use murmur_db::Database;
use murmur_types::models::User;

use crate::convert;
use crate::error::ChatResult;

/// Online flag and last-seen per user, stored on the user row.
#[derive(Clone)]
pub struct PresenceTracker {
    db: Arc<Database>,
}

impl PresenceTracker {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Returns the updated user, or `None` if it does not exist.
    pub fn set_online(&self, user_id: Uuid) -> ChatResult<Option<User>> {
        let now = murmur_db::timestamp(Utc::now());
        self.update(user_id, true, &now)
    }

    /// Clears the online flag and stamps last-seen.
    pub fn set_offline(&self, user_id: Uuid) -> ChatResult<Option<User>> {
        let now = murmur_db::timestamp(Utc::now());
        self.update(user_id, false, &now)
    }

    pub fn touch_last_seen(&self, user_id: Uuid) -> ChatResult<()> {
        let now = murmur_db::timestamp(Utc::now());
        self.db.touch_last_seen(&user_id.to_string(), &now)?;
        Ok(())
    }

    pub fn get(&self, user_id: Uuid) -> ChatResult<Option<User>> {
        Ok(self.db.get_user_by_id(&user_id.to_string())?.map(convert::user))
    }

    fn update(&self, user_id: Uuid, online: bool, now: &str) -> ChatResult<Option<User>> {
        let uid = user_id.to_string();
        if !self.db.set_presence(&uid, online, Some(now))? {
            return Ok(None);
        }
        debug!("{} is now {}", user_id, if online { "online" } else { "offline" });
        self.get(user_id)
    }
}
