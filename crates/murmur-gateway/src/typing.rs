use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

/// A typing indicator with no refresh expires after this long.
pub const TYPING_IDLE: Duration = Duration::from_secs(2);

/// Per-session typing deadlines. Owned by the typer's own session, so the
/// automatic stop is produced on the sender side.
#[derive(Default)]
pub struct TypingTracker {
    deadlines: HashMap<Uuid, Instant>,
}

impl TypingTracker {
    /// Arm or refresh the deadline. Returns true if typing just started.
    pub fn start(&mut self, conversation_id: Uuid) -> bool {
        self.deadlines
            .insert(conversation_id, Instant::now() + TYPING_IDLE)
            .is_none()
    }

    /// Returns true if the conversation was marked as typing.
    pub fn stop(&mut self, conversation_id: Uuid) -> bool {
        self.deadlines.remove(&conversation_id).is_some()
    }

    pub fn next_deadline(&self) -> Option<(Uuid, Instant)> {
        self.deadlines
            .iter()
            .min_by_key(|(_, at)| **at)
            .map(|(conv, at)| (*conv, *at))
    }

    pub fn drain(&mut self) -> Vec<Uuid> {
        self.deadlines.drain().map(|(conv, _)| conv).collect()
    }
}

/// Resolves when the given deadline passes; never resolves for `None`.
pub async fn expiry(next: Option<(Uuid, Instant)>) -> Uuid {
    match next {
        Some((conversation_id, at)) => {
            tokio::time::sleep_until(at).await;
            conversation_id
        }
        None => std::future::pending().await,
    }
}
