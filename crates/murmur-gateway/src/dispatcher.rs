use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use murmur_types::events::GatewayEvent;

/// A connected gateway session's outbound queue.
struct Session {
    user_id: Uuid,
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

/// Result of registering a session.
pub struct Registration {
    pub session_id: Uuid,
    pub receiver: mpsc::UnboundedReceiver<GatewayEvent>,
    /// True if the user had no other live session.
    pub first_session: bool,
}

/// Result of removing a session.
#[derive(Debug)]
pub struct Departure {
    pub user_id: Uuid,
    /// True if this was the user's last live session.
    pub last_session: bool,
}

/// Registry of connected sessions and the channels they listen on.
///
/// User channels address every session of one user; conversation channels
/// address every session subscribed to one conversation. Delivery is best
/// effort: nothing is kept for sessions that are gone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

// The three maps are never locked at the same time.
struct DispatcherInner {
    /// session_id -> session
    sessions: RwLock<HashMap<Uuid, Session>>,

    /// user_id -> session ids
    users: RwLock<HashMap<Uuid, HashSet<Uuid>>>,

    /// conversation_id -> subscribed session ids
    conversations: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                sessions: RwLock::new(HashMap::new()),
                users: RwLock::new(HashMap::new()),
                conversations: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a new session for `user_id` and return its outbound queue.
    pub async fn register_session(&self, user_id: Uuid) -> Registration {
        let session_id = Uuid::new_v4();
        let (tx, receiver) = mpsc::unbounded_channel();

        self.inner
            .sessions
            .write()
            .await
            .insert(session_id, Session { user_id, tx });

        let first_session = {
            let mut users = self.inner.users.write().await;
            let sessions = users.entry(user_id).or_default();
            sessions.insert(session_id);
            sessions.len() == 1
        };

        debug!("Session {} registered for {}", session_id, user_id);
        Registration {
            session_id,
            receiver,
            first_session,
        }
    }

    /// Remove a session from every channel. Removing twice is a no-op.
    pub async fn unregister_session(&self, session_id: Uuid) -> Option<Departure> {
        let session = self.inner.sessions.write().await.remove(&session_id)?;
        let user_id = session.user_id;

        let last_session = {
            let mut users = self.inner.users.write().await;
            match users.get_mut(&user_id) {
                Some(sessions) => {
                    sessions.remove(&session_id);
                    if sessions.is_empty() {
                        users.remove(&user_id);
                        true
                    } else {
                        false
                    }
                }
                None => true,
            }
        };

        self.inner.conversations.write().await.retain(|_, subscribers| {
            subscribers.remove(&session_id);
            !subscribers.is_empty()
        });

        debug!("Session {} of {} unregistered", session_id, user_id);
        Some(Departure {
            user_id,
            last_session,
        })
    }

    /// Add a session to a conversation channel. The caller must have checked
    /// membership first. Returns false if the session is unknown.
    pub async fn subscribe(&self, session_id: Uuid, conversation_id: Uuid) -> bool {
        if !self.inner.sessions.read().await.contains_key(&session_id) {
            return false;
        }

        self.inner
            .conversations
            .write()
            .await
            .entry(conversation_id)
            .or_default()
            .insert(session_id);

        // The session may have gone away between the two steps.
        if !self.inner.sessions.read().await.contains_key(&session_id) {
            self.unsubscribe(session_id, conversation_id).await;
            return false;
        }
        true
    }

    /// Returns true if the session was subscribed.
    pub async fn unsubscribe(&self, session_id: Uuid, conversation_id: Uuid) -> bool {
        let mut conversations = self.inner.conversations.write().await;
        let Some(subscribers) = conversations.get_mut(&conversation_id) else {
            return false;
        };
        let removed = subscribers.remove(&session_id);
        if subscribers.is_empty() {
            conversations.remove(&conversation_id);
        }
        removed
    }

    pub async fn is_subscribed(&self, session_id: Uuid, conversation_id: Uuid) -> bool {
        self.inner
            .conversations
            .read()
            .await
            .get(&conversation_id)
            .is_some_and(|s| s.contains(&session_id))
    }

    /// Fan an event out to every session subscribed to the conversation.
    /// Events reach each session in publish order. Returns the number of
    /// sessions reached.
    pub async fn publish(&self, conversation_id: Uuid, event: GatewayEvent) -> usize {
        let subscribers: Vec<Uuid> = match self.inner.conversations.read().await.get(&conversation_id) {
            Some(s) => s.iter().copied().collect(),
            None => return 0,
        };
        self.send_to_sessions(&subscribers, event).await
    }

    /// Send an event to every session of a user.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) -> usize {
        let sessions: Vec<Uuid> = match self.inner.users.read().await.get(&user_id) {
            Some(s) => s.iter().copied().collect(),
            None => return 0,
        };
        self.send_to_sessions(&sessions, event).await
    }

    pub async fn send_to_session(&self, session_id: Uuid, event: GatewayEvent) -> bool {
        self.send_to_sessions(&[session_id], event).await == 1
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.users.read().await.contains_key(&user_id)
    }

    /// Users with at least one live session.
    pub async fn online_users(&self) -> Vec<Uuid> {
        self.inner.users.read().await.keys().copied().collect()
    }

    async fn send_to_sessions(&self, session_ids: &[Uuid], event: GatewayEvent) -> usize {
        let sessions = self.inner.sessions.read().await;
        let mut reached = 0;
        for session_id in session_ids {
            if let Some(session) = sessions.get(session_id) {
                if session.tx.send(event.clone()).is_ok() {
                    reached += 1;
                }
            }
        }
        reached
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typing(conversation_id: Uuid, typing: bool) -> GatewayEvent {
        GatewayEvent::TypingChanged {
            conversation_id,
            user_id: Uuid::nil(),
            username: "ana".into(),
            typing,
        }
    }

    #[tokio::test]
    async fn publish_reaches_only_subscribers() {
        let dispatcher = Dispatcher::new();
        let conv = Uuid::new_v4();
        let mut a = dispatcher.register_session(Uuid::new_v4()).await;
        let mut b = dispatcher.register_session(Uuid::new_v4()).await;

        assert!(dispatcher.subscribe(a.session_id, conv).await);
        assert_eq!(dispatcher.publish(conv, typing(conv, true)).await, 1);

        assert!(matches!(a.receiver.try_recv(), Ok(GatewayEvent::TypingChanged { typing: true, .. })));
        assert!(b.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let dispatcher = Dispatcher::new();
        let conv = Uuid::new_v4();
        let mut a = dispatcher.register_session(Uuid::new_v4()).await;
        dispatcher.subscribe(a.session_id, conv).await;

        for i in 0..50 {
            dispatcher.publish(conv, typing(conv, i % 2 == 0)).await;
        }
        for i in 0..50 {
            match a.receiver.try_recv() {
                Ok(GatewayEvent::TypingChanged { typing, .. }) => assert_eq!(typing, i % 2 == 0),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn last_session_marks_departure() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let first = dispatcher.register_session(user).await;
        let second = dispatcher.register_session(user).await;
        assert!(first.first_session);
        assert!(!second.first_session);

        let gone = dispatcher.unregister_session(first.session_id).await.unwrap();
        assert!(!gone.last_session);
        assert!(dispatcher.is_online(user).await);

        let gone = dispatcher.unregister_session(second.session_id).await.unwrap();
        assert!(gone.last_session);
        assert!(!dispatcher.is_online(user).await);

        assert!(dispatcher.unregister_session(second.session_id).await.is_none());
    }

    #[tokio::test]
    async fn unregister_clears_subscriptions() {
        let dispatcher = Dispatcher::new();
        let conv = Uuid::new_v4();
        let a = dispatcher.register_session(Uuid::new_v4()).await;
        dispatcher.subscribe(a.session_id, conv).await;
        dispatcher.unregister_session(a.session_id).await;

        assert!(!dispatcher.is_subscribed(a.session_id, conv).await);
        assert_eq!(dispatcher.publish(conv, typing(conv, true)).await, 0);
        assert!(!dispatcher.subscribe(a.session_id, conv).await);
    }

    #[tokio::test]
    async fn user_channel_reaches_every_session() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let mut a = dispatcher.register_session(user).await;
        let mut b = dispatcher.register_session(user).await;

        let event = GatewayEvent::PresenceChanged {
            user_id: Uuid::new_v4(),
            username: "ben".into(),
            online: true,
            last_seen: None,
        };
        assert_eq!(dispatcher.send_to_user(user, event).await, 2);
        assert!(a.receiver.try_recv().is_ok());
        assert!(b.receiver.try_recv().is_ok());
    }
}
