use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use murmur_core::{
    Access, ChatError, ConversationStore, Identity, MembershipGuard, PresenceTracker, TokenIssuer,
    run_blocking,
};
use murmur_types::events::{GatewayCommand, GatewayEvent};
use murmur_types::models::User;

use crate::dispatcher::Dispatcher;
use crate::turns::Turns;
use crate::typing::{self, TypingTracker};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Unauthenticated sockets must identify within this window.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a gateway session needs besides its socket.
#[derive(Clone)]
pub struct Gateway {
    pub dispatcher: Dispatcher,
    pub issuer: TokenIssuer,
    pub guard: MembershipGuard,
    pub presence: PresenceTracker,
    pub conversations: ConversationStore,
    /// Presence writes for one user happen one at a time.
    presence_turns: Turns,
}

impl Gateway {
    pub fn new(
        dispatcher: Dispatcher,
        issuer: TokenIssuer,
        guard: MembershipGuard,
        presence: PresenceTracker,
        conversations: ConversationStore,
    ) -> Self {
        Self {
            dispatcher,
            issuer,
            guard,
            presence,
            conversations,
            presence_turns: Turns::default(),
        }
    }

    /// Tell the user's own sessions and everyone sharing a conversation
    /// with them about a presence change.
    pub async fn announce_presence(&self, user: &User) {
        let conversations = self.conversations.clone();
        let user_id = user.id;
        let peers = match run_blocking(move || conversations.peers(user_id)).await {
            Ok(peers) => peers,
            Err(e) => {
                warn!("Presence fan-out for {} failed: {}", user_id, e);
                return;
            }
        };

        let event = GatewayEvent::PresenceChanged {
            user_id,
            username: user.username.clone(),
            online: user.online,
            last_seen: user.last_seen,
        };
        for target in peers.into_iter().chain(std::iter::once(user_id)) {
            self.dispatcher.send_to_user(target, event.clone()).await;
        }
    }
}

/// Handle a pre-authenticated WebSocket connection.
/// The token was already verified at the HTTP upgrade layer, so we skip
/// the Identify handshake and go straight to Ready + event loop.
pub async fn handle_connection_authenticated(socket: WebSocket, gateway: Gateway, identity: Identity) {
    let (sender, receiver) = socket.split();

    info!("{} ({}) connected to gateway (pre-authenticated)", identity.username, identity.user_id);

    run_connection_loop(sender, receiver, gateway, identity).await;
}

/// Handle a WebSocket connection that authenticates with an Identify command.
pub async fn handle_connection(socket: WebSocket, gateway: Gateway) {
    let (sender, mut receiver) = socket.split();

    let identity = match wait_for_identify(&mut receiver, &gateway.issuer).await {
        Some(identity) => identity,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    info!("{} ({}) connected to gateway", identity.username, identity.user_id);

    run_connection_loop(sender, receiver, gateway, identity).await;
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    gateway: Gateway,
    identity: Identity,
) {
    let user_id = identity.user_id;
    let registration = gateway.dispatcher.register_session(user_id).await;
    let session_id = registration.session_id;
    let mut session_rx = registration.receiver;

    gateway
        .dispatcher
        .send_to_session(
            session_id,
            GatewayEvent::Ready {
                user_id,
                username: identity.username.clone(),
                session_id,
            },
        )
        .await;

    // Peers already online, so the client starts with a correct picture
    send_online_peers(&gateway, session_id, user_id).await;

    if registration.first_session {
        mark_presence(&gateway, user_id, true).await;
    }

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward this session's queue -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = session_rx.recv() => {
                    let Some(event) = event else { break };
                    let Some(frame) = encode(&event) else { continue };
                    if sender.send(frame).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Outlives both tasks so either exit path can close open indicators
    let typing = Arc::new(Mutex::new(TypingTracker::default()));

    // Read commands from client; expire idle typing indicators
    let recv_gateway = gateway.clone();
    let recv_identity = identity.clone();
    let recv_typing = typing.clone();
    let mut recv_task = tokio::spawn(async move {
        loop {
            let next_expiry = recv_typing.lock().await.next_deadline();
            tokio::select! {
                frame = receiver.next() => {
                    let Some(Ok(frame)) = frame else { break };
                    match frame {
                        Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                            Ok(cmd) => {
                                let mut typing = recv_typing.lock().await;
                                handle_command(&recv_gateway, session_id, &recv_identity, cmd, &mut typing).await;
                            }
                            Err(e) => {
                                warn!(
                                    "{} ({}) bad command: {} -- raw: {}",
                                    recv_identity.username,
                                    recv_identity.user_id,
                                    e,
                                    text.chars().take(200).collect::<String>()
                                );
                            }
                        },
                        Message::Pong(_) => {
                            pong_flag_recv.store(true, Ordering::Release);
                            touch_last_seen(&recv_gateway, recv_identity.user_id).await;
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
                conversation_id = typing::expiry(next_expiry) => {
                    if recv_typing.lock().await.stop(conversation_id) {
                        publish_typing(&recv_gateway, &recv_identity, conversation_id, false).await;
                    }
                }
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    finish_session(&gateway, &identity, session_id, &typing).await;

    info!("{} ({}) disconnected from gateway", identity.username, user_id);
}

/// Close open typing indicators, leave the registry and go offline if this
/// was the user's last session.
async fn finish_session(
    gateway: &Gateway,
    identity: &Identity,
    session_id: Uuid,
    typing: &Mutex<TypingTracker>,
) {
    let still_typing = typing.lock().await.drain();
    for conversation_id in still_typing {
        publish_typing(gateway, identity, conversation_id, false).await;
    }

    if let Some(departure) = gateway.dispatcher.unregister_session(session_id).await {
        if departure.last_session {
            mark_presence(gateway, identity.user_id, false).await;
        }
    }
}

async fn wait_for_identify(
    receiver: &mut SplitStream<WebSocket>,
    issuer: &TokenIssuer,
) -> Option<Identity> {
    let timeout = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    return issuer.verify(&token).ok();
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

async fn handle_command(
    gateway: &Gateway,
    session_id: Uuid,
    identity: &Identity,
    cmd: GatewayCommand,
    typing: &mut TypingTracker,
) {
    match cmd {
        GatewayCommand::Identify { .. } => {} // Already handled

        GatewayCommand::Subscribe { conversation_ids } => {
            info!(
                "{} ({}) subscribing to {} conversations",
                identity.username,
                identity.user_id,
                conversation_ids.len()
            );
            for conversation_id in conversation_ids {
                subscribe(gateway, session_id, identity.user_id, conversation_id).await;
            }
        }

        GatewayCommand::Unsubscribe { conversation_ids } => {
            for conversation_id in conversation_ids {
                if typing.stop(conversation_id) {
                    publish_typing(gateway, identity, conversation_id, false).await;
                }
                gateway.dispatcher.unsubscribe(session_id, conversation_id).await;
            }
        }

        GatewayCommand::StartTyping { conversation_id } => {
            if !gateway.dispatcher.is_subscribed(session_id, conversation_id).await {
                reject(gateway, session_id, format!("not subscribed to {}", conversation_id)).await;
                return;
            }
            if typing.start(conversation_id) {
                publish_typing(gateway, identity, conversation_id, true).await;
            }
        }

        GatewayCommand::StopTyping { conversation_id } => {
            if typing.stop(conversation_id) {
                publish_typing(gateway, identity, conversation_id, false).await;
            }
        }
    }
}

/// Subscriptions are honored only for members of the conversation.
async fn subscribe(gateway: &Gateway, session_id: Uuid, user_id: Uuid, conversation_id: Uuid) {
    let guard = gateway.guard.clone();
    let verdict = run_blocking(move || guard.authorize(user_id, conversation_id, Access::Read)).await;

    match verdict {
        Ok(()) => {
            if gateway.dispatcher.subscribe(session_id, conversation_id).await {
                gateway
                    .dispatcher
                    .send_to_session(session_id, GatewayEvent::Subscribed { conversation_id })
                    .await;
            }
        }
        Err(ChatError::Forbidden) => {
            reject(gateway, session_id, format!("forbidden: {}", conversation_id)).await;
        }
        Err(e) => {
            error!("Subscribe {} -> {} failed: {}", user_id, conversation_id, e);
            reject(gateway, session_id, "subscribe failed".to_string()).await;
        }
    }
}

async fn reject(gateway: &Gateway, session_id: Uuid, message: String) {
    gateway
        .dispatcher
        .send_to_session(session_id, GatewayEvent::Error { message })
        .await;
}

async fn publish_typing(gateway: &Gateway, identity: &Identity, conversation_id: Uuid, typing: bool) {
    gateway
        .dispatcher
        .publish(
            conversation_id,
            GatewayEvent::TypingChanged {
                conversation_id,
                user_id: identity.user_id,
                username: identity.username.clone(),
                typing,
            },
        )
        .await;
}

async fn send_online_peers(gateway: &Gateway, session_id: Uuid, user_id: Uuid) {
    let mut online = Vec::new();
    let conversations = gateway.conversations.clone();
    let peers = match run_blocking(move || conversations.peers(user_id)).await {
        Ok(peers) => peers,
        Err(e) => {
            warn!("Loading peers of {} failed: {}", user_id, e);
            return;
        }
    };
    for peer in peers {
        if gateway.dispatcher.is_online(peer).await {
            online.push(peer);
        }
    }
    if online.is_empty() {
        return;
    }

    let presence = gateway.presence.clone();
    let users = run_blocking(move || {
        let mut users = Vec::with_capacity(online.len());
        for peer in online {
            if let Some(user) = presence.get(peer)? {
                users.push(user);
            }
        }
        Ok(users)
    })
    .await;

    match users {
        Ok(users) => {
            for user in users {
                gateway
                    .dispatcher
                    .send_to_session(
                        session_id,
                        GatewayEvent::PresenceChanged {
                            user_id: user.id,
                            username: user.username,
                            online: true,
                            last_seen: user.last_seen,
                        },
                    )
                    .await;
            }
        }
        Err(e) => warn!("Loading online peers of {} failed: {}", user_id, e),
    }
}

async fn touch_last_seen(gateway: &Gateway, user_id: Uuid) {
    let presence = gateway.presence.clone();
    if let Err(e) = run_blocking(move || presence.touch_last_seen(user_id)).await {
        warn!("Touching last-seen of {} failed: {}", user_id, e);
    }
}

/// Persist the presence change, then fan it out.
///
/// Changes for one user are applied in turn, and one that no longer matches
/// the session registry is skipped: a reconnect that raced a departure
/// keeps the user online.
async fn mark_presence(gateway: &Gateway, user_id: Uuid, online: bool) {
    gateway
        .presence_turns
        .take(user_id, async {
            if gateway.dispatcher.is_online(user_id).await != online {
                debug!("Stale presence change for {} (online={}) skipped", user_id, online);
                return;
            }

            let presence = gateway.presence.clone();
            let updated = run_blocking(move || {
                if online {
                    presence.set_online(user_id)
                } else {
                    presence.set_offline(user_id)
                }
            })
            .await;

            match updated {
                Ok(Some(user)) => gateway.announce_presence(&user).await,
                Ok(None) => warn!("Presence update for unknown user {}", user_id),
                Err(e) => error!("Presence update for {} failed: {}", user_id, e),
            }
        })
        .await
}

fn encode(event: &GatewayEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            error!("Failed to encode gateway event: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use murmur_db::Database;

    use super::*;

    struct Fixture {
        gateway: Gateway,
        conversation: Uuid,
        ana: Identity,
        ben: Uuid,
    }

    fn user(db: &Database, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        let now = murmur_db::timestamp(chrono::Utc::now());
        db.create_user(&id.to_string(), &format!("{name}@example.com"), name, "hash", &now)
            .unwrap();
        id
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ana = user(&db, "ana");
        let ben = user(&db, "ben");
        let conversations = ConversationStore::new(db.clone());
        let (conversation, _) = conversations.create_direct(ana, ben).unwrap();
        let gateway = Gateway::new(
            Dispatcher::new(),
            TokenIssuer::new("secret", chrono::Duration::days(1)),
            MembershipGuard::new(db.clone()),
            PresenceTracker::new(db),
            conversations,
        );
        Fixture {
            gateway,
            conversation: conversation.id,
            ana: Identity { user_id: ana, username: "ana".into() },
            ben,
        }
    }

    fn is_stored_online(f: &Fixture, user_id: Uuid) -> bool {
        f.gateway.presence.get(user_id).unwrap().unwrap().online
    }

    #[tokio::test]
    async fn finishing_a_session_stops_its_typing() {
        let f = fixture();
        let mut ben = f.gateway.dispatcher.register_session(f.ben).await;
        f.gateway.dispatcher.subscribe(ben.session_id, f.conversation).await;

        let ana = f.gateway.dispatcher.register_session(f.ana.user_id).await;
        mark_presence(&f.gateway, f.ana.user_id, true).await;
        let typing = Mutex::new(TypingTracker::default());
        typing.lock().await.start(f.conversation);

        finish_session(&f.gateway, &f.ana, ana.session_id, &typing).await;

        let mut stopped = false;
        while let Ok(event) = ben.receiver.try_recv() {
            if let GatewayEvent::TypingChanged { user_id, typing, .. } = event {
                assert_eq!(user_id, f.ana.user_id);
                assert!(!typing);
                stopped = true;
            }
        }
        assert!(stopped);
        assert!(typing.lock().await.next_deadline().is_none());
        assert!(!f.gateway.dispatcher.is_online(f.ana.user_id).await);
        assert!(!is_stored_online(&f, f.ana.user_id));
    }

    #[tokio::test]
    async fn reconnect_during_departure_stays_online() {
        let f = fixture();
        let user_id = f.ana.user_id;
        let first = f.gateway.dispatcher.register_session(user_id).await;
        mark_presence(&f.gateway, user_id, true).await;

        // The old session leaves as its last one, a new one arrives, and the
        // new session's online write lands before the old offline write
        let departure = f.gateway.dispatcher.unregister_session(first.session_id).await.unwrap();
        assert!(departure.last_session);
        let second = f.gateway.dispatcher.register_session(user_id).await;
        assert!(second.first_session);
        mark_presence(&f.gateway, user_id, true).await;
        mark_presence(&f.gateway, user_id, false).await;

        assert!(is_stored_online(&f, user_id));
    }

    #[tokio::test]
    async fn concurrent_presence_changes_follow_the_registry() {
        let f = fixture();
        let user_id = f.ana.user_id;
        let first = f.gateway.dispatcher.register_session(user_id).await;
        mark_presence(&f.gateway, user_id, true).await;

        f.gateway.dispatcher.unregister_session(first.session_id).await;
        let second = f.gateway.dispatcher.register_session(user_id).await;
        tokio::join!(
            mark_presence(&f.gateway, user_id, false),
            mark_presence(&f.gateway, user_id, true),
        );
        assert!(is_stored_online(&f, user_id));

        f.gateway.dispatcher.unregister_session(second.session_id).await;
        mark_presence(&f.gateway, user_id, false).await;
        assert!(!is_stored_online(&f, user_id));
    }
}
