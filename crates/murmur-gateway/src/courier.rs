use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use murmur_core::{Access, ChatError, ChatResult, Ledger, MembershipGuard, run_blocking};
use murmur_types::events::GatewayEvent;
use murmur_types::models::{Attachment, Message, ReceiptKind};

use crate::turns::Turns;

/// Bounded queue of delivered messages that concern one watched user:
/// messages in conversations the user belongs to, not sent by the user.
#[derive(Clone)]
pub struct DeliveryFeed {
    tx: mpsc::Sender<Message>,
    watched: Uuid,
}

impl DeliveryFeed {
    pub fn new(tx: mpsc::Sender<Message>, watched: Uuid) -> Self {
        Self { tx, watched }
    }

    pub fn watched(&self) -> Uuid {
        self.watched
    }

    /// Queue `message`. When the queue is full the message waits for room
    /// on a spawned task, so the caller never blocks and nothing is dropped.
    fn offer(&self, message: Message) {
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                debug!("Reply queue full, message {} waits for room", message.id);
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let id = message.id;
                    if tx.send(message).await.is_err() {
                        debug!("Reply queue closed, message {} not offered", id);
                    }
                });
            }
            Err(TrySendError::Closed(message)) => {
                debug!("Reply queue closed, message {} not offered", message.id);
            }
        }
    }
}

/// Persist-then-publish for one conversation at a time.
///
/// A message is broadcast only after the ledger has stored it, and the
/// per-conversation turn makes subscribers see messages in stored order.
/// Different conversations never wait on each other.
#[derive(Clone)]
pub struct Courier {
    ledger: Ledger,
    guard: MembershipGuard,
    dispatcher: crate::Dispatcher,
    feed: Option<DeliveryFeed>,
    turns: Turns,
}

impl Courier {
    pub fn new(ledger: Ledger, dispatcher: crate::Dispatcher) -> Self {
        Self {
            guard: ledger.guard().clone(),
            ledger,
            dispatcher,
            feed: None,
            turns: Turns::default(),
        }
    }

    /// Offer delivered messages that concern the feed's watched user.
    pub fn with_feed(mut self, feed: DeliveryFeed) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn dispatcher(&self) -> &crate::Dispatcher {
        &self.dispatcher
    }

    /// Append through the ledger, publish `message.created` to the
    /// conversation channel and offer the message to the feed.
    ///
    /// The three steps run on their own task, so a caller that goes away
    /// mid-call cannot leave a stored message unpublished.
    pub async fn deliver(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: String,
        attachment: Option<Attachment>,
    ) -> ChatResult<Message> {
        let courier = self.clone();
        tokio::spawn(async move {
            let turns = courier.turns.clone();
            let work = courier.store_and_publish(conversation_id, sender_id, content, attachment);
            turns.take(conversation_id, work).await
        })
        .await
        .map_err(|e| ChatError::Persistence(anyhow::anyhow!("delivery task join error: {}", e)))?
    }

    async fn store_and_publish(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: String,
        attachment: Option<Attachment>,
    ) -> ChatResult<Message> {
        let ledger = self.ledger.clone();
        let guard = self.guard.clone();
        let watched = self.feed.as_ref().map(DeliveryFeed::watched);
        let (message, concerns_feed) = run_blocking(move || {
            let message = ledger.append(conversation_id, sender_id, &content, attachment)?;
            let concerns_feed = match watched {
                Some(watched) if watched != sender_id => {
                    match guard.authorize(watched, conversation_id, Access::Read) {
                        Ok(()) => true,
                        Err(ChatError::Forbidden) => false,
                        Err(e) => {
                            // The consumer re-checks eligibility
                            warn!("Feed membership check for {} failed: {}", message.id, e);
                            true
                        }
                    }
                }
                _ => false,
            };
            Ok((message, concerns_feed))
        })
        .await?;

        let reached = self
            .dispatcher
            .publish(
                conversation_id,
                GatewayEvent::MessageCreated {
                    message: message.clone(),
                },
            )
            .await;
        debug!("Message {} published to {} session(s)", message.id, reached);

        if concerns_feed {
            if let Some(feed) = &self.feed {
                feed.offer(message.clone());
            }
        }
        Ok(message)
    }

    /// Toggle a reaction and publish the new reaction map.
    pub async fn react(&self, message_id: Uuid, user_id: Uuid, emoji: String) -> ChatResult<Message> {
        let ledger = self.ledger.clone();
        let message = run_blocking(move || ledger.react(message_id, user_id, &emoji)).await?;

        self.dispatcher
            .publish(
                message.conversation_id,
                GatewayEvent::ReactionUpdated {
                    conversation_id: message.conversation_id,
                    message_id: message.id,
                    reactions: message.reactions.clone(),
                },
            )
            .await;

        Ok(message)
    }

    /// Record delivered/read acknowledgements and publish them.
    pub async fn acknowledge(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        message_ids: Vec<Uuid>,
        kind: ReceiptKind,
    ) -> ChatResult<Vec<Uuid>> {
        let ledger = self.ledger.clone();
        let acked =
            run_blocking(move || ledger.acknowledge(conversation_id, user_id, &message_ids, kind))
                .await?;

        if !acked.is_empty() {
            self.dispatcher
                .publish(
                    conversation_id,
                    GatewayEvent::ReceiptUpdated {
                        conversation_id,
                        user_id,
                        kind,
                        message_ids: acked.clone(),
                    },
                )
                .await;
        }

        Ok(acked)
    }
}
