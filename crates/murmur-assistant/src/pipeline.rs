use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use murmur_core::{ChatError, ConversationStore, run_blocking};
use murmur_gateway::{Courier, DeliveryFeed};
use murmur_types::events::GatewayEvent;
use murmur_types::models::Message;

use crate::completion::{GenerationError, SYSTEM_PROMPT, TextGenerator};
use crate::context::{ContextTurn, build_context, prompt_for, reply_text};
use crate::seed::AssistantIdentity;

#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// Messages before the trigger handed to the generator.
    pub context_window: u32,
    pub workers: usize,
    pub queue_capacity: usize,
    pub generation_timeout: Duration,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            context_window: 10,
            workers: 2,
            queue_capacity: 256,
            generation_timeout: Duration::from_secs(30),
        }
    }
}

/// How one trigger ended. Every run ends in exactly one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Not an assistant conversation, or the assistant sent the trigger.
    Ineligible,
    Replied(Message),
    GenerationFailed,
    /// The conversation went away or the store failed; no reply was stored.
    Abandoned,
}

/// Generates and delivers assistant replies for one trigger at a time.
pub struct Responder {
    courier: Courier,
    conversations: ConversationStore,
    generator: Arc<dyn TextGenerator>,
    assistant: AssistantIdentity,
    config: ResponderConfig,
}

impl Responder {
    pub fn new(
        courier: Courier,
        conversations: ConversationStore,
        generator: Arc<dyn TextGenerator>,
        assistant: AssistantIdentity,
        config: ResponderConfig,
    ) -> Self {
        Self {
            courier,
            conversations,
            generator,
            assistant,
            config,
        }
    }

    pub async fn respond(&self, trigger: &Message) -> Outcome {
        let conversation_id = trigger.conversation_id;

        // The assistant's own replies come back through the same feed
        if self.assistant.is_assistant(trigger.sender_id) {
            return Outcome::Ineligible;
        }

        let conversations = self.conversations.clone();
        let participants = match run_blocking(move || conversations.participants(conversation_id)).await {
            Ok(participants) => participants,
            Err(e) => {
                error!("Reply to {} in {}: loading members failed: {}", trigger.id, conversation_id, e);
                return Outcome::Abandoned;
            }
        };
        if !participants.iter().any(|p| self.assistant.is_assistant(p.user_id)) {
            return Outcome::Ineligible;
        }

        let ledger = self.courier.ledger().clone();
        let (window, trigger_id) = (self.config.context_window, trigger.id);
        let history = match run_blocking(move || ledger.history(conversation_id, window, Some(trigger_id))).await {
            Ok(history) => history,
            Err(ChatError::NotFound(what)) => {
                warn!("Reply to {} abandoned: {} is gone", trigger.id, what);
                return Outcome::Abandoned;
            }
            Err(e) => {
                error!("Reply to {} in {}: loading history failed: {}", trigger.id, conversation_id, e);
                return Outcome::Abandoned;
            }
        };
        let context = build_context(&history, self.assistant.user_id);

        self.publish_typing(conversation_id, true).await;
        let generated = self.generate(&context, prompt_for(trigger)).await;
        self.publish_typing(conversation_id, false).await;

        let text = match generated {
            Ok(text) => reply_text(text),
            Err(e) => {
                warn!("Generation for {} in {} failed: {}", trigger.id, conversation_id, e);
                return Outcome::GenerationFailed;
            }
        };

        match self
            .courier
            .deliver(conversation_id, self.assistant.user_id, text, None)
            .await
        {
            Ok(reply) => {
                info!("Assistant replied to {} in {} with {}", trigger.id, conversation_id, reply.id);
                Outcome::Replied(reply)
            }
            Err(ChatError::NotFound(_)) | Err(ChatError::Forbidden) => {
                warn!("Reply to {} abandoned: {} no longer accepts it", trigger.id, conversation_id);
                Outcome::Abandoned
            }
            Err(e) => {
                error!("Storing reply to {} in {} failed: {}", trigger.id, conversation_id, e);
                Outcome::Abandoned
            }
        }
    }

    async fn generate(&self, context: &[ContextTurn], message: &str) -> Result<String, GenerationError> {
        tokio::time::timeout(
            self.config.generation_timeout,
            self.generator.complete(SYSTEM_PROMPT, context, message),
        )
        .await
        .map_err(|_| GenerationError::Timeout)?
    }

    async fn publish_typing(&self, conversation_id: Uuid, typing: bool) {
        self.courier
            .dispatcher()
            .publish(
                conversation_id,
                GatewayEvent::TypingChanged {
                    conversation_id,
                    user_id: self.assistant.user_id,
                    username: self.assistant.username.clone(),
                    typing,
                },
            )
            .await;
    }
}

/// The background worker pool consuming the delivery feed.
pub struct AutoResponder {
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl AutoResponder {
    /// Create the bounded feed for a `Courier`, plus its receiving end.
    /// Only messages reaching the assistant's conversations are queued.
    pub fn channel(
        config: &ResponderConfig,
        assistant: &AssistantIdentity,
    ) -> (DeliveryFeed, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        (DeliveryFeed::new(tx, assistant.user_id), rx)
    }

    pub fn spawn(responder: Responder, feed: mpsc::Receiver<Message>) -> Self {
        let workers = responder.config.workers.max(1);
        let responder = Arc::new(responder);
        let feed = Arc::new(Mutex::new(feed));
        let cancel = CancellationToken::new();

        let workers = (0..workers)
            .map(|n| {
                let responder = responder.clone();
                let feed = feed.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { run_worker(n, responder, feed, cancel).await })
            })
            .collect();

        Self { cancel, workers }
    }

    /// Stop taking new triggers, finish the queued ones, wait for the workers.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!("Reply worker panicked: {}", e);
            }
        }
        info!("Auto-responder stopped");
    }
}

async fn run_worker(
    n: usize,
    responder: Arc<Responder>,
    feed: Arc<Mutex<mpsc::Receiver<Message>>>,
    cancel: CancellationToken,
) {
    debug!("Reply worker {} started", n);

    loop {
        let next = {
            let mut feed = feed.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Refuse new triggers; what is buffered is still handed out
                    feed.close();
                    feed.recv().await
                }
                trigger = feed.recv() => trigger,
            }
        };

        let Some(trigger) = next else { break };
        let outcome = responder.respond(&trigger).await;
        debug!("Worker {} finished {}: {:?}", n, trigger.id, outcome);
    }

    debug!("Reply worker {} stopped", n);
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use tokio::sync::{Notify, Semaphore};
    use murmur_core::Ledger;
    use murmur_db::Database;
    use murmur_gateway::Dispatcher;

    use super::*;
    use crate::context::{FALLBACK_REPLY, Role};
    use crate::seed::ensure_assistant_user;

    /// Records every call and answers from a script.
    struct Scripted {
        reply: Result<String, ()>,
        calls: StdMutex<Vec<(Vec<ContextTurn>, String)>>,
    }

    impl Scripted {
        fn replying(text: &str) -> Arc<Self> {
            Arc::new(Self { reply: Ok(text.into()), calls: StdMutex::new(Vec::new()) })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self { reply: Err(()), calls: StdMutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl TextGenerator for Scripted {
        async fn complete(
            &self,
            _system_prompt: &str,
            context: &[ContextTurn],
            message: &str,
        ) -> Result<String, GenerationError> {
            self.calls.lock().unwrap().push((context.to_vec(), message.to_string()));
            self.reply.clone().map_err(|_| GenerationError::Status(503))
        }
    }

    struct Fixture {
        db: Arc<Database>,
        courier: Courier,
        conversations: ConversationStore,
        assistant: AssistantIdentity,
        human: Uuid,
        conversation: Uuid,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let assistant = ensure_assistant_user(&db, "bot@example.com", "bot").unwrap();
        let human = Uuid::new_v4();
        let now = murmur_db::timestamp(chrono::Utc::now());
        db.create_user(&human.to_string(), "ana@example.com", "ana", "hash", &now).unwrap();

        let conversations = ConversationStore::new(db.clone());
        let (conversation, _) = conversations.create_direct(human, assistant.user_id).unwrap();
        let courier = Courier::new(Ledger::new(db.clone()), Dispatcher::new());
        Fixture {
            db,
            courier,
            conversations,
            assistant,
            human,
            conversation: conversation.id,
        }
    }

    fn responder(f: &Fixture, generator: Arc<dyn TextGenerator>) -> Responder {
        Responder::new(
            f.courier.clone(),
            f.conversations.clone(),
            generator,
            f.assistant.clone(),
            ResponderConfig::default(),
        )
    }

    #[tokio::test]
    async fn context_is_the_messages_before_the_trigger() {
        let f = fixture();
        let generator = Scripted::replying("noted");
        let responder = responder(&f, generator.clone());

        let m1 = f.courier.deliver(f.conversation, f.human, "m1".into(), None).await.unwrap();
        let m2 = f.courier.deliver(f.conversation, f.assistant.user_id, "m2".into(), None).await.unwrap();
        let m3 = f.courier.deliver(f.conversation, f.human, "m3".into(), None).await.unwrap();

        let outcome = responder.respond(&m3).await;
        let Outcome::Replied(reply) = outcome else {
            panic!("expected a reply, got {:?}", outcome);
        };
        assert_eq!(reply.sender_id, f.assistant.user_id);
        assert_eq!(reply.content, "noted");
        assert!(reply.seq > m3.seq);

        let calls = generator.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (context, message) = &calls[0];
        assert_eq!(message, "m3");
        assert_eq!(
            context,
            &vec![
                ContextTurn { role: Role::User, content: m1.content.clone() },
                ContextTurn { role: Role::Assistant, content: m2.content.clone() },
            ]
        );
    }

    #[tokio::test]
    async fn assistant_messages_never_trigger_replies() {
        let f = fixture();
        let generator = Scripted::replying("again");
        let responder = responder(&f, generator.clone());

        let own = f
            .courier
            .deliver(f.conversation, f.assistant.user_id, "hello".into(), None)
            .await
            .unwrap();
        assert_eq!(responder.respond(&own).await, Outcome::Ineligible);
        assert!(generator.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn conversations_without_the_assistant_are_ignored() {
        let f = fixture();
        let bob = Uuid::new_v4();
        let now = murmur_db::timestamp(chrono::Utc::now());
        f.db.create_user(&bob.to_string(), "bob@example.com", "bob", "hash", &now).unwrap();
        let (between_humans, _) = f.conversations.create_direct(f.human, bob).unwrap();

        let generator = Scripted::replying("hi");
        let responder = responder(&f, generator.clone());
        let message = f
            .courier
            .deliver(between_humans.id, f.human, "hey".into(), None)
            .await
            .unwrap();

        assert_eq!(responder.respond(&message).await, Outcome::Ineligible);
        assert!(generator.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_generation_stores_the_fallback() {
        let f = fixture();
        let responder = responder(&f, Scripted::replying("   "));
        let trigger = f.courier.deliver(f.conversation, f.human, "?".into(), None).await.unwrap();

        match responder.respond(&trigger).await {
            Outcome::Replied(reply) => assert_eq!(reply.content, FALLBACK_REPLY),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_generation_stores_nothing() {
        let f = fixture();
        let responder = responder(&f, Scripted::failing());
        let trigger = f.courier.deliver(f.conversation, f.human, "hi".into(), None).await.unwrap();

        assert_eq!(responder.respond(&trigger).await, Outcome::GenerationFailed);
        let history = f.courier.ledger().history(f.conversation, 10, None).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn typing_is_announced_around_generation() {
        let f = fixture();
        let mut listener = f.courier.dispatcher().register_session(f.human).await;
        f.courier
            .dispatcher()
            .subscribe(listener.session_id, f.conversation)
            .await;
        let responder = responder(&f, Scripted::replying("yo"));
        let trigger = f.courier.deliver(f.conversation, f.human, "hi".into(), None).await.unwrap();
        let _created = listener.receiver.try_recv().unwrap();

        responder.respond(&trigger).await;

        let mut typing = Vec::new();
        while let Ok(event) = listener.receiver.try_recv() {
            if let GatewayEvent::TypingChanged { user_id, typing: on, .. } = event {
                assert_eq!(user_id, f.assistant.user_id);
                typing.push(on);
            }
        }
        assert_eq!(typing, vec![true, false]);
    }

    #[tokio::test]
    async fn pool_replies_once_and_drains_on_shutdown() {
        let f = fixture();
        let generator = Scripted::replying("pong");
        let config = ResponderConfig::default();
        let (feed, receiver) = AutoResponder::channel(&config, &f.assistant);
        let courier = f.courier.clone().with_feed(feed);

        let pool = AutoResponder::spawn(
            Responder::new(
                courier.clone(),
                f.conversations.clone(),
                generator.clone(),
                f.assistant.clone(),
                config,
            ),
            receiver,
        );

        courier.deliver(f.conversation, f.human, "ping".into(), None).await.unwrap();

        // The reply is offered back to the feed and must be ignored
        let mut waited = 0;
        loop {
            let history = courier.ledger().history(f.conversation, 10, None).unwrap();
            if history.len() >= 2 || waited > 200 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
        pool.shutdown().await;

        let history = courier.ledger().history(f.conversation, 10, None).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].sender_id, f.assistant.user_id);
        assert_eq!(history[1].content, "pong");
        assert_eq!(generator.calls.lock().unwrap().len(), 1);
    }

    /// Answers "ok" once the test opens the gate.
    struct Gated {
        started: Notify,
        gate: Semaphore,
    }

    #[async_trait]
    impl TextGenerator for Gated {
        async fn complete(
            &self,
            _system_prompt: &str,
            _context: &[ContextTurn],
            _message: &str,
        ) -> Result<String, GenerationError> {
            self.started.notify_one();
            let permit = self.gate.acquire().await.map_err(|_| GenerationError::Timeout)?;
            permit.forget();
            Ok("ok".into())
        }
    }

    #[tokio::test]
    async fn busy_worker_still_answers_every_trigger() {
        let f = fixture();
        let bob = Uuid::new_v4();
        let now = murmur_db::timestamp(chrono::Utc::now());
        f.db.create_user(&bob.to_string(), "bob@example.com", "bob", "hash", &now).unwrap();
        let (between_humans, _) = f.conversations.create_direct(f.human, bob).unwrap();

        let generator = Arc::new(Gated { started: Notify::new(), gate: Semaphore::new(0) });
        let config = ResponderConfig { workers: 1, queue_capacity: 1, ..ResponderConfig::default() };
        let (feed, receiver) = AutoResponder::channel(&config, &f.assistant);
        let courier = f.courier.clone().with_feed(feed);
        let pool = AutoResponder::spawn(
            Responder::new(
                courier.clone(),
                f.conversations.clone(),
                generator.clone(),
                f.assistant.clone(),
                config,
            ),
            receiver,
        );

        courier.deliver(f.conversation, f.human, "first".into(), None).await.unwrap();
        generator.started.notified().await;

        // The only worker is busy; unrelated traffic and more triggers arrive
        for i in 0..3 {
            courier.deliver(between_humans.id, bob, format!("chatter {i}"), None).await.unwrap();
        }
        courier.deliver(f.conversation, f.human, "second".into(), None).await.unwrap();
        courier.deliver(f.conversation, f.human, "third".into(), None).await.unwrap();
        generator.gate.add_permits(16);

        let mut replies = 0;
        for _ in 0..200 {
            let history = courier.ledger().history(f.conversation, 20, None).unwrap();
            replies = history.iter().filter(|m| f.assistant.is_assistant(m.sender_id)).count();
            if replies >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await;

        assert_eq!(replies, 3);
        let chatter = courier.ledger().history(between_humans.id, 20, None).unwrap();
        assert!(chatter.iter().all(|m| !f.assistant.is_assistant(m.sender_id)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_generation_times_out() {
        let f = fixture();
        let generator = Arc::new(Gated { started: Notify::new(), gate: Semaphore::new(0) });
        let responder = responder(&f, generator);
        let trigger = f.courier.deliver(f.conversation, f.human, "hi".into(), None).await.unwrap();

        assert_eq!(responder.respond(&trigger).await, Outcome::GenerationFailed);
        let history = f.courier.ledger().history(f.conversation, 10, None).unwrap();
        assert_eq!(history.len(), 1);
    }
}
