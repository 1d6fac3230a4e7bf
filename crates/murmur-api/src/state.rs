use std::sync::Arc;

use murmur_core::{ConversationStore, MembershipGuard, PresenceTracker, TokenIssuer};
use murmur_db::Database;
use murmur_gateway::{Courier, Gateway};

use crate::files::BlobStore;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub issuer: TokenIssuer,
    pub guard: MembershipGuard,
    pub conversations: ConversationStore,
    pub presence: PresenceTracker,
    pub courier: Courier,
    pub gateway: Gateway,
    pub uploads: BlobStore,
    /// Email of the assistant row; nobody may register with it.
    pub reserved_email: String,
}

impl AppStateInner {
    /// Wire the services around one database and the courier's dispatcher.
    pub fn new(
        db: Arc<Database>,
        issuer: TokenIssuer,
        courier: Courier,
        uploads: BlobStore,
        reserved_email: impl Into<String>,
    ) -> AppState {
        let guard = MembershipGuard::new(db.clone());
        let conversations = ConversationStore::new(db.clone());
        let presence = PresenceTracker::new(db.clone());
        let gateway = Gateway::new(
            courier.dispatcher().clone(),
            issuer.clone(),
            guard.clone(),
            presence.clone(),
            conversations.clone(),
        );

        Arc::new(Self {
            db,
            issuer,
            guard,
            conversations,
            presence,
            courier,
            gateway,
            uploads,
            reserved_email: reserved_email.into(),
        })
    }
}
