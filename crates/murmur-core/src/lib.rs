//! Chat domain services over the SQLite store: token verification,
//! membership checks, conversations, the message ledger and presence.

pub mod conversations;
pub mod convert;
pub mod error;
pub mod guard;
pub mod identity;
pub mod ledger;
pub mod presence;

pub use conversations::ConversationStore;
pub use error::{AuthError, ChatError, ChatResult, ValidationError, run_blocking};
pub use guard::{Access, MembershipGuard};
pub use identity::{Identity, TokenIssuer};
pub use ledger::Ledger;
pub use presence::PresenceTracker;
