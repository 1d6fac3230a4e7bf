//! Assistant auto-responder: a bounded queue of stored messages, a worker
//! pool that builds a context window, calls the text generator and delivers
//! the reply back through the courier.

pub mod completion;
pub mod context;
pub mod pipeline;
pub mod seed;

pub use completion::{CannedReply, GenerationError, MistralClient, TextGenerator};
pub use pipeline::{AutoResponder, Outcome, Responder, ResponderConfig};
pub use seed::{AssistantIdentity, ensure_assistant_user};
