//! REST surface and gateway upgrade for the chat core.

pub mod auth;
pub mod conversations;
pub mod error;
pub mod files;
pub mod gateway;
pub mod messages;
pub mod middleware;
pub mod reactions;
pub mod receipts;
pub mod routes;
pub mod state;
pub mod users;

pub use routes::router;
pub use state::{AppState, AppStateInner};
