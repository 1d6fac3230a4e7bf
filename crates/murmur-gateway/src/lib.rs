pub mod connection;
pub mod courier;
pub mod dispatcher;
mod turns;
pub mod typing;

pub use connection::Gateway;
pub use courier::{Courier, DeliveryFeed};
pub use dispatcher::Dispatcher;
