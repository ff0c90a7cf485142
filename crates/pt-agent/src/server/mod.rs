//! Client connection serving

mod handler;
mod listener;

pub use handler::{handle_connection, ConnectionHandler};
pub use listener::Listener;
