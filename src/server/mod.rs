pub mod connection_session;
pub mod network;
pub mod protocol;
pub mod router;

pub use network::{serve, serve_listener};
