pub mod connection_manager;

pub use connection_manager::{ConnectionHandle, ConnectionManager};
