pub mod connection;
pub mod group;
pub mod message;
pub mod topic;

pub use connection::*;
pub use group::*;
pub use message::*;
pub use topic::*;
