pub mod admin;
pub mod connection;
pub mod consumer;
pub mod groups;
pub mod producer;
