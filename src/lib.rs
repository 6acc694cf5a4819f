pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod managers;
pub mod models;
pub mod server;
pub mod storage;

pub use engine::KafdeskEngine;
pub use error::{KafdeskError, Result};
