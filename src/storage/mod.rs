//! Local persistence: the connection store and the secure credential store.

pub mod crypto;
pub mod registry;
pub mod sqlite;
pub mod vault;

pub use registry::ConnectionRegistry;
pub use vault::CredentialVault;
