pub mod admin_manager;

pub use admin_manager::AdminManager;
