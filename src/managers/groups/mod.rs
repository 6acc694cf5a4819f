pub mod group_manager;

pub use group_manager::GroupManager;
