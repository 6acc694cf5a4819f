pub mod producer_manager;

pub use producer_manager::ProducerManager;
