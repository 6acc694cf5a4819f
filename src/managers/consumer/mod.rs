pub mod session;
pub mod session_manager;

pub use session::SessionHandle;
pub use session_manager::SessionManager;
