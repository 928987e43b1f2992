pub mod router;
pub mod server;
pub mod session;
pub mod subsystems;
