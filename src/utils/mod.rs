pub mod graceful_shutdown;
pub mod net;

pub use graceful_shutdown::GracefulShutdown;
