//! Client-facing side of the daemon.

pub mod listener;
pub mod session;

pub use listener::Server;
pub use session::{ClientSession, SessionError, SessionState};
