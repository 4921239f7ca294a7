//! VBI proxy broker.
//!
//! One daemon process owns each VBI capture device and shares its sliced
//! data among any number of clients connected over a local socket. Each
//! client receives the subset of services it asked for, and a channel token
//! arbitrates which client may retune the shared tuner.

pub mod broker;
pub mod config;
pub mod device;
pub mod logging;
pub mod scheduler;
pub mod server;
