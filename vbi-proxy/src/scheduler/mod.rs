//! Channel control scheduling.
//!
//! This module provides:
//! - [`ChannelScheduler`]: per-device channel token arbitration

pub mod channel;

pub use channel::{ChannelAction, ChannelScheduler};
