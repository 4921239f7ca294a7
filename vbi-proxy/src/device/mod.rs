//! Capture device management for the broker.
//!
//! This module provides:
//! - [`CaptureDevice`] / [`DeviceOpener`]: the backend interface
//! - [`StreamOpener`]: backend reading pre-sliced frame streams
//! - [`BufferPool`]: reference-counted frame buffers shared by clients
//! - [`Acquisition`]: reactor-driven or worker-thread capture
//! - [`DeviceSession`]: open/negotiate/suspend/close lifecycle
//! - [`ioctl`]: control requests clients may pass through

pub mod acquisition;
pub mod backend;
pub mod ioctl;
pub mod pool;
pub mod session;
pub mod stream;

pub use acquisition::{Acquisition, DeviceEvent, FrameSink, StopOutcome};
pub use backend::{
    CaptureDevice, DeviceControl, DeviceError, DeviceOpener, Negotiated, ReadStatus, Readiness,
};
pub use pool::{BufferPool, ClientId, PoolStats};
pub use session::{DeviceSession, DeviceState};
pub use stream::StreamOpener;
