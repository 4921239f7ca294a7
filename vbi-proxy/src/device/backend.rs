//! Interface between the broker and capture backends.
//!
//! A backend turns a device path into decoded sliced frames. The broker
//! never decodes anything itself; it negotiates services, reads frames and
//! forwards them.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use nix::errno::Errno;
use thiserror::Error;
use vbi_proxy_protocol::{SamplingParams, ServiceSet, SlicedFrame, STRICTNESS_LEVELS};

/// Capture backend errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("service negotiation failed: {0}")]
    Negotiate(String),

    #[error("device read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed capture record: {0}")]
    Format(String),

    /// The device was interrupted through its control handle.
    #[error("device interrupted")]
    Interrupted,

    #[error("end of capture stream")]
    EndOfStream,
}

/// Outcome of a service negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub services: ServiceSet,
    pub params: SamplingParams,
}

/// Result of one read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// A complete frame was written into the buffer.
    Frame,
    /// Nothing available yet; wait for readiness.
    Pending,
}

/// How the device reports that a frame can be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A pollable descriptor; the runtime's reactor drives reads.
    Fd(RawFd),
    /// No readiness signal; reads block and need a dedicated worker.
    Blocking,
}

/// An open capture device.
pub trait CaptureDevice: Send {
    /// Configure the device for the union of requested services, indexed by strictness.
    fn negotiate(
        &mut self,
        requested: &[ServiceSet; STRICTNESS_LEVELS],
    ) -> Result<Negotiated, DeviceError>;

    /// Read one frame into `frame`, replacing its contents.
    fn read_frame(&mut self, frame: &mut SlicedFrame) -> Result<ReadStatus, DeviceError>;

    fn readiness(&self) -> Readiness;

    /// Handle usable while another thread is blocked in [`read_frame`](Self::read_frame).
    fn control(&self) -> Arc<dyn DeviceControl>;
}

/// Operations that may run concurrently with acquisition.
pub trait DeviceControl: Send + Sync {
    /// Low-level control request. `arg` is read and updated in place.
    fn ioctl(&self, request: u32, arg: &mut [u8]) -> Result<i32, Errno>;

    /// Force a blocked read to fail with [`DeviceError::Interrupted`].
    /// The device must not be read again afterwards.
    fn interrupt(&self);
}

/// Opens devices by path.
pub trait DeviceOpener: Send + Sync {
    fn open(&self, path: &str, buffer_count: usize) -> Result<Box<dyn CaptureDevice>, DeviceError>;
}
