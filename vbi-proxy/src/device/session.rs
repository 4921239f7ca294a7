//! Lifecycle of one capture device shared by all of its clients.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use nix::errno::Errno;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use vbi_proxy_protocol::{SamplingParams, ServiceSet, STRICTNESS_LEVELS};

use super::acquisition::{Acquisition, DeviceEvent, FrameSink, StopOutcome};
use super::backend::{CaptureDevice, DeviceControl, DeviceError, DeviceOpener, Negotiated};
use super::pool::BufferPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Closed,
    /// Acquisition is being (re)started.
    Acquiring,
    Running,
    /// Acquisition is stopped while the device is reconfigured.
    Suspended,
}

/// One device path, opened while at least one client requests services.
pub struct DeviceSession {
    id: usize,
    path: String,
    opener: Arc<dyn DeviceOpener>,
    buffer_count: usize,
    stop_timeout: Duration,
    state: DeviceState,
    /// Held while acquisition is stopped.
    device: Option<Box<dyn CaptureDevice>>,
    control: Option<Arc<dyn DeviceControl>>,
    acquisition: Option<Acquisition>,
    pool: Arc<Mutex<BufferPool>>,
    published: Arc<watch::Sender<u64>>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    requested: [ServiceSet; STRICTNESS_LEVELS],
    granted: ServiceSet,
    params: SamplingParams,
}

impl DeviceSession {
    pub fn new(
        id: usize,
        path: String,
        opener: Arc<dyn DeviceOpener>,
        buffer_count: usize,
        stop_timeout: Duration,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Self {
        let params = SamplingParams::default();
        let (published, _) = watch::channel(0);
        Self {
            id,
            path,
            opener,
            buffer_count,
            stop_timeout,
            state: DeviceState::Closed,
            device: None,
            control: None,
            acquisition: None,
            pool: Arc::new(Mutex::new(BufferPool::new(buffer_count, params.max_lines()))),
            published: Arc::new(published),
            events,
            requested: [ServiceSet::EMPTY; STRICTNESS_LEVELS],
            granted: ServiceSet::EMPTY,
            params,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn pool(&self) -> &Arc<Mutex<BufferPool>> {
        &self.pool
    }

    /// Receiver woken whenever a frame is published.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.published.subscribe()
    }

    pub fn granted(&self) -> ServiceSet {
        self.granted
    }

    pub fn params(&self) -> SamplingParams {
        self.params
    }

    /// Reconfigure the device for the union of all client requests.
    ///
    /// Opens the device on first use and closes it when nothing is
    /// requested anymore, in which case `None` is returned. Acquisition is
    /// suspended while services are renegotiated and in-flight frames are
    /// discarded, since they were captured with the previous parameters.
    pub async fn apply_services(
        &mut self,
        requested: [ServiceSet; STRICTNESS_LEVELS],
    ) -> Result<Option<Negotiated>, DeviceError> {
        if ServiceSet::union_all(&requested).is_empty() {
            self.close().await;
            return Ok(None);
        }
        if self.state == DeviceState::Running && requested == self.requested {
            return Ok(Some(Negotiated {
                services: self.granted,
                params: self.params,
            }));
        }

        let mut device = match self.state {
            DeviceState::Running => match self.suspend().await {
                Some(d) => d,
                None => self.open()?,
            },
            _ => match self.device.take() {
                Some(d) => d,
                None => self.open()?,
            },
        };

        self.state = DeviceState::Acquiring;
        let negotiated = match device.negotiate(&requested) {
            Ok(n) => n,
            Err(e) => {
                error!("[Device {}] {}: {}", self.id, self.path, e);
                self.device = Some(device);
                self.state = DeviceState::Suspended;
                return Err(e);
            }
        };
        self.requested = requested;
        self.granted = negotiated.services;
        self.params = negotiated.params;

        {
            let mut pool = self.pool.lock();
            pool.flush();
            pool.set_max_lines(negotiated.params.max_lines());
        }

        self.control = Some(device.control());
        let sink = FrameSink::new(
            self.id,
            Arc::clone(&self.pool),
            Arc::clone(&self.published),
            self.events.clone(),
        );
        let acquisition = Acquisition::start(device, sink);
        info!(
            "[Device {}] {}: capturing services {} ({} lines, {} acquisition)",
            self.id,
            self.path,
            negotiated.services,
            negotiated.params.max_lines(),
            acquisition.kind()
        );
        self.acquisition = Some(acquisition);
        self.state = DeviceState::Running;
        Ok(Some(negotiated))
    }

    fn open(&mut self) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        debug!("[Device {}] Opening {}", self.id, self.path);
        match self.opener.open(&self.path, self.buffer_count) {
            Ok(d) => Ok(d),
            Err(e) => {
                self.state = DeviceState::Closed;
                Err(e)
            }
        }
    }

    /// Stop acquisition. Returns the device unless it had to be killed.
    async fn suspend(&mut self) -> Option<Box<dyn CaptureDevice>> {
        let acquisition = self.acquisition.take()?;
        self.state = DeviceState::Suspended;
        match acquisition.stop(self.stop_timeout).await {
            StopOutcome::Stopped(device) => Some(device),
            StopOutcome::Killed => {
                warn!("[Device {}] {}: acquisition killed, reopening", self.id, self.path);
                self.control = None;
                None
            }
        }
    }

    /// Stop acquisition and release the device.
    pub async fn close(&mut self) {
        if self.state == DeviceState::Closed && self.device.is_none() {
            return;
        }
        if let Some(device) = self.suspend().await {
            drop(device);
        }
        self.device = None;
        self.control = None;
        self.requested = [ServiceSet::EMPTY; STRICTNESS_LEVELS];
        self.granted = ServiceSet::EMPTY;
        self.state = DeviceState::Closed;

        let stats = {
            let mut pool = self.pool.lock();
            pool.flush();
            pool.stats()
        };
        info!(
            "[Device {}] {} closed (published: {}, discarded: {}, forced: {})",
            self.id, self.path, stats.published, stats.discarded, stats.forced
        );
    }

    /// Discard in-flight frames, e.g. after a channel change.
    pub fn flush(&self) {
        self.pool.lock().flush();
    }

    /// Pass a control request to the open device.
    pub fn ioctl(&self, request: u32, arg: &mut [u8]) -> Result<i32, Errno> {
        match &self.control {
            Some(control) => control.ioctl(request, arg),
            None => Err(Errno::ENODEV),
        }
    }
}
