//! Acquisition strategies: reactor-driven or worker-thread.
//!
//! A device with a pollable descriptor is read from a task woken by the
//! runtime's reactor. A device without one gets a dedicated thread that
//! blocks in the read call. Both publish into the same buffer pool and
//! signal sessions through the same publish counter.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use vbi_proxy_protocol::SlicedFrame;

use super::backend::{CaptureDevice, DeviceControl, DeviceError, ReadStatus, Readiness};
use super::pool::BufferPool;

/// Frames read per readiness event before yielding to other tasks.
const READ_BATCH: usize = 8;

/// Events reported by acquisition to the broker.
#[derive(Debug)]
pub enum DeviceEvent {
    /// Acquisition stopped on an error; the device must be torn down.
    Failed { device: usize, error: String },
}

/// Where acquisition delivers frames.
///
/// The device is read into a spare frame owned by the sink. A pool buffer
/// is taken only once a frame has actually arrived, so a full pool costs a
/// slow client a frame only when a newer one replaces it.
pub struct FrameSink {
    device: usize,
    pool: Arc<Mutex<BufferPool>>,
    published: Arc<watch::Sender<u64>>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    spare: SlicedFrame,
}

impl FrameSink {
    pub fn new(
        device: usize,
        pool: Arc<Mutex<BufferPool>>,
        published: Arc<watch::Sender<u64>>,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Self {
        let spare = SlicedFrame::with_capacity(pool.lock().max_lines());
        Self {
            device,
            pool,
            published,
            events,
            spare,
        }
    }

    /// Read one frame and publish it. Returns `false` if the device had nothing.
    ///
    /// The pool lock is never held across the device read.
    pub fn capture(&mut self, device: &mut dyn CaptureDevice) -> Result<bool, DeviceError> {
        self.spare.clear();
        match device.read_frame(&mut self.spare)? {
            ReadStatus::Frame => {}
            ReadStatus::Pending => return Ok(false),
        }

        let mut pool = self.pool.lock();
        let (buf, forced) = pool.acquire_or_force();
        if let Some(forced) = forced {
            debug!(
                "[Device {}] Frame #{} dropped for clients {:?}",
                self.device, forced.seq, forced.victims
            );
        }
        let mut buf = match buf {
            Some(b) => b,
            None => {
                warn!("[Device {}] No capture buffer available, frame lost", self.device);
                return Ok(true);
            }
        };
        std::mem::swap(&mut buf.frame, &mut self.spare);
        let seq = pool.publish(buf);
        drop(pool);
        self.published.send_replace(seq);
        Ok(true)
    }

    fn fail(&self, error: DeviceError) {
        error!("[Device {}] Acquisition failed: {}", self.device, error);
        let _ = self.events.send(DeviceEvent::Failed {
            device: self.device,
            error: error.to_string(),
        });
    }
}

struct DeviceFd(RawFd);

impl AsRawFd for DeviceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// How acquisition ended.
pub enum StopOutcome {
    /// Acquisition stopped cleanly; the device can be reconfigured.
    Stopped(Box<dyn CaptureDevice>),
    /// The device had to be interrupted or abandoned and must be reopened.
    Killed,
}

/// A running acquisition.
pub enum Acquisition {
    Reactor {
        stop: oneshot::Sender<()>,
        task: JoinHandle<Box<dyn CaptureDevice>>,
    },
    Worker {
        stop: Arc<AtomicBool>,
        done: oneshot::Receiver<Box<dyn CaptureDevice>>,
        control: Arc<dyn DeviceControl>,
    },
}

impl Acquisition {
    /// Start acquiring from `device`. Must be called inside the runtime.
    pub fn start(device: Box<dyn CaptureDevice>, sink: FrameSink) -> Acquisition {
        match device.readiness() {
            Readiness::Fd(fd) => match AsyncFd::new(DeviceFd(fd)) {
                Ok(async_fd) => {
                    let (stop_tx, stop_rx) = oneshot::channel();
                    let task = tokio::spawn(drive_reactor(device, async_fd, sink, stop_rx));
                    Acquisition::Reactor {
                        stop: stop_tx,
                        task,
                    }
                }
                Err(e) => {
                    warn!(
                        "[Device {}] Descriptor not pollable ({}), using a worker thread",
                        sink.device, e
                    );
                    Self::start_worker(device, sink)
                }
            },
            Readiness::Blocking => Self::start_worker(device, sink),
        }
    }

    fn start_worker(device: Box<dyn CaptureDevice>, sink: FrameSink) -> Acquisition {
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = oneshot::channel();
        let control = device.control();
        let name = format!("vbi-acq-{}", sink.device);
        let worker_stop = Arc::clone(&stop);
        let spawned = thread::Builder::new()
            .name(name)
            .spawn(move || run_worker(device, sink, worker_stop, done_tx));
        if let Err(e) = spawned {
            // The closure owning the device is dropped; stop() reports Killed.
            error!("Failed to spawn acquisition thread: {}", e);
        }
        Acquisition::Worker {
            stop,
            done: done_rx,
            control,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Acquisition::Reactor { .. } => "reactor",
            Acquisition::Worker { .. } => "worker",
        }
    }

    /// Stop acquisition, waiting at most `timeout` per phase.
    ///
    /// A worker that does not stop in time has its device interrupted; a
    /// reactor task that does not stop is aborted.
    pub async fn stop(self, timeout: Duration) -> StopOutcome {
        match self {
            Acquisition::Reactor { stop, mut task } => {
                let _ = stop.send(());
                match tokio::time::timeout(timeout, &mut task).await {
                    Ok(Ok(device)) => StopOutcome::Stopped(device),
                    Ok(Err(e)) => {
                        error!("Acquisition task ended abnormally: {}", e);
                        StopOutcome::Killed
                    }
                    Err(_) => {
                        warn!("Acquisition task did not stop within {:?}, aborting", timeout);
                        task.abort();
                        StopOutcome::Killed
                    }
                }
            }
            Acquisition::Worker {
                stop,
                mut done,
                control,
            } => {
                stop.store(true, Ordering::Release);
                match tokio::time::timeout(timeout, &mut done).await {
                    Ok(Ok(device)) => return StopOutcome::Stopped(device),
                    Ok(Err(_)) => return StopOutcome::Killed,
                    Err(_) => {}
                }

                warn!(
                    "Acquisition worker did not stop within {:?}, interrupting the device",
                    timeout
                );
                control.interrupt();
                match tokio::time::timeout(timeout, &mut done).await {
                    Ok(Ok(_interrupted)) => info!("Acquisition worker stopped after interrupt"),
                    Ok(Err(_)) => {}
                    Err(_) => error!("Acquisition worker still blocked, abandoning it"),
                }
                StopOutcome::Killed
            }
        }
    }
}

async fn drive_reactor(
    mut device: Box<dyn CaptureDevice>,
    fd: AsyncFd<DeviceFd>,
    mut sink: FrameSink,
    mut stop: oneshot::Receiver<()>,
) -> Box<dyn CaptureDevice> {
    debug!("[Device {}] Reactor acquisition started", sink.device);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            ready = fd.readable() => {
                let mut guard = match ready {
                    Ok(g) => g,
                    Err(e) => {
                        sink.fail(DeviceError::Io(e));
                        break;
                    }
                };
                let mut drained = false;
                let mut failed = false;
                for _ in 0..READ_BATCH {
                    match sink.capture(device.as_mut()) {
                        Ok(true) => {}
                        Ok(false) => {
                            drained = true;
                            break;
                        }
                        Err(e) => {
                            sink.fail(e);
                            failed = true;
                            break;
                        }
                    }
                }
                if failed {
                    break;
                }
                if drained {
                    guard.clear_ready();
                }
            }
        }
    }
    debug!("[Device {}] Reactor acquisition stopped", sink.device);
    device
}

fn run_worker(
    mut device: Box<dyn CaptureDevice>,
    mut sink: FrameSink,
    stop: Arc<AtomicBool>,
    done: oneshot::Sender<Box<dyn CaptureDevice>>,
) {
    debug!("[Device {}] Worker acquisition started", sink.device);
    while !stop.load(Ordering::Acquire) {
        match sink.capture(device.as_mut()) {
            Ok(true) => {}
            // A blocking device should not report this; avoid spinning if it does.
            Ok(false) => thread::sleep(Duration::from_millis(5)),
            Err(DeviceError::Interrupted) if stop.load(Ordering::Acquire) => break,
            Err(e) => {
                sink.fail(e);
                break;
            }
        }
    }
    debug!("[Device {}] Worker acquisition stopped", sink.device);
    let _ = done.send(device);
}
