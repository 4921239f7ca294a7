//! Capture backend reading pre-sliced frames from a file, FIFO or character device.
//!
//! The source carries a sequence of framed SLICED_IND messages as produced by
//! an external slicer. FIFOs and character devices are non-blocking and
//! driven by readiness. Regular files cannot be polled, so they are read by
//! the acquisition worker, paced at the field rate and rewound at the end.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use vbi_proxy_protocol::{
    decode_server_message, FrameBuffer, MessageType, SamplingParams, ServerMessage, ServiceSet,
    SlicedFrame, Strictness, SCANNING_525, STRICTNESS_LEVELS,
};

use super::backend::{
    CaptureDevice, DeviceControl, DeviceError, DeviceOpener, Negotiated, ReadStatus, Readiness,
};

const READ_CHUNK: usize = 16 * 1024;

/// Opens [`StreamDevice`]s.
pub struct StreamOpener {
    scanning: u16,
    per_device: HashMap<String, u16>,
    max_message_size: u32,
}

impl StreamOpener {
    pub fn new(scanning: u16, max_message_size: u32) -> Self {
        Self {
            scanning,
            per_device: HashMap::new(),
            max_message_size,
        }
    }

    /// Override the scanning of one device path.
    pub fn with_scanning(mut self, path: impl Into<String>, scanning: u16) -> Self {
        self.per_device.insert(path.into(), scanning);
        self
    }
}

impl DeviceOpener for StreamOpener {
    fn open(&self, path: &str, buffer_count: usize) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        let scanning = self.per_device.get(path).copied().unwrap_or(self.scanning);
        let device = StreamDevice::open(path, scanning, self.max_message_size)?;
        info!(
            "Opened {} ({}, {} buffers)",
            path,
            if device.pollable { "pollable" } else { "paced file" },
            buffer_count
        );
        Ok(Box::new(device))
    }
}

struct StreamControl {
    interrupted: AtomicBool,
}

impl DeviceControl for StreamControl {
    fn ioctl(&self, _request: u32, _arg: &mut [u8]) -> Result<i32, Errno> {
        Err(Errno::ENOTTY)
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }
}

pub struct StreamDevice {
    path: String,
    file: File,
    pollable: bool,
    frames: FrameBuffer,
    params: SamplingParams,
    granted: ServiceSet,
    next_due: Option<Instant>,
    control: Arc<StreamControl>,
}

impl StreamDevice {
    pub fn open(path: &str, scanning: u16, max_message_size: u32) -> Result<Self, DeviceError> {
        let open_err = |source| DeviceError::Open {
            path: path.to_string(),
            source,
        };
        let file_type = std::fs::metadata(path).map_err(open_err)?.file_type();
        let pollable = file_type.is_fifo() || file_type.is_char_device();

        let mut options = OpenOptions::new();
        options.read(true);
        if pollable {
            options.custom_flags(OFlag::O_NONBLOCK.bits());
        }
        if file_type.is_fifo() {
            // Holding a write end keeps reads from hitting EOF between writers.
            options.write(true);
        }
        let file = options.open(path).map_err(open_err)?;

        Ok(Self {
            path: path.to_string(),
            file,
            pollable,
            frames: FrameBuffer::new(max_message_size),
            params: SamplingParams::for_scanning(scanning),
            granted: ServiceSet::EMPTY,
            next_due: None,
            control: Arc::new(StreamControl {
                interrupted: AtomicBool::new(false),
            }),
        })
    }

    fn check_interrupted(&self) -> Result<(), DeviceError> {
        if self.control.interrupted.load(Ordering::Acquire) {
            return Err(DeviceError::Interrupted);
        }
        Ok(())
    }

    fn field_period(&self) -> Duration {
        if self.params.scanning == SCANNING_525 {
            Duration::from_micros(33_367)
        } else {
            Duration::from_millis(40)
        }
    }

    /// Wait for the next field slot of a paced file.
    fn pace(&mut self) -> Result<(), DeviceError> {
        if let Some(due) = self.next_due {
            loop {
                self.check_interrupted()?;
                let now = Instant::now();
                if now >= due {
                    break;
                }
                thread::sleep((due - now).min(Duration::from_millis(5)));
            }
        }
        let period = self.field_period();
        let now = Instant::now();
        // Resynchronise instead of bursting after a stall.
        let base = match self.next_due {
            Some(due) if due + period > now => due,
            _ => now,
        };
        self.next_due = Some(base + period);
        Ok(())
    }

    /// Next complete record, or `None` if a non-blocking source has no more data.
    fn next_record(&mut self) -> Result<Option<SlicedFrame>, DeviceError> {
        let mut rewound = false;
        loop {
            self.check_interrupted()?;
            if let Some(frame) = self
                .frames
                .next_frame()
                .map_err(|e| DeviceError::Format(e.to_string()))?
            {
                if frame.header.message_type != MessageType::SlicedInd {
                    return Err(DeviceError::Format(format!(
                        "unexpected {:?} record",
                        frame.header.message_type
                    )));
                }
                return match decode_server_message(MessageType::SlicedInd, frame.body) {
                    Ok(ServerMessage::SlicedInd(sliced)) => Ok(Some(sliced)),
                    Ok(_) => Err(DeviceError::Format("not a sliced record".into())),
                    Err(e) => Err(DeviceError::Format(e.to_string())),
                };
            }

            let mut chunk = [0u8; READ_CHUNK];
            match self.file.read(&mut chunk) {
                Ok(0) if self.pollable => return Err(DeviceError::EndOfStream),
                Ok(0) => {
                    if rewound {
                        return Err(DeviceError::EndOfStream);
                    }
                    debug!("{}: end of recording, rewinding", self.path);
                    self.file.seek(SeekFrom::Start(0))?;
                    self.frames.clear();
                    rewound = true;
                }
                Ok(n) => self.frames.extend(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

impl CaptureDevice for StreamDevice {
    fn negotiate(
        &mut self,
        requested: &[ServiceSet; STRICTNESS_LEVELS],
    ) -> Result<Negotiated, DeviceError> {
        let supported = ServiceSet::supported_by(self.params.scanning);
        let mut granted = (requested[Strictness::Lenient.index()]
            | requested[Strictness::Default.index()])
            & supported;
        // Strict requests also need a synchronous sampling clock.
        if self.params.synchronous {
            granted |= requested[Strictness::Strict.index()] & supported;
        }
        self.granted = granted;
        self.next_due = None;
        debug!(
            "{}: negotiated services {} of {}",
            self.path,
            granted,
            ServiceSet::union_all(requested)
        );
        Ok(Negotiated {
            services: granted,
            params: self.params,
        })
    }

    fn read_frame(&mut self, frame: &mut SlicedFrame) -> Result<ReadStatus, DeviceError> {
        if !self.pollable {
            self.pace()?;
        }
        let record = match self.next_record()? {
            Some(r) => r,
            None => return Ok(ReadStatus::Pending),
        };

        frame.clear();
        frame.timestamp = now_seconds();
        let granted = self.granted;
        frame
            .lines
            .extend(record.lines.into_iter().filter(|l| granted.intersects(l.service())));
        frame.raw = record.raw;
        Ok(ReadStatus::Frame)
    }

    fn readiness(&self) -> Readiness {
        if self.pollable {
            Readiness::Fd(self.file.as_raw_fd())
        } else {
            Readiness::Blocking
        }
    }

    fn control(&self) -> Arc<dyn DeviceControl> {
        self.control.clone()
    }
}
