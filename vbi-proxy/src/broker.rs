//! Broker context shared by all listeners and client sessions.
//!
//! The broker owns every device session and channel scheduler plus the
//! list of registered clients. All of it sits behind one async mutex, the
//! client-list lock. Buffer pools have their own lock, which is always
//! taken after this one and never held across an await point.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};
use parking_lot::Mutex as PoolMutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use vbi_proxy_protocol::{
    ChannelNotifyFlags, ChannelPriority, ChannelProfile, ClientFlags, SamplingParams, ServiceSet,
    Strictness, TokenReply, STRICTNESS_LEVELS,
};

use crate::config::{BrokerConfig, DeviceConfig};
use crate::device::{ioctl, BufferPool, ClientId, DeviceError, DeviceEvent, DeviceOpener, DeviceSession};
use crate::scheduler::{ChannelAction, ChannelScheduler};

/// Reasons a client request is refused. The display text is sent to the
/// client in reject messages.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("too many clients (limit {0})")]
    TooManyClients(usize),

    #[error("unknown client")]
    UnknownClient,

    #[error("no such device #{0}")]
    UnknownDevice(usize),

    #[error("client is not connected")]
    NotConnected,

    #[error("device captures {supported}-line video, client expects {requested} lines")]
    ScanningMismatch { requested: u16, supported: u16 },

    #[error("{0}")]
    Device(#[from] DeviceError),

    #[error("requested services {requested} are not available (granted {granted})")]
    ServicesUnavailable {
        requested: ServiceSet,
        granted: ServiceSet,
    },

    #[error("ioctl request 0x{0:08X} is not permitted")]
    IoctlDenied(u32),

    #[error("ioctl argument has {actual} bytes, request needs {expected}")]
    IoctlArgSize { expected: usize, actual: usize },

    #[error("another client holds the channel")]
    ChannelBusy,
}

/// Indications delivered to a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    TokenGranted,
    Reclaim,
    ChannelChanged {
        flags: ChannelNotifyFlags,
        scanning: u16,
    },
}

/// Handles given to a client session when it registers.
pub struct Registration {
    pub id: ClientId,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    /// Publish counter of the client's device.
    pub frames: watch::Receiver<u64>,
    pub pool: Arc<PoolMutex<BufferPool>>,
}

/// Reply to a passed-through ioctl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoctlResult {
    pub result: i32,
    pub errno: i32,
    pub arg: Vec<u8>,
}

struct ClientRecord {
    device: usize,
    name: String,
    pid: u32,
    flags: ClientFlags,
    connected: bool,
    requested: [ServiceSet; STRICTNESS_LEVELS],
    effective: ServiceSet,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ClientRecord {
    fn send(&self, event: SessionEvent) {
        // A closed receiver means the session is already tearing down.
        let _ = self.events.send(event);
    }
}

struct DeviceEntry {
    config: DeviceConfig,
    session: DeviceSession,
    channel: ChannelScheduler,
}

struct BrokerState {
    clients: BTreeMap<ClientId, ClientRecord>,
    devices: Vec<DeviceEntry>,
    shutting_down: bool,
}

pub struct Broker {
    config: BrokerConfig,
    state: Mutex<BrokerState>,
    /// Woken whenever a scheduling decision may have moved the channel deadline.
    timer: Notify,
    next_client: AtomicU64,
    pid: u32,
}

impl Broker {
    /// Create a broker for the configured devices. Devices are opened on
    /// demand. Acquisition failures are reported on the returned receiver
    /// and must be fed back through [`handle_device_event`](Self::handle_device_event).
    pub fn new(
        config: BrokerConfig,
        opener: Arc<dyn DeviceOpener>,
    ) -> (Arc<Broker>, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let devices = config
            .devices
            .iter()
            .enumerate()
            .map(|(index, dev)| DeviceEntry {
                config: dev.clone(),
                session: DeviceSession::new(
                    index,
                    dev.path.clone(),
                    Arc::clone(&opener),
                    config.buffer_count,
                    config.stop_timeout,
                    events_tx.clone(),
                ),
                channel: ChannelScheduler::new(config.reclaim_timeout),
            })
            .collect();

        let broker = Broker {
            config,
            state: Mutex::new(BrokerState {
                clients: BTreeMap::new(),
                devices,
                shutting_down: false,
            }),
            timer: Notify::new(),
            next_client: AtomicU64::new(1),
            pid: std::process::id(),
        };
        (Arc::new(broker), events_rx)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Register a new connection on `device`.
    pub async fn register(&self, device: usize) -> Result<Registration, BrokerError> {
        let mut state = self.state.lock().await;
        if device >= state.devices.len() {
            return Err(BrokerError::UnknownDevice(device));
        }
        if state.clients.len() >= self.config.max_clients {
            return Err(BrokerError::TooManyClients(self.config.max_clients));
        }

        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        state.clients.insert(
            id,
            ClientRecord {
                device,
                name: String::new(),
                pid: 0,
                flags: ClientFlags::default(),
                connected: false,
                requested: [ServiceSet::EMPTY; STRICTNESS_LEVELS],
                effective: ServiceSet::EMPTY,
                events: events_tx,
            },
        );
        let entry = &mut state.devices[device];
        entry.channel.add_client(id);
        debug!("[Client {}] Registered on {}", id, entry.config.path);

        Ok(Registration {
            id,
            events: events_rx,
            frames: entry.session.subscribe(),
            pool: Arc::clone(entry.session.pool()),
        })
    }

    /// Complete the handshake of a registered client.
    #[allow(clippy::too_many_arguments)]
    pub async fn connect(
        &self,
        id: ClientId,
        name: &str,
        pid: u32,
        flags: ClientFlags,
        scanning: u16,
        services: ServiceSet,
        strictness: Strictness,
    ) -> Result<(ServiceSet, SamplingParams), BrokerError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let record = state.clients.get_mut(&id).ok_or(BrokerError::UnknownClient)?;
        let entry = &state.devices[record.device];
        if scanning != 0 && scanning != entry.config.scanning {
            return Err(BrokerError::ScanningMismatch {
                requested: scanning,
                supported: entry.config.scanning,
            });
        }

        record.connected = true;
        record.name = name.to_string();
        record.pid = pid;
        record.flags = flags;
        entry
            .session
            .pool()
            .lock()
            .attach(id, ServiceSet::EMPTY, flags.contains(ClientFlags::RAW_DATA));
        info!(
            "[Client {}] Connected: \"{}\" (pid {}) on {}",
            id, name, pid, entry.config.path
        );

        if services.is_empty() {
            return Ok((ServiceSet::EMPTY, entry.session.params()));
        }
        Self::update_services(state, id, true, true, strictness, services).await
    }

    /// Add or replace the services requested by a client.
    pub async fn request_services(
        &self,
        id: ClientId,
        reset: bool,
        commit: bool,
        strictness: Strictness,
        services: ServiceSet,
    ) -> Result<(ServiceSet, SamplingParams), BrokerError> {
        let mut guard = self.state.lock().await;
        Self::update_services(&mut guard, id, reset, commit, strictness, services).await
    }

    async fn update_services(
        state: &mut BrokerState,
        id: ClientId,
        reset: bool,
        commit: bool,
        strictness: Strictness,
        services: ServiceSet,
    ) -> Result<(ServiceSet, SamplingParams), BrokerError> {
        let record = state.clients.get_mut(&id).ok_or(BrokerError::UnknownClient)?;
        if !record.connected {
            return Err(BrokerError::NotConnected);
        }
        if reset {
            record.requested = [ServiceSet::EMPTY; STRICTNESS_LEVELS];
        }
        record.requested[strictness.index()] |= services;
        let device = record.device;
        debug!(
            "[Client {}] Service request {} at {:?} (reset: {}, commit: {})",
            id, services, strictness, reset, commit
        );

        if commit {
            Self::renegotiate(state, device).await?;
        }

        let record = &state.clients[&id];
        let params = state.devices[device].session.params();
        let requested = ServiceSet::union_all(&record.requested);
        let strict = record.requested[Strictness::Strict.index()];
        // A bare commit stands for everything recorded so far.
        let asked = if services.is_empty() { requested } else { services };
        if commit
            && ((!asked.is_empty() && !asked.intersects(record.effective))
                || !record.effective.contains(strict))
        {
            return Err(BrokerError::ServicesUnavailable {
                requested,
                granted: record.effective,
            });
        }
        Ok((record.effective, params))
    }

    /// Reconfigure `device` for the union of its clients' requests and
    /// recompute every client's effective services.
    async fn renegotiate(state: &mut BrokerState, device: usize) -> Result<(), BrokerError> {
        if state.shutting_down {
            return Ok(());
        }
        let mut aggregate = [ServiceSet::EMPTY; STRICTNESS_LEVELS];
        for record in state.clients.values() {
            if record.device == device && record.connected {
                for (level, services) in aggregate.iter_mut().zip(record.requested.iter()) {
                    *level |= *services;
                }
            }
        }

        let entry = &mut state.devices[device];
        match entry.session.apply_services(aggregate).await {
            Ok(negotiated) => {
                let granted = negotiated.map_or(ServiceSet::EMPTY, |n| n.services);
                let mut pool = entry.session.pool().lock();
                for (id, record) in state.clients.iter_mut() {
                    if record.device == device && record.connected {
                        record.effective = ServiceSet::union_all(&record.requested) & granted;
                        pool.update_services(*id, record.effective);
                    }
                }
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                Self::fail_device(state, device, &reason).await;
                Err(e.into())
            }
        }
    }

    /// Tear down a device after an error. Clients keep their requests and
    /// see their effective services drop to nothing.
    async fn fail_device(state: &mut BrokerState, device: usize, reason: &str) {
        let entry = &mut state.devices[device];
        error!("[Device {}] {} failed: {}", device, entry.config.path, reason);
        entry.session.close().await;
        let scanning = entry.config.scanning;
        let mut pool = entry.session.pool().lock();
        for (id, record) in state.clients.iter_mut() {
            if record.device == device && record.connected {
                record.effective = ServiceSet::EMPTY;
                pool.update_services(*id, ServiceSet::EMPTY);
                record.send(SessionEvent::ChannelChanged {
                    flags: ChannelNotifyFlags::FAIL,
                    scanning,
                });
            }
        }
    }

    pub async fn handle_device_event(&self, event: DeviceEvent) {
        match event {
            DeviceEvent::Failed { device, error } => {
                let mut guard = self.state.lock().await;
                if device < guard.devices.len() {
                    Self::fail_device(&mut guard, device, &error).await;
                }
            }
        }
    }

    pub async fn request_token(
        &self,
        id: ClientId,
        priority: ChannelPriority,
        profile: ChannelProfile,
    ) -> Result<TokenReply, BrokerError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let device = Self::connected_device(state, id)?;
        let entry = &mut state.devices[device];
        let (reply, actions) = entry
            .channel
            .request_token(id, priority, profile, Instant::now());
        Self::dispatch(&state.clients, &mut entry.channel, actions);
        self.timer.notify_one();
        Ok(reply)
    }

    /// Handle a channel notification. FLUSH and NORM are passed on to the
    /// device's other clients.
    pub async fn notify_channel(
        &self,
        id: ClientId,
        flags: ChannelNotifyFlags,
        scanning: u16,
    ) -> Result<(), BrokerError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let device = Self::connected_device(state, id)?;
        let entry = &mut state.devices[device];

        if flags.intersects(ChannelNotifyFlags::TOKEN | ChannelNotifyFlags::RELEASE) {
            let actions = entry.channel.notify(id, flags, Instant::now());
            Self::dispatch(&state.clients, &mut entry.channel, actions);
            self.timer.notify_one();
        }
        if flags.contains(ChannelNotifyFlags::FLUSH) {
            debug!("[Client {}] Channel switched, flushing {}", id, entry.config.path);
            entry.session.flush();
        }

        let changed = ChannelNotifyFlags(
            flags.0 & (ChannelNotifyFlags::FLUSH | ChannelNotifyFlags::NORM).0,
        );
        if changed.0 != 0 {
            for (other, record) in state.clients.iter() {
                if *other != id
                    && record.device == device
                    && record.connected
                    && !record.flags.contains(ClientFlags::NO_STATUS_IND)
                {
                    record.send(SessionEvent::ChannelChanged {
                        flags: changed,
                        scanning,
                    });
                }
            }
        }
        Ok(())
    }

    pub async fn confirm_reclaim(&self, id: ClientId) -> Result<(), BrokerError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let device = Self::connected_device(state, id)?;
        let entry = &mut state.devices[device];
        let actions = entry.channel.reclaim_confirmed(id, Instant::now());
        Self::dispatch(&state.clients, &mut entry.channel, actions);
        self.timer.notify_one();
        Ok(())
    }

    /// Pass a permitted control request through to the device.
    pub async fn ioctl(
        &self,
        id: ClientId,
        request: u32,
        mut arg: Vec<u8>,
    ) -> Result<IoctlResult, BrokerError> {
        let permission = ioctl::lookup(request).ok_or(BrokerError::IoctlDenied(request))?;
        let expected = ioctl::arg_size(request);
        if arg.len() != expected {
            return Err(BrokerError::IoctlArgSize {
                expected,
                actual: arg.len(),
            });
        }

        let guard = self.state.lock().await;
        let device = Self::connected_device(&guard, id)?;
        let entry = &guard.devices[device];
        if permission.changes_channel && !entry.channel.may_switch(id) {
            return Err(BrokerError::ChannelBusy);
        }
        debug!("[Client {}] ioctl {}", id, permission.name);
        Ok(match entry.session.ioctl(request, &mut arg) {
            Ok(result) => IoctlResult {
                result,
                errno: 0,
                arg,
            },
            Err(errno) => IoctlResult {
                result: -1,
                errno: errno as i32,
                arg,
            },
        })
    }

    /// Remove a client. Calling this more than once is harmless.
    pub async fn unregister(&self, id: ClientId) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let record = match state.clients.remove(&id) {
            Some(r) => r,
            None => return,
        };
        let device = record.device;
        let entry = &mut state.devices[device];

        let dropped = entry.session.pool().lock().detach(id);
        let actions = entry.channel.remove_client(id, Instant::now());
        Self::dispatch(&state.clients, &mut entry.channel, actions);
        self.timer.notify_one();

        if record.connected {
            info!(
                "[Client {}] Disconnected: \"{}\" (pid {}, dropped frames: {})",
                id,
                record.name,
                record.pid,
                dropped.unwrap_or(0)
            );
        } else {
            debug!("[Client {}] Unregistered before connecting", id);
        }

        if !ServiceSet::union_all(&record.requested).is_empty() {
            if let Err(e) = Self::renegotiate(state, device).await {
                warn!("[Device {}] Renegotiation after client {} left failed: {}", device, id, e);
            }
        }
    }

    /// Re-run channel scheduling on every device.
    pub async fn on_channel_timer(&self) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let now = Instant::now();
        for entry in state.devices.iter_mut() {
            let actions = entry.channel.schedule(now);
            Self::dispatch(&state.clients, &mut entry.channel, actions);
        }
    }

    /// Soonest channel scheduling deadline across all devices.
    pub async fn next_channel_deadline(&self) -> Option<Instant> {
        let guard = self.state.lock().await;
        let now = Instant::now();
        guard
            .devices
            .iter()
            .filter_map(|entry| entry.channel.next_deadline(now))
            .min()
    }

    /// Resolves when a scheduling decision may have changed the deadline.
    pub async fn channel_timer_changed(&self) {
        self.timer.notified().await;
    }

    /// Close every device. Later requests no longer reopen them.
    pub async fn shutdown(&self) {
        let mut guard = self.state.lock().await;
        guard.shutting_down = true;
        for entry in guard.devices.iter_mut() {
            entry.session.close().await;
        }
        info!("Broker shut down ({} client(s) still registered)", guard.clients.len());
    }

    fn connected_device(state: &BrokerState, id: ClientId) -> Result<usize, BrokerError> {
        let record = state.clients.get(&id).ok_or(BrokerError::UnknownClient)?;
        if !record.connected {
            return Err(BrokerError::NotConnected);
        }
        Ok(record.device)
    }

    fn dispatch(
        clients: &BTreeMap<ClientId, ClientRecord>,
        channel: &mut ChannelScheduler,
        actions: Vec<ChannelAction>,
    ) {
        for action in actions {
            match action {
                ChannelAction::Grant(id) => {
                    if let Some(record) = clients.get(&id) {
                        record.send(SessionEvent::TokenGranted);
                    }
                    channel.confirm_grant(id);
                }
                ChannelAction::Reclaim(id) => {
                    if let Some(record) = clients.get(&id) {
                        record.send(SessionEvent::Reclaim);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    use nix::errno::Errno;
    use vbi_proxy_protocol::{sub_priority, SlicedFrame, TokenStatus};

    use crate::device::{CaptureDevice, DeviceControl, Negotiated, ReadStatus, Readiness};

    struct Control(AtomicBool);

    impl DeviceControl for Control {
        fn ioctl(&self, _request: u32, arg: &mut [u8]) -> Result<i32, Errno> {
            if let Some(first) = arg.first_mut() {
                *first = 1;
            }
            Ok(0)
        }
        fn interrupt(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    struct IdleDevice(Arc<Control>);

    impl CaptureDevice for IdleDevice {
        fn negotiate(&mut self, r: &[ServiceSet; STRICTNESS_LEVELS]) -> Result<Negotiated, DeviceError> {
            Ok(Negotiated {
                services: ServiceSet::union_all(r) & ServiceSet::ALL_625,
                params: SamplingParams::pal(),
            })
        }
        fn read_frame(&mut self, _frame: &mut SlicedFrame) -> Result<ReadStatus, DeviceError> {
            std::thread::sleep(Duration::from_millis(2));
            if self.0 .0.load(Ordering::SeqCst) {
                return Err(DeviceError::Interrupted);
            }
            Ok(ReadStatus::Pending)
        }
        fn readiness(&self) -> Readiness {
            Readiness::Blocking
        }
        fn control(&self) -> Arc<dyn DeviceControl> {
            self.0.clone()
        }
    }

    #[derive(Default)]
    struct Opener {
        opens: AtomicUsize,
    }

    impl DeviceOpener for Opener {
        fn open(&self, _path: &str, _buffer_count: usize) -> Result<Box<dyn CaptureDevice>, DeviceError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(IdleDevice(Arc::new(Control(AtomicBool::new(false))))))
        }
    }

    fn broker(max_clients: usize) -> (Arc<Broker>, Arc<Opener>) {
        let opener = Arc::new(Opener::default());
        let config = BrokerConfig {
            max_clients,
            stop_timeout: Duration::from_millis(200),
            ..BrokerConfig::default()
        };
        let (broker, _events) = Broker::new(config, opener.clone());
        (broker, opener)
    }

    async fn connected(broker: &Broker, services: ServiceSet, flags: ClientFlags) -> Registration {
        let reg = broker.register(0).await.unwrap();
        broker
            .connect(reg.id, "test", 1, flags, 0, services, Strictness::Default)
            .await
            .unwrap();
        reg
    }

    #[tokio::test]
    async fn test_shared_device_opens_once() {
        let (broker, opener) = broker(10);
        let a = connected(&broker, ServiceSet::TELETEXT_B, ClientFlags::default()).await;
        let b = broker.register(0).await.unwrap();
        let (granted, params) = broker
            .connect(b.id, "b", 2, ClientFlags::default(), 625, ServiceSet::TELETEXT_B, Strictness::Default)
            .await
            .unwrap();
        assert_eq!(granted, ServiceSet::TELETEXT_B);
        assert_eq!(params, SamplingParams::pal());
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);

        broker.unregister(a.id).await;
        broker.unregister(a.id).await;
        broker.unregister(b.id).await;
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_unavailable_services_are_rejected() {
        let (broker, _) = broker(10);
        let reg = connected(&broker, ServiceSet::EMPTY, ClientFlags::default()).await;
        let err = broker
            .request_services(reg.id, true, true, Strictness::Default, ServiceSet::CAPTION_525)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ServicesUnavailable { .. }));

        // Uncommitted requests are only recorded.
        let (granted, _) = broker
            .request_services(reg.id, false, false, Strictness::Default, ServiceSet::VPS)
            .await
            .unwrap();
        assert_eq!(granted, ServiceSet::EMPTY);
        let (granted, _) = broker
            .request_services(reg.id, false, true, Strictness::Default, ServiceSet::EMPTY)
            .await
            .unwrap();
        assert_eq!(granted, ServiceSet::VPS);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_added_unavailable_service_is_rejected() {
        let (broker, _) = broker(10);
        let reg = connected(&broker, ServiceSet::TELETEXT_B, ClientFlags::default()).await;

        let err = broker
            .request_services(reg.id, false, true, Strictness::Default, ServiceSet::CAPTION_525)
            .await
            .unwrap_err();
        match err {
            BrokerError::ServicesUnavailable { granted, .. } => {
                assert_eq!(granted, ServiceSet::TELETEXT_B)
            }
            other => panic!("unexpected {:?}", other),
        }

        // Partly available additions are confirmed with what the device has.
        let (granted, _) = broker
            .request_services(
                reg.id,
                false,
                true,
                Strictness::Default,
                ServiceSet::VPS | ServiceSet::CAPTION_525,
            )
            .await
            .unwrap();
        assert_eq!(granted, ServiceSet::TELETEXT_B | ServiceSet::VPS);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_connection_limit_and_scanning() {
        let (broker, _) = broker(1);
        let reg = broker.register(0).await.unwrap();
        assert!(matches!(broker.register(0).await, Err(BrokerError::TooManyClients(1))));
        assert!(matches!(broker.register(7).await, Err(BrokerError::UnknownDevice(7))));
        let err = broker
            .connect(reg.id, "ntsc", 1, ClientFlags::default(), 525, ServiceSet::EMPTY, Strictness::Default)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ScanningMismatch { requested: 525, supported: 625 }));
    }

    #[tokio::test]
    async fn test_ioctl_permissions() {
        let (broker, _) = broker(10);
        let mut a = connected(&broker, ServiceSet::VPS, ClientFlags::default()).await;
        let b = connected(&broker, ServiceSet::VPS, ClientFlags::default()).await;

        assert!(matches!(
            broker.ioctl(a.id, 0xdead_beef, vec![]).await,
            Err(BrokerError::IoctlDenied(0xdead_beef))
        ));
        assert!(matches!(
            broker.ioctl(a.id, 0x402c_5639, vec![0; 4]).await,
            Err(BrokerError::IoctlArgSize { expected: 44, actual: 4 })
        ));

        let profile = ChannelProfile {
            is_valid: true,
            sub_prio: sub_priority::UPDATE,
            min_duration: 60,
            exp_duration: 60,
        };
        let reply = broker.request_token(a.id, ChannelPriority::Background, profile).await.unwrap();
        assert_eq!(reply.status, TokenStatus::Granted);
        assert!(a.events.try_recv().is_err());

        assert!(matches!(
            broker.ioctl(b.id, 0x402c_5639, vec![0; 44]).await,
            Err(BrokerError::ChannelBusy)
        ));
        let reply = broker.ioctl(a.id, 0x402c_5639, vec![0; 44]).await.unwrap();
        assert_eq!(reply.result, 0);
        assert_eq!(reply.arg[0], 1);
        // Queries never need the token.
        assert!(broker.ioctl(b.id, 0xc02c_5638, vec![0; 44]).await.is_ok());
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_reaches_other_clients() {
        let (broker, _) = broker(10);
        let mut a = connected(&broker, ServiceSet::VPS, ClientFlags::default()).await;
        let mut b = connected(&broker, ServiceSet::VPS, ClientFlags::default()).await;
        let mut quiet = connected(&broker, ServiceSet::VPS, ClientFlags::NO_STATUS_IND).await;

        broker
            .notify_channel(a.id, ChannelNotifyFlags::FLUSH, 625)
            .await
            .unwrap();
        assert_eq!(
            b.events.try_recv().unwrap(),
            SessionEvent::ChannelChanged {
                flags: ChannelNotifyFlags::FLUSH,
                scanning: 625
            }
        );
        assert!(a.events.try_recv().is_err());
        assert!(quiet.events.try_recv().is_err());
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_device_failure_keeps_requests() {
        let (broker, opener) = broker(10);
        let mut a = connected(&broker, ServiceSet::VPS, ClientFlags::default()).await;

        broker
            .handle_device_event(DeviceEvent::Failed {
                device: 0,
                error: "gone".into(),
            })
            .await;
        match a.events.try_recv().unwrap() {
            SessionEvent::ChannelChanged { flags, .. } => {
                assert!(flags.contains(ChannelNotifyFlags::FAIL))
            }
            other => panic!("unexpected {:?}", other),
        }

        // The next committed request reopens the device with the old request.
        let (granted, _) = broker
            .request_services(a.id, false, true, Strictness::Default, ServiceSet::EMPTY)
            .await
            .unwrap();
        assert_eq!(granted, ServiceSet::VPS);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_holder_leaving_grants_next() {
        let (broker, _) = broker(10);
        let a = connected(&broker, ServiceSet::VPS, ClientFlags::default()).await;
        let mut b = connected(&broker, ServiceSet::VPS, ClientFlags::default()).await;
        let profile = ChannelProfile {
            is_valid: true,
            sub_prio: sub_priority::CHECK,
            min_duration: 60,
            exp_duration: 60,
        };
        broker.request_token(a.id, ChannelPriority::Background, profile).await.unwrap();
        let reply = broker.request_token(b.id, ChannelPriority::Background, profile).await.unwrap();
        assert_eq!(reply.status, TokenStatus::Pending);
        assert!(broker.next_channel_deadline().await.is_some());

        broker.unregister(a.id).await;
        assert_eq!(b.events.try_recv().unwrap(), SessionEvent::TokenGranted);
        broker.shutdown().await;
    }
}
