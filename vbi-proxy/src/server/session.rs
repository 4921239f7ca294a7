//! Client session handling.
//!
//! Each connection runs one session task. Inbound and outbound each carry
//! at most one message at a time: while a reply cannot be queued the next
//! request is not read. Outgoing messages are picked in priority order:
//! indications, then the reply to the pending request, then captured
//! frames.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex as PoolMutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use vbi_proxy_protocol::{
    decode_client_message, encode_server_message, ClientFlags, ClientMessage, FrameBuffer,
    FrameWriter, MessageType, ProtocolError, ServerMessage, ServiceSet, PROTOCOL_VERSION_MAJOR,
    PROTOCOL_VERSION_MINOR,
};

use crate::broker::{Broker, BrokerError, Registration, SessionEvent};
use crate::device::{BufferPool, ClientId};

const TICK: Duration = Duration::from_secs(1);

/// Session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for a connect or daemon-pid request.
    WaitConnect,
    /// Connected; frames and indications are forwarded.
    Forward,
    /// Flushing a final reply before closing.
    WaitClose,
    Closed,
}

/// Why a session ended abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("unexpected {0:?} in state {1:?}")]
    Violation(MessageType, SessionState),

    #[error("{0}")]
    Broker(#[from] BrokerError),

    #[error("{0} timed out")]
    Timeout(&'static str),
}

/// A client session.
pub struct ClientSession<S> {
    id: ClientId,
    peer: String,
    broker: Arc<Broker>,
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    inbound: FrameBuffer,
    outbound: FrameWriter,
    state: SessionState,
    /// Decoded request waiting for the outbound slot.
    request: Option<ClientMessage>,
    indications: VecDeque<ServerMessage>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    events_open: bool,
    frames: watch::Receiver<u64>,
    /// Frames may be pending in the pool.
    frames_ready: bool,
    pool: Arc<PoolMutex<BufferPool>>,
    flags: ClientFlags,
    started: Instant,
    last_io: Instant,
    frames_sent: u64,
    shutdown: watch::Receiver<bool>,
}

impl<S> ClientSession<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(
        registration: Registration,
        stream: S,
        peer: String,
        broker: Arc<Broker>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let now = Instant::now();
        let max_message_size = broker.config().max_message_size;
        Self {
            id: registration.id,
            peer,
            broker,
            reader,
            writer,
            inbound: FrameBuffer::new(max_message_size),
            outbound: FrameWriter::new(),
            state: SessionState::WaitConnect,
            request: None,
            indications: VecDeque::new(),
            events: registration.events,
            events_open: true,
            frames: registration.frames,
            frames_ready: false,
            pool: registration.pool,
            flags: ClientFlags::default(),
            started: now,
            last_io: now,
            frames_sent: 0,
            shutdown,
        }
    }

    /// Serve the connection until it closes, then unregister from the broker.
    pub async fn run(mut self) {
        info!("[Client {}] New connection from {}", self.id, self.peer);
        match self.serve().await {
            Ok(()) => info!(
                "[Client {}] Connection closed ({} frames sent)",
                self.id, self.frames_sent
            ),
            Err(SessionError::Io(e)) if is_disconnect(&e) => {
                info!("[Client {}] Peer disconnected", self.id)
            }
            Err(e) => warn!("[Client {}] Connection dropped: {}", self.id, e),
        }
        self.state = SessionState::Closed;
        self.broker.unregister(self.id).await;
    }

    async fn serve(&mut self) -> Result<(), SessionError> {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            self.fill_outbound().await?;
            if self.state == SessionState::Closed {
                return Ok(());
            }
            if self.state == SessionState::WaitClose && !self.outbound.is_pending() {
                let _ = self.writer.shutdown().await;
                return Ok(());
            }

            let can_read = self.request.is_none() && self.state != SessionState::WaitClose;
            let writing = self.outbound.is_pending();
            let want_frames = self.state == SessionState::Forward && !self.frames_ready;

            tokio::select! {
                res = self.reader.read_buf(self.inbound.buffer_mut()), if can_read => {
                    if res? == 0 {
                        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                    }
                    self.last_io = Instant::now();
                    self.parse_request()?;
                }
                res = self.writer.write(self.outbound.remaining()), if writing => {
                    let n = res?;
                    if n == 0 {
                        return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                    }
                    self.outbound.advance(n);
                    self.last_io = Instant::now();
                }
                event = self.events.recv(), if self.events_open => {
                    match event {
                        Some(event) => self.push_indication(event),
                        None => self.events_open = false,
                    }
                }
                res = self.frames.changed(), if want_frames => {
                    if res.is_err() {
                        return Ok(());
                    }
                    self.frames.borrow_and_update();
                    self.frames_ready = true;
                }
                _ = tick.tick() => self.check_timeouts()?,
                _ = self.shutdown.changed() => {
                    debug!("[Client {}] Closing for daemon shutdown", self.id);
                    return Ok(());
                }
            }
        }
    }

    /// Decode the next buffered request if none is waiting.
    fn parse_request(&mut self) -> Result<(), SessionError> {
        if self.request.is_some() {
            return Ok(());
        }
        if let Some(frame) = self.inbound.next_frame()? {
            let msg = decode_client_message(frame.header.message_type, frame.body)?;
            self.request = Some(msg);
        }
        Ok(())
    }

    /// Queue the next outgoing message if the outbound slot is free.
    async fn fill_outbound(&mut self) -> Result<(), SessionError> {
        while !self.outbound.is_pending() && self.state != SessionState::Closed {
            if let Some(msg) = self.indications.pop_front() {
                self.queue(&msg)?;
                continue;
            }

            if let Some(request) = self.request.take() {
                let reply = self.handle_message(request).await?;
                if let Some(reply) = reply {
                    self.queue(&reply)?;
                }
                if self.state != SessionState::WaitClose {
                    self.parse_request()?;
                }
                continue;
            }

            if self.state == SessionState::Forward && self.frames_ready {
                let frame = self.pool.lock().consume(self.id);
                match frame {
                    Some(frame) => {
                        self.queue(&ServerMessage::SlicedInd(frame))?;
                        self.frames_sent += 1;
                        continue;
                    }
                    None => self.frames_ready = false,
                }
            }
            break;
        }
        Ok(())
    }

    fn queue(&mut self, msg: &ServerMessage) -> Result<(), SessionError> {
        let bytes = encode_server_message(msg)?;
        self.outbound.queue(bytes)?;
        Ok(())
    }

    fn push_indication(&mut self, event: SessionEvent) {
        if self.state != SessionState::Forward {
            return;
        }
        let msg = match event {
            SessionEvent::TokenGranted => ServerMessage::ChnTokenInd,
            SessionEvent::Reclaim => ServerMessage::ChnReclaimReq,
            SessionEvent::ChannelChanged { flags, scanning } => {
                ServerMessage::ChnChangeInd { flags, scanning }
            }
        };
        self.indications.push_back(msg);
    }

    fn check_timeouts(&self) -> Result<(), SessionError> {
        let config = self.broker.config();
        let now = Instant::now();
        if self.state == SessionState::WaitConnect
            && now.duration_since(self.started) > config.connect_timeout
        {
            return Err(SessionError::Timeout("handshake"));
        }
        if self.outbound.is_pending()
            && !self.flags.contains(ClientFlags::NO_TIMEOUTS)
            && now.duration_since(self.last_io) > config.write_timeout
        {
            return Err(SessionError::Timeout("write"));
        }
        Ok(())
    }

    async fn handle_message(&mut self, msg: ClientMessage) -> Result<Option<ServerMessage>, SessionError> {
        match self.state {
            SessionState::WaitConnect => self.handle_handshake(msg).await,
            SessionState::Forward => self.handle_request(msg).await,
            state => Err(SessionError::Violation(msg.message_type(), state)),
        }
    }

    async fn handle_handshake(&mut self, msg: ClientMessage) -> Result<Option<ServerMessage>, SessionError> {
        match msg {
            ClientMessage::ConnectReq {
                handshake,
                client_name,
                pid,
                flags,
                scanning,
                services,
                strictness,
            } => {
                if let Some(reason) = handshake.incompatibility() {
                    warn!("[Client {}] Rejecting \"{}\": {}", self.id, client_name, reason);
                    self.state = SessionState::WaitClose;
                    return Ok(Some(ServerMessage::ConnectRej { reason }));
                }
                let connected = self
                    .broker
                    .connect(self.id, &client_name, pid, flags, scanning, services, strictness)
                    .await;
                match connected {
                    Ok((services, params)) => {
                        self.flags = flags;
                        self.state = SessionState::Forward;
                        self.frames.borrow_and_update();
                        self.frames_ready = true;
                        Ok(Some(ServerMessage::ConnectCnf {
                            version_major: PROTOCOL_VERSION_MAJOR,
                            version_minor: PROTOCOL_VERSION_MINOR,
                            daemon_pid: self.broker.pid(),
                            services,
                            params,
                        }))
                    }
                    Err(e) => {
                        warn!("[Client {}] Rejecting \"{}\": {}", self.id, client_name, e);
                        self.state = SessionState::WaitClose;
                        Ok(Some(ServerMessage::ConnectRej {
                            reason: e.to_string(),
                        }))
                    }
                }
            }
            ClientMessage::DaemonPidReq { .. } => {
                debug!("[Client {}] Daemon pid query", self.id);
                self.state = SessionState::WaitClose;
                Ok(Some(ServerMessage::DaemonPidCnf {
                    pid: self.broker.pid(),
                }))
            }
            other => Err(SessionError::Violation(other.message_type(), self.state)),
        }
    }

    async fn handle_request(&mut self, msg: ClientMessage) -> Result<Option<ServerMessage>, SessionError> {
        match msg {
            ClientMessage::CloseReq => {
                debug!("[Client {}] Close requested", self.id);
                self.state = SessionState::Closed;
                Ok(None)
            }
            ClientMessage::ServiceReq {
                reset,
                commit,
                strictness,
                services,
            } => {
                let result = self
                    .broker
                    .request_services(self.id, reset, commit, strictness, services)
                    .await;
                // Frames queued with the old parameters are gone.
                self.frames_ready = true;
                Ok(Some(match result {
                    Ok((services, params)) => ServerMessage::ServiceCnf { services, params },
                    Err(e) => {
                        let services = match &e {
                            BrokerError::ServicesUnavailable { granted, .. } => *granted,
                            _ => ServiceSet::EMPTY,
                        };
                        debug!("[Client {}] Service request rejected: {}", self.id, e);
                        ServerMessage::ServiceRej {
                            services,
                            reason: e.to_string(),
                        }
                    }
                }))
            }
            ClientMessage::ChnTokenReq { priority, profile } => {
                let reply = self.broker.request_token(self.id, priority, profile).await?;
                Ok(Some(ServerMessage::ChnTokenCnf(reply)))
            }
            ClientMessage::ChnNotifyReq { flags, scanning } => {
                self.broker.notify_channel(self.id, flags, scanning).await?;
                Ok(Some(ServerMessage::ChnNotifyCnf { flags, scanning }))
            }
            ClientMessage::ChnReclaimCnf => {
                self.broker.confirm_reclaim(self.id).await?;
                Ok(None)
            }
            ClientMessage::ChnIoctlReq { request, arg } => {
                Ok(Some(match self.broker.ioctl(self.id, request, arg).await {
                    Ok(r) => ServerMessage::ChnIoctlCnf {
                        result: r.result,
                        errno: r.errno,
                        arg: r.arg,
                    },
                    Err(e) => {
                        debug!("[Client {}] ioctl 0x{:08X} rejected: {}", self.id, request, e);
                        ServerMessage::ChnIoctlRej {
                            reason: e.to_string(),
                        }
                    }
                }))
            }
            other => Err(SessionError::Violation(other.message_type(), self.state)),
        }
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tokio::io::{duplex, DuplexStream};
    use vbi_proxy_protocol::{
        decode_header, decode_server_message, encode_client_message, Handshake, Strictness, HEADER_SIZE,
    };

    use crate::config::BrokerConfig;
    use crate::device::{CaptureDevice, DeviceError, DeviceOpener};

    struct NoDevice;

    impl DeviceOpener for NoDevice {
        fn open(&self, path: &str, _buffer_count: usize) -> Result<Box<dyn CaptureDevice>, DeviceError> {
            Err(DeviceError::Open {
                path: path.to_string(),
                source: io::Error::from(io::ErrorKind::NotFound),
            })
        }
    }

    type Started = (DuplexStream, watch::Sender<bool>, tokio::task::JoinHandle<()>);

    async fn start(config: BrokerConfig) -> Started {
        start_with_capacity(config, 64 * 1024).await
    }

    async fn start_with_capacity(config: BrokerConfig, capacity: usize) -> Started {
        let (broker, _events) = Broker::new(config, Arc::new(NoDevice));
        let registration = broker.register(0).await.unwrap();
        let (ours, theirs) = duplex(capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = ClientSession::new(registration, theirs, "test".into(), broker, shutdown_rx);
        (ours, shutdown_tx, tokio::spawn(session.run()))
    }

    async fn send(stream: &mut DuplexStream, msg: &ClientMessage) {
        stream.write_all(&encode_client_message(msg).unwrap()).await.unwrap();
    }

    async fn recv(stream: &mut DuplexStream) -> Option<ServerMessage> {
        let mut buf = BytesMut::new();
        loop {
            if let Some(header) = decode_header(&buf, u32::MAX).unwrap() {
                let total = HEADER_SIZE + header.body_len as usize;
                if buf.len() >= total {
                    let body = buf.split_to(total).freeze().slice(HEADER_SIZE..);
                    return Some(decode_server_message(header.message_type, body).unwrap());
                }
            }
            if stream.read_buf(&mut buf).await.unwrap() == 0 {
                return None;
            }
        }
    }

    fn connect_req(handshake: Handshake, services: ServiceSet) -> ClientMessage {
        connect_req_with_flags(handshake, services, ClientFlags::default())
    }

    fn connect_req_with_flags(handshake: Handshake, services: ServiceSet, flags: ClientFlags) -> ClientMessage {
        ClientMessage::ConnectReq {
            handshake,
            client_name: "unit".into(),
            pid: 42,
            flags,
            scanning: 0,
            services,
            strictness: Strictness::Default,
        }
    }

    #[tokio::test]
    async fn test_connect_without_services() {
        let (mut stream, _shutdown, task) = start(BrokerConfig::default()).await;
        send(&mut stream, &connect_req(Handshake::current(), ServiceSet::EMPTY)).await;
        match recv(&mut stream).await {
            Some(ServerMessage::ConnectCnf { daemon_pid, services, .. }) => {
                assert_eq!(daemon_pid, std::process::id());
                assert_eq!(services, ServiceSet::EMPTY);
            }
            other => panic!("unexpected {:?}", other),
        }
        send(&mut stream, &ClientMessage::CloseReq).await;
        assert!(recv(&mut stream).await.is_none());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_device_failure_rejects_connect() {
        let (mut stream, _shutdown, task) = start(BrokerConfig::default()).await;
        send(&mut stream, &connect_req(Handshake::current(), ServiceSet::VPS)).await;
        match recv(&mut stream).await {
            Some(ServerMessage::ConnectRej { reason }) => assert!(reason.contains("/dev/vbi0")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(recv(&mut stream).await.is_none());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_before_connect_closes() {
        let (mut stream, _shutdown, task) = start(BrokerConfig::default()).await;
        send(
            &mut stream,
            &ClientMessage::ServiceReq {
                reset: true,
                commit: true,
                strictness: Strictness::Default,
                services: ServiceSet::VPS,
            },
        )
        .await;
        assert!(recv(&mut stream).await.is_none());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_ioctl_rejected_with_reason() {
        let (mut stream, _shutdown, task) = start(BrokerConfig::default()).await;
        send(&mut stream, &connect_req(Handshake::current(), ServiceSet::EMPTY)).await;
        assert!(matches!(recv(&mut stream).await, Some(ServerMessage::ConnectCnf { .. })));
        send(
            &mut stream,
            &ClientMessage::ChnIoctlReq {
                request: 0x1234_5678,
                arg: vec![],
            },
        )
        .await;
        match recv(&mut stream).await {
            Some(ServerMessage::ChnIoctlRej { reason }) => assert!(reason.contains("not permitted")),
            other => panic!("unexpected {:?}", other),
        }
        drop(stream);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let config = BrokerConfig {
            connect_timeout: Duration::from_secs(3),
            ..BrokerConfig::default()
        };
        let (mut stream, _shutdown, task) = start(config).await;
        assert!(recv(&mut stream).await.is_none());
        task.await.unwrap();
    }

    fn stall_config() -> BrokerConfig {
        BrokerConfig {
            write_timeout: Duration::from_secs(5),
            ..BrokerConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_reader_is_dropped() {
        // The reply does not fit the pipe and the peer never reads.
        let (mut stream, _shutdown, task) = start_with_capacity(stall_config(), 8).await;
        send(&mut stream, &connect_req(Handshake::current(), ServiceSet::EMPTY)).await;
        tokio::time::timeout(Duration::from_secs(30), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_timeouts_flag_keeps_stalled_reader() {
        let (mut stream, _shutdown, mut task) = start_with_capacity(stall_config(), 8).await;
        let request =
            connect_req_with_flags(Handshake::current(), ServiceSet::EMPTY, ClientFlags::NO_TIMEOUTS);
        send(&mut stream, &request).await;
        assert!(tokio::time::timeout(Duration::from_secs(30), &mut task).await.is_err());

        assert!(matches!(recv(&mut stream).await, Some(ServerMessage::ConnectCnf { .. })));
        send(&mut stream, &ClientMessage::CloseReq).await;
        assert!(recv(&mut stream).await.is_none());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_session() {
        let (mut stream, shutdown, task) = start(BrokerConfig::default()).await;
        shutdown.send(true).unwrap();
        assert!(recv(&mut stream).await.is_none());
        task.await.unwrap();
    }
}
