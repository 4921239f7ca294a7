//! Connection to the proxy daemon.

use std::collections::VecDeque;

use log::{debug, info};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;
use vbi_proxy_protocol::{
    decode_server_message, encode_client_message, ChannelNotifyFlags, ChannelPriority,
    ChannelProfile, ClientMessage, FrameBuffer, Handshake, SamplingParams, ServerMessage,
    ServiceSet, SlicedFrame, Strictness, TokenReply,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// Byte stream to the daemon.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Something the daemon sent without being asked.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyEvent {
    Frame(SlicedFrame),
    /// The channel token was handed to this client.
    TokenGranted,
    /// The daemon wants the token back; answer with [`ProxyClient::confirm_reclaim`].
    Reclaim,
    ChannelChanged {
        flags: ChannelNotifyFlags,
        scanning: u16,
    },
}

impl ProxyEvent {
    fn from_indication(msg: ServerMessage) -> Option<ProxyEvent> {
        match msg {
            ServerMessage::SlicedInd(frame) => Some(ProxyEvent::Frame(frame)),
            ServerMessage::ChnTokenInd => Some(ProxyEvent::TokenGranted),
            ServerMessage::ChnReclaimReq => Some(ProxyEvent::Reclaim),
            ServerMessage::ChnChangeInd { flags, scanning } => {
                Some(ProxyEvent::ChannelChanged { flags, scanning })
            }
            _ => None,
        }
    }
}

/// Result of a device control request executed by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoctlReply {
    pub result: i32,
    pub errno: i32,
    pub arg: Vec<u8>,
}

/// A connected client session.
pub struct ProxyClient {
    stream: Box<dyn Transport>,
    inbound: FrameBuffer,
    /// Indications received while waiting for a reply.
    queued: VecDeque<ProxyEvent>,
    config: ClientConfig,
    services: ServiceSet,
    params: SamplingParams,
    daemon_pid: u32,
}

async fn open_stream(config: &ClientConfig) -> Result<Box<dyn Transport>> {
    let connect = async {
        let stream: Box<dyn Transport> = match &config.tcp_addr {
            Some(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Box::new(stream)
            }
            None => Box::new(UnixStream::connect(config.socket_path()).await?),
        };
        Ok::<_, ClientError>(stream)
    };
    timeout(config.connect_timeout, connect)
        .await
        .map_err(|_| ClientError::Timeout("connect"))?
}

impl ProxyClient {
    /// Connect to the daemon serving `config.device` and request `services`.
    pub async fn connect(
        config: ClientConfig,
        services: ServiceSet,
        strictness: Strictness,
    ) -> Result<ProxyClient> {
        let stream = open_stream(&config).await?;
        Self::connect_stream(stream, config, services, strictness).await
    }

    /// Run the connect handshake over an already opened stream.
    pub async fn connect_stream<S: Transport + 'static>(
        stream: S,
        config: ClientConfig,
        services: ServiceSet,
        strictness: Strictness,
    ) -> Result<ProxyClient> {
        let mut client = ProxyClient {
            stream: Box::new(stream),
            inbound: FrameBuffer::new(config.max_message_size),
            queued: VecDeque::new(),
            services: ServiceSet::EMPTY,
            params: SamplingParams::default(),
            daemon_pid: 0,
            config,
        };

        let request = ClientMessage::ConnectReq {
            handshake: Handshake::current(),
            client_name: client.config.client_name.clone(),
            pid: std::process::id(),
            flags: client.config.flags,
            scanning: client.config.scanning,
            services,
            strictness,
        };
        match client.request(&request).await? {
            ServerMessage::ConnectCnf {
                version_major,
                version_minor,
                daemon_pid,
                services,
                params,
            } => {
                info!(
                    "Connected to vbi-proxy daemon {} (protocol {}.{}) for {}",
                    daemon_pid, version_major, version_minor, client.config.device
                );
                client.daemon_pid = daemon_pid;
                client.services = services;
                client.params = params;
                Ok(client)
            }
            ServerMessage::ConnectRej { reason } => Err(ClientError::Rejected(reason)),
            other => Err(ClientError::UnexpectedReply(other.message_type())),
        }
    }

    /// Ask the daemon for its process id without opening a session.
    pub async fn query_daemon_pid(config: &ClientConfig) -> Result<u32> {
        let stream = open_stream(config).await?;
        let mut client = ProxyClient {
            stream,
            inbound: FrameBuffer::new(config.max_message_size),
            queued: VecDeque::new(),
            services: ServiceSet::EMPTY,
            params: SamplingParams::default(),
            daemon_pid: 0,
            config: config.clone(),
        };
        let request = ClientMessage::DaemonPidReq {
            handshake: Handshake::current(),
        };
        match client.request(&request).await? {
            ServerMessage::DaemonPidCnf { pid } => Ok(pid),
            ServerMessage::ConnectRej { reason } => Err(ClientError::Rejected(reason)),
            other => Err(ClientError::UnexpectedReply(other.message_type())),
        }
    }

    /// Add to (or with `reset`, replace) the requested services.
    ///
    /// Without `commit` the request is only recorded by the daemon and the
    /// current services are returned unchanged.
    pub async fn update_services(
        &mut self,
        services: ServiceSet,
        strictness: Strictness,
        reset: bool,
        commit: bool,
    ) -> Result<ServiceSet> {
        let request = ClientMessage::ServiceReq {
            reset,
            commit,
            strictness,
            services,
        };
        match self.request(&request).await? {
            ServerMessage::ServiceCnf { services, params } => {
                self.services = services;
                self.params = params;
                Ok(services)
            }
            ServerMessage::ServiceRej { services, reason } => {
                self.services = services;
                Err(ClientError::Rejected(reason))
            }
            other => Err(ClientError::UnexpectedReply(other.message_type())),
        }
    }

    pub async fn request_token(
        &mut self,
        priority: ChannelPriority,
        profile: ChannelProfile,
    ) -> Result<TokenReply> {
        match self
            .request(&ClientMessage::ChnTokenReq { priority, profile })
            .await?
        {
            ServerMessage::ChnTokenCnf(reply) => Ok(reply),
            other => Err(ClientError::UnexpectedReply(other.message_type())),
        }
    }

    /// Report a channel event, or return the token with [`ChannelNotifyFlags::TOKEN`].
    pub async fn notify(&mut self, flags: ChannelNotifyFlags, scanning: u16) -> Result<()> {
        match self
            .request(&ClientMessage::ChnNotifyReq { flags, scanning })
            .await?
        {
            ServerMessage::ChnNotifyCnf { .. } => Ok(()),
            other => Err(ClientError::UnexpectedReply(other.message_type())),
        }
    }

    /// Give the token back after a [`ProxyEvent::Reclaim`].
    pub async fn confirm_reclaim(&mut self) -> Result<()> {
        self.send(&ClientMessage::ChnReclaimCnf).await
    }

    pub async fn ioctl(&mut self, request: u32, arg: Vec<u8>) -> Result<IoctlReply> {
        match self
            .request(&ClientMessage::ChnIoctlReq { request, arg })
            .await?
        {
            ServerMessage::ChnIoctlCnf { result, errno, arg } => Ok(IoctlReply { result, errno, arg }),
            ServerMessage::ChnIoctlRej { reason } => Err(ClientError::Rejected(reason)),
            other => Err(ClientError::UnexpectedReply(other.message_type())),
        }
    }

    /// Wait for the next frame or indication.
    pub async fn next_event(&mut self) -> Result<ProxyEvent> {
        if let Some(event) = self.queued.pop_front() {
            return Ok(event);
        }
        let msg = self.read_message().await?;
        let msg_type = msg.message_type();
        ProxyEvent::from_indication(msg).ok_or(ClientError::UnexpectedReply(msg_type))
    }

    /// Close the session gracefully.
    pub async fn close(mut self) -> Result<()> {
        self.send(&ClientMessage::CloseReq).await?;
        self.stream.shutdown().await?;
        debug!("Closed session with daemon {}", self.daemon_pid);
        Ok(())
    }

    pub fn services(&self) -> ServiceSet {
        self.services
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    pub fn daemon_pid(&self) -> u32 {
        self.daemon_pid
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        let encoded = encode_client_message(msg)?;
        self.stream.write_all(&encoded).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Send a request and wait for its reply, queueing indications that arrive first.
    async fn request(&mut self, msg: &ClientMessage) -> Result<ServerMessage> {
        self.send(msg).await?;
        let reply_timeout = self.config.reply_timeout;
        timeout(reply_timeout, async {
            loop {
                let reply = self.read_message().await?;
                if !reply.is_indication() {
                    return Ok(reply);
                }
                if let Some(event) = ProxyEvent::from_indication(reply) {
                    self.queued.push_back(event);
                }
            }
        })
        .await
        .map_err(|_| ClientError::Timeout("reply"))?
    }

    async fn read_message(&mut self) -> Result<ServerMessage> {
        loop {
            if let Some(frame) = self.inbound.next_frame()? {
                return Ok(decode_server_message(frame.header.message_type, frame.body)?);
            }
            let n = self.stream.read_buf(self.inbound.buffer_mut()).await?;
            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use vbi_proxy_protocol::{
        decode_client_message, encode_server_message, SlicedLine, TokenStatus,
        DEFAULT_MAX_MESSAGE_SIZE, PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR,
    };

    /// Daemon end of a duplex pipe.
    struct FakeDaemon {
        stream: DuplexStream,
        inbound: FrameBuffer,
    }

    impl FakeDaemon {
        async fn recv(&mut self) -> ClientMessage {
            loop {
                if let Some(frame) = self.inbound.next_frame().unwrap() {
                    return decode_client_message(frame.header.message_type, frame.body).unwrap();
                }
                let n = self.stream.read_buf(self.inbound.buffer_mut()).await.unwrap();
                assert!(n > 0, "client hung up");
            }
        }

        async fn send(&mut self, msg: ServerMessage) {
            let encoded = encode_server_message(&msg).unwrap();
            self.stream.write_all(&encoded).await.unwrap();
        }
    }

    fn pipe() -> (DuplexStream, FakeDaemon) {
        let (client, daemon) = tokio::io::duplex(64 * 1024);
        (
            client,
            FakeDaemon {
                stream: daemon,
                inbound: FrameBuffer::new(DEFAULT_MAX_MESSAGE_SIZE),
            },
        )
    }

    fn connect_cnf(services: ServiceSet) -> ServerMessage {
        ServerMessage::ConnectCnf {
            version_major: PROTOCOL_VERSION_MAJOR,
            version_minor: PROTOCOL_VERSION_MINOR,
            daemon_pid: 4242,
            services,
            params: SamplingParams::default(),
        }
    }

    #[tokio::test]
    async fn test_connect_and_receive_frames() {
        let (stream, mut daemon) = pipe();
        let server = tokio::spawn(async move {
            match daemon.recv().await {
                ClientMessage::ConnectReq { services, .. } => {
                    assert_eq!(services, ServiceSet::TELETEXT_B);
                }
                other => panic!("unexpected {:?}", other),
            }
            daemon.send(connect_cnf(ServiceSet::TELETEXT_B)).await;
            daemon
                .send(ServerMessage::SlicedInd(SlicedFrame {
                    timestamp: 1.5,
                    lines: vec![SlicedLine::new(ServiceSet::TELETEXT_B_L10_625, 7, &[0x55; 42])],
                    raw: None,
                }))
                .await;
            assert_eq!(daemon.recv().await, ClientMessage::CloseReq);
        });

        let mut client = ProxyClient::connect_stream(
            stream,
            ClientConfig::new("/dev/vbi0"),
            ServiceSet::TELETEXT_B,
            Strictness::Default,
        )
        .await
        .unwrap();
        assert_eq!(client.daemon_pid(), 4242);
        assert_eq!(client.services(), ServiceSet::TELETEXT_B);

        match client.next_event().await.unwrap() {
            ProxyEvent::Frame(frame) => {
                assert_eq!(frame.lines.len(), 1);
                assert_eq!(frame.lines[0].line, 7);
            }
            other => panic!("unexpected {:?}", other),
        }
        client.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_rejected() {
        let (stream, mut daemon) = pipe();
        let server = tokio::spawn(async move {
            daemon.recv().await;
            daemon
                .send(ServerMessage::ConnectRej {
                    reason: "device /dev/vbi0 is busy".into(),
                })
                .await;
        });

        let err = ProxyClient::connect_stream(
            stream,
            ClientConfig::new("/dev/vbi0"),
            ServiceSet::VPS,
            Strictness::Default,
        )
        .await
        .err()
        .unwrap();
        match err {
            ClientError::Rejected(reason) => assert_eq!(reason, "device /dev/vbi0 is busy"),
            other => panic!("unexpected {:?}", other),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_indications_queued_while_waiting_for_reply() {
        let (stream, mut daemon) = pipe();
        let server = tokio::spawn(async move {
            daemon.recv().await;
            daemon.send(connect_cnf(ServiceSet::EMPTY)).await;

            assert!(matches!(daemon.recv().await, ClientMessage::ChnTokenReq { .. }));
            daemon.send(ServerMessage::ChnReclaimReq).await;
            daemon
                .send(ServerMessage::ChnTokenCnf(TokenReply {
                    status: TokenStatus::Pending,
                    permitted: false,
                    non_exclusive: false,
                }))
                .await;
            daemon.send(ServerMessage::ChnTokenInd).await;
            assert_eq!(daemon.recv().await, ClientMessage::ChnReclaimCnf);
        });

        let mut client = ProxyClient::connect_stream(
            stream,
            ClientConfig::new("/dev/vbi0"),
            ServiceSet::EMPTY,
            Strictness::Default,
        )
        .await
        .unwrap();
        let reply = client
            .request_token(ChannelPriority::Background, ChannelProfile::default())
            .await
            .unwrap();
        assert_eq!(reply.status, TokenStatus::Pending);

        assert_eq!(client.next_event().await.unwrap(), ProxyEvent::Reclaim);
        assert_eq!(client.next_event().await.unwrap(), ProxyEvent::TokenGranted);
        client.confirm_reclaim().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_service_rejection_keeps_granted_set() {
        let (stream, mut daemon) = pipe();
        let server = tokio::spawn(async move {
            daemon.recv().await;
            daemon.send(connect_cnf(ServiceSet::VPS)).await;
            daemon.recv().await;
            daemon
                .send(ServerMessage::ServiceRej {
                    services: ServiceSet::VPS,
                    reason: "services not supported".into(),
                })
                .await;
        });

        let mut client = ProxyClient::connect_stream(
            stream,
            ClientConfig::new("/dev/vbi0"),
            ServiceSet::VPS,
            Strictness::Default,
        )
        .await
        .unwrap();
        let err = client
            .update_services(ServiceSet::WSS_625, Strictness::Strict, false, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Rejected(_)));
        assert_eq!(client.services(), ServiceSet::VPS);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_daemon_hangup() {
        let (stream, daemon) = pipe();
        drop(daemon);
        let err = ProxyClient::connect_stream(
            stream,
            ClientConfig::new("/dev/vbi0"),
            ServiceSet::VPS,
            Strictness::Default,
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ClientError::ConnectionClosed | ClientError::Io(_)));
    }

    #[tokio::test]
    async fn test_query_pid_without_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ClientConfig::new("/dev/vbi9");
        config.socket_dir = dir.path().to_path_buf();
        assert!(matches!(
            ProxyClient::query_daemon_pid(&config).await,
            Err(ClientError::Io(_))
        ));
    }
}
