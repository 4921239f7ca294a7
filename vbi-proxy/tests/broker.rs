//! End-to-end tests: a daemon serving a recorded capture over real sockets.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use vbi_proxy::broker::Broker;
use vbi_proxy::config::{BrokerConfig, DeviceConfig};
use vbi_proxy::device::StreamOpener;
use vbi_proxy::server::Server;
use vbi_proxy_client::{ClientConfig, ClientError, ProxyClient, ProxyEvent};
use vbi_proxy_protocol::{
    decode_server_message, encode_client_message, encode_server_message, ChannelNotifyFlags,
    ChannelPriority, ChannelProfile, ClientFlags, ClientMessage, FrameBuffer, Handshake,
    MessageType, ServerMessage, ServiceSet, SlicedFrame, SlicedLine, Strictness, TokenStatus,
    DEFAULT_MAX_MESSAGE_SIZE, SCANNING_625,
};

const WAIT: Duration = Duration::from_secs(5);

struct Daemon {
    dir: tempfile::TempDir,
    device: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<std::io::Result<()>>,
}

impl Daemon {
    async fn start(device: &str) -> Daemon {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig {
            devices: vec![DeviceConfig::new(device)],
            socket_dir: dir.path().to_path_buf(),
            stop_timeout: Duration::from_millis(500),
            ..BrokerConfig::default()
        };
        let opener = StreamOpener::new(SCANNING_625, config.max_message_size);
        let (broker, events) = Broker::new(config, Arc::new(opener));
        let server = Server::bind(broker).await.unwrap();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(server.run(events, shutdown_rx));
        Daemon {
            dir,
            device: device.to_string(),
            shutdown,
            task,
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(self.device.clone());
        config.socket_dir = self.dir.path().to_path_buf();
        config.client_name = "integration".into();
        config
    }

    async fn raw_stream(&self) -> UnixStream {
        UnixStream::connect(self.client_config().socket_path()).await.unwrap()
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        timeout(WAIT, self.task).await.unwrap().unwrap().unwrap();
    }
}

/// A capture file where every frame carries one teletext and one VPS line.
fn recording() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for n in 0..4u8 {
        let frame = SlicedFrame {
            timestamp: 0.0,
            lines: vec![
                SlicedLine::new(ServiceSet::TELETEXT_B_L10_625, 7, &[n; 42]),
                SlicedLine::new(ServiceSet::VPS, 16, &[n; 13]),
            ],
            raw: None,
        };
        let encoded = encode_server_message(&ServerMessage::SlicedInd(frame)).unwrap();
        file.write_all(&encoded).unwrap();
    }
    file.flush().unwrap();
    file
}

async fn next_frame(client: &mut ProxyClient) -> SlicedFrame {
    loop {
        match timeout(WAIT, client.next_event()).await.unwrap().unwrap() {
            ProxyEvent::Frame(frame) => return frame,
            _ => continue,
        }
    }
}

async fn read_reply(stream: &mut UnixStream, inbound: &mut FrameBuffer) -> Option<ServerMessage> {
    loop {
        if let Some(frame) = inbound.next_frame().unwrap() {
            return Some(decode_server_message(frame.header.message_type, frame.body).unwrap());
        }
        let n = timeout(WAIT, stream.read_buf(inbound.buffer_mut()))
            .await
            .unwrap()
            .unwrap_or(0);
        if n == 0 {
            return None;
        }
    }
}

#[tokio::test]
async fn test_clients_receive_only_their_services() {
    let capture = recording();
    let daemon = Daemon::start(capture.path().to_str().unwrap()).await;

    let mut teletext = ProxyClient::connect(
        daemon.client_config(),
        ServiceSet::TELETEXT_B,
        Strictness::Default,
    )
    .await
    .unwrap();
    assert_eq!(teletext.services(), ServiceSet::TELETEXT_B);

    let mut vps = ProxyClient::connect(daemon.client_config(), ServiceSet::VPS, Strictness::Default)
        .await
        .unwrap();
    assert_eq!(vps.services(), ServiceSet::VPS);
    assert_eq!(vps.daemon_pid(), std::process::id());

    for _ in 0..3 {
        let frame = next_frame(&mut teletext).await;
        assert!(!frame.lines.is_empty());
        assert!(frame.lines.iter().all(|l| l.line == 7));
    }
    for _ in 0..3 {
        let frame = next_frame(&mut vps).await;
        assert!(!frame.lines.is_empty());
        assert!(frame.lines.iter().all(|l| l.service() == ServiceSet::VPS));
    }

    // A channel switch by one client is reported to the other.
    teletext.notify(ChannelNotifyFlags::FLUSH, 0).await.unwrap();
    let changed = timeout(WAIT, async {
        loop {
            if let ProxyEvent::ChannelChanged { flags, .. } = vps.next_event().await.unwrap() {
                return flags;
            }
        }
    })
    .await
    .unwrap();
    assert!(changed.contains(ChannelNotifyFlags::FLUSH));

    teletext.close().await.unwrap();
    vps.close().await.unwrap();
    daemon.stop().await;
}

#[tokio::test]
async fn test_unsupported_services_are_refused() {
    let capture = recording();
    let daemon = Daemon::start(capture.path().to_str().unwrap()).await;

    let err = ProxyClient::connect(
        daemon.client_config(),
        ServiceSet::CAPTION_525,
        Strictness::Default,
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, ClientError::Rejected(_)));

    daemon.stop().await;
}

#[tokio::test]
async fn test_channel_token_handover() {
    let daemon = Daemon::start("/dev/vbi-token-test").await;
    let mut viewer = ProxyClient::connect(daemon.client_config(), ServiceSet::EMPTY, Strictness::Default)
        .await
        .unwrap();
    let mut recorder =
        ProxyClient::connect(daemon.client_config(), ServiceSet::EMPTY, Strictness::Default)
            .await
            .unwrap();

    let reply = viewer
        .request_token(ChannelPriority::Interactive, ChannelProfile::default())
        .await
        .unwrap();
    assert_eq!(reply.status, TokenStatus::Granted);
    assert!(reply.permitted);

    // A recording takes the channel at once; the viewer is asked to give it up.
    let reply = recorder
        .request_token(ChannelPriority::Record, ChannelProfile::default())
        .await
        .unwrap();
    assert_eq!(reply.status, TokenStatus::Granted);
    assert!(reply.permitted);

    assert_eq!(timeout(WAIT, viewer.next_event()).await.unwrap().unwrap(), ProxyEvent::Reclaim);
    viewer.confirm_reclaim().await.unwrap();
    viewer.notify(ChannelNotifyFlags::default(), 0).await.unwrap();

    // Once the recording returns the token the viewer gets it back.
    recorder.notify(ChannelNotifyFlags::TOKEN, 0).await.unwrap();
    assert_eq!(
        timeout(WAIT, viewer.next_event()).await.unwrap().unwrap(),
        ProxyEvent::TokenGranted
    );

    viewer.close().await.unwrap();
    recorder.close().await.unwrap();
    daemon.stop().await;
}

#[tokio::test]
async fn test_daemon_pid_query() {
    let daemon = Daemon::start("/dev/vbi-pid-test").await;
    let pid = ProxyClient::query_daemon_pid(&daemon.client_config()).await.unwrap();
    assert_eq!(pid, std::process::id());
    daemon.stop().await;
}

#[tokio::test]
async fn test_incompatible_version_is_rejected_then_closed() {
    let daemon = Daemon::start("/dev/vbi-version-test").await;
    let mut stream = daemon.raw_stream().await;
    let mut inbound = FrameBuffer::new(DEFAULT_MAX_MESSAGE_SIZE);

    let handshake = Handshake {
        version_major: 2,
        ..Handshake::current()
    };
    let request = ClientMessage::ConnectReq {
        handshake,
        client_name: "old".into(),
        pid: 1,
        flags: ClientFlags::default(),
        scanning: 0,
        services: ServiceSet::VPS,
        strictness: Strictness::Default,
    };
    stream.write_all(&encode_client_message(&request).unwrap()).await.unwrap();

    match read_reply(&mut stream, &mut inbound).await {
        Some(ServerMessage::ConnectRej { reason }) => assert!(reason.contains("version")),
        other => panic!("unexpected {:?}", other),
    }
    assert!(read_reply(&mut stream, &mut inbound).await.is_none());
    daemon.stop().await;
}

#[tokio::test]
async fn test_oversized_message_closes_connection() {
    let daemon = Daemon::start("/dev/vbi-size-test").await;
    let mut stream = daemon.raw_stream().await;

    let mut header = Vec::new();
    header.extend_from_slice(&(DEFAULT_MAX_MESSAGE_SIZE + 1).to_le_bytes());
    header.extend_from_slice(&(MessageType::ConnectReq as u16).to_le_bytes());
    stream.write_all(&header).await.unwrap();

    let mut inbound = FrameBuffer::new(DEFAULT_MAX_MESSAGE_SIZE);
    assert!(read_reply(&mut stream, &mut inbound).await.is_none());

    // The daemon keeps serving other clients.
    let pid = ProxyClient::query_daemon_pid(&daemon.client_config()).await.unwrap();
    assert_eq!(pid, std::process::id());
    daemon.stop().await;
}
