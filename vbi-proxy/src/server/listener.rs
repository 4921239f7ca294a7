//! Socket listeners accepting client connections.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use vbi_proxy_client::{ClientConfig, ProxyClient};
use vbi_proxy_protocol::socket_path_for_device;

use crate::broker::{Broker, BrokerError};
use crate::device::DeviceEvent;
use crate::server::session::ClientSession;

const PID_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Listening sockets of one device.
struct DeviceListener {
    device: usize,
    path: String,
    socket_path: PathBuf,
    unix: UnixListener,
    tcp: Option<(TcpListener, SocketAddr)>,
}

/// The daemon's listening side: one UNIX socket (and optional TCP port) per device.
pub struct Server {
    broker: Arc<Broker>,
    listeners: Vec<DeviceListener>,
}

impl Server {
    /// Bind the sockets of every configured device.
    ///
    /// A leftover socket file is probed first. If a daemon still answers on
    /// it, binding fails with [`io::ErrorKind::AddrInUse`]; otherwise the
    /// stale file is removed.
    pub async fn bind(broker: Arc<Broker>) -> io::Result<Server> {
        let config = broker.config().clone();
        let mut listeners = Vec::with_capacity(config.devices.len());

        for (device, dev) in config.devices.iter().enumerate() {
            let socket_path = socket_path_for_device(&config.socket_dir, &dev.path);
            if socket_path.exists() {
                let mut query = ClientConfig::new(dev.path.clone());
                query.socket_dir = config.socket_dir.clone();
                query.connect_timeout = PID_QUERY_TIMEOUT;
                query.reply_timeout = PID_QUERY_TIMEOUT;
                match ProxyClient::query_daemon_pid(&query).await {
                    Ok(pid) => {
                        return Err(io::Error::new(
                            io::ErrorKind::AddrInUse,
                            format!("daemon {} already serves {} at {:?}", pid, dev.path, socket_path),
                        ));
                    }
                    Err(e) => {
                        warn!("Removing stale socket {:?} ({})", socket_path, e);
                        std::fs::remove_file(&socket_path)?;
                    }
                }
            }

            let unix = UnixListener::bind(&socket_path)?;
            info!("[Device {}] Listening for {} on {:?}", device, dev.path, socket_path);

            let tcp = match dev.tcp_listen {
                Some(addr) => {
                    let listener = TcpListener::bind(addr).await?;
                    let local = listener.local_addr()?;
                    info!("[Device {}] Listening for {} on {}", device, dev.path, local);
                    Some((listener, local))
                }
                None => None,
            };

            listeners.push(DeviceListener {
                device,
                path: dev.path.clone(),
                socket_path,
                unix,
                tcp,
            });
        }

        Ok(Server { broker, listeners })
    }

    /// Addresses of the bound TCP listeners, by device index.
    pub fn tcp_addrs(&self) -> Vec<(usize, SocketAddr)> {
        self.listeners
            .iter()
            .filter_map(|l| l.tcp.as_ref().map(|(_, addr)| (l.device, *addr)))
            .collect()
    }

    /// Serve until `shutdown` turns true, then close every session and device.
    pub async fn run(
        self,
        mut device_events: mpsc::UnboundedReceiver<DeviceEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<()> {
        let mut tasks = JoinSet::new();
        let mut socket_paths = Vec::new();

        for listener in self.listeners {
            socket_paths.push(listener.socket_path.clone());
            let DeviceListener {
                device,
                path,
                unix,
                tcp,
                ..
            } = listener;

            tasks.spawn(accept_unix(
                unix,
                device,
                path.clone(),
                Arc::clone(&self.broker),
                shutdown.clone(),
            ));
            if let Some((tcp, _)) = tcp {
                tasks.spawn(accept_tcp(
                    tcp,
                    device,
                    path,
                    Arc::clone(&self.broker),
                    shutdown.clone(),
                ));
            }
        }
        tasks.spawn(channel_timer(Arc::clone(&self.broker), shutdown.clone()));

        loop {
            tokio::select! {
                event = device_events.recv() => match event {
                    Some(event) => self.broker.handle_device_event(event).await,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Shutting down");
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("Listener task failed: {}", e);
            }
        }
        self.broker.shutdown().await;

        for path in socket_paths {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove socket {:?}: {}", path, e);
                }
            }
        }
        Ok(())
    }
}

async fn accept_unix(
    listener: UnixListener,
    device: usize,
    path: String,
    broker: Arc<Broker>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let peer = format!("local socket of {}", path);
                    spawn_session(&mut sessions, &broker, device, stream, peer, &shutdown).await;
                }
                Err(e) => error!("[Device {}] Failed to accept connection: {}", device, e),
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    drain(sessions).await;
}

async fn accept_tcp(
    listener: TcpListener,
    device: usize,
    path: String,
    broker: Arc<Broker>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("[Device {}] set_nodelay failed for {}: {}", device, addr, e);
                    }
                    let peer = format!("{} ({})", addr, path);
                    spawn_session(&mut sessions, &broker, device, stream, peer, &shutdown).await;
                }
                Err(e) => error!("[Device {}] Failed to accept connection: {}", device, e),
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    drain(sessions).await;
}

async fn spawn_session<S>(
    sessions: &mut JoinSet<()>,
    broker: &Arc<Broker>,
    device: usize,
    stream: S,
    peer: String,
    shutdown: &watch::Receiver<bool>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    match broker.register(device).await {
        Ok(registration) => {
            let session = ClientSession::new(
                registration,
                stream,
                peer,
                Arc::clone(broker),
                shutdown.clone(),
            );
            sessions.spawn(session.run());
        }
        Err(e @ BrokerError::TooManyClients(_)) => {
            warn!("[Device {}] Refusing connection from {}: {}", device, peer, e);
        }
        Err(e) => error!("[Device {}] Cannot register {}: {}", device, peer, e),
    }
}

async fn drain(mut sessions: JoinSet<()>) {
    while let Some(result) = sessions.join_next().await {
        if let Err(e) = result {
            error!("Session task failed: {}", e);
        }
    }
}

/// Wake the broker at channel scheduling deadlines.
async fn channel_timer(broker: Arc<Broker>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let deadline = broker.next_channel_deadline().await;
        let sleep = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = sleep => broker.on_channel_timer().await,
            _ = broker.channel_timer_changed() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerConfig, DeviceConfig};
    use crate::device::{CaptureDevice, DeviceError, DeviceOpener};

    struct NoDevice;

    impl DeviceOpener for NoDevice {
        fn open(&self, path: &str, _: usize) -> Result<Box<dyn CaptureDevice>, DeviceError> {
            Err(DeviceError::Open {
                path: path.to_string(),
                source: io::Error::from(io::ErrorKind::NotFound),
            })
        }
    }

    fn config(dir: &std::path::Path) -> BrokerConfig {
        BrokerConfig {
            devices: vec![DeviceConfig::new("/dev/vbi7")],
            socket_dir: dir.to_path_buf(),
            ..BrokerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_bind_serves_pid_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, events) = Broker::new(config(dir.path()), Arc::new(NoDevice));
        let server = Server::bind(Arc::clone(&broker)).await.unwrap();
        let socket = dir.path().join("vbiproxy-dev-vbi7");
        assert!(socket.exists());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = tokio::spawn(server.run(events, shutdown_rx));

        let mut query = ClientConfig::new("/dev/vbi7");
        query.socket_dir = dir.path().to_path_buf();
        let pid = ProxyClient::query_daemon_pid(&query).await.unwrap();
        assert_eq!(pid, std::process::id());

        // A second daemon must not steal the socket.
        let (second, _events) = Broker::new(config(dir.path()), Arc::new(NoDevice));
        let err = Server::bind(second).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);

        shutdown_tx.send(true).unwrap();
        running.await.unwrap().unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("vbiproxy-dev-vbi7");
        drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
        assert!(socket.exists());

        let (broker, _events) = Broker::new(config(dir.path()), Arc::new(NoDevice));
        let server = Server::bind(broker).await.unwrap();
        assert!(socket.exists());
        assert!(server.tcp_addrs().is_empty());
    }
}
