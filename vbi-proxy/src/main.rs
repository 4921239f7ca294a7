//! vbi-proxyd: shares VBI capture devices among multiple clients.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use vbi_proxy::broker::Broker;
use vbi_proxy::config::{load_config, BrokerConfig, ConfigFile, DeviceConfig};
use vbi_proxy::device::StreamOpener;
use vbi_proxy::logging;
use vbi_proxy::server::Server;
use vbi_proxy_client::{ClientConfig, ProxyClient};
use vbi_proxy_protocol::SCANNING_625;

const DEFAULT_CONFIG_FILE: &str = "vbi-proxyd.toml";
const DEFAULT_RETENTION_DAYS: u64 = 7;
const DEFAULT_LOG_DIR: &str = "logs";

/// vbi-proxyd - VBI capture proxy daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Capture device to serve (repeatable)
    #[arg(short, long)]
    device: Vec<String>,

    /// Number of capture buffers per device
    #[arg(short, long)]
    buffers: Option<usize>,

    /// Maximum number of connected clients
    #[arg(short = 'c', long)]
    max_clients: Option<usize>,

    /// Directory for the per-device sockets
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Stay in the foreground
    #[arg(long)]
    no_detach: bool,

    /// Terminate the daemons serving the configured devices and exit
    #[arg(short, long)]
    kill: bool,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long)]
    log_retention_days: Option<u64>,
}

/// Merge the configuration file with the command line; the command line wins.
fn broker_config(args: &Args, file_config: &ConfigFile) -> Result<BrokerConfig, Box<dyn std::error::Error>> {
    let mut config = file_config.broker_config()?;

    if !args.device.is_empty() {
        config.devices = args
            .device
            .iter()
            .map(|path| {
                config
                    .devices
                    .iter()
                    .find(|d| &d.path == path)
                    .cloned()
                    .unwrap_or_else(|| DeviceConfig::new(path.clone()))
            })
            .collect();
    }
    if let Some(n) = args.buffers {
        config.buffer_count = n;
    }
    if let Some(n) = args.max_clients {
        config.max_clients = n;
    }
    if let Some(dir) = &args.socket_dir {
        config.socket_dir = dir.clone();
    }

    config.validate()?;
    Ok(config)
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Load config file: explicit path > auto-detect > default
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    });
    let file_config = match &config_path {
        Some(path) => match load_config(path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => ConfigFile::default(),
    };

    let config = match broker_config(&args, &file_config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let configured_log_dir = args
        .log_dir
        .clone()
        .or_else(|| file_config.logging.log_dir.as_ref().map(PathBuf::from));
    let log_dir = log_dir_for(configured_log_dir, !args.no_detach && !args.kill);
    let log_retention_days = args
        .log_retention_days
        .or(file_config.logging.retention_days)
        .unwrap_or(DEFAULT_RETENTION_DAYS);

    if args.kill {
        if let Err(e) = logging::init_logging(None, log_retention_days, args.verbose, None) {
            eprintln!("Failed to initialize logging: {}", e);
        }
        return match runtime() {
            Ok(rt) => rt.block_on(kill_daemons(&config)),
            Err(e) => {
                eprintln!("Failed to start runtime: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    // Fork before any thread exists; the log writer and runtime start afterwards.
    if !args.no_detach {
        if let Some(dir) = &log_dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                eprintln!("Cannot create log directory {}: {}", dir.display(), e);
                return ExitCode::FAILURE;
            }
            eprintln!("Logging to {}", dir.display());
        }
        if let Err(e) = nix::unistd::daemon(true, false) {
            eprintln!("Failed to detach: {}", e);
            return ExitCode::FAILURE;
        }
    }

    let _guard = match logging::init_logging(
        log_dir.as_deref(),
        log_retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    ) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!(
        "vbi-proxyd {} starting (pid {}, {} device(s))",
        env!("CARGO_PKG_VERSION"),
        std::process::id(),
        config.devices.len()
    );

    let rt = match runtime() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    match rt.block_on(serve(config)) {
        Ok(()) => {
            info!("vbi-proxyd stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// A detached daemon has no terminal, so it always gets a log directory.
fn log_dir_for(configured: Option<PathBuf>, detach: bool) -> Option<PathBuf> {
    configured.or_else(|| detach.then(|| PathBuf::from(DEFAULT_LOG_DIR)))
}

fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread().enable_all().build()
}

async fn serve(config: BrokerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let opener = config.devices.iter().fold(
        StreamOpener::new(SCANNING_625, config.max_message_size),
        |opener, dev| opener.with_scanning(dev.path.clone(), dev.scanning),
    );
    let (broker, device_events) = Broker::new(config, Arc::new(opener));
    let server = Server::bind(broker).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_termination().await;
        info!("Termination requested");
        let _ = shutdown_tx.send(true);
    });

    server.run(device_events, shutdown_rx).await?;
    Ok(())
}

async fn wait_for_termination() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Cannot install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = terminate.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

/// Ask the daemon of each configured device for its pid and send it SIGTERM.
/// Succeeds if at least one daemon was signalled.
async fn kill_daemons(config: &BrokerConfig) -> ExitCode {
    let mut signalled = 0;
    for dev in &config.devices {
        let mut query = ClientConfig::new(dev.path.clone());
        query.socket_dir = config.socket_dir.clone();
        match ProxyClient::query_daemon_pid(&query).await {
            Ok(pid) => match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    info!("Sent SIGTERM to daemon {} serving {}", pid, dev.path);
                    signalled += 1;
                }
                Err(e) => error!("Failed to signal daemon {} serving {}: {}", pid, dev.path, e),
            },
            Err(e) => warn!("No daemon serving {}: {}", dev.path, e),
        }
    }
    if signalled > 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_daemon_always_logs_to_files() {
        assert_eq!(log_dir_for(None, true), Some(PathBuf::from(DEFAULT_LOG_DIR)));
        assert_eq!(log_dir_for(None, false), None);
        let configured = PathBuf::from("/var/log/vbi-proxy");
        assert_eq!(log_dir_for(Some(configured.clone()), true), Some(configured.clone()));
        assert_eq!(log_dir_for(Some(configured.clone()), false), Some(configured));
    }

    #[test]
    fn test_command_line_overrides_config_file() {
        let file_config: ConfigFile = toml::from_str(
            r#"
            [server]
            max_clients = 4

            [[device]]
            path = "/dev/vbi0"
            "#,
        )
        .unwrap();
        let args = Args::parse_from(["vbi-proxyd", "-c", "9", "-d", "/dev/vbi1"]);
        let config = broker_config(&args, &file_config).unwrap();
        assert_eq!(config.max_clients, 9);
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].path, "/dev/vbi1");
    }
}
