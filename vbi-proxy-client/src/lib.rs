//! Client library for the VBI proxy daemon.
//!
//! ```no_run
//! use vbi_proxy_client::{ClientConfig, ProxyClient, ProxyEvent};
//! use vbi_proxy_protocol::{ServiceSet, Strictness};
//!
//! # async fn run() -> vbi_proxy_client::Result<()> {
//! let config = ClientConfig::from_env("/dev/vbi0");
//! let mut client = ProxyClient::connect(config, ServiceSet::TELETEXT_B, Strictness::Default).await?;
//! while let ProxyEvent::Frame(frame) = client.next_event().await? {
//!     println!("{} lines at {}", frame.lines.len(), frame.timestamp);
//! }
//! client.close().await
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;

pub use client::{IoctlReply, ProxyClient, ProxyEvent, Transport};
pub use config::{ClientConfig, ENV_SOCKET_DIR, ENV_TCP};
pub use error::{ClientError, Result};
