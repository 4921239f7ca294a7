//! Message type definitions for the VBI proxy protocol.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Sub};

use serde::{Deserialize, Serialize};

/// Magic bytes opening every handshake.
pub const MAGIC: [u8; 8] = *b"VBIPROXY";

/// Protocol major version. Peers with a different major version are rejected.
pub const PROTOCOL_VERSION_MAJOR: u16 = 1;

/// Protocol minor version.
pub const PROTOCOL_VERSION_MINOR: u16 = 0;

/// Byte-order probe carried in the handshake.
pub const ENDIAN_MAGIC: u32 = 0x1122_3344;

/// What [`ENDIAN_MAGIC`] reads as when the peer wrote it in the opposite byte order.
pub const ENDIAN_MAGIC_SWAPPED: u32 = 0x4433_2211;

/// Payload bytes carried by one sliced line.
pub const SLICED_DATA_SIZE: usize = 56;

/// Maximum client name length in bytes.
pub const MAX_CLIENT_NAME: usize = 64;

/// Maximum length of a human-readable reject reason.
pub const MAX_ERROR_TEXT: usize = 256;

/// Maximum ioctl argument size.
pub const MAX_IOCTL_ARG: usize = 256;

/// Default upper bound for a single message body (1 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// Number of strictness levels a client may request services at.
pub const STRICTNESS_LEVELS: usize = 3;

/// Scanning value of 625-line systems (PAL/SECAM).
pub const SCANNING_625: u16 = 625;

/// Scanning value of 525-line systems (NTSC).
pub const SCANNING_525: u16 = 525;

/// Set of sliced data services, as a bit mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceSet(pub u32);

impl ServiceSet {
    pub const EMPTY: ServiceSet = ServiceSet(0);
    /// Teletext level 1.0 on 625-line systems.
    pub const TELETEXT_B_L10_625: ServiceSet = ServiceSet(0x0000_0001);
    /// Teletext level 2.5 on 625-line systems.
    pub const TELETEXT_B_L25_625: ServiceSet = ServiceSet(0x0000_0002);
    pub const TELETEXT_B: ServiceSet = ServiceSet(0x0000_0003);
    /// Video Programming System, line 16 first field.
    pub const VPS: ServiceSet = ServiceSet(0x0000_0004);
    pub const CAPTION_625_F1: ServiceSet = ServiceSet(0x0000_0008);
    pub const CAPTION_625_F2: ServiceSet = ServiceSet(0x0000_0010);
    pub const CAPTION_625: ServiceSet = ServiceSet(0x0000_0018);
    pub const CAPTION_525_F1: ServiceSet = ServiceSet(0x0000_0020);
    pub const CAPTION_525_F2: ServiceSet = ServiceSet(0x0000_0040);
    pub const CAPTION_525: ServiceSet = ServiceSet(0x0000_0060);
    /// Wide-screen signalling on 625-line systems.
    pub const WSS_625: ServiceSet = ServiceSet(0x0000_0400);
    /// Wide-screen signalling per EIA-J CPR-1204 (525-line).
    pub const WSS_CPR1204: ServiceSet = ServiceSet(0x0000_0800);
    /// VPS data transmitted on the second field.
    pub const VPS_F2: ServiceSet = ServiceSet(0x0000_1000);

    /// Services a 625-line source can carry.
    pub const ALL_625: ServiceSet =
        ServiceSet(0x0000_0003 | 0x0000_0004 | 0x0000_0018 | 0x0000_0400 | 0x0000_1000);
    /// Services a 525-line source can carry.
    pub const ALL_525: ServiceSet = ServiceSet(0x0000_0060 | 0x0000_0800);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: ServiceSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: ServiceSet) -> bool {
        self.0 & other.0 != 0
    }

    /// Services that can be carried at the given scanning.
    pub fn supported_by(scanning: u16) -> ServiceSet {
        match scanning {
            SCANNING_525 => ServiceSet::ALL_525,
            _ => ServiceSet::ALL_625,
        }
    }

    /// Union of a per-strictness request array.
    pub fn union_all(levels: &[ServiceSet; STRICTNESS_LEVELS]) -> ServiceSet {
        levels.iter().fold(ServiceSet::EMPTY, |acc, s| acc | *s)
    }
}

impl BitOr for ServiceSet {
    type Output = ServiceSet;
    fn bitor(self, rhs: ServiceSet) -> ServiceSet {
        ServiceSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for ServiceSet {
    fn bitor_assign(&mut self, rhs: ServiceSet) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ServiceSet {
    type Output = ServiceSet;
    fn bitand(self, rhs: ServiceSet) -> ServiceSet {
        ServiceSet(self.0 & rhs.0)
    }
}

impl Sub for ServiceSet {
    type Output = ServiceSet;
    fn sub(self, rhs: ServiceSet) -> ServiceSet {
        ServiceSet(self.0 & !rhs.0)
    }
}

impl fmt::Display for ServiceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// How conservatively the daemon validates that requested services are deliverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Strictness {
    Lenient = 0,
    #[default]
    Default = 1,
    Strict = 2,
}

impl Strictness {
    pub fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for Strictness {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(Strictness::Lenient),
            1 => Ok(Strictness::Default),
            2 => Ok(Strictness::Strict),
            other => Err(other),
        }
    }
}

/// Channel-control priority tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChannelPriority {
    /// Time-shared among all background clients by the channel scheduler.
    Background = 1,
    #[default]
    Interactive = 2,
    Record = 3,
}

impl TryFrom<u8> for ChannelPriority {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            1 => Ok(ChannelPriority::Background),
            2 => Ok(ChannelPriority::Interactive),
            3 => Ok(ChannelPriority::Record),
            other => Err(other),
        }
    }
}

/// Sub-priorities used by background clients as a scheduling tie-break.
pub mod sub_priority {
    pub const MINIMAL: u8 = 0x00;
    pub const CHECK: u8 = 0x10;
    pub const UPDATE: u8 = 0x20;
    pub const INITIAL: u8 = 0x30;
    pub const VPS_PDC: u8 = 0x40;
}

/// Background channel-control profile supplied with a token request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelProfile {
    /// Clients without a valid profile never take part in background scheduling.
    pub is_valid: bool,
    pub sub_prio: u8,
    /// Minimum time in seconds the client wants to keep the channel once granted.
    pub min_duration: u32,
    /// Expected time in seconds the client needs the channel.
    pub exp_duration: u32,
}

/// Token state reported in a token confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum TokenStatus {
    #[default]
    Idle = 0,
    Granted = 1,
    /// Queued; a grant indication follows when the scheduler picks this client.
    Pending = 2,
}

impl TryFrom<u8> for TokenStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(TokenStatus::Idle),
            1 => Ok(TokenStatus::Granted),
            2 => Ok(TokenStatus::Pending),
            other => Err(other),
        }
    }
}

/// Answer to a channel token request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenReply {
    pub status: TokenStatus,
    /// Whether the client may switch channels right now.
    pub permitted: bool,
    /// Another client at the same tier may also switch channels.
    pub non_exclusive: bool,
}

/// Flags of channel notifications and change indications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ChannelNotifyFlags(pub u32);

impl ChannelNotifyFlags {
    /// Background task completed; stop scheduling this client.
    pub const RELEASE: ChannelNotifyFlags = ChannelNotifyFlags(0x01);
    /// Return the channel token.
    pub const TOKEN: ChannelNotifyFlags = ChannelNotifyFlags(0x02);
    /// Channel was switched; discard captured data.
    pub const FLUSH: ChannelNotifyFlags = ChannelNotifyFlags(0x04);
    /// TV norm changed.
    pub const NORM: ChannelNotifyFlags = ChannelNotifyFlags(0x08);
    /// The device failed; all services are gone.
    pub const FAIL: ChannelNotifyFlags = ChannelNotifyFlags(0x10);

    pub fn contains(self, other: ChannelNotifyFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: ChannelNotifyFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for ChannelNotifyFlags {
    type Output = ChannelNotifyFlags;
    fn bitor(self, rhs: ChannelNotifyFlags) -> ChannelNotifyFlags {
        ChannelNotifyFlags(self.0 | rhs.0)
    }
}

/// Per-connection option flags sent with the connect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ClientFlags(pub u32);

impl ClientFlags {
    /// Never drop this client for a stalled write.
    pub const NO_TIMEOUTS: ClientFlags = ClientFlags(0x01);
    /// Do not send channel change indications.
    pub const NO_STATUS_IND: ClientFlags = ClientFlags(0x02);
    /// Forward raw samples along with sliced lines.
    pub const RAW_DATA: ClientFlags = ClientFlags(0x04);

    pub fn contains(self, other: ClientFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ClientFlags {
    type Output = ClientFlags;
    fn bitor(self, rhs: ClientFlags) -> ClientFlags {
        ClientFlags(self.0 | rhs.0)
    }
}

/// Sampling parameters of a capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub scanning: u16,
    pub sampling_format: u32,
    pub sampling_rate: u32,
    pub bytes_per_line: u32,
    pub offset: u32,
    /// First line of each field.
    pub start: [i32; 2],
    /// Number of lines captured per field.
    pub count: [u32; 2],
    pub interlaced: bool,
    pub synchronous: bool,
}

impl SamplingParams {
    /// Wire size of the encoded parameters.
    pub const ENCODED_SIZE: usize = 36;

    pub fn pal() -> Self {
        Self {
            scanning: SCANNING_625,
            sampling_format: 1,
            sampling_rate: 13_500_000,
            bytes_per_line: 1440,
            offset: 128,
            start: [6, 318],
            count: [17, 17],
            interlaced: false,
            synchronous: true,
        }
    }

    pub fn ntsc() -> Self {
        Self {
            scanning: SCANNING_525,
            sampling_format: 1,
            sampling_rate: 13_500_000,
            bytes_per_line: 1440,
            offset: 118,
            start: [10, 272],
            count: [12, 12],
            interlaced: false,
            synchronous: true,
        }
    }

    /// Defaults for a scanning value; anything but 525 is treated as 625.
    pub fn for_scanning(scanning: u16) -> Self {
        match scanning {
            SCANNING_525 => Self::ntsc(),
            _ => Self::pal(),
        }
    }

    /// Maximum number of sliced lines one frame can carry.
    pub fn max_lines(&self) -> usize {
        (self.count[0] + self.count[1]) as usize
    }
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self::pal()
    }
}

/// One decoded line of auxiliary data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlicedLine {
    /// Service of this line; a single bit of [`ServiceSet`].
    pub id: u32,
    pub line: u32,
    pub data: [u8; SLICED_DATA_SIZE],
}

impl SlicedLine {
    pub fn new(service: ServiceSet, line: u32, payload: &[u8]) -> Self {
        let mut data = [0u8; SLICED_DATA_SIZE];
        let n = payload.len().min(SLICED_DATA_SIZE);
        data[..n].copy_from_slice(&payload[..n]);
        Self { id: service.0, line, data }
    }

    pub fn service(&self) -> ServiceSet {
        ServiceSet(self.id)
    }
}

/// One captured frame: sliced lines plus optional raw samples.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SlicedFrame {
    /// Capture time in seconds since the Unix epoch.
    pub timestamp: f64,
    pub lines: Vec<SlicedLine>,
    pub raw: Option<Vec<u8>>,
}

impl SlicedFrame {
    pub fn with_capacity(max_lines: usize) -> Self {
        Self {
            timestamp: 0.0,
            lines: Vec::with_capacity(max_lines),
            raw: None,
        }
    }

    /// Union of the services present in this frame.
    pub fn services(&self) -> ServiceSet {
        self.lines
            .iter()
            .fold(ServiceSet::EMPTY, |acc, l| acc | l.service())
    }

    pub fn clear(&mut self) {
        self.timestamp = 0.0;
        self.lines.clear();
        self.raw = None;
    }

    /// Copy of this frame restricted to `mask`.
    pub fn filtered(&self, mask: ServiceSet, want_raw: bool) -> SlicedFrame {
        SlicedFrame {
            timestamp: self.timestamp,
            lines: self
                .lines
                .iter()
                .filter(|l| mask.intersects(l.service()))
                .copied()
                .collect(),
            raw: if want_raw { self.raw.clone() } else { None },
        }
    }
}

/// Opening block of connect and daemon-pid requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub magic: [u8; 8],
    pub version_major: u16,
    pub version_minor: u16,
    pub endian_magic: u32,
}

impl Handshake {
    pub const ENCODED_SIZE: usize = 16;

    /// Handshake of this protocol implementation.
    pub fn current() -> Self {
        Self {
            magic: MAGIC,
            version_major: PROTOCOL_VERSION_MAJOR,
            version_minor: PROTOCOL_VERSION_MINOR,
            endian_magic: ENDIAN_MAGIC,
        }
    }

    /// Reason to reject a peer presenting this handshake, if any.
    pub fn incompatibility(&self) -> Option<String> {
        if self.endian_magic == ENDIAN_MAGIC_SWAPPED {
            return Some("byte order mismatch: peer uses the opposite endianness".to_string());
        }
        if self.endian_magic != ENDIAN_MAGIC {
            return Some(format!("invalid endian magic 0x{:08X}", self.endian_magic));
        }
        if self.version_major != PROTOCOL_VERSION_MAJOR {
            return Some(format!(
                "incompatible protocol version {}.{} (daemon speaks {}.{})",
                self.version_major, self.version_minor, PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR
            ));
        }
        None
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::current()
    }
}

/// Message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    // Connection (0x000x)
    ConnectReq = 0x0001,
    ConnectCnf = 0x0002,
    ConnectRej = 0x0003,
    CloseReq = 0x0004,
    DaemonPidReq = 0x0005,
    DaemonPidCnf = 0x0006,

    // Services (0x001x)
    ServiceReq = 0x0010,
    ServiceCnf = 0x0011,
    ServiceRej = 0x0012,

    // Data (0x002x)
    SlicedInd = 0x0020,

    // Channel control (0x003x)
    ChnTokenReq = 0x0030,
    ChnTokenCnf = 0x0031,
    ChnTokenInd = 0x0032,
    ChnNotifyReq = 0x0033,
    ChnNotifyCnf = 0x0034,
    ChnReclaimReq = 0x0035,
    ChnReclaimCnf = 0x0036,
    ChnChangeInd = 0x0037,

    // Device control passthrough (0x004x)
    ChnIoctlReq = 0x0040,
    ChnIoctlCnf = 0x0041,
    ChnIoctlRej = 0x0042,
}

impl MessageType {
    /// True for messages a client sends to the daemon.
    pub fn is_client_message(self) -> bool {
        matches!(
            self,
            MessageType::ConnectReq
                | MessageType::CloseReq
                | MessageType::DaemonPidReq
                | MessageType::ServiceReq
                | MessageType::ChnTokenReq
                | MessageType::ChnNotifyReq
                | MessageType::ChnReclaimCnf
                | MessageType::ChnIoctlReq
        )
    }

    /// Inclusive bounds of the body length for this message type.
    ///
    /// Variable-size messages are additionally capped by `max_message_size`.
    pub fn body_limits(self, max_message_size: u32) -> (u32, u32) {
        const H: u32 = Handshake::ENCODED_SIZE as u32;
        const P: u32 = SamplingParams::ENCODED_SIZE as u32;
        const TEXT: u32 = 2 + MAX_ERROR_TEXT as u32;
        const ARG: u32 = 2 + MAX_IOCTL_ARG as u32;
        let (min, max) = match self {
            MessageType::ConnectReq => (H + 2 + 4 + 4 + 2 + 4 + 1, H + 2 + MAX_CLIENT_NAME as u32 + 4 + 4 + 2 + 4 + 1),
            MessageType::ConnectCnf => (2 + 2 + 4 + 4 + P, 2 + 2 + 4 + 4 + P),
            MessageType::ConnectRej => (2, TEXT),
            MessageType::CloseReq => (0, 0),
            MessageType::DaemonPidReq => (H, H),
            MessageType::DaemonPidCnf => (4, 4),
            MessageType::ServiceReq => (7, 7),
            MessageType::ServiceCnf => (4 + P, 4 + P),
            MessageType::ServiceRej => (4 + 2, 4 + TEXT),
            MessageType::SlicedInd => (8 + 4 + 1, max_message_size),
            MessageType::ChnTokenReq => (11, 11),
            MessageType::ChnTokenCnf => (3, 3),
            MessageType::ChnTokenInd => (0, 0),
            MessageType::ChnNotifyReq => (6, 6),
            MessageType::ChnNotifyCnf => (6, 6),
            MessageType::ChnReclaimReq => (0, 0),
            MessageType::ChnReclaimCnf => (0, 0),
            MessageType::ChnChangeInd => (6, 6),
            MessageType::ChnIoctlReq => (4 + 2, 4 + ARG),
            MessageType::ChnIoctlCnf => (4 + 4 + 2, 4 + 4 + ARG),
            MessageType::ChnIoctlRej => (2, TEXT),
        };
        (min, max.min(max_message_size))
    }
}

impl TryFrom<u16> for MessageType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, u16> {
        match value {
            0x0001 => Ok(MessageType::ConnectReq),
            0x0002 => Ok(MessageType::ConnectCnf),
            0x0003 => Ok(MessageType::ConnectRej),
            0x0004 => Ok(MessageType::CloseReq),
            0x0005 => Ok(MessageType::DaemonPidReq),
            0x0006 => Ok(MessageType::DaemonPidCnf),
            0x0010 => Ok(MessageType::ServiceReq),
            0x0011 => Ok(MessageType::ServiceCnf),
            0x0012 => Ok(MessageType::ServiceRej),
            0x0020 => Ok(MessageType::SlicedInd),
            0x0030 => Ok(MessageType::ChnTokenReq),
            0x0031 => Ok(MessageType::ChnTokenCnf),
            0x0032 => Ok(MessageType::ChnTokenInd),
            0x0033 => Ok(MessageType::ChnNotifyReq),
            0x0034 => Ok(MessageType::ChnNotifyCnf),
            0x0035 => Ok(MessageType::ChnReclaimReq),
            0x0036 => Ok(MessageType::ChnReclaimCnf),
            0x0037 => Ok(MessageType::ChnChangeInd),
            0x0040 => Ok(MessageType::ChnIoctlReq),
            0x0041 => Ok(MessageType::ChnIoctlCnf),
            0x0042 => Ok(MessageType::ChnIoctlRej),
            other => Err(other),
        }
    }
}

impl From<MessageType> for u16 {
    fn from(value: MessageType) -> Self {
        value as u16
    }
}

/// Messages sent from client to daemon.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Open a session and request an initial set of services.
    ConnectReq {
        handshake: Handshake,
        client_name: String,
        pid: u32,
        flags: ClientFlags,
        /// Scanning the client expects, or 0 if it does not care.
        scanning: u16,
        services: ServiceSet,
        strictness: Strictness,
    },
    /// Ask for the daemon's process id without opening a session.
    DaemonPidReq { handshake: Handshake },
    /// Graceful close.
    CloseReq,
    /// Add or replace requested services.
    ServiceReq {
        reset: bool,
        commit: bool,
        strictness: Strictness,
        services: ServiceSet,
    },
    /// Ask for channel control.
    ChnTokenReq {
        priority: ChannelPriority,
        profile: ChannelProfile,
    },
    /// Report a channel event or return the token.
    ChnNotifyReq {
        flags: ChannelNotifyFlags,
        scanning: u16,
    },
    /// Acknowledge a reclaim request; the token is returned.
    ChnReclaimCnf,
    /// Low-level device control passthrough.
    ChnIoctlReq { request: u32, arg: Vec<u8> },
}

impl ClientMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ClientMessage::ConnectReq { .. } => MessageType::ConnectReq,
            ClientMessage::DaemonPidReq { .. } => MessageType::DaemonPidReq,
            ClientMessage::CloseReq => MessageType::CloseReq,
            ClientMessage::ServiceReq { .. } => MessageType::ServiceReq,
            ClientMessage::ChnTokenReq { .. } => MessageType::ChnTokenReq,
            ClientMessage::ChnNotifyReq { .. } => MessageType::ChnNotifyReq,
            ClientMessage::ChnReclaimCnf => MessageType::ChnReclaimCnf,
            ClientMessage::ChnIoctlReq { .. } => MessageType::ChnIoctlReq,
        }
    }
}

/// Messages sent from daemon to client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    ConnectCnf {
        version_major: u16,
        version_minor: u16,
        daemon_pid: u32,
        services: ServiceSet,
        params: SamplingParams,
    },
    ConnectRej { reason: String },
    DaemonPidCnf { pid: u32 },
    ServiceCnf {
        services: ServiceSet,
        params: SamplingParams,
    },
    /// Rejected service request; `services` is what the client still receives.
    ServiceRej { services: ServiceSet, reason: String },
    SlicedInd(SlicedFrame),
    ChnTokenCnf(TokenReply),
    ChnTokenInd,
    ChnNotifyCnf {
        flags: ChannelNotifyFlags,
        scanning: u16,
    },
    ChnReclaimReq,
    ChnChangeInd {
        flags: ChannelNotifyFlags,
        scanning: u16,
    },
    ChnIoctlCnf { result: i32, errno: i32, arg: Vec<u8> },
    ChnIoctlRej { reason: String },
}

impl ServerMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ServerMessage::ConnectCnf { .. } => MessageType::ConnectCnf,
            ServerMessage::ConnectRej { .. } => MessageType::ConnectRej,
            ServerMessage::DaemonPidCnf { .. } => MessageType::DaemonPidCnf,
            ServerMessage::ServiceCnf { .. } => MessageType::ServiceCnf,
            ServerMessage::ServiceRej { .. } => MessageType::ServiceRej,
            ServerMessage::SlicedInd(_) => MessageType::SlicedInd,
            ServerMessage::ChnTokenCnf(_) => MessageType::ChnTokenCnf,
            ServerMessage::ChnTokenInd => MessageType::ChnTokenInd,
            ServerMessage::ChnNotifyCnf { .. } => MessageType::ChnNotifyCnf,
            ServerMessage::ChnReclaimReq => MessageType::ChnReclaimReq,
            ServerMessage::ChnChangeInd { .. } => MessageType::ChnChangeInd,
            ServerMessage::ChnIoctlCnf { .. } => MessageType::ChnIoctlCnf,
            ServerMessage::ChnIoctlRej { .. } => MessageType::ChnIoctlRej,
        }
    }

    /// Unsolicited messages that may arrive between a request and its reply.
    pub fn is_indication(&self) -> bool {
        matches!(
            self,
            ServerMessage::SlicedInd(_)
                | ServerMessage::ChnTokenInd
                | ServerMessage::ChnReclaimReq
                | ServerMessage::ChnChangeInd { .. }
        )
    }
}
