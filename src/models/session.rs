use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::proxy::relay::TerminationReason;

/// Client-facing protocol of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Http,
    Socks5,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Http => "http",
            ProtocolKind::Socks5 => "socks5",
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Clean,
    ClientError,
    UpstreamError,
    IdleTimeout,
    ForcedShutdown,
    HandshakeFailed,
    DialFailed,
    /// The client was refused by the access policy
    Denied,
    /// The session task went away without recording a reason
    Aborted,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Clean => "clean",
            CloseReason::ClientError => "client_error",
            CloseReason::UpstreamError => "upstream_error",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::ForcedShutdown => "forced_shutdown",
            CloseReason::HandshakeFailed => "handshake_failed",
            CloseReason::DialFailed => "dial_failed",
            CloseReason::Denied => "denied",
            CloseReason::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<TerminationReason> for CloseReason {
    fn from(reason: TerminationReason) -> Self {
        match reason {
            TerminationReason::Clean => CloseReason::Clean,
            TerminationReason::ClientError => CloseReason::ClientError,
            TerminationReason::UpstreamError => CloseReason::UpstreamError,
            TerminationReason::IdleTimeout => CloseReason::IdleTimeout,
            TerminationReason::ForcedShutdown => CloseReason::ForcedShutdown,
        }
    }
}

/// Lifecycle state of a session; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Accepted,
    Handshaking,
    Dialing,
    Relaying,
    Closed(CloseReason),
}

impl SessionState {
    fn rank(&self) -> u8 {
        match self {
            SessionState::Accepted => 0,
            SessionState::Handshaking => 1,
            SessionState::Dialing => 2,
            SessionState::Relaying => 3,
            SessionState::Closed(_) => 4,
        }
    }

    /// Whether `next` is strictly later in the lifecycle
    pub fn can_advance_to(&self, next: &SessionState) -> bool {
        next.rank() > self.rank()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed(_))
    }
}

/// Proxy-wide lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownState {
    #[default]
    Running,
    Draining,
    Stopped,
}

impl ShutdownState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownState::Running => "ok",
            ShutdownState::Draining => "draining",
            ShutdownState::Stopped => "stopped",
        }
    }
}

/// Point-in-time view of one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: u64,
    pub kind: ProtocolKind,
    pub peer: SocketAddr,
    pub target: Option<String>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Session table counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionCounts {
    pub live: usize,
    pub accepted: u64,
    pub closed: u64,
}
