//! Proxy implementation
//!
//! This module provides:
//! - Listener management and graceful drain
//! - The session table and lifecycle
//! - HTTP forwarding to the configured origin
//! - SOCKS5 negotiation
//! - Bidirectional relaying and upstream dialing

pub mod dialer;
pub mod health;
pub mod http;
pub mod listener;
pub mod policy;
pub mod relay;
pub mod session;
pub mod shutdown;
pub mod socks5;
pub mod stream;

#[cfg(test)]
pub(crate) mod testing;

pub use dialer::{Dialer, TargetHost, TcpDialer, Upstream, UpstreamTarget};
pub use health::HealthReporter;
pub use listener::{DrainOutcome, ListenerManager};
pub use policy::{AccessPolicy, AllowAll, StaticPolicy};
pub use relay::{relay, RelayOutcome, TerminationReason};
pub use session::{SessionGuard, SessionInfo, SessionRegistry};
pub use shutdown::{ShutdownController, ShutdownSignal};
