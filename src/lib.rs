//! duoproxy - Dual-protocol forwarding proxy
//!
//! Two front ends share one session table and one shutdown path:
//!
//! - An HTTP listener that forwards every request to a single configured
//!   origin, rewriting `Host` and tagging requests with `x-forwarded-by`,
//!   while answering `GET /health` locally
//! - A SOCKS5 listener (no authentication, CONNECT only) that relays raw
//!   TCP to the requested target
//!
//! Relays support half-close and idle timeouts; shutdown drains live
//! sessions before force-closing whatever remains.

pub mod config;
pub mod error;
pub mod models;
pub mod proxy;

pub use config::Config;
pub use error::{ProxyError, Result};
