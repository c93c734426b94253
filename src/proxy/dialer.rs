//! Upstream dialer
//!
//! Turns an [`UpstreamTarget`] into an established outbound connection.
//! The dialer never retries; callers fail fast and let the client retry.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream};
use tracing::{debug, instrument};

use crate::error::DialError;
use crate::proxy::policy::AccessPolicy;

/// Host part of a dial target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetHost {
    Ip(IpAddr),
    Domain(String),
}

/// A resolved-by-name-or-address destination, immutable once chosen
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamTarget {
    pub host: TargetHost,
    pub port: u16,
}

impl UpstreamTarget {
    pub fn new(host: TargetHost, port: u16) -> Self {
        Self { host, port }
    }
}

impl From<SocketAddr> for UpstreamTarget {
    fn from(addr: SocketAddr) -> Self {
        Self::new(TargetHost::Ip(addr.ip()), addr.port())
    }
}

impl fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            TargetHost::Ip(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
            TargetHost::Ip(ip) => write!(f, "{}:{}", ip, self.port),
            TargetHost::Domain(name) => write!(f, "{}:{}", name, self.port),
        }
    }
}

/// Any duplex byte stream usable as an upstream connection
pub trait UpstreamStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> UpstreamStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// An established upstream connection
pub struct Upstream {
    pub stream: Box<dyn UpstreamStream>,
    /// Local end of the connection, reported as the SOCKS5 bound address
    pub local_addr: Option<SocketAddr>,
}

impl Upstream {
    pub fn new<S: UpstreamStream>(stream: S, local_addr: Option<SocketAddr>) -> Self {
        Self {
            stream: Box::new(stream),
            local_addr,
        }
    }
}

impl fmt::Debug for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upstream")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

/// Establishes upstream connections
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `target`, giving up after `timeout`
    async fn dial(
        &self,
        target: &UpstreamTarget,
        timeout: Duration,
    ) -> std::result::Result<Upstream, DialError>;
}

/// Dials over plain TCP using the system resolver
pub struct TcpDialer {
    policy: Arc<dyn AccessPolicy>,
}

impl TcpDialer {
    pub fn new(policy: Arc<dyn AccessPolicy>) -> Self {
        Self { policy }
    }

    async fn resolve(
        &self,
        target: &UpstreamTarget,
    ) -> std::result::Result<Vec<SocketAddr>, DialError> {
        let addrs: Vec<SocketAddr> = match &target.host {
            TargetHost::Ip(ip) => vec![SocketAddr::new(*ip, target.port)],
            TargetHost::Domain(name) => lookup_host((name.as_str(), target.port))
                .await
                .map_err(|e| {
                    debug!("Resolving {} failed: {}", name, e);
                    DialError::Unresolvable
                })?
                .collect(),
        };

        if addrs.is_empty() {
            return Err(DialError::Unresolvable);
        }
        if !addrs.iter().all(|a| self.policy.allow_resolved(a)) {
            return Err(DialError::PolicyDenied);
        }
        Ok(addrs)
    }

    async fn connect(&self, target: &UpstreamTarget) -> std::result::Result<Upstream, DialError> {
        let addrs = self.resolve(target).await?;

        let stream = TcpStream::connect(&addrs[..]).await.map_err(|e| {
            debug!("Connect to {} failed: {}", target, e);
            DialError::from_io(&e)
        })?;
        let _ = stream.set_nodelay(true);
        let local_addr = stream.local_addr().ok();

        Ok(Upstream::new(stream, local_addr))
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    #[instrument(skip(self), fields(target = %target))]
    async fn dial(
        &self,
        target: &UpstreamTarget,
        timeout: Duration,
    ) -> std::result::Result<Upstream, DialError> {
        if !self.policy.allow_target(target) {
            debug!("Target denied by policy");
            return Err(DialError::PolicyDenied);
        }

        match tokio::time::timeout(timeout, self.connect(target)).await {
            Ok(result) => result,
            Err(_) => Err(DialError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::proxy::policy::{AllowAll, StaticPolicy};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn dialer() -> TcpDialer {
        TcpDialer::new(Arc::new(AllowAll))
    }

    #[test]
    fn test_target_display() {
        let v4 = UpstreamTarget::from("127.0.0.1:80".parse::<SocketAddr>().unwrap());
        assert_eq!(v4.to_string(), "127.0.0.1:80");

        let v6 = UpstreamTarget::from("[::1]:443".parse::<SocketAddr>().unwrap());
        assert_eq!(v6.to_string(), "[::1]:443");

        let name = UpstreamTarget::new(TargetHost::Domain("example.com".into()), 8080);
        assert_eq!(name.to_string(), "example.com:8080");
    }

    #[tokio::test]
    async fn test_dial_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hi").await.unwrap();
        });

        let mut upstream = dialer()
            .dial(&addr.into(), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(upstream.local_addr.is_some());

        let mut buf = [0u8; 2];
        upstream.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = dialer()
            .dial(&addr.into(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err, DialError::Refused);
    }

    #[tokio::test]
    async fn test_dial_unresolvable() {
        let target = UpstreamTarget::new(TargetHost::Domain("nonexistent.invalid".into()), 80);
        let err = dialer()
            .dial(&target, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::Unresolvable | DialError::Timeout));
    }

    #[tokio::test]
    async fn test_dial_policy_denied() {
        let policy = StaticPolicy::from_config(&PolicyConfig {
            deny_private: true,
            ..Default::default()
        });
        let dialer = TcpDialer::new(Arc::new(policy));

        let target = UpstreamTarget::from("127.0.0.1:9".parse::<SocketAddr>().unwrap());
        let err = dialer
            .dial(&target, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, DialError::PolicyDenied);

        // A name resolving into a denied range is caught after resolution.
        let target = UpstreamTarget::new(TargetHost::Domain("localhost".into()), 9);
        let err = dialer
            .dial(&target, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::PolicyDenied | DialError::Unresolvable));
    }
}
