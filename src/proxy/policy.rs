//! Access policy
//!
//! The binary allow/deny hook consulted for client peers at accept time and
//! for upstream targets before dialing.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::config::PolicyConfig;
use crate::proxy::dialer::{TargetHost, UpstreamTarget};

/// Allow/deny decisions for clients and targets
pub trait AccessPolicy: Send + Sync {
    /// Whether a client connecting from `peer` may open a session
    fn allow_client(&self, _peer: SocketAddr) -> bool {
        true
    }

    /// Whether `target` may be dialed
    fn allow_target(&self, _target: &UpstreamTarget) -> bool {
        true
    }

    /// Whether a resolved address of an allowed target may be connected to
    fn allow_resolved(&self, _addr: &SocketAddr) -> bool {
        true
    }
}

/// Permits everything
pub struct AllowAll;

impl AccessPolicy for AllowAll {}

/// Policy built from configuration
#[derive(Debug, Default)]
pub struct StaticPolicy {
    deny_hosts: HashSet<String>,
    deny_private: bool,
    allow_clients: HashSet<IpAddr>,
}

impl StaticPolicy {
    pub fn from_config(config: &PolicyConfig) -> Self {
        Self {
            deny_hosts: config
                .deny_targets
                .iter()
                .map(|h| normalize_host(h))
                .collect(),
            deny_private: config.deny_private,
            allow_clients: config.allow_clients.iter().copied().collect(),
        }
    }

    fn ip_denied(&self, ip: &IpAddr) -> bool {
        if self.deny_hosts.contains(&ip.to_string()) {
            return true;
        }
        self.deny_private && is_private(ip)
    }
}

impl AccessPolicy for StaticPolicy {
    fn allow_client(&self, peer: SocketAddr) -> bool {
        self.allow_clients.is_empty() || self.allow_clients.contains(&peer.ip())
    }

    fn allow_target(&self, target: &UpstreamTarget) -> bool {
        match &target.host {
            TargetHost::Ip(ip) => !self.ip_denied(ip),
            TargetHost::Domain(name) => !self.deny_hosts.contains(&normalize_host(name)),
        }
    }

    // Catches domains that resolve into denied ranges.
    fn allow_resolved(&self, addr: &SocketAddr) -> bool {
        !self.ip_denied(&addr.ip())
    }
}

fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_private_v4(&v4),
            None => is_private_v6(v6),
        },
    }
}

fn is_private_v4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        // 100.64.0.0/10 shared address space
        || (octets[0] == 100 && (octets[1] & 0xC0) == 64)
}

fn is_private_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(name: &str) -> UpstreamTarget {
        UpstreamTarget::new(TargetHost::Domain(name.to_string()), 443)
    }

    fn ip(addr: &str) -> UpstreamTarget {
        UpstreamTarget::new(TargetHost::Ip(addr.parse().unwrap()), 443)
    }

    #[test]
    fn test_allow_all() {
        let policy = AllowAll;
        assert!(policy.allow_client("10.0.0.1:5000".parse().unwrap()));
        assert!(policy.allow_target(&ip("127.0.0.1")));
    }

    #[test]
    fn test_deny_targets_by_name_and_ip() {
        let policy = StaticPolicy::from_config(&PolicyConfig {
            deny_targets: vec!["Metadata.Internal.".to_string(), "169.254.169.254".to_string()],
            ..Default::default()
        });

        assert!(!policy.allow_target(&domain("metadata.internal")));
        assert!(!policy.allow_target(&ip("169.254.169.254")));
        assert!(policy.allow_target(&domain("example.com")));
        assert!(policy.allow_target(&ip("127.0.0.1")));
    }

    #[test]
    fn test_deny_private() {
        let policy = StaticPolicy::from_config(&PolicyConfig {
            deny_private: true,
            ..Default::default()
        });

        assert!(!policy.allow_target(&ip("127.0.0.1")));
        assert!(!policy.allow_target(&ip("10.1.2.3")));
        assert!(!policy.allow_target(&ip("100.64.0.1")));
        assert!(!policy.allow_target(&ip("::1")));
        assert!(!policy.allow_target(&ip("fd00::1")));
        assert!(!policy.allow_target(&ip("::ffff:192.168.1.1")));
        assert!(policy.allow_target(&ip("8.8.8.8")));
        assert!(policy.allow_target(&domain("localhost")));
        assert!(!policy.allow_resolved(&"127.0.0.1:80".parse().unwrap()));
        assert!(policy.allow_resolved(&"1.1.1.1:80".parse().unwrap()));
    }

    #[test]
    fn test_allow_clients() {
        let open = StaticPolicy::from_config(&PolicyConfig::default());
        assert!(open.allow_client("203.0.113.9:4000".parse().unwrap()));

        let restricted = StaticPolicy::from_config(&PolicyConfig {
            allow_clients: vec!["127.0.0.1".parse().unwrap()],
            ..Default::default()
        });
        assert!(restricted.allow_client("127.0.0.1:4000".parse().unwrap()));
        assert!(!restricted.allow_client("203.0.113.9:4000".parse().unwrap()));
    }
}
