use crate::error::{ProxyError, Result};
use crate::proxy::dialer::{TargetHost, UpstreamTarget};
use std::env;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP forwarding listener
    pub http: HttpListenerConfig,
    /// SOCKS5 relay listener
    pub socks: SocksListenerConfig,
    /// Timeouts shared by both listeners
    pub timeouts: TimeoutConfig,
    /// Maximum number of concurrent sessions across both listeners
    pub max_connections: usize,
    /// Access policy inputs
    pub policy: PolicyConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct HttpListenerConfig {
    /// Whether the HTTP listener runs (default: true)
    pub enabled: bool,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Port for the HTTP listener (default: 3000)
    pub port: u16,
    /// Upstream origin, required when the listener is enabled
    pub origin: Option<Origin>,
}

#[derive(Debug, Clone)]
pub struct SocksListenerConfig {
    /// Whether the SOCKS5 listener runs (default: true)
    pub enabled: bool,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Port for the SOCKS5 listener (default: 1080)
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Upstream connect timeout
    pub connect: Duration,
    /// Time allowed for the origin to send response headers
    pub request: Duration,
    /// Time allowed for a SOCKS5 client to finish negotiation
    pub handshake: Duration,
    /// Relay idle timeout (no bytes in either direction)
    pub idle: Duration,
    /// Drain budget on shutdown
    pub drain: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            request: Duration::from_secs(30),
            handshake: Duration::from_secs(10),
            idle: Duration::from_secs(300),
            drain: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Hosts or IPs that may never be dialed
    pub deny_targets: Vec<String>,
    /// Deny loopback, private and link-local IP targets
    pub deny_private: bool,
    /// Client IPs allowed to connect (empty = everyone)
    pub allow_clients: Vec<IpAddr>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

/// The single upstream origin HTTP requests are forwarded to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// The value exactly as configured, reported by `/health`
    pub raw: String,
    /// Where to dial
    pub target: UpstreamTarget,
    /// Value for the forwarded Host header
    pub authority: String,
    /// Path prefix prepended to every forwarded path ("" when the origin has none)
    pub path_prefix: String,
}

impl Origin {
    /// Parse and validate an origin URL
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ProxyError::InvalidConfig(
                "UPSTREAM_ORIGIN must not be empty".into(),
            ));
        }

        let url = Url::parse(trimmed).map_err(|e| {
            ProxyError::InvalidConfig(format!("UPSTREAM_ORIGIN must be a valid URL: {}", e))
        })?;

        match url.scheme() {
            "http" => {}
            "https" => {
                return Err(ProxyError::InvalidConfig(
                    "UPSTREAM_ORIGIN uses https, but TLS origination is not performed; \
                     front the origin with a TLS terminator and use http://"
                        .into(),
                ))
            }
            other => {
                return Err(ProxyError::InvalidConfig(format!(
                    "UPSTREAM_ORIGIN has unsupported scheme: {}",
                    other
                )))
            }
        }

        if url.query().is_some() || url.fragment().is_some() {
            return Err(ProxyError::InvalidConfig(
                "UPSTREAM_ORIGIN must not include query/fragment".into(),
            ));
        }

        let host = match url.host() {
            Some(url::Host::Domain(d)) => TargetHost::Domain(d.to_string()),
            Some(url::Host::Ipv4(ip)) => TargetHost::Ip(IpAddr::V4(ip)),
            Some(url::Host::Ipv6(ip)) => TargetHost::Ip(IpAddr::V6(ip)),
            None => {
                return Err(ProxyError::InvalidConfig(
                    "UPSTREAM_ORIGIN must include a host".into(),
                ))
            }
        };

        let port = url.port_or_known_default().unwrap_or(80);
        let host_str = url.host_str().unwrap_or_default();
        let authority = match url.port() {
            Some(p) => format!("{}:{}", host_str, p),
            None => host_str.to_string(),
        };

        Ok(Origin {
            raw: raw.to_string(),
            target: UpstreamTarget::new(host, port),
            authority,
            path_prefix: url.path().trim_end_matches('/').to_string(),
        })
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let http_enabled = parse_env("PROXY_HTTP_ENABLED", true)?;
        let origin = match env::var("UPSTREAM_ORIGIN") {
            Ok(raw) if !raw.trim().is_empty() => Some(Origin::parse(&raw)?),
            _ if http_enabled => {
                return Err(ProxyError::MissingEnvVar("UPSTREAM_ORIGIN".into()));
            }
            _ => None,
        };

        let socks_enabled = parse_env("PROXY_SOCKS_ENABLED", true)?;
        if !http_enabled && !socks_enabled {
            return Err(ProxyError::InvalidConfig(
                "at least one of PROXY_HTTP_ENABLED / PROXY_SOCKS_ENABLED must be true".into(),
            ));
        }

        let max_connections: usize = parse_env("PROXY_MAX_CONNECTIONS", 10_000)?;
        if max_connections == 0 {
            return Err(ProxyError::InvalidConfig(
                "PROXY_MAX_CONNECTIONS must be greater than zero".into(),
            ));
        }

        Ok(Config {
            http: HttpListenerConfig {
                enabled: http_enabled,
                host: get_env_or("PROXY_HTTP_HOST", "0.0.0.0"),
                port: parse_port("PROXY_HTTP_PORT", 3000)?,
                origin,
            },
            socks: SocksListenerConfig {
                enabled: socks_enabled,
                host: get_env_or("PROXY_SOCKS_HOST", "0.0.0.0"),
                port: parse_port("PROXY_SOCKS_PORT", 1080)?,
            },
            timeouts: TimeoutConfig {
                connect: parse_secs("PROXY_CONNECT_TIMEOUT", 10)?,
                request: parse_secs("PROXY_REQUEST_TIMEOUT", 30)?,
                handshake: parse_secs("PROXY_HANDSHAKE_TIMEOUT", 10)?,
                idle: parse_secs("PROXY_IDLE_TIMEOUT", 300)?,
                drain: parse_secs("PROXY_DRAIN_TIMEOUT", 30)?,
            },
            max_connections,
            policy: PolicyConfig {
                deny_targets: parse_list("PROXY_DENY_TARGETS"),
                deny_private: parse_env("PROXY_DENY_PRIVATE", false)?,
                allow_clients: parse_list("PROXY_ALLOW_CLIENTS")
                    .iter()
                    .map(|s| {
                        s.parse().map_err(|_| {
                            ProxyError::InvalidConfig(format!(
                                "PROXY_ALLOW_CLIENTS entry is not an IP address: {}",
                                s
                            ))
                        })
                    })
                    .collect::<Result<Vec<IpAddr>>>()?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Get the HTTP listener address
    pub fn http_addr(&self) -> String {
        format_bind_addr(&self.http.host, self.http.port)
    }

    /// Get the SOCKS5 listener address
    pub fn socks_addr(&self) -> String {
        format_bind_addr(&self.socks.host, self.socks.port)
    }
}

fn format_bind_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ProxyError::InvalidConfig(format!("{} has an invalid value: {}", key, raw))),
        _ => Ok(default),
    }
}

fn parse_port(key: &str, default: u16) -> Result<u16> {
    parse_env(key, default)
        .map_err(|_| ProxyError::InvalidConfig(format!("{} must be a valid port number", key)))
}

/// Upper bound for any configured timeout (one week)
const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

fn parse_secs(key: &str, default: u64) -> Result<Duration> {
    let secs: u64 = parse_env(key, default)?;
    if !(1..=MAX_TIMEOUT_SECS).contains(&secs) {
        return Err(ProxyError::InvalidConfig(format!(
            "{} must be between 1 and {} seconds",
            key, MAX_TIMEOUT_SECS
        )));
    }
    Ok(Duration::from_secs(secs))
}

fn parse_list(key: &str) -> Vec<String> {
    get_env_or(key, "")
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
