//! Listener manager
//!
//! Owns the HTTP and SOCKS5 listening sockets, the session table and the
//! shutdown controller. Each accepted connection is registered before its
//! task is spawned, so a drain never misses a session that was accepted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{Config, TimeoutConfig};
use crate::error::{ProxyError, Result};
use crate::models::{CloseReason, ProtocolKind, SessionSnapshot, ShutdownState};
use crate::proxy::dialer::Dialer;
use crate::proxy::health::{HealthReporter, ListenerPorts};
use crate::proxy::http::{self, HttpState};
use crate::proxy::policy::AccessPolicy;
use crate::proxy::session::{SessionGuard, SessionRegistry};
use crate::proxy::shutdown::ShutdownController;
use crate::proxy::socks5;

/// Pause after a failed accept to avoid spinning on persistent errors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long forcibly closed sessions get to unwind
const FORCE_GRACE: Duration = Duration::from_secs(5);

/// Result of [`ListenerManager::shutdown`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Every session finished on its own within the drain timeout
    pub drained: bool,
    /// Sessions still live when the drain timeout expired
    pub forced: usize,
}

#[derive(Clone)]
enum Frontend {
    Http(Router),
    Socks5,
}

impl Frontend {
    fn kind(&self) -> ProtocolKind {
        match self {
            Frontend::Http(_) => ProtocolKind::Http,
            Frontend::Socks5 => ProtocolKind::Socks5,
        }
    }
}

struct Shared {
    registry: Arc<SessionRegistry>,
    controller: ShutdownController,
    dialer: Arc<dyn Dialer>,
    policy: Arc<dyn AccessPolicy>,
    timeouts: TimeoutConfig,
    connections: Arc<Semaphore>,
}

/// Runs both front ends and coordinates graceful shutdown
pub struct ListenerManager {
    shared: Arc<Shared>,
    http_addr: Option<SocketAddr>,
    socks_addr: Option<SocketAddr>,
    pending: Mutex<Vec<(TcpListener, Frontend)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ListenerManager {
    /// Bind every enabled listener; nothing is accepted until [`start`](Self::start)
    pub async fn bind(
        config: &Config,
        dialer: Arc<dyn Dialer>,
        policy: Arc<dyn AccessPolicy>,
    ) -> Result<Self> {
        let registry = Arc::new(SessionRegistry::new());
        let controller = ShutdownController::new();

        let http_listener = if config.http.enabled {
            Some(bind_listener(&config.http_addr()).await?)
        } else {
            None
        };
        let socks_listener = if config.socks.enabled {
            Some(bind_listener(&config.socks_addr()).await?)
        } else {
            None
        };
        let http_addr = http_listener.as_ref().map(|l| l.local_addr()).transpose()?;
        let socks_addr = socks_listener.as_ref().map(|l| l.local_addr()).transpose()?;

        let mut pending = Vec::new();
        if let Some(listener) = http_listener {
            let origin = config
                .http
                .origin
                .clone()
                .ok_or_else(|| ProxyError::MissingEnvVar("UPSTREAM_ORIGIN".into()))?;
            let health = HealthReporter::new(
                Some(origin.raw.clone()),
                ListenerPorts {
                    http: http_addr.map(|a| a.port()),
                    socks: socks_addr.map(|a| a.port()),
                },
                registry.clone(),
                controller.subscribe_state(),
            );
            let router = http::router(HttpState {
                origin: Arc::new(origin),
                dialer: dialer.clone(),
                timeouts: config.timeouts.clone(),
                health,
            });
            pending.push((listener, Frontend::Http(router)));
        }
        if let Some(listener) = socks_listener {
            pending.push((listener, Frontend::Socks5));
        }

        Ok(Self {
            shared: Arc::new(Shared {
                registry,
                controller,
                dialer,
                policy,
                timeouts: config.timeouts.clone(),
                connections: Arc::new(Semaphore::new(config.max_connections)),
            }),
            http_addr,
            socks_addr,
            pending: Mutex::new(pending),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub fn socks_addr(&self) -> Option<SocketAddr> {
        self.socks_addr
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.shared.registry.clone()
    }

    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.shared.registry.snapshot()
    }

    pub fn state(&self) -> ShutdownState {
        self.shared.controller.state()
    }

    /// Spawn the accept loops
    pub fn start(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut tasks = self.tasks.lock();
        for (listener, frontend) in pending {
            tasks.push(tokio::spawn(accept_loop(
                listener,
                frontend,
                self.shared.clone(),
            )));
        }
    }

    /// Stop accepting, wait for live sessions, then force-close stragglers
    pub async fn shutdown(&self) -> DrainOutcome {
        let shared = &self.shared;
        if shared.controller.begin_drain() {
            info!(
                live = shared.registry.live_count(),
                "Draining: no longer accepting connections"
            );
        }

        // Accept loops drop their listeners on exit.
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!("Accept loop panicked: {}", e);
            }
        }
        self.pending.lock().clear();

        let drain_timeout = shared.timeouts.drain;
        let drained = tokio::time::timeout(drain_timeout, shared.registry.wait_empty())
            .await
            .is_ok();

        let mut forced = 0;
        if !drained {
            forced = shared.registry.live_count();
            let err = ProxyError::ShutdownTimeout {
                secs: drain_timeout.as_secs(),
                remaining: forced,
            };
            warn!("{}", err);
            shared.controller.force_close();

            if tokio::time::timeout(FORCE_GRACE, shared.registry.wait_empty())
                .await
                .is_err()
            {
                error!(
                    remaining = shared.registry.live_count(),
                    "Sessions still open after forced close"
                );
            }
        }

        shared.controller.mark_stopped();
        info!(drained, forced, "Stopped");
        DrainOutcome { drained, forced }
    }
}

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind {}: {}", addr, e);
        ProxyError::Io(e)
    })?;
    Ok(listener)
}

async fn accept_loop(listener: TcpListener, frontend: Frontend, shared: Arc<Shared>) {
    let kind = frontend.kind();
    let signal = shared.controller.signal();
    match listener.local_addr() {
        Ok(addr) => info!(kind = %kind, addr = %addr, "Listening"),
        Err(e) => warn!(kind = %kind, "Listening on unknown address: {}", e),
    }

    loop {
        // Waiting for a permit before accepting leaves excess clients in the
        // kernel backlog instead of accepting and dropping them.
        let permit = tokio::select! {
            biased;
            _ = signal.draining() => break,
            permit = shared.connections.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let (stream, peer) = tokio::select! {
            biased;
            _ = signal.draining() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        let mut session = shared.registry.register(kind, peer);
        // Upgraded HTTP sessions outlive `run_session`; the slot goes with the guard.
        session.hold_permit(permit);
        let session = Arc::new(session);
        if !shared.policy.allow_client(peer) {
            debug!(peer = %peer, "Client denied by policy");
            session.close(CloseReason::Denied);
            continue;
        }

        let span = info_span!("session", id = session.id, kind = %kind, peer = %peer);
        let shared = shared.clone();
        let frontend = frontend.clone();
        tokio::spawn(
            async move { run_session(stream, session, frontend, &shared).await }
            .instrument(span),
        );
    }

    info!(kind = %kind, "Listener closed");
}

async fn run_session(
    stream: TcpStream,
    session: Arc<SessionGuard>,
    frontend: Frontend,
    shared: &Shared,
) {
    let _ = stream.set_nodelay(true);
    let signal = shared.controller.signal();

    match frontend {
        Frontend::Http(router) => {
            http::serve_connection(stream, router, session, &shared.timeouts, signal).await
        }
        Frontend::Socks5 => {
            let reason = socks5::serve(
                stream,
                &session,
                shared.dialer.as_ref(),
                &shared.timeouts,
                &signal,
            )
            .await;
            session.close(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        HttpListenerConfig, LogConfig, Origin, PolicyConfig, SocksListenerConfig,
    };
    use crate::proxy::policy::{AllowAll, StaticPolicy};
    use crate::proxy::testing::{read_head, spawn_upgrade_origin, MockDialer, UPGRADE_REQUEST};
    use bytes::Bytes;
    use http_body_util::{BodyExt, Empty};
    use hyper_util::rt::TokioIo;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_socks::tcp::Socks5Stream;

    fn config(origin: Option<&str>, socks: bool) -> Config {
        Config {
            http: HttpListenerConfig {
                enabled: origin.is_some(),
                host: "127.0.0.1".to_string(),
                port: 0,
                origin: origin.map(|o| Origin::parse(o).unwrap()),
            },
            socks: SocksListenerConfig {
                enabled: socks,
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            timeouts: TimeoutConfig {
                drain: Duration::from_secs(2),
                ..Default::default()
            },
            max_connections: 1000,
            policy: PolicyConfig::default(),
            log: LogConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    async fn start(config: &Config, dialer: Arc<MockDialer>) -> Arc<ListenerManager> {
        let manager = ListenerManager::bind(config, dialer, Arc::new(AllowAll))
            .await
            .unwrap();
        manager.start();
        Arc::new(manager)
    }

    async fn wait_live(registry: &SessionRegistry, live: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.live_count() != live {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("live session count never reached target");
    }

    #[tokio::test]
    async fn test_disabled_listener_is_not_bound() {
        let manager = start(&config(None, true), Arc::new(MockDialer::echo())).await;
        assert!(manager.http_addr().is_none());
        assert!(manager.socks_addr().is_some());
        assert_eq!(manager.state(), ShutdownState::Running);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_socks5_sessions() {
        let dialer = Arc::new(MockDialer::echo());
        let manager = start(&config(None, true), dialer.clone()).await;
        let proxy = manager.socks_addr().unwrap();

        let mut clients = Vec::new();
        for i in 0..100u32 {
            clients.push(tokio::spawn(async move {
                let mut stream = Socks5Stream::connect(proxy, ("example.com", 80))
                    .await
                    .unwrap();
                let payload = format!("session {} payload", i).into_bytes();
                stream.write_all(&payload).await.unwrap();
                stream.shutdown().await.unwrap();

                let mut echoed = Vec::new();
                stream.read_to_end(&mut echoed).await.unwrap();
                assert_eq!(echoed, payload);
            }));
        }
        for client in clients {
            client.await.unwrap();
        }

        let registry = manager.registry();
        wait_live(&registry, 0).await;
        let counts = registry.counts();
        assert_eq!(counts.accepted, 100);
        assert_eq!(counts.closed, 100);
        assert_eq!(dialer.calls(), 100);

        let outcome = manager.shutdown().await;
        assert_eq!(outcome, DrainOutcome { drained: true, forced: 0 });
    }

    #[tokio::test]
    async fn test_drain_waits_for_sessions_to_finish() {
        let manager = start(&config(None, true), Arc::new(MockDialer::echo())).await;
        let proxy = manager.socks_addr().unwrap();

        let mut stream = Socks5Stream::connect(proxy, ("example.com", 80))
            .await
            .unwrap();
        let registry = manager.registry();
        wait_live(&registry, 1).await;

        let shutdown = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.shutdown().await })
        };

        // The live session keeps working while draining.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.state(), ShutdownState::Draining);
        stream.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 10];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");

        // New connections are no longer accepted.
        let refused = tokio::time::timeout(
            Duration::from_millis(200),
            Socks5Stream::connect(proxy, ("example.com", 80)),
        )
        .await;
        assert!(!matches!(refused, Ok(Ok(_))));

        stream.shutdown().await.unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();

        let outcome = shutdown.await.unwrap();
        assert_eq!(outcome, DrainOutcome { drained: true, forced: 0 });
        assert_eq!(manager.state(), ShutdownState::Stopped);
    }

    #[tokio::test]
    async fn test_drain_timeout_forces_close_of_every_session() {
        const SESSIONS: usize = 10;
        let drain = Duration::from_millis(300);
        let mut config = config(None, true);
        config.timeouts.drain = drain;
        let manager = start(&config, Arc::new(MockDialer::echo())).await;
        let proxy = manager.socks_addr().unwrap();

        // Every session is mid-relay and would stay open indefinitely.
        let mut streams = Vec::new();
        for i in 0..SESSIONS {
            let mut stream = Socks5Stream::connect(proxy, ("example.com", 80))
                .await
                .unwrap();
            let payload = format!("relay {}", i).into_bytes();
            stream.write_all(&payload).await.unwrap();
            let mut echoed = vec![0u8; payload.len()];
            stream.read_exact(&mut echoed).await.unwrap();
            assert_eq!(echoed, payload);
            streams.push(stream);
        }
        wait_live(&manager.registry(), SESSIONS).await;

        let started = tokio::time::Instant::now();
        let outcome = manager.shutdown().await;
        let elapsed = started.elapsed();

        assert_eq!(outcome, DrainOutcome { drained: false, forced: SESSIONS });
        assert!(elapsed >= drain);
        assert!(elapsed < drain + Duration::from_secs(1), "shutdown took {:?}", elapsed);
        assert_eq!(manager.registry().live_count(), 0);
        assert_eq!(manager.registry().counts().closed, SESSIONS as u64);
        assert_eq!(manager.state(), ShutdownState::Stopped);

        // Each client observes the close, as EOF or a reset.
        for mut stream in streams {
            let mut buf = Vec::new();
            tokio::time::timeout(Duration::from_secs(1), stream.read_to_end(&mut buf))
                .await
                .expect("client never saw the forced close")
                .ok();
        }
    }

    #[tokio::test]
    async fn test_upgraded_session_keeps_its_connection_slot() {
        let origin = spawn_upgrade_origin().await;
        let origin = format!("http://{}", origin);
        let mut config = config(Some(origin.as_str()), false);
        config.max_connections = 1;
        let manager = start(&config, Arc::new(MockDialer::direct())).await;
        let http_addr = manager.http_addr().unwrap();

        let mut upgraded = TcpStream::connect(http_addr).await.unwrap();
        upgraded.write_all(UPGRADE_REQUEST).await.unwrap();
        let head = read_head(&mut upgraded).await;
        assert!(head.starts_with(b"HTTP/1.1 101"));
        upgraded.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        upgraded.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        // The only slot belongs to the upgraded session, so this one waits.
        let mut second = TcpStream::connect(http_addr).await.unwrap();
        second
            .write_all(b"GET /health HTTP/1.1\r\nhost: proxy.local\r\n\r\n")
            .await
            .unwrap();
        let mut byte = [0u8; 1];
        let early = tokio::time::timeout(Duration::from_millis(300), second.read(&mut byte)).await;
        assert!(early.is_err(), "second connection served past the connection bound");
        assert_eq!(manager.registry().live_count(), 1);

        drop(upgraded);
        let head = tokio::time::timeout(Duration::from_secs(5), read_head(&mut second))
            .await
            .expect("second connection never served after the slot freed up");
        assert!(head.starts_with(b"HTTP/1.1 200"));
    }

    #[tokio::test]
    async fn test_denied_client_is_closed() {
        let mut config = config(None, true);
        config.policy.allow_clients = vec!["10.9.9.9".parse().unwrap()];
        let dialer = Arc::new(MockDialer::echo());
        let manager = ListenerManager::bind(
            &config,
            dialer.clone(),
            Arc::new(StaticPolicy::from_config(&config.policy)),
        )
        .await
        .unwrap();
        manager.start();

        let result = Socks5Stream::connect(manager.socks_addr().unwrap(), ("example.com", 80)).await;
        assert!(result.is_err());

        let registry = manager.registry();
        wait_live(&registry, 0).await;
        assert_eq!(registry.counts().accepted, 1);
        assert_eq!(registry.counts().closed, 1);
        assert_eq!(dialer.calls(), 0);
    }

    #[tokio::test]
    async fn test_http_health_and_graceful_drain() {
        let dialer = Arc::new(MockDialer::echo());
        let manager = start(&config(Some("http://origin.internal:8080"), true), dialer.clone()).await;
        let http_addr = manager.http_addr().unwrap();

        let stream = TcpStream::connect(http_addr).await.unwrap();
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .unwrap();
        let conn = tokio::spawn(conn);

        let request = hyper::Request::get("/health")
            .header("host", "proxy.local")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = sender.send_request(request).await.unwrap();
        assert_eq!(response.status(), 200);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["target"], "http://origin.internal:8080");
        assert_eq!(health["ports"]["http"], http_addr.port());
        assert_eq!(health["ports"]["socks"], manager.socks_addr().unwrap().port());
        assert_eq!(health["sessions"]["live"], 1);
        assert_eq!(dialer.calls(), 0);

        // The idle keep-alive connection is closed by the drain.
        let outcome = manager.shutdown().await;
        assert_eq!(outcome, DrainOutcome { drained: true, forced: 0 });
        let _ = tokio::time::timeout(Duration::from_secs(1), conn)
            .await
            .expect("client connection was not closed");

        let snapshot = manager.sessions();
        assert!(snapshot.is_empty());
    }
}
