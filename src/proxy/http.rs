//! HTTP forwarding front end
//!
//! Every request except `GET /health` is rewritten for the configured origin
//! and sent over a freshly dialed upstream connection. Responses stream back
//! unbuffered. Upgrade handshakes (for example WebSocket) are relayed as raw
//! byte streams once the origin answers `101 Switching Protocols`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{FromRef, Request, State},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Router,
};
use http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, Version};
use hyper::server::conn::http1;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn, Instrument};

use crate::config::{Origin, TimeoutConfig};
use crate::error::{ProxyError, Result};
use crate::models::{CloseReason, SessionState};
use crate::proxy::dialer::Dialer;
use crate::proxy::health::{health_check, HealthReporter};
use crate::proxy::relay::relay;
use crate::proxy::session::SessionGuard;
use crate::proxy::shutdown::ShutdownSignal;
use crate::proxy::stream::CountingStream;

/// Header added to every forwarded request
pub const FORWARDED_BY: HeaderName = HeaderName::from_static("x-forwarded-by");
pub const FORWARDED_BY_VALUE: &str = "duoproxy";

/// Connection-scoped headers that never cross the proxy
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared state of the HTTP router
#[derive(Clone)]
pub struct HttpState {
    pub origin: Arc<Origin>,
    pub dialer: Arc<dyn Dialer>,
    pub timeouts: TimeoutConfig,
    pub health: HealthReporter,
}

impl FromRef<HttpState> for HealthReporter {
    fn from_ref(state: &HttpState) -> Self {
        state.health.clone()
    }
}

/// Per-connection request extension
#[derive(Clone)]
pub struct ConnectionContext {
    pub session: Arc<SessionGuard>,
    pub signal: ShutdownSignal,
}

/// Build the HTTP router
pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health_check).fallback(forward))
        .fallback(forward)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Serve one client connection until it closes, drains or is forced shut
pub async fn serve_connection<S>(
    stream: S,
    router: Router,
    session: Arc<SessionGuard>,
    timeouts: &TimeoutConfig,
    signal: ShutdownSignal,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(CountingStream::new(stream, session.info().clone()));
    let context = ConnectionContext {
        session: session.clone(),
        signal: signal.clone(),
    };
    let service = TowerToHyperService::new(router.layer(Extension(context)));

    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(timeouts.handshake)
        .serve_connection(io, service)
        .with_upgrades();
    tokio::pin!(conn);

    let mut draining = false;
    let reason = loop {
        tokio::select! {
            result = conn.as_mut() => break match result {
                Ok(()) => CloseReason::Clean,
                Err(e) => {
                    debug!("HTTP connection ended with error: {}", e);
                    CloseReason::ClientError
                }
            },
            _ = signal.draining(), if !draining => {
                debug!("Draining, closing connection after in-flight request");
                conn.as_mut().graceful_shutdown();
                draining = true;
            }
            _ = signal.forced() => break CloseReason::ForcedShutdown,
        }
    };

    if !session.is_handed_off() {
        session.close(reason);
    }
}

async fn forward(
    State(state): State<HttpState>,
    connection: Option<Extension<ConnectionContext>>,
    req: Request,
) -> Response {
    let connection = connection.map(|Extension(c)| c);
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match forward_request(&state, connection.as_ref(), req).await {
        Ok(response) => response,
        Err(e) => {
            warn!(method = %method, path = %path, "Forwarding failed: {}", e);
            let dial_failed = matches!(e, ProxyError::Dial(_));
            let mut response = e.into_response();
            if dial_failed {
                if let Some(connection) = &connection {
                    connection.session.close(CloseReason::DialFailed);
                }
                response
                    .headers_mut()
                    .insert(header::CONNECTION, HeaderValue::from_static("close"));
            }
            response
        }
    }
}

async fn forward_request(
    state: &HttpState,
    connection: Option<&ConnectionContext>,
    mut req: Request,
) -> Result<Response> {
    let upgrade = is_upgrade(req.headers());
    let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut req));
    let outbound = rewrite_request(&state.origin, req, upgrade)?;

    if let Some(connection) = connection {
        connection.session.set_target(state.origin.target.clone());
        connection.session.advance(SessionState::Dialing);
    }
    let upstream = state
        .dialer
        .dial(&state.origin.target, state.timeouts.connect)
        .await?;
    if let Some(connection) = connection {
        connection.session.advance(SessionState::Relaying);
    }

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(upstream.stream))
        .await?;
    tokio::spawn(
        async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Upstream connection ended: {}", e);
            }
        }
        .in_current_span(),
    );

    let mut response = tokio::time::timeout(state.timeouts.request, sender.send_request(outbound))
        .await
        .map_err(|_| ProxyError::UpstreamTimeout)??;

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        let (Some(client_upgrade), Some(connection)) = (client_upgrade, connection) else {
            return Err(ProxyError::Upstream(
                "origin switched protocols without an upgrade request".into(),
            ));
        };
        let upstream_upgrade = hyper::upgrade::on(&mut response);
        spawn_upgrade_relay(
            client_upgrade,
            upstream_upgrade,
            connection.clone(),
            state.timeouts.idle,
        );
    } else {
        strip_hop_by_hop(response.headers_mut());
    }

    Ok(response.map(Body::new))
}

/// Relay an upgraded connection; the spawned task owns the session's close
fn spawn_upgrade_relay(
    client: OnUpgrade,
    upstream: OnUpgrade,
    connection: ConnectionContext,
    idle_timeout: Duration,
) {
    connection.session.hand_off();

    tokio::spawn(
        async move {
            let session = connection.session;
            let (client, upstream) = match tokio::try_join!(client, upstream) {
                Ok(pair) => pair,
                Err(e) => {
                    debug!("Upgrade failed: {}", e);
                    session.close(CloseReason::UpstreamError);
                    return;
                }
            };

            // Client bytes keep flowing through the counting stream underneath.
            let outcome = relay(
                TokioIo::new(client),
                TokioIo::new(upstream),
                idle_timeout,
                connection.signal.forced(),
            )
            .await;
            session.close(outcome.reason.into());
        }
        .in_current_span(),
    );
}

fn is_upgrade(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Remove hop-by-hop headers, including any named by `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Point a client request at the origin
fn rewrite_request(origin: &Origin, req: Request, upgrade: bool) -> Result<Request> {
    let (parts, body) = req.into_parts();

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = format!("{}{}", origin.path_prefix, path)
        .parse()
        .map_err(|e| ProxyError::InvalidRequest(format!("Cannot forward {}: {}", path, e)))?;

    let mut headers = parts.headers;
    let upgrade_protocol = headers.get(header::UPGRADE).cloned();
    strip_hop_by_hop(&mut headers);
    if let (true, Some(protocol)) = (upgrade, upgrade_protocol) {
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(header::UPGRADE, protocol);
    }

    let host = HeaderValue::from_str(&origin.authority)
        .map_err(|e| ProxyError::InvalidConfig(format!("Origin authority: {}", e)))?;
    headers.insert(header::HOST, host);
    headers.insert(FORWARDED_BY, HeaderValue::from_static(FORWARDED_BY_VALUE));

    let mut outbound = Request::new(body);
    *outbound.method_mut() = parts.method;
    *outbound.uri_mut() = uri;
    *outbound.version_mut() = Version::HTTP_11;
    *outbound.headers_mut() = headers;
    Ok(outbound)
}
