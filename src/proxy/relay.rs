//! Bidirectional stream relay
//!
//! Copies bytes client→upstream and upstream→client concurrently. A direction
//! that reaches EOF (or fails) half-closes its destination and the other
//! direction keeps running until it terminates on its own, the relay goes idle,
//! or a forced shutdown arrives.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, instrument};

/// Per-direction copy buffer
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Why a relay ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Both directions reached EOF
    Clean,
    /// Reading from or writing to the upstream failed first
    UpstreamError,
    /// Reading from or writing to the client failed first
    ClientError,
    /// No bytes moved in either direction for the idle timeout
    IdleTimeout,
    /// The relay was told to stop
    ForcedShutdown,
}

/// Byte totals and termination reason of a finished relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
    pub reason: TerminationReason,
}

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
enum Side {
    Client = 1,
    Upstream = 2,
}

const NO_FAILURE: u8 = 0;

/// State shared by both copy directions and the idle watchdog
struct RelayState {
    started: Instant,
    /// Milliseconds since `started` at the last byte movement
    last_activity: AtomicU64,
    client_to_upstream: AtomicU64,
    upstream_to_client: AtomicU64,
    first_failure: AtomicU8,
}

impl RelayState {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_activity: AtomicU64::new(0),
            client_to_upstream: AtomicU64::new(0),
            upstream_to_client: AtomicU64::new(0),
            first_failure: AtomicU8::new(NO_FAILURE),
        }
    }

    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_activity.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn idle_deadline(&self, idle_timeout: Duration) -> Instant {
        let last = Duration::from_millis(self.last_activity.load(Ordering::Relaxed));
        last.checked_add(idle_timeout)
            .and_then(|after| self.started.checked_add(after))
            .unwrap_or_else(far_future)
    }

    fn fail(&self, side: Side) {
        let _ = self.first_failure.compare_exchange(
            NO_FAILURE,
            side as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn completion_reason(&self) -> TerminationReason {
        match self.first_failure.load(Ordering::Acquire) {
            x if x == Side::Client as u8 => TerminationReason::ClientError,
            x if x == Side::Upstream as u8 => TerminationReason::UpstreamError,
            _ => TerminationReason::Clean,
        }
    }

    fn outcome(&self, reason: TerminationReason) -> RelayOutcome {
        RelayOutcome {
            client_to_upstream: self.client_to_upstream.load(Ordering::Relaxed),
            upstream_to_client: self.upstream_to_client.load(Ordering::Relaxed),
            reason,
        }
    }
}

/// About 30 years out; stands in for "never"
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

/// Copy `reader` into `writer` until EOF or error, then half-close `writer`.
async fn copy_direction<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &AtomicU64,
    state: &RelayState,
    from: Side,
    to: Side,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(side = ?from, "Read ended with error: {}", e);
                state.fail(from);
                break;
            }
        };
        state.touch();

        let written = async {
            writer.write_all(&buf[..n]).await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            debug!(side = ?to, "Write failed: {}", e);
            state.fail(to);
            return;
        }
        counter.fetch_add(n as u64, Ordering::Relaxed);
        state.touch();
    }

    // Half-close: the peer sees EOF while the other direction keeps draining.
    let _ = writer.shutdown().await;
}

/// Relay bytes between `client` and `upstream` until both directions end.
///
/// Returns early with [`TerminationReason::IdleTimeout`] when nothing moves for
/// `idle_timeout`, or with [`TerminationReason::ForcedShutdown`] once `force`
/// resolves. Both streams are dropped (closed) before this returns.
#[instrument(skip_all)]
pub async fn relay<C, U, F>(
    client: C,
    upstream: U,
    idle_timeout: Duration,
    force: F,
) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite,
    U: AsyncRead + AsyncWrite,
    F: Future<Output = ()>,
{
    let state = RelayState::new();
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let transfer = async {
        tokio::join!(
            copy_direction(
                &mut client_read,
                &mut upstream_write,
                &state.client_to_upstream,
                &state,
                Side::Client,
                Side::Upstream,
            ),
            copy_direction(
                &mut upstream_read,
                &mut client_write,
                &state.upstream_to_client,
                &state,
                Side::Upstream,
                Side::Client,
            ),
        )
    };

    let idle = async {
        loop {
            tokio::time::sleep_until(state.idle_deadline(idle_timeout)).await;
            if Instant::now() >= state.idle_deadline(idle_timeout) {
                break;
            }
        }
    };

    let reason = tokio::select! {
        biased;
        _ = transfer => state.completion_reason(),
        _ = force => TerminationReason::ForcedShutdown,
        _ = idle => TerminationReason::IdleTimeout,
    };

    let outcome = state.outcome(reason);
    debug!(
        client_to_upstream = outcome.client_to_upstream,
        upstream_to_client = outcome.upstream_to_client,
        reason = ?outcome.reason,
        "Relay finished"
    );
    outcome
}
