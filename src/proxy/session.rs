//! Session table
//!
//! Every accepted connection is registered here before any protocol work
//! starts and removed exactly once when its [`SessionGuard`] drops.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit};
use tracing::{debug, info};

use crate::models::{
    CloseReason, ProtocolKind, SessionCounts, SessionSnapshot, SessionState,
};
use crate::proxy::dialer::UpstreamTarget;

/// Live bookkeeping for one client connection
#[derive(Debug)]
pub struct SessionInfo {
    pub id: u64,
    pub kind: ProtocolKind,
    pub peer: SocketAddr,
    pub created_at: DateTime<Utc>,
    started: Instant,
    state: Mutex<SessionState>,
    target: Mutex<Option<UpstreamTarget>>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    handed_off: AtomicBool,
}

impl SessionInfo {
    fn new(id: u64, kind: ProtocolKind, peer: SocketAddr) -> Self {
        Self {
            id,
            kind,
            peer,
            created_at: Utc::now(),
            started: Instant::now(),
            state: Mutex::new(SessionState::Accepted),
            target: Mutex::new(None),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            handed_off: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Move to `next` if it is later in the lifecycle; returns whether it moved
    pub fn advance(&self, next: SessionState) -> bool {
        let mut state = self.state.lock();
        if state.can_advance_to(&next) {
            debug!(session_id = self.id, from = ?*state, to = ?next, "Session state change");
            *state = next;
            true
        } else {
            false
        }
    }

    /// Record the terminal state; the first reason wins
    pub fn close(&self, reason: CloseReason) -> bool {
        self.advance(SessionState::Closed(reason))
    }

    pub fn target(&self) -> Option<UpstreamTarget> {
        self.target.lock().clone()
    }

    /// Set the dial target; it is immutable once chosen
    pub fn set_target(&self, target: UpstreamTarget) {
        let mut slot = self.target.lock();
        if slot.is_none() {
            *slot = Some(target);
        }
    }

    /// Bytes received from the client
    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    /// Bytes sent to the client
    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Mark that a detached task (an upgraded HTTP relay) now owns the close
    pub fn hand_off(&self) {
        self.handed_off.store(true, Ordering::Release);
    }

    pub fn is_handed_off(&self) -> bool {
        self.handed_off.load(Ordering::Acquire)
    }

    pub fn duration(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            kind: self.kind,
            peer: self.peer,
            target: self.target().map(|t| t.to_string()),
            state: self.state(),
            created_at: self.created_at,
            bytes_in: self.bytes_in(),
            bytes_out: self.bytes_out(),
        }
    }
}

/// Table of live sessions
pub struct SessionRegistry {
    sessions: Mutex<HashMap<u64, Arc<SessionInfo>>>,
    next_id: AtomicU64,
    accepted: AtomicU64,
    closed: AtomicU64,
    emptied: Notify,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            accepted: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            emptied: Notify::new(),
        }
    }

    /// Add a session; it stays live until the returned guard drops
    pub fn register(self: &Arc<Self>, kind: ProtocolKind, peer: SocketAddr) -> SessionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = Arc::new(SessionInfo::new(id, kind, peer));

        {
            let mut sessions = self.sessions.lock();
            sessions.insert(id, info.clone());
            self.accepted.fetch_add(1, Ordering::Relaxed);
        }
        debug!(session_id = id, kind = %kind, peer = %peer, "Session registered");

        SessionGuard {
            info,
            registry: self.clone(),
            permit: None,
        }
    }

    fn remove(&self, info: &SessionInfo) {
        let now_empty = {
            let mut sessions = self.sessions.lock();
            if sessions.remove(&info.id).is_none() {
                return;
            }
            self.closed.fetch_add(1, Ordering::Relaxed);
            sessions.is_empty()
        };

        let reason = match info.state() {
            SessionState::Closed(reason) => reason,
            _ => CloseReason::Aborted,
        };
        let target = info
            .target()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        info!(
            session_id = info.id,
            kind = %info.kind,
            peer = %info.peer,
            target = %target,
            reason = %reason,
            bytes_in = info.bytes_in(),
            bytes_out = info.bytes_out(),
            duration_ms = info.duration().as_millis() as u64,
            "Session closed"
        );

        if now_empty {
            self.emptied.notify_waiters();
        }
    }

    pub fn live_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Counters read under the table lock so `live == accepted - closed`
    pub fn counts(&self) -> SessionCounts {
        let sessions = self.sessions.lock();
        SessionCounts {
            live: sessions.len(),
            accepted: self.accepted.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<SessionInfo>> = self.sessions.lock().values().cloned().collect();
        let mut snapshot: Vec<SessionSnapshot> = sessions.iter().map(|s| s.snapshot()).collect();
        snapshot.sort_by_key(|s| s.id);
        snapshot
    }

    /// Wait until no sessions are live
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.emptied.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.live_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Owning handle of a registered session
///
/// Dropping it removes the session from the table and logs its accounting.
/// A held connection permit is released only after that removal.
pub struct SessionGuard {
    info: Arc<SessionInfo>,
    registry: Arc<SessionRegistry>,
    permit: Option<OwnedSemaphorePermit>,
}

impl SessionGuard {
    pub fn info(&self) -> &Arc<SessionInfo> {
        &self.info
    }

    /// Tie a connection slot to the session's lifetime
    pub fn hold_permit(&mut self, permit: OwnedSemaphorePermit) {
        self.permit = Some(permit);
    }
}

impl Deref for SessionGuard {
    type Target = SessionInfo;

    fn deref(&self) -> &Self::Target {
        &self.info
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.info.close(CloseReason::Aborted);
        self.registry.remove(&self.info);
    }
}
