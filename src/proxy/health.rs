//! Local health endpoint
//!
//! Answers `GET /health` from in-process state only; it never touches the
//! upstream origin.

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::models::{SessionCounts, ShutdownState};
use crate::proxy::session::SessionRegistry;

/// Bound ports of the enabled listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListenerPorts {
    pub http: Option<u16>,
    pub socks: Option<u16>,
}

/// Body of a health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub target: Option<String>,
    pub ports: ListenerPorts,
    pub sessions: SessionCounts,
    pub uptime_secs: u64,
}

#[derive(Clone)]
pub struct HealthReporter {
    target: Option<String>,
    ports: ListenerPorts,
    registry: Arc<SessionRegistry>,
    state: watch::Receiver<ShutdownState>,
    started_at: Instant,
}

impl HealthReporter {
    pub fn new(
        target: Option<String>,
        ports: ListenerPorts,
        registry: Arc<SessionRegistry>,
        state: watch::Receiver<ShutdownState>,
    ) -> Self {
        Self {
            target,
            ports,
            registry,
            state,
            started_at: Instant::now(),
        }
    }

    pub fn status(&self) -> HealthStatus {
        let state = *self.state.borrow();
        HealthStatus {
            status: state.as_str().to_string(),
            target: self.target.clone(),
            ports: self.ports,
            sessions: self.registry.counts(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

/// `GET /health`; 503 once the proxy has started draining
pub async fn health_check(State(reporter): State<HealthReporter>) -> impl IntoResponse {
    let status = reporter.status();
    let code = if status.status == ShutdownState::Running.as_str() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}
