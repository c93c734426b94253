//! duoproxy - Entry Point
//!
//! Starts the HTTP forwarding and SOCKS5 listeners and drains them on
//! Ctrl+C or SIGTERM.

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use duoproxy::config::{Config, LogConfig};
use duoproxy::proxy::{AccessPolicy, Dialer, ListenerManager, StaticPolicy, TcpDialer};

#[tokio::main]
async fn main() -> duoproxy::Result<()> {
    // Load configuration
    let config = Config::from_env().inspect_err(|e| eprintln!("duoproxy: {}", e))?;

    init_tracing(&config.log);
    info!("Starting duoproxy");

    let policy: Arc<dyn AccessPolicy> = Arc::new(StaticPolicy::from_config(&config.policy));
    let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::new(policy.clone()));

    let manager = ListenerManager::bind(&config, dialer, policy)
        .await
        .inspect_err(|e| error!("Startup failed: {}", e))?;
    manager.start();

    info!(
        http = ?manager.http_addr(),
        socks = ?manager.socks_addr(),
        origin = config.http.origin.as_ref().map(|o| o.raw.as_str()).unwrap_or("-"),
        "Listeners started"
    );

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let outcome = manager.shutdown().await;
    info!(
        drained = outcome.drained,
        forced = outcome.forced,
        "duoproxy stopped"
    );
    Ok(())
}

/// Install the global subscriber; `RUST_LOG` overrides `LOG_LEVEL`
fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("duoproxy={},tower_http={}", log.level, log.level).into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
