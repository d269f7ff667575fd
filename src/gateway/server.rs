//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{info, warn};

use super::router::{AppState, create_router};
use crate::config::Config;
use crate::store::SharedCache;
use crate::{Error, Result};

/// Admission gateway server
pub struct Gateway {
    config: Config,
    state: Arc<AppState>,
}

impl Gateway {
    /// Create a new gateway. Connects nothing yet; the cache client is lazy.
    pub fn new(config: Config) -> Result<Self> {
        let cache = SharedCache::from_config(&config.cache)?;
        let state = Arc::new(AppState::from_config(&config, cache)?);
        Ok(Self { config, state })
    }

    /// Shared state, for embedding the router elsewhere
    #[must_use]
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Run the gateway until a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        if let Some(verifier) = &self.state.verifier {
            let trust_root = Arc::clone(verifier.trust_root());
            tokio::spawn(async move { trust_root.warm().await });
        }

        let app = create_router(Arc::clone(&self.state));
        let listener = TcpListener::bind(addr).await?;

        info!("Admission gateway listening on http://{addr}");
        info!(
            cache = self.state.cache.backend_name(),
            auth = self.state.verifier.is_some(),
            rate_limiting = self.state.limiter.is_some(),
            upstream = self.state.upstream.as_ref().map(|u| u.base_url()),
            "Gateway ready"
        );
        if let Some(lockout) = self.state.limiter.as_ref().and_then(|l| l.lockout()) {
            info!(fail_mode = ?lockout.fail_mode(), "Auth lockout active");
        }

        let shutdown_timeout = self.config.server.shutdown_timeout;
        let stopping = Arc::new(Notify::new());
        let notify = Arc::clone(&stopping);
        let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                notify.notify_one();
            });
        let mut server = tokio::spawn(async move { server.await });

        tokio::select! {
            joined = &mut server => return finish(joined),
            () = stopping.notified() => {}
        }

        // In-flight requests get `shutdown_timeout` to drain.
        match tokio::time::timeout(shutdown_timeout, server).await {
            Ok(joined) => finish(joined)?,
            Err(_) => warn!(timeout = ?shutdown_timeout, "Connections still open at shutdown deadline"),
        }
        info!("Gateway stopped");
        Ok(())
    }
}

fn finish(joined: std::result::Result<std::io::Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(result) => Ok(result?),
        Err(e) => Err(Error::Internal(format!("Server task failed: {e}"))),
    }
}

/// Resolve on Ctrl+C or SIGTERM. A handler that cannot be installed never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
