//! Proxy server: accept loop and per-connection task spawning.
//!
//! # Responsibilities
//! - Accept clients through the bounded listener
//! - Spawn one task per connection, each in its own tracing span
//! - Stop accepting on shutdown and drain in-flight connections

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::Instrument;

use crate::cache::CacheStore;
use crate::config::ProxyConfig;
use crate::net::{ConnectionTracker, Listener, ListenerError};
use crate::proxy::handler::ConnectionHandler;

/// Pause after a failed accept (e.g. file descriptor exhaustion).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Forwarding proxy server.
pub struct ProxyServer {
    handler: Arc<ConnectionHandler>,
    tracker: ConnectionTracker,
    shutdown_grace: Duration,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Self {
        if config.cache.enabled {
            tracing::info!(directory = %config.cache.directory.display(), "Response cache enabled");
        } else {
            tracing::info!("Response cache disabled");
        }

        Self {
            handler: Arc::new(ConnectionHandler::from_config(&config)),
            tracker: ConnectionTracker::new(),
            shutdown_grace: config.timeouts.shutdown_grace(),
        }
    }

    pub fn cache(&self) -> Option<&CacheStore> {
        self.handler.engine().cache()
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Serve until `shutdown` fires, then wait up to the grace period for
    /// open connections.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ListenerError> {
        let addr = listener.local_addr().map_err(ListenerError::Accept)?;
        tracing::info!(address = %addr, "Proxy listening");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, no longer accepting");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        let guard = self.tracker.track();
                        let handler = Arc::clone(&self.handler);
                        let span = tracing::info_span!("connection", id = %guard.id(), peer = %peer);

                        tokio::spawn(
                            async move {
                                handler.handle(stream, peer).await;
                                drop(guard);
                                drop(permit);
                            }
                            .instrument(span),
                        );
                    }
                    Err(ListenerError::Closed) => return Err(ListenerError::Closed),
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        self.drain().await;
        Ok(())
    }

    async fn drain(&self) {
        let open = self.tracker.active_count();
        if open == 0 {
            return;
        }
        tracing::info!(open, grace = ?self.shutdown_grace, "Waiting for open connections");
        if tokio::time::timeout(self.shutdown_grace, self.tracker.wait_for_idle())
            .await
            .is_err()
        {
            tracing::warn!(
                open = self.tracker.active_count(),
                "Grace period elapsed with connections still open"
            );
        }
    }
}
