//! Stratum TCP listener.
//!
//! Binds once at startup (a busy port is a fatal init error) and then
//! accepts connections until shutdown, spawning one session task per
//! socket. The connection cap is enforced here, before a session exists:
//! over-limit peers get a single error line and are closed.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::registry::SessionRegistry;
use super::session::{self, SessionSettings};
use crate::job::JobBuffer;
use crate::tracing::prelude::*;
use crate::validator::ShareValidator;

/// Everything a session task needs, bundled for the accept loop.
pub struct StratumServer {
    pub listener: TcpListener,
    pub max_connections: usize,
    pub registry: Arc<SessionRegistry>,
    pub jobs: Arc<JobBuffer>,
    pub validator: Arc<ShareValidator>,
    pub settings: Arc<SessionSettings>,
}

impl StratumServer {
    /// Bind the listener. Fails fast when the port is taken.
    pub async fn bind(
        host: &str,
        port: u16,
        max_connections: usize,
        registry: Arc<SessionRegistry>,
        jobs: Arc<JobBuffer>,
        validator: Arc<ShareValidator>,
        settings: Arc<SessionSettings>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind((host, port)).await.map_err(|e| {
            anyhow::anyhow!("cannot bind stratum listener on {}:{}: {}", host, port, e)
        })?;

        info!(host, port, "Stratum listener ready");

        Ok(Self {
            listener,
            max_connections,
            registry,
            jobs,
            validator,
            settings,
        })
    }

    /// Accept until shutdown. Session tasks are spawned on the tracker so
    /// the daemon can wait for them to drain.
    pub async fn run(self, tracker: TaskTracker, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };

                    if self.registry.connection_count() >= self.max_connections {
                        warn!(peer = %peer, "Connection cap reached, refusing");
                        tracker.spawn(refuse(stream));
                        continue;
                    }

                    tracker.spawn(session::run_session(
                        stream,
                        peer,
                        self.registry.clone(),
                        self.jobs.clone(),
                        self.validator.clone(),
                        self.settings.clone(),
                    ));
                }
                _ = shutdown.cancelled() => {
                    debug!("Stratum listener shutting down");
                    return;
                }
            }
        }
    }
}

/// Tell an over-limit peer why, then hang up.
async fn refuse(mut stream: TcpStream) {
    let line = b"{\"id\":null,\"result\":null,\"error\":[503,\"Too many connections\",null]}\n";
    let _ = stream.write_all(line).await;
    let _ = stream.shutdown().await;
}
