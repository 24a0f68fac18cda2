//! ZMQ `hashblock` subscription.
//!
//! Bitcoin Core publishes the hash of every newly connected block on its ZMQ
//! interface. The listener forwards a unit tick for each notification; the
//! template source reacts by refreshing immediately instead of waiting for
//! the next poll. Socket failures reconnect with exponential backoff.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use zeromq::{Socket, SocketRecv, SubSocket};

use crate::tracing::prelude::*;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Subscribe to `hashblock` and forward a tick per notification.
///
/// Runs until shutdown. Never returns an error: transient socket failures
/// are logged and retried forever, since the poll timer keeps the pool
/// working even with ZMQ down.
pub async fn run_hashblock_listener(
    endpoint: String,
    notify_tx: mpsc::Sender<()>,
    shutdown: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match listen(&endpoint, &notify_tx, &shutdown, &mut backoff).await {
            Ok(()) => return,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "ZMQ connection lost, reconnecting");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.cancelled() => return,
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// One connection lifetime. `Ok(())` means shutdown was requested.
async fn listen(
    endpoint: &str,
    notify_tx: &mpsc::Sender<()>,
    shutdown: &CancellationToken,
    backoff: &mut Duration,
) -> Result<(), zeromq::ZmqError> {
    let mut socket = SubSocket::new();
    socket.connect(endpoint).await?;
    socket.subscribe("hashblock").await?;
    debug!(endpoint = %endpoint, "Subscribed to hashblock notifications");

    loop {
        tokio::select! {
            message = socket.recv() => {
                let message = message?;
                // A delivered message proves the endpoint is healthy.
                *backoff = INITIAL_BACKOFF;

                let is_hashblock = message
                    .get(0)
                    .map(|topic| topic.as_ref() == b"hashblock".as_slice())
                    .unwrap_or(false);

                if is_hashblock {
                    if let Some(hash) = message.get(1) {
                        info!(block = %display_hash(hash), "New block announced via ZMQ");
                    }
                    // Drop the tick if the source is already refreshing.
                    let _ = notify_tx.try_send(());
                }
            }
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}

/// Hex-encode with byte order reversed, the display convention for hashes.
fn display_hash(bytes: &[u8]) -> String {
    let reversed: Vec<u8> = bytes.iter().rev().copied().collect();
    hex::encode(reversed)
}
