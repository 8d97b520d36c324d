//! A reserve of connected snowflakes.
//!
//! Peers are short-lived by design, so a caller that waits to dial until
//! it needs a tunnel pays the full rendezvous-plus-ICE latency on every
//! connection. The pool keeps up to `max_peers` ready peers banked:
//! `collect` dials one into the bank, `pop` hands out the oldest one
//! still alive. Capacity accounting covers in-flight dials too, so a
//! maintainer can call `collect` in a loop without overshooting.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dialer::Dialer;
use crate::error::{ClientError, Result};
use crate::peer::WebRtcPeer;

/// How long the maintainer naps when the bank is full or a dial failed.
const MAINTAIN_BACKOFF: std::time::Duration = std::time::Duration::from_secs(1);

pub struct PeerPool {
    dialer: Arc<Dialer>,
    tx: mpsc::Sender<WebRtcPeer>,
    rx: AsyncMutex<mpsc::Receiver<WebRtcPeer>>,
    cancel: CancellationToken,
}

impl PeerPool {
    pub fn new(dialer: Arc<Dialer>) -> Self {
        let (tx, rx) = mpsc::channel(dialer.get_max());
        Self { dialer, tx, rx: AsyncMutex::new(rx), cancel: CancellationToken::new() }
    }

    /// Dials one peer and banks it. Fails with [`ClientError::PoolCapacity`]
    /// when `max_peers` peers are already banked or being dialled.
    pub async fn collect(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::PoolCapacity);
        }
        // The permit holds a slot for the duration of the dial.
        let permit = match self.tx.try_reserve() {
            Ok(permit) => permit,
            Err(_) => return Err(ClientError::PoolCapacity),
        };
        let peer = self.dialer.catch().await?;
        debug!(id = peer.id(), "banked a snowflake");
        permit.send(peer);
        Ok(())
    }

    /// The next live banked peer. Peers that died while banked are
    /// discarded on the way out. `None` once the pool has ended.
    pub async fn pop(&self) -> Option<WebRtcPeer> {
        let mut rx = self.rx.lock().await;
        loop {
            let peer = tokio::select! {
                peer = rx.recv() => peer?,
                _ = self.cancel.cancelled() => return None,
            };
            if peer.closed() {
                debug!(id = peer.id(), "discarding a peer that died in the bank");
                continue;
            }
            return Some(peer);
        }
    }

    /// Keeps the bank topped up until the pool ends. Dial failures are
    /// recoverable here: log, back off, dial again.
    pub async fn maintain(&self) {
        loop {
            let outcome = tokio::select! {
                outcome = self.collect() => outcome,
                _ = self.cancel.cancelled() => return,
            };
            match outcome {
                Ok(()) => {}
                Err(ClientError::PoolCapacity) => {
                    tokio::select! {
                        _ = tokio::time::sleep(MAINTAIN_BACKOFF) => {}
                        _ = self.cancel.cancelled() => return,
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to collect a snowflake");
                    tokio::select! {
                        _ = tokio::time::sleep(MAINTAIN_BACKOFF) => {}
                        _ = self.cancel.cancelled() => return,
                    }
                }
            }
        }
    }

    /// Ends the pool: wakes `pop` callers and closes every banked peer.
    pub async fn end(&self) {
        self.cancel.cancel();
        let mut rx = self.rx.lock().await;
        while let Ok(peer) = rx.try_recv() {
            peer.close().await;
        }
        info!("peer pool ended");
    }

    pub fn capacity(&self) -> usize {
        self.dialer.get_max()
    }
}
