//! Fire-and-forget queue toward the persistence collaborator.
//!
//! The core only ever emits `RecordLastRoom` events; the profile store
//! behind them is an external collaborator. Events are offered into a
//! bounded queue and a worker drains it. Overflow drops the event with a
//! warning; nothing upstream blocks on persistence.

use log::{debug, info, warn};
use shared::PERSISTENCE_QUEUE_DEPTH;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// A player's most recent room, to be written to the profile store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLastRoom {
    pub player_id: String,
    pub room_id: String,
}

struct Inner {
    tx: mpsc::Sender<RecordLastRoom>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to the persistence queue.
#[derive(Clone)]
pub struct PersistenceQueue {
    inner: Arc<Inner>,
}

impl PersistenceQueue {
    /// Starts the queue and its worker. With no `DATABASE_URL` the worker
    /// logs and discards events, which is the whole interface the core
    /// depends on.
    pub fn start(database_url: Option<String>) -> Self {
        let (tx, mut rx) = mpsc::channel::<RecordLastRoom>(PERSISTENCE_QUEUE_DEPTH);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let configured = database_url.is_some();

        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => handle_event(&event, configured),
                        None => break,
                    },
                    _ = shutdown_rx.wait_for(|stop| *stop) => {
                        // Drain whatever was queued before the signal.
                        while let Ok(event) = rx.try_recv() {
                            handle_event(&event, configured);
                        }
                        break;
                    }
                }
            }
            info!("Persistence worker stopped");
        });

        info!("Persistence worker started");
        Self {
            inner: Arc::new(Inner {
                tx,
                shutdown_tx,
                worker: Mutex::new(Some(worker)),
            }),
        }
    }

    /// Non-blocking offer. Returns whether the event was queued.
    pub fn record_last_room(&self, player_id: &str, room_id: &str) -> bool {
        let event = RecordLastRoom {
            player_id: player_id.to_string(),
            room_id: room_id.to_string(),
        };
        match self.inner.tx.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    "Persistence queue full, dropping last-room update for player {}",
                    player_id
                );
                false
            }
        }
    }

    /// Signals the worker, lets it drain, and waits for it to exit.
    pub async fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
        if let Some(worker) = self.inner.worker.lock().await.take() {
            let _ = worker.await;
        }
    }
}

fn handle_event(event: &RecordLastRoom, configured: bool) {
    if configured {
        debug!(
            "Recorded last room {} for player {}",
            event.room_id, event.player_id
        );
    } else {
        debug!(
            "DATABASE_URL not set; discarding last-room update for player {}",
            event.player_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_and_shutdown() {
        let queue = PersistenceQueue::start(None);
        assert!(queue.record_last_room("alice", "ROOM42"));
        queue.shutdown().await;
        // Idempotent: a second shutdown finds no worker to await.
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_unavailable_queue_drops_instead_of_blocking() {
        let queue = PersistenceQueue::start(None);
        queue.shutdown().await;

        // The worker is gone; offers must fail fast, never block.
        let started = std::time::Instant::now();
        for i in 0..(PERSISTENCE_QUEUE_DEPTH + 10) {
            assert!(!queue.record_last_room(&format!("p{}", i), "ROOM"));
        }
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }
}
