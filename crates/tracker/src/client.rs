//! Handle through which in-process consumers attach to the tracker.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::{mpsc, oneshot};

use crate::{
    data_model::{TaskDelta, TaskSnapshot},
    tracker::{
        subscribers::{SubscribeError, SubscriberId},
        Command,
    },
};

/// Room for a burst of deltas while a consumer is busy; a consumer that
/// falls further behind than this loses deltas (delivery is best-effort)
/// until it catches up or is detached.
const DELTA_CHANNEL_CAPACITY: usize = 1024;

/// An attached subscription: the point-in-time task snapshot plus the live
/// delta feed from that point on. Dropping it detaches the peer.
pub struct Subscription {
    pub peer: SubscriberId,
    pub snapshot: TaskSnapshot,
    pub deltas: mpsc::Receiver<TaskDelta>,
}

/// Cloneable address of the tracker actor. Stays valid across the tracker's
/// internal reconnects; a subscription, by contrast, lives at most as long
/// as one master connection.
#[derive(Clone)]
pub struct TrackerHandle {
    commands: mpsc::Sender<Command>,
    next_peer: Arc<AtomicU64>,
    subscribe_timeout: Duration,
}

impl TrackerHandle {
    pub(crate) fn new(commands: mpsc::Sender<Command>, subscribe_timeout: Duration) -> Self {
        Self {
            commands,
            next_peer: Arc::new(AtomicU64::new(1)),
            subscribe_timeout,
        }
    }

    /// Allocate an identity for a consumer. One identity may hold at most
    /// one live subscription at a time.
    pub fn allocate_peer(&self) -> SubscriberId {
        SubscriberId(self.next_peer.fetch_add(1, Ordering::Relaxed))
    }

    /// Attach `peer` to the task feed.
    ///
    /// * `Err(Init)` — the tracker is gone (or never started).
    /// * `Err(Wait)` — no cluster snapshot yet; retry shortly.
    /// * `Err(AlreadySubscribed)` — this peer already holds a subscription.
    /// * `Err(Timeout)` — the handshake took longer than the caller-side
    ///   bound.
    pub async fn subscribe(&self, peer: SubscriberId) -> Result<Subscription, SubscribeError> {
        let (delivery, deltas) = mpsc::channel(DELTA_CHANNEL_CAPACITY);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Subscribe {
                peer,
                delivery,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SubscribeError::Init)?;

        match tokio::time::timeout(self.subscribe_timeout, reply_rx).await {
            Err(_) => Err(SubscribeError::Timeout),
            Ok(Err(_)) => Err(SubscribeError::Init),
            Ok(Ok(result)) => result.map(|snapshot| Subscription {
                peer,
                snapshot,
                deltas,
            }),
        }
    }
}
