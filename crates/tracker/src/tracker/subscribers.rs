//! Subscriber registry: who receives task deltas, snapshot-gated attach,
//! and per-subscriber liveness monitoring.

use std::{
    collections::HashMap,
    fmt::{self, Display},
};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{data_model::TaskDelta, tracker::Command};

/// Stable identity of a downstream consumer, allocated once per consumer by
/// the tracker handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub(crate) u64);

impl Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber-{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscribeError {
    /// The tracker is not running.
    #[error("tracker is not running")]
    Init,
    /// The tracker is running but has not applied a cluster snapshot yet.
    /// Retry shortly.
    #[error("tracker has no cluster snapshot yet")]
    Wait,
    #[error("peer is already subscribed")]
    AlreadySubscribed,
    #[error("subscribe handshake timed out")]
    Timeout,
}

/// `None` until the initial snapshot has been applied; subscribe requests
/// that arrive earlier are told to wait so they never observe a torn
/// half-snapshot.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    subs: Option<HashMap<SubscriberId, mpsc::Sender<TaskDelta>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&mut self) {
        if self.subs.is_none() {
            self.subs = Some(HashMap::new());
        }
    }

    pub fn insert(
        &mut self,
        peer: SubscriberId,
        delivery: mpsc::Sender<TaskDelta>,
    ) -> Result<(), SubscribeError> {
        let Some(subs) = self.subs.as_mut() else {
            return Err(SubscribeError::Wait);
        };
        if subs.contains_key(&peer) {
            return Err(SubscribeError::AlreadySubscribed);
        }
        info!(peer = %peer, "subscriber attached");
        subs.insert(peer, delivery);
        Ok(())
    }

    /// Called only from the peer's liveness monitor.
    pub fn remove(&mut self, peer: SubscriberId) {
        if let Some(subs) = self.subs.as_mut() {
            if subs.remove(&peer).is_some() {
                info!(peer = %peer, "subscriber went away, detached");
            }
        }
    }

    /// Best-effort delivery of one delta to every live subscriber. A peer
    /// that stopped reading is not waited for; its monitor will remove it.
    pub fn fan_out(&self, delta: &TaskDelta) {
        let Some(subs) = self.subs.as_ref() else {
            return;
        };
        for (peer, delivery) in subs {
            match delivery.try_send(delta.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(peer = %peer, task_id = %delta.task_id, "subscriber lagging, delta dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}

/// Install the liveness monitor for a freshly attached peer. Runs until the
/// peer drops its receiver (posting exactly one `PeerDown`) or the
/// connection is torn down, whichever comes first; the monitor must not
/// outlive the connection or its sender clone would keep the peer's channel
/// open forever.
pub fn spawn_monitor(
    peer: SubscriberId,
    delivery: mpsc::Sender<TaskDelta>,
    commands: mpsc::Sender<Command>,
    connection: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = delivery.closed() => {
                let _ = commands.send(Command::PeerDown { peer }).await;
            }
            _ = connection.cancelled() => {}
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::{Join, Task, TaskId, TaskState};

    fn delta(id: &str) -> TaskDelta {
        TaskDelta {
            task_id: TaskId::from(id),
            task: Task {
                id: TaskId::from(id),
                name: None,
                framework: Join::Unresolved("f1".into()),
                agent_ip: Join::Resolved(None),
                container_ip: vec![],
                state: TaskState::Running,
                ports: vec![],
            },
        }
    }

    #[tokio::test]
    async fn subscribe_before_snapshot_waits() {
        let mut registry = SubscriberRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        assert_eq!(
            registry.insert(SubscriberId(1), tx),
            Err(SubscribeError::Wait)
        );
    }

    #[tokio::test]
    async fn duplicate_subscribe_is_rejected() {
        let mut registry = SubscriberRegistry::new();
        registry.activate();
        let (tx, _rx) = mpsc::channel(1);
        assert_eq!(registry.insert(SubscriberId(1), tx.clone()), Ok(()));
        assert_eq!(
            registry.insert(SubscriberId(1), tx),
            Err(SubscribeError::AlreadySubscribed)
        );
    }

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber() {
        let mut registry = SubscriberRegistry::new();
        registry.activate();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        registry.insert(SubscriberId(1), tx1).unwrap();
        registry.insert(SubscriberId(2), tx2).unwrap();

        registry.fan_out(&delta("t1"));
        assert_eq!(rx1.recv().await.unwrap().task_id, TaskId::from("t1"));
        assert_eq!(rx2.recv().await.unwrap().task_id, TaskId::from("t1"));
    }

    #[tokio::test]
    async fn monitor_posts_peer_down_once_on_receiver_drop() {
        let (delivery, delivery_rx) = mpsc::channel::<TaskDelta>(1);
        let (commands, mut command_rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        spawn_monitor(SubscriberId(7), delivery, commands, token);

        drop(delivery_rx);
        match command_rx.recv().await.unwrap() {
            Command::PeerDown { peer } => assert_eq!(peer, SubscriberId(7)),
            other => panic!("unexpected command: {other:?}"),
        }
        // Monitor exits after firing; the command channel sender is gone.
        assert!(command_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn monitor_exits_quietly_on_connection_teardown() {
        let (delivery, _delivery_rx) = mpsc::channel::<TaskDelta>(1);
        let (commands, mut command_rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        spawn_monitor(SubscriberId(7), delivery, commands, token.clone());

        token.cancel();
        assert!(command_rx.recv().await.is_none());
    }
}
