//! Test harness: a tracker actor whose connection side is a channel the
//! test feeds directly, bypassing HTTP.

use std::sync::Arc;

use bytes::Bytes;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    client::{Subscription, TrackerHandle},
    connection::{build_client, ConnEvent, ConnectionError, MasterEndpoint, StaticResolver},
    metrics::TrackerMetrics,
    recordio,
    tracker::subscribers::{SubscribeError, SubscriberId},
    tracker::{Tracker, TrackerOptions},
};

pub(crate) struct TestTracker {
    pub handle: TrackerHandle,
    pub conn_tx: mpsc::Sender<ConnEvent>,
    pub shutdown: CancellationToken,
    pub actor: JoinHandle<Result<(), ConnectionError>>,
}

impl TestTracker {
    /// Run `stream_events` over an injected connection channel.
    pub fn start() -> TestTracker {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (conn_tx, conn_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let options = TrackerOptions::default();
        let handle = TrackerHandle::new(cmd_tx.clone(), options.subscribe_timeout);
        let mut tracker = Tracker {
            cmd_tx,
            cmd_rx,
            client: build_client().unwrap(),
            resolver: Arc::new(StaticResolver::new(MasterEndpoint {
                url: "http://mesos.invalid:5050".to_string(),
                principal: None,
                secret: None,
            })),
            options,
            metrics: TrackerMetrics::new(),
            shutdown: shutdown.clone(),
        };
        let actor = tokio::spawn(async move { tracker.stream_events(conn_rx).await });
        TestTracker {
            handle,
            conn_tx,
            shutdown,
            actor,
        }
    }

    pub async fn send_chunk(&self, bytes: &[u8]) {
        self.conn_tx
            .send(ConnEvent::Chunk(Bytes::copy_from_slice(bytes)))
            .await
            .expect("tracker hung up its connection channel");
    }

    /// Frame and send one operator event.
    pub async fn send_event(&self, event: &serde_json::Value) {
        self.send_chunk(&recordio::encode(event.to_string().as_bytes()))
            .await;
    }

    pub async fn send_subscribed(&self, heartbeat_interval_seconds: f64) {
        self.send_event(&serde_json::json!({
            "type": "SUBSCRIBED",
            "subscribed": {
                "heartbeat_interval_seconds": heartbeat_interval_seconds,
                "get_state": {}
            }
        }))
        .await;
    }

    /// Subscribe, riding out the handshake racing the event channel. Only
    /// yields to the scheduler, so paused-clock tests stay exact.
    pub async fn attach(&self, peer: SubscriberId) -> Subscription {
        for _ in 0..1000 {
            match self.handle.subscribe(peer).await {
                Ok(subscription) => return subscription,
                Err(SubscribeError::Wait) => tokio::task::yield_now().await,
                Err(err) => panic!("subscribe failed: {err}"),
            }
        }
        panic!("tracker never became ready");
    }
}
