//! End-to-end tests against an in-process mock master that speaks the
//! Operator API wire format: streaming POST /api/v1, RecordIO frames,
//! redirects from non-leaders.

use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::Response,
    routing::post,
    Router,
};
use bytes::Bytes;
use tokio::{
    sync::mpsc,
    time::{sleep, timeout},
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::{
    client::{Subscription, TrackerHandle},
    connection::{build_client, MasterEndpoint, StaticResolver},
    data_model::{Join, TaskState},
    metrics::TrackerMetrics,
    recordio,
    tracker::subscribers::SubscribeError,
    tracker::{Tracker, TrackerOptions},
};

#[derive(Default)]
struct MockMaster {
    /// 307s to serve before acting as the leader.
    redirects: AtomicUsize,
    /// 503s to serve before acting as the leader.
    failures: AtomicUsize,
    hits: AtomicUsize,
    /// Sender feeding the currently streaming response body.
    stream: Mutex<Option<mpsc::Sender<Result<Bytes, Infallible>>>>,
}

impl MockMaster {
    async fn serve(self: Arc<Self>) -> SocketAddr {
        let app = Router::new()
            .route("/api/v1", post(subscribe_handler))
            .with_state(self);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    /// Wait for the tracker to reach the streaming phase and hand back the
    /// frame feed.
    async fn connected(&self) -> mpsc::Sender<Result<Bytes, Infallible>> {
        for _ in 0..500 {
            if let Some(tx) = self.stream.lock().unwrap().clone() {
                return tx;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("tracker never connected");
    }
}

async fn subscribe_handler(State(master): State<Arc<MockMaster>>) -> Response {
    master.hits.fetch_add(1, Ordering::SeqCst);

    if master
        .redirects
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return Response::builder()
            .status(StatusCode::TEMPORARY_REDIRECT)
            .header(header::LOCATION, "/api/v1")
            .body(Body::empty())
            .unwrap();
    }
    if master
        .failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(Body::empty())
            .unwrap();
    }

    let (tx, rx) = mpsc::channel(64);
    *master.stream.lock().unwrap() = Some(tx);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap()
}

async fn frame(feed: &mpsc::Sender<Result<Bytes, Infallible>>, event: &serde_json::Value) {
    let bytes = recordio::encode(event.to_string().as_bytes());
    feed.send(Ok(Bytes::from(bytes))).await.unwrap();
}

fn start_tracker(addr: SocketAddr) -> (TrackerHandle, CancellationToken) {
    let resolver = Arc::new(StaticResolver::new(MasterEndpoint {
        url: format!("http://{addr}"),
        principal: None,
        secret: None,
    }));
    let shutdown = CancellationToken::new();
    let (handle, _task) = Tracker::spawn(
        resolver,
        build_client().unwrap(),
        TrackerOptions::default(),
        TrackerMetrics::new(),
        shutdown.clone(),
    );
    (handle, shutdown)
}

async fn attach(handle: &TrackerHandle) -> Subscription {
    let peer = handle.allocate_peer();
    for _ in 0..500 {
        match handle.subscribe(peer).await {
            Ok(subscription) => return subscription,
            Err(SubscribeError::Wait) => sleep(Duration::from_millis(10)).await,
            Err(err) => panic!("subscribe failed: {err}"),
        }
    }
    panic!("tracker never became ready");
}

async fn next_delta(sub: &mut Subscription) -> crate::data_model::TaskDelta {
    timeout(Duration::from_secs(5), sub.deltas.recv())
        .await
        .expect("timed out waiting for a delta")
        .expect("delta feed closed")
}

fn subscribed_event() -> serde_json::Value {
    serde_json::json!({
        "type": "SUBSCRIBED",
        "subscribed": {
            "heartbeat_interval_seconds": 15.0,
            "get_state": {
                "get_agents": {"agents": [
                    {"agent_info": {"id": {"value": "a1"}, "hostname": "10.0.0.5"}}
                ]},
                "get_frameworks": {"frameworks": []},
                "get_tasks": {"tasks": []}
            }
        }
    })
}

#[tokio::test]
async fn streams_deltas_end_to_end() {
    let master = Arc::new(MockMaster::default());
    let addr = master.clone().serve().await;
    let (handle, shutdown) = start_tracker(addr);

    let feed = master.connected().await;
    frame(&feed, &subscribed_event()).await;

    let mut sub = attach(&handle).await;
    assert!(sub.snapshot.is_empty());

    frame(
        &feed,
        &serde_json::json!({
            "type": "TASK_ADDED",
            "task_added": {"task": {
                "task_id": {"value": "t1"},
                "name": "n",
                "agent_id": {"value": "a1"},
                "framework_id": {"value": "f1"},
                "statuses": [{"state": "TASK_RUNNING", "timestamp": 1.0}]
            }}
        }),
    )
    .await;
    let delta = next_delta(&mut sub).await;
    assert_eq!(delta.task_id.get(), "t1");
    assert_eq!(delta.task.agent_ip, Join::Resolved(Some("10.0.0.5".parse().unwrap())));
    assert_eq!(delta.task.framework, Join::Unresolved("f1".into()));
    assert_eq!(delta.task.state, TaskState::Running);

    frame(
        &feed,
        &serde_json::json!({
            "type": "FRAMEWORK_UPDATED",
            "framework_updated": {"framework": {"framework_info": {
                "id": {"value": "f1"}, "name": "marathon"
            }}}
        }),
    )
    .await;
    let delta = next_delta(&mut sub).await;
    match &delta.task.framework {
        Join::Resolved(framework) => assert_eq!(framework.name.as_deref(), Some("marathon")),
        unresolved => panic!("framework not resolved: {unresolved:?}"),
    }

    frame(
        &feed,
        &serde_json::json!({
            "type": "TASK_UPDATED",
            "task_updated": {
                "framework_id": {"value": "f1"},
                "status": {
                    "task_id": {"value": "t1"},
                    "agent_id": {"value": "a1"},
                    "state": "TASK_FINISHED",
                    "timestamp": 2.0
                }
            }
        }),
    )
    .await;
    let delta = next_delta(&mut sub).await;
    assert_eq!(delta.task.state, TaskState::Terminal);

    shutdown.cancel();
}

#[tokio::test]
async fn redirect_from_a_non_leader_is_retried() {
    let master = Arc::new(MockMaster::default());
    master.redirects.store(2, Ordering::SeqCst);
    let addr = master.clone().serve().await;
    let (handle, shutdown) = start_tracker(addr);

    let feed = master.connected().await;
    assert!(master.hits.load(Ordering::SeqCst) >= 3);

    frame(&feed, &subscribed_event()).await;
    let sub = attach(&handle).await;
    assert!(sub.snapshot.is_empty());

    shutdown.cancel();
}

#[tokio::test]
async fn http_errors_are_retried() {
    let master = Arc::new(MockMaster::default());
    master.failures.store(1, Ordering::SeqCst);
    let addr = master.clone().serve().await;
    let (handle, shutdown) = start_tracker(addr);

    let feed = master.connected().await;
    frame(&feed, &subscribed_event()).await;
    let sub = attach(&handle).await;
    assert!(sub.snapshot.is_empty());

    shutdown.cancel();
}

#[tokio::test]
async fn a_closed_stream_triggers_a_reconnect_with_a_fresh_snapshot() {
    let master = Arc::new(MockMaster::default());
    let addr = master.clone().serve().await;
    let (handle, shutdown) = start_tracker(addr);

    let feed = master.connected().await;
    frame(&feed, &subscribed_event()).await;
    let mut sub = attach(&handle).await;

    // Master drops the stream: the subscription ends and a reconnect
    // produces a fresh registry to attach to.
    master.stream.lock().unwrap().take();
    drop(feed);
    assert!(timeout(Duration::from_secs(5), sub.deltas.recv())
        .await
        .expect("feed did not close on disconnect")
        .is_none());

    let feed = master.connected().await;
    frame(&feed, &subscribed_event()).await;
    let sub = attach(&handle).await;
    assert!(sub.snapshot.is_empty());

    shutdown.cancel();
}
