//! The tracker actor: one task owns every piece of mutable state and works
//! through a serialized stream of inputs — subscribe requests, HTTP chunks,
//! the heartbeat watchdog, peer-death notifications. Concurrency comes from
//! running the actor next to its callers, not from sharing.

pub mod projector;
pub mod store;
pub mod subscribers;

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    client::TrackerHandle,
    connection::{run_stream, ConnEvent, ConnectionError, MasterResolver},
    data_model::{TaskDelta, TaskSnapshot},
    metrics::TrackerMetrics,
    operator_api::{decode_event, Event, Subscribed},
    recordio::FrameDecoder,
    tracker::{
        store::TaskStore,
        subscribers::{spawn_monitor, SubscribeError, SubscriberId, SubscriberRegistry},
    },
};

/// Mesos defaults to 15 seconds when the subscription does not advertise an
/// interval.
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// The connection is declared dead after this many missed heartbeats.
const HEARTBEAT_GRACE_FACTOR: u32 = 3;

const COMMAND_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
pub enum Command {
    Subscribe {
        peer: SubscriberId,
        delivery: mpsc::Sender<TaskDelta>,
        reply: oneshot::Sender<Result<TaskSnapshot, SubscribeError>>,
    },
    PeerDown {
        peer: SubscriberId,
    },
}

#[derive(Debug, Clone)]
pub struct TrackerOptions {
    /// Deadline for the subscribe call to produce response headers.
    pub connect_timeout: Duration,
    /// Fixed delay between connection attempts.
    pub retry_delay: Duration,
    /// Caller-side bound on the subscribe handshake.
    pub subscribe_timeout: Duration,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_millis(100),
            subscribe_timeout: Duration::from_secs(5),
        }
    }
}

/// State that lives exactly as long as one master connection. Rebuilt from
/// scratch on reconnect; subscribers observe the teardown through their
/// delivery channels closing and re-attach for a fresh snapshot.
struct ConnectionState {
    decoder: FrameDecoder,
    store: TaskStore,
    subscribers: SubscriberRegistry,
    heartbeat_interval: Duration,
    watchdog: Option<Instant>,
    /// Cancelled on teardown so subscriber monitors drop their sender
    /// clones and the peers see end-of-stream.
    token: CancellationToken,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            decoder: FrameDecoder::new(),
            store: TaskStore::new(),
            subscribers: SubscriberRegistry::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            watchdog: None,
            token: CancellationToken::new(),
        }
    }

    fn arm_watchdog(&mut self) {
        self.watchdog = Some(Instant::now() + self.heartbeat_interval * HEARTBEAT_GRACE_FACTOR);
    }
}

impl Drop for ConnectionState {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

pub struct Tracker {
    pub(crate) cmd_tx: mpsc::Sender<Command>,
    pub(crate) cmd_rx: mpsc::Receiver<Command>,
    pub(crate) client: reqwest::Client,
    pub(crate) resolver: Arc<dyn MasterResolver>,
    pub(crate) options: TrackerOptions,
    pub(crate) metrics: TrackerMetrics,
    pub(crate) shutdown: CancellationToken,
}

impl Tracker {
    /// Spawn the tracker actor. The handle is the stable address callers
    /// keep across reconnects.
    pub fn spawn(
        resolver: Arc<dyn MasterResolver>,
        client: reqwest::Client,
        options: TrackerOptions,
        metrics: TrackerMetrics,
        shutdown: CancellationToken,
    ) -> (TrackerHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let handle = TrackerHandle::new(cmd_tx.clone(), options.subscribe_timeout);
        let tracker = Tracker {
            cmd_tx,
            cmd_rx,
            client,
            resolver,
            options,
            metrics,
            shutdown,
        };
        (handle, tokio::spawn(tracker.run()))
    }

    /// Supervision loop: run one connection until it fails, tear the
    /// per-connection state down, pause briefly, reconnect. A redirect is
    /// ordinary leader discovery and retried without a log line; everything
    /// else is logged first.
    pub async fn run(mut self) {
        loop {
            let err = match self.run_connection().await {
                Ok(()) => return,
                Err(err) => err,
            };
            self.metrics.connection_failures.add(1, &[]);
            if err.is_silent() {
                debug!(error = %err, "master is not the leader, retrying");
            } else {
                error!(error = %err, "mesos connection failed, reconnecting");
            }
            if !self.pause_before_retry().await {
                return;
            }
        }
    }

    /// Sleep out the retry delay while still answering the mailbox; callers
    /// that subscribe between connections are told to wait. Returns false
    /// when the tracker should shut down instead of reconnecting.
    async fn pause_before_retry(&mut self) -> bool {
        let wake = Instant::now() + self.options.retry_delay;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = sleep_until(wake) => return true,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Subscribe { reply, .. }) => {
                        let _ = reply.send(Err(SubscribeError::Wait));
                    }
                    Some(Command::PeerDown { .. }) => {}
                    None => return false,
                },
            }
        }
    }

    async fn run_connection(&mut self) -> Result<(), ConnectionError> {
        let endpoint = self
            .resolver
            .resolve()
            .await
            .map_err(|err| ConnectionError::Endpoint(err.to_string()))?;
        self.metrics.connection_attempts.add(1, &[]);

        // Capacity one: the pump only fetches the next transport chunk once
        // the previous one has been consumed here.
        let (conn_tx, conn_rx) = mpsc::channel(1);
        let pump = tokio::spawn(run_stream(
            self.client.clone(),
            endpoint,
            self.options.connect_timeout,
            conn_tx,
        ));
        let result = self.stream_events(conn_rx).await;
        pump.abort();
        result
    }

    /// Serial event loop over one connection's lifetime. Returns `Ok` only
    /// for an orderly shutdown.
    pub(crate) async fn stream_events(
        &mut self,
        mut conn_rx: mpsc::Receiver<ConnEvent>,
    ) -> Result<(), ConnectionError> {
        let mut state = ConnectionState::new();
        loop {
            let watchdog = state.watchdog;
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(&mut state, cmd),
                    None => return Ok(()),
                },
                event = conn_rx.recv() => match event {
                    Some(ConnEvent::Chunk(bytes)) => self.handle_chunk(&mut state, &bytes)?,
                    Some(ConnEvent::Failed(err)) => return Err(err),
                    None => return Err(ConnectionError::StreamReaderDied),
                },
                _ = sleep_until(watchdog.unwrap_or_else(far_future)), if watchdog.is_some() => {
                    return Err(ConnectionError::HeartbeatTimeout(
                        state.heartbeat_interval * HEARTBEAT_GRACE_FACTOR,
                    ));
                }
            }
        }
    }

    fn handle_command(&self, state: &mut ConnectionState, cmd: Command) {
        match cmd {
            Command::Subscribe {
                peer,
                delivery,
                reply,
            } => {
                let result = state.subscribers.insert(peer, delivery.clone());
                let reply_value = match result {
                    Ok(()) => {
                        // Monitor before reply: a peer death after this
                        // point produces exactly one removal.
                        spawn_monitor(peer, delivery, self.cmd_tx.clone(), state.token.clone());
                        Ok(state.store.snapshot())
                    }
                    Err(err) => Err(err),
                };
                let _ = reply.send(reply_value);
            }
            Command::PeerDown { peer } => state.subscribers.remove(peer),
        }
    }

    fn handle_chunk(
        &self,
        state: &mut ConnectionState,
        chunk: &Bytes,
    ) -> Result<(), ConnectionError> {
        for frame in state.decoder.push(chunk)? {
            self.metrics.frames_decoded.add(1, &[]);
            let Some(event) = decode_event(&frame)? else {
                continue;
            };
            self.metrics.events_dispatched.add(1, &[]);
            self.handle_event(state, event);
        }
        Ok(())
    }

    fn handle_event(&self, state: &mut ConnectionState, event: Event) {
        match event {
            Event::Subscribed(subscribed) => self.apply_snapshot(state, subscribed),
            Event::Heartbeat => state.arm_watchdog(),
            Event::TaskAdded(task) | Event::TaskUpdated(task) => {
                let delta = state.store.apply_task(&task);
                self.emit(state, delta);
            }
            Event::FrameworkUpserted(info) => {
                let deltas = state.store.upsert_framework(&info);
                for delta in deltas {
                    self.emit(state, Some(delta));
                }
            }
            Event::FrameworkRemoved(id) => state.store.remove_framework(&id),
            Event::AgentAdded(info) => {
                let deltas = state.store.upsert_agent(&info);
                for delta in deltas {
                    self.emit(state, Some(delta));
                }
            }
            Event::AgentRemoved(id) => state.store.remove_agent(&id),
        }
    }

    /// Apply the SUBSCRIBED snapshot: agents first, then frameworks, then
    /// tasks, so that most task references resolve on first projection.
    /// Only after the whole snapshot is in does the registry open for
    /// subscribers.
    fn apply_snapshot(&self, state: &mut ConnectionState, subscribed: Subscribed) {
        state.heartbeat_interval = subscribed
            .heartbeat_interval_seconds
            .map(Duration::from_secs_f64)
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);

        let cluster = subscribed.get_state;
        for agent in cluster.get_agents.agents {
            if let Some(info) = agent.agent_info {
                let deltas = state.store.upsert_agent(&info);
                for delta in deltas {
                    self.emit(state, Some(delta));
                }
            }
        }
        for framework in cluster.get_frameworks.frameworks {
            if let Some(info) = framework.framework_info {
                let deltas = state.store.upsert_framework(&info);
                for delta in deltas {
                    self.emit(state, Some(delta));
                }
            }
        }
        for task in &cluster.get_tasks.tasks {
            let delta = state.store.apply_task(task);
            self.emit(state, delta);
        }

        state.subscribers.activate();
        state.store.compact();
        state.arm_watchdog();
        info!(
            agents = state.store.agent_count(),
            frameworks = state.store.framework_count(),
            tasks = state.store.task_count(),
            heartbeat_interval = ?state.heartbeat_interval,
            "initial cluster snapshot applied"
        );
    }

    fn emit(&self, state: &mut ConnectionState, delta: Option<TaskDelta>) {
        if let Some(delta) = delta {
            self.metrics.deltas_emitted.add(1, &[]);
            state.subscribers.fan_out(&delta);
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(24 * 60 * 60)
}
