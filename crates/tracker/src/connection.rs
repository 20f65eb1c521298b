//! SUBSCRIBE call management: issue the streaming POST against the master,
//! classify the first response, and pump body chunks into the tracker
//! mailbox one at a time.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::recordio::FrameError;

/// Everything that can end a connection, recoverable or not. The supervisor
/// decides how loud each case is: a redirect retries silently, everything
/// else is logged before the retry.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("master is not the leader (redirect)")]
    Redirect,
    #[error("subscribe call returned status {0}")]
    Status(StatusCode),
    #[error("timed out waiting for the event stream to start")]
    ConnectTimeout,
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("master endpoint resolution failed: {0}")]
    Endpoint(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("malformed event payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("no heartbeat from the master within {0:?}")]
    HeartbeatTimeout(Duration),
    #[error("event stream closed by the master")]
    StreamClosed,
    #[error("event stream reader died")]
    StreamReaderDied,
}

impl ConnectionError {
    /// Redirects are an expected part of leader discovery and retried
    /// without a log line.
    pub fn is_silent(&self) -> bool {
        matches!(self, ConnectionError::Redirect)
    }
}

/// Where to find the current Mesos master. Leader discovery itself lives
/// behind this seam; the tracker re-resolves on every connection attempt.
#[derive(Debug, Clone)]
pub struct MasterEndpoint {
    pub url: String,
    pub principal: Option<String>,
    pub secret: Option<String>,
}

#[async_trait]
pub trait MasterResolver: Send + Sync {
    async fn resolve(&self) -> anyhow::Result<MasterEndpoint>;
}

/// Resolver for a statically configured master.
pub struct StaticResolver {
    endpoint: MasterEndpoint,
}

impl StaticResolver {
    pub fn new(endpoint: MasterEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl MasterResolver for StaticResolver {
    async fn resolve(&self) -> anyhow::Result<MasterEndpoint> {
        Ok(self.endpoint.clone())
    }
}

/// Input to the tracker actor from the connection side.
#[derive(Debug)]
pub enum ConnEvent {
    Chunk(Bytes),
    Failed(ConnectionError),
}

/// Build the client the subscribe call goes through. Redirects must surface
/// as statuses: a 307 from a non-leader master is routing information, and
/// transparently re-POSTing to the Location would bypass the resolver.
pub fn build_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

/// Issue the SUBSCRIBE call and hand back the chunked body stream once the
/// master commits to streaming. `connect_timeout` bounds only the wait for
/// response headers; the stream itself is unbounded by design.
async fn open_stream(
    client: &reqwest::Client,
    endpoint: &MasterEndpoint,
    connect_timeout: Duration,
) -> Result<impl futures::Stream<Item = reqwest::Result<Bytes>>, ConnectionError> {
    let url = format!("{}/api/v1", endpoint.url.trim_end_matches('/'));
    let mut call = client
        .post(url)
        .json(&serde_json::json!({"type": "SUBSCRIBE"}));
    if let Some(principal) = &endpoint.principal {
        call = call.basic_auth(principal, endpoint.secret.as_deref());
    }

    let response = tokio::time::timeout(connect_timeout, call.send())
        .await
        .map_err(|_| ConnectionError::ConnectTimeout)??;

    match response.status() {
        StatusCode::TEMPORARY_REDIRECT => Err(ConnectionError::Redirect),
        status if !status.is_success() => Err(ConnectionError::Status(status)),
        _ => Ok(response.bytes_stream()),
    }
}

/// Connection pump: subscribe, then forward every body chunk into the
/// tracker mailbox. The channel has capacity one, so the next chunk is only
/// requested from the transport after the tracker consumed the previous one.
pub(crate) async fn run_stream(
    client: reqwest::Client,
    endpoint: MasterEndpoint,
    connect_timeout: Duration,
    events: mpsc::Sender<ConnEvent>,
) {
    let mut stream = match open_stream(&client, &endpoint, connect_timeout).await {
        Ok(stream) => stream,
        Err(err) => {
            let _ = events.send(ConnEvent::Failed(err)).await;
            return;
        }
    };

    debug!(url = %endpoint.url, "operator event stream started");
    while let Some(chunk) = stream.next().await {
        let event = match chunk {
            Ok(bytes) => ConnEvent::Chunk(bytes),
            Err(err) => {
                let _ = events.send(ConnEvent::Failed(err.into())).await;
                return;
            }
        };
        if events.send(event).await.is_err() {
            // Tracker went away; stop reading.
            return;
        }
    }
    let _ = events.send(ConnEvent::Failed(ConnectionError::StreamClosed)).await;
}
