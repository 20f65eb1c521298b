//! Wire model for the subset of the Mesos v1 Operator API the tracker
//! consumes. Every leaf field is optional; the projector decides what an
//! absent field means.

use serde::Deserialize;
use tracing::error;

use crate::data_model::{AgentId, FrameworkId};

#[derive(Debug, Clone, Deserialize)]
pub struct IdValue {
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireLabel {
    pub key: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireLabels {
    pub labels: Option<Vec<WireLabel>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireIpAddress {
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WirePortMapping {
    pub container_port: Option<u16>,
    pub host_port: Option<u16>,
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireNetworkInfo {
    pub ip_addresses: Option<Vec<WireIpAddress>>,
    pub port_mappings: Option<Vec<WirePortMapping>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireContainerStatus {
    pub network_infos: Option<Vec<WireNetworkInfo>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireDockerInfo {
    pub port_mappings: Option<Vec<WirePortMapping>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireContainer {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub network_infos: Option<Vec<WireNetworkInfo>>,
    pub docker: Option<WireDockerInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireDiscoveryPort {
    pub number: Option<u16>,
    pub name: Option<String>,
    pub protocol: Option<String>,
    pub labels: Option<WireLabels>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WirePorts {
    pub ports: Option<Vec<WireDiscoveryPort>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireDiscovery {
    pub ports: Option<WirePorts>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireTaskStatus {
    pub task_id: Option<IdValue>,
    pub agent_id: Option<IdValue>,
    pub state: Option<String>,
    pub timestamp: Option<f64>,
    pub healthy: Option<bool>,
    pub container_status: Option<WireContainerStatus>,
}

/// A task as seen on the wire. `TASK_ADDED` and the snapshot carry the full
/// shape; `TASK_UPDATED` carries only a status, lifted into this shape by
/// [`WireTask::from_status`].
#[derive(Debug, Clone, Deserialize, Default)]
pub struct WireTask {
    pub task_id: Option<IdValue>,
    pub name: Option<String>,
    pub framework_id: Option<IdValue>,
    pub agent_id: Option<IdValue>,
    pub statuses: Option<Vec<WireTaskStatus>>,
    pub container: Option<WireContainer>,
    pub discovery: Option<WireDiscovery>,
}

impl WireTask {
    /// Merge the envelope `framework_id` of a `TASK_UPDATED` event into its
    /// status, producing the partial task view the projector operates on.
    pub fn from_status(framework_id: Option<IdValue>, status: WireTaskStatus) -> WireTask {
        WireTask {
            task_id: status.task_id.clone(),
            agent_id: status.agent_id.clone(),
            framework_id,
            statuses: Some(vec![status]),
            ..WireTask::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireAgentInfo {
    pub id: Option<IdValue>,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireAgent {
    pub agent_info: Option<WireAgentInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireFrameworkInfo {
    pub id: Option<IdValue>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireFramework {
    pub framework_info: Option<WireFrameworkInfo>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GetAgents {
    #[serde(default)]
    pub agents: Vec<WireAgent>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GetFrameworks {
    #[serde(default)]
    pub frameworks: Vec<WireFramework>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GetTasks {
    #[serde(default)]
    pub tasks: Vec<WireTask>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GetState {
    #[serde(default)]
    pub get_agents: GetAgents,
    #[serde(default)]
    pub get_frameworks: GetFrameworks,
    #[serde(default)]
    pub get_tasks: GetTasks,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subscribed {
    pub heartbeat_interval_seconds: Option<f64>,
    #[serde(default)]
    pub get_state: GetState,
}

/// A decoded Operator API event, routed by its `type` tag.
#[derive(Debug)]
pub enum Event {
    Subscribed(Subscribed),
    Heartbeat,
    TaskAdded(WireTask),
    TaskUpdated(WireTask),
    FrameworkUpserted(WireFrameworkInfo),
    FrameworkRemoved(FrameworkId),
    AgentAdded(WireAgentInfo),
    AgentRemoved(AgentId),
}

#[derive(Debug, Deserialize)]
struct SubscribedEnvelope {
    subscribed: Subscribed,
}

#[derive(Debug, Deserialize)]
struct TaskAddedEnvelope {
    task_added: TaskAddedBody,
}

#[derive(Debug, Deserialize)]
struct TaskAddedBody {
    task: WireTask,
}

#[derive(Debug, Deserialize)]
struct TaskUpdatedEnvelope {
    task_updated: TaskUpdatedBody,
}

#[derive(Debug, Deserialize)]
struct TaskUpdatedBody {
    framework_id: Option<IdValue>,
    status: WireTaskStatus,
}

#[derive(Debug, Deserialize)]
struct FrameworkEnvelope {
    #[serde(alias = "framework_added", alias = "framework_updated")]
    framework: FrameworkBody,
}

#[derive(Debug, Deserialize)]
struct FrameworkBody {
    framework: WireFramework,
}

#[derive(Debug, Deserialize)]
struct FrameworkRemovedEnvelope {
    framework_removed: FrameworkRemovedBody,
}

#[derive(Debug, Deserialize)]
struct FrameworkRemovedBody {
    framework_info: WireFrameworkInfo,
}

#[derive(Debug, Deserialize)]
struct AgentAddedEnvelope {
    agent_added: AgentAddedBody,
}

#[derive(Debug, Deserialize)]
struct AgentAddedBody {
    agent: WireAgent,
}

#[derive(Debug, Deserialize)]
struct AgentRemovedEnvelope {
    agent_removed: AgentRemovedBody,
}

#[derive(Debug, Deserialize)]
struct AgentRemovedBody {
    agent_id: IdValue,
}

/// Decode one RecordIO frame into an event.
///
/// Decoding is two-phase: the frame must parse as JSON (failure is fatal to
/// the connection and propagated), but an unknown `type` tag is logged and
/// dropped (`Ok(None)`).
pub fn decode_event(frame: &[u8]) -> Result<Option<Event>, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_slice(frame)?;
    let kind = value.get("type").and_then(|t| t.as_str()).unwrap_or("");

    let event = match kind {
        "SUBSCRIBED" => {
            let env: SubscribedEnvelope = serde_json::from_value(value)?;
            Event::Subscribed(env.subscribed)
        }
        "HEARTBEAT" => Event::Heartbeat,
        "TASK_ADDED" => {
            let env: TaskAddedEnvelope = serde_json::from_value(value)?;
            Event::TaskAdded(env.task_added.task)
        }
        "TASK_UPDATED" => {
            let env: TaskUpdatedEnvelope = serde_json::from_value(value)?;
            let body = env.task_updated;
            Event::TaskUpdated(WireTask::from_status(body.framework_id, body.status))
        }
        "FRAMEWORK_ADDED" | "FRAMEWORK_UPDATED" => {
            let env: FrameworkEnvelope = serde_json::from_value(value)?;
            match env.framework.framework.framework_info {
                Some(info) => Event::FrameworkUpserted(info),
                None => return Ok(None),
            }
        }
        "FRAMEWORK_REMOVED" => {
            let env: FrameworkRemovedEnvelope = serde_json::from_value(value)?;
            match env.framework_removed.framework_info.id {
                Some(id) => Event::FrameworkRemoved(FrameworkId::new(id.value)),
                None => return Ok(None),
            }
        }
        "AGENT_ADDED" => {
            let env: AgentAddedEnvelope = serde_json::from_value(value)?;
            match env.agent_added.agent.agent_info {
                Some(info) => Event::AgentAdded(info),
                None => return Ok(None),
            }
        }
        "AGENT_REMOVED" => {
            let env: AgentRemovedEnvelope = serde_json::from_value(value)?;
            Event::AgentRemoved(AgentId::new(env.agent_removed.agent_id.value))
        }
        other => {
            error!(event_type = other, "unknown operator event type, dropping");
            return Ok(None);
        }
    };
    Ok(Some(event))
}
