//! Projection of raw wire tasks into canonical task records.
//!
//! Projection is merge-style: it starts from the previously stored record
//! and overwrites a field only when the wire view actually carries a value
//! for it. A `TASK_UPDATED` event holds a bare TaskStatus and must not wipe
//! the ports or name that an earlier full task info established.

use std::{collections::HashMap, net::IpAddr};

use tracing::warn;

use crate::{
    data_model::{
        coalesce, coalesce_vec, Agent, AgentId, Framework, FrameworkId, Join, PortProtocol, Task,
        TaskId, TaskPort, TaskState, Vips,
    },
    operator_api::{WireContainer, WireDiscovery, WireTask, WireTaskStatus},
};

/// Terminal states per the Mesos v1 task state machine.
const TERMINAL_STATES: &[&str] = &[
    "TASK_FINISHED",
    "TASK_FAILED",
    "TASK_KILLED",
    "TASK_ERROR",
    "TASK_DROPPED",
    "TASK_GONE",
];

/// Project a wire task onto the previously stored record (if any).
/// Returns `None` for a wire object without a task id, which cannot be
/// keyed and is dropped.
pub fn project(
    prev: Option<&Task>,
    wire: &WireTask,
    agents: &HashMap<AgentId, Agent>,
    frameworks: &HashMap<FrameworkId, Option<String>>,
) -> Option<Task> {
    let Some(task_id) = wire.task_id.as_ref() else {
        warn!("wire task without a task_id, dropping");
        return None;
    };
    let id = TaskId::new(task_id.value.clone());

    let framework = wire.framework_id.as_ref().map(|fid| {
        let fid = FrameworkId::new(fid.value.clone());
        match frameworks.get(&fid) {
            Some(name) => Join::Resolved(Framework {
                id: fid,
                name: name.clone(),
            }),
            None => Join::Unresolved(fid),
        }
    });
    let agent_ip = wire.agent_id.as_ref().map(|aid| {
        let aid = AgentId::new(aid.value.clone());
        match agents.get(&aid) {
            Some(agent) => Join::Resolved(agent.ipv4),
            None => Join::Unresolved(aid),
        }
    });

    let latest = latest_status(wire.statuses.as_deref().unwrap_or_default());
    let state = latest.map(derive_state);
    let container_ip = latest.map(container_ips).unwrap_or_default();
    let ports = task_ports(wire.container.as_ref(), wire.discovery.as_ref());

    let mut task = match prev {
        Some(prev) => prev.clone(),
        None => Task {
            id,
            name: None,
            framework: framework
                .clone()
                .unwrap_or_else(|| Join::Unresolved(FrameworkId::new(String::new()))),
            agent_ip: agent_ip.clone().unwrap_or(Join::Resolved(None)),
            container_ip: Vec::new(),
            state: TaskState::Starting,
            ports: Vec::new(),
        },
    };

    coalesce(&mut task.name, wire.name.clone().map(Some));
    coalesce(&mut task.framework, framework);
    coalesce(&mut task.agent_ip, agent_ip);
    coalesce_vec(&mut task.container_ip, container_ip);
    coalesce(&mut task.state, state);
    coalesce_vec(&mut task.ports, ports);
    Some(task)
}

/// The status with the maximum timestamp; among equals the later one wins.
fn latest_status(statuses: &[WireTaskStatus]) -> Option<&WireTaskStatus> {
    statuses.iter().fold(None, |best, status| match best {
        Some(b) if timestamp(b) > timestamp(status) => Some(b),
        _ => Some(status),
    })
}

fn timestamp(status: &WireTaskStatus) -> f64 {
    status.timestamp.unwrap_or(f64::NEG_INFINITY)
}

fn derive_state(status: &WireTaskStatus) -> TaskState {
    let state = status.state.as_deref().unwrap_or("");
    if TERMINAL_STATES.contains(&state) {
        TaskState::Terminal
    } else if state == "TASK_RUNNING" {
        match status.healthy {
            Some(healthy) => TaskState::RunningHealthy(healthy),
            None => TaskState::Running,
        }
    } else {
        TaskState::Starting
    }
}

/// Every IP literal (v4 or v6) the latest status advertises. Entries that do
/// not parse are skipped; a malformed address must not take the projector
/// down.
fn container_ips(status: &WireTaskStatus) -> Vec<IpAddr> {
    let Some(container) = status.container_status.as_ref() else {
        return Vec::new();
    };
    container
        .network_infos
        .iter()
        .flatten()
        .flat_map(|info| info.ip_addresses.iter().flatten())
        .filter_map(|addr| addr.ip_address.as_deref())
        .filter_map(|addr| addr.parse().ok())
        .collect()
}

/// Intermediate port record during the merge; the protocol may still be
/// unknown, which matters for the merge keys.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PortCandidate {
    name: Option<String>,
    protocol: Option<PortProtocol>,
    port: Option<u16>,
    host_port: Option<u16>,
    vips: Option<Vips>,
}

type PortKey = (Option<PortProtocol>, Option<u16>, Option<u16>);

impl PortCandidate {
    fn key(&self) -> PortKey {
        (self.protocol, self.port, self.host_port)
    }

    fn into_port(self) -> TaskPort {
        TaskPort {
            name: self.name,
            protocol: self.protocol.unwrap_or(PortProtocol::Tcp),
            port: self.port,
            host_port: self.host_port,
            vips: self.vips,
        }
    }
}

fn task_ports(
    container: Option<&WireContainer>,
    discovery: Option<&WireDiscovery>,
) -> Vec<TaskPort> {
    let mappings = container.map(port_mappings).unwrap_or_default();
    let discovered = discovery.map(discovery_ports).unwrap_or_default();
    merge_ports(mappings, discovered)
        .into_iter()
        .map(PortCandidate::into_port)
        .collect()
}

/// Container-level port mappings, by container type: `HOST` (or missing) has
/// none, `MESOS` carries them on the network infos, `DOCKER` on the docker
/// info.
fn port_mappings(container: &WireContainer) -> Vec<PortCandidate> {
    let mappings: Vec<_> = match container.kind.as_deref() {
        Some("MESOS") => container
            .network_infos
            .iter()
            .flatten()
            .flat_map(|info| info.port_mappings.iter().flatten())
            .collect(),
        Some("DOCKER") => container
            .docker
            .iter()
            .flat_map(|docker| docker.port_mappings.iter().flatten())
            .collect(),
        _ => Vec::new(),
    };
    mappings
        .into_iter()
        .map(|mapping| PortCandidate {
            name: None,
            protocol: mapping.protocol.as_deref().map(PortProtocol::parse),
            port: mapping.container_port,
            host_port: mapping.host_port,
            vips: None,
        })
        .collect()
}

/// Discovery ports with their VIP labels. A `network-scope=container` label
/// makes the advertised number a container-scope port; otherwise it is
/// host-scope.
fn discovery_ports(discovery: &WireDiscovery) -> Vec<PortCandidate> {
    discovery
        .ports
        .iter()
        .flat_map(|ports| ports.ports.iter().flatten())
        .map(|port| {
            let mut vips = Vec::new();
            let mut container_scope = false;
            let labels = port.labels.iter().flat_map(|l| l.labels.iter().flatten());
            for label in labels {
                let key = label.key.as_deref().unwrap_or("");
                if key.starts_with("VIP") || key.starts_with("vip") {
                    if let Some(value) = &label.value {
                        vips.push(value.clone());
                    }
                } else if key == "network-scope" && label.value.as_deref() == Some("container") {
                    container_scope = true;
                }
            }
            let vips = (!vips.is_empty()).then(|| {
                if container_scope {
                    Vips::Container(vips.clone())
                } else {
                    Vips::Host(vips.clone())
                }
            });
            PortCandidate {
                name: port.name.clone(),
                protocol: port.protocol.as_deref().map(PortProtocol::parse),
                port: container_scope.then_some(port.number).flatten(),
                host_port: (!container_scope).then_some(port.number).flatten(),
                vips,
            }
        })
        .collect()
}

/// Merge port mappings into the discovery ports.
///
/// Discovery ports are authoritative for names and VIPs but may leave either
/// side of the mapping blank; a port mapping with a matching partial key
/// fills in the concrete numbers. The probes, in order:
/// 1. a discovery entry with no protocol and both numbers matching,
/// 2. a discovery entry with the protocol and the host port matching,
/// 3. a discovery entry with the protocol whose advertised number matches
///    the mapping's container port (the common shape for bridged
///    containers, where discovery cannot know the allocated host port).
/// Anything unmatched is kept as its own entry.
fn merge_ports(
    mappings: Vec<PortCandidate>,
    discovered: Vec<PortCandidate>,
) -> Vec<PortCandidate> {
    let mut merged = discovered;
    for mapping in mappings {
        let (protocol, port, host_port) = mapping.key();
        let probes: [PortKey; 3] = [
            (None, port, host_port),
            (protocol, None, host_port),
            (protocol, None, port),
        ];
        match probes
            .iter()
            .find_map(|probe| merged.iter().position(|entry| entry.key() == *probe))
        {
            Some(at) => {
                let entry = &mut merged[at];
                entry.protocol = entry.protocol.or(protocol);
                entry.port = port;
                entry.host_port = host_port;
            }
            None => merged.push(mapping),
        }
    }
    merged
}
