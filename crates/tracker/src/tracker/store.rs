//! In-memory cluster model: agents, frameworks, non-terminal tasks, and the
//! index of tasks still waiting for an agent or framework to be announced.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::{
    data_model::{
        Agent, AgentId, Framework, FrameworkId, Join, Task, TaskDelta, TaskDiff, TaskId,
        TaskSnapshot,
    },
    operator_api::{WireAgentInfo, WireFrameworkInfo, WireTask},
    tracker::projector,
};

#[derive(Debug, Default)]
pub struct TaskStore {
    agents: HashMap<AgentId, Agent>,
    frameworks: HashMap<FrameworkId, Option<String>>,
    tasks: HashMap<TaskId, Task>,
    waiting: HashSet<TaskId>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn framework_count(&self) -> usize {
        self.frameworks.len()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.tasks.clone()
    }

    #[cfg(test)]
    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    #[cfg(test)]
    pub fn waiting(&self) -> &HashSet<TaskId> {
        &self.waiting
    }

    /// Record an agent and resolve any tasks that referenced it before it
    /// was announced. The address comes from the hostname iff that parses
    /// strictly as an IPv4 literal.
    pub fn upsert_agent(&mut self, info: &WireAgentInfo) -> Vec<TaskDelta> {
        let Some(id) = info.id.as_ref() else {
            warn!("agent without an id, dropping");
            return Vec::new();
        };
        let agent = Agent {
            id: AgentId::new(id.value.clone()),
            ipv4: info.hostname.as_deref().and_then(|h| h.parse().ok()),
        };
        debug!(agent_id = %agent.id, ipv4 = ?agent.ipv4, "agent added");
        self.agents.insert(agent.id.clone(), agent.clone());
        self.resolve_agent_waiters(&agent)
    }

    /// Forgetting an agent does not cascade: tasks keep whatever address was
    /// last projected for them.
    pub fn remove_agent(&mut self, id: &AgentId) {
        info!(agent_id = %id, "agent removed");
        self.agents.remove(id);
    }

    pub fn upsert_framework(&mut self, info: &WireFrameworkInfo) -> Vec<TaskDelta> {
        let Some(id) = info.id.as_ref() else {
            warn!("framework without an id, dropping");
            return Vec::new();
        };
        let framework = Framework {
            id: FrameworkId::new(id.value.clone()),
            name: info.name.clone(),
        };
        debug!(framework_id = %framework.id, name = ?framework.name, "framework updated");
        self.frameworks
            .insert(framework.id.clone(), framework.name.clone());
        self.resolve_framework_waiters(&framework)
    }

    pub fn remove_framework(&mut self, id: &FrameworkId) {
        info!(framework_id = %id, "framework removed");
        self.frameworks.remove(id);
    }

    /// Project a wire task over the stored record and commit the result.
    /// Returns the delta to fan out, or `None` when nothing changed.
    pub fn apply_task(&mut self, wire: &WireTask) -> Option<TaskDelta> {
        let prev = wire
            .task_id
            .as_ref()
            .map(|id| TaskId::new(id.value.clone()))
            .and_then(|id| self.tasks.get(&id));
        let task = projector::project(prev, wire, &self.agents, &self.frameworks)?;
        self.commit(task)
    }

    /// Diff-gated commit. An empty diff leaves the store untouched and emits
    /// nothing; a terminal state removes the task.
    fn commit(&mut self, task: Task) -> Option<TaskDelta> {
        let diff = TaskDiff::between(self.tasks.get(&task.id), &task);
        if diff.is_empty() {
            return None;
        }
        debug!(task_id = %task.id, diff = ?diff, "task changed");

        let id = task.id.clone();
        if task.state.is_terminal() {
            self.tasks.remove(&id);
            self.waiting.remove(&id);
        } else {
            if task.has_unresolved() {
                self.waiting.insert(id.clone());
            } else {
                self.waiting.remove(&id);
            }
            self.tasks.insert(id.clone(), task.clone());
        }
        Some(TaskDelta { task_id: id, task })
    }

    fn resolve_agent_waiters(&mut self, agent: &Agent) -> Vec<TaskDelta> {
        let waiting: Vec<TaskId> = self.waiting.iter().cloned().collect();
        let mut deltas = Vec::new();
        for task_id in waiting {
            let Some(task) = self.tasks.get(&task_id) else {
                continue;
            };
            if task.agent_ip != Join::Unresolved(agent.id.clone()) {
                continue;
            }
            let mut task = task.clone();
            task.agent_ip = Join::Resolved(agent.ipv4);
            deltas.extend(self.commit(task));
        }
        deltas
    }

    fn resolve_framework_waiters(&mut self, framework: &Framework) -> Vec<TaskDelta> {
        let waiting: Vec<TaskId> = self.waiting.iter().cloned().collect();
        let mut deltas = Vec::new();
        for task_id in waiting {
            let Some(task) = self.tasks.get(&task_id) else {
                continue;
            };
            if task.framework != Join::Unresolved(framework.id.clone()) {
                continue;
            }
            let mut task = task.clone();
            task.framework = Join::Resolved(framework.clone());
            deltas.extend(self.commit(task));
        }
        deltas
    }

    /// Give allocator slack from the snapshot bulk-load back. The closest
    /// thing this runtime has to requesting a minor collection.
    pub fn compact(&mut self) {
        self.agents.shrink_to_fit();
        self.frameworks.shrink_to_fit();
        self.tasks.shrink_to_fit();
        self.waiting.shrink_to_fit();
    }
}
