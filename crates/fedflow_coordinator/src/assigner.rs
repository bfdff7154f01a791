//! Task assignment.
//!
//! Owns the coordinator's current model version and a per-client cache
//! of served tasks. A client polling for work gets its cached task back
//! verbatim while the underlying round is still live and unsaturated;
//! otherwise the cache entry is dropped and the round manager decides.
//! The version only advances through `set_version`, invoked when a
//! round closes.

use fedflow_protocol::defaults::TASK_KIND_TRAIN;
use fedflow_protocol::{ModelVersion, RoundId, RoundState};
use serde::{Deserialize, Serialize};

use crate::rounds::RoundManager;

/// A training task served to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub round_id: RoundId,
    pub model_version: ModelVersion,
    pub task: String,
    pub description: String,
}

impl Task {
    fn train(round_id: RoundId, model_version: ModelVersion) -> Self {
        let description = format!("Train model version {model_version} for round {round_id}");
        Self {
            round_id,
            model_version,
            task: TASK_KIND_TRAIN.to_string(),
            description,
        }
    }
}

/// Effects of serving a task, reported so the caller can update
/// metrics, reputation and the round timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignEffects {
    /// A round was created to satisfy this assignment.
    pub round_created: bool,
    /// The client joined the round (as opposed to re-reading a cached
    /// task).
    pub newly_assigned: bool,
}

pub struct TaskAssigner {
    current_version: ModelVersion,
    cached_tasks: std::collections::HashMap<String, Task>,
}

impl TaskAssigner {
    /// `latest_persisted` seeds the current version; a fresh deployment
    /// starts at the initial version.
    pub fn new(latest_persisted: Option<ModelVersion>) -> Self {
        Self {
            current_version: latest_persisted.unwrap_or_else(ModelVersion::initial),
            cached_tasks: std::collections::HashMap::new(),
        }
    }

    pub fn version(&self) -> &ModelVersion {
        &self.current_version
    }

    /// Advance the version all future assignments bind to.
    pub fn set_version(&mut self, version: ModelVersion) {
        self.current_version = version;
    }

    /// Serve a task for `client_id`, reusing the cached assignment when
    /// its round is still collecting and unsaturated.
    pub fn assign(
        &mut self,
        client_id: &str,
        rounds: &mut RoundManager,
    ) -> Option<(Task, AssignEffects)> {
        if let Some(task) = self.cached_tasks.get(client_id) {
            let reusable = rounds.round(task.round_id).is_some_and(|round| {
                matches!(round.state, RoundState::Open | RoundState::Collecting)
                    && !round.is_saturated()
            });
            if reusable {
                return Some((
                    task.clone(),
                    AssignEffects {
                        round_created: false,
                        newly_assigned: false,
                    },
                ));
            }
            self.cached_tasks.remove(client_id);
        }

        let assignment = rounds.assign(client_id, &self.current_version)?;
        let task = Task::train(assignment.round_id, self.current_version.clone());
        self.cached_tasks
            .insert(client_id.to_string(), task.clone());
        Some((
            task,
            AssignEffects {
                round_created: assignment.round_created,
                newly_assigned: true,
            },
        ))
    }
}
