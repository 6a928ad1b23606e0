use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Value};
use taskline_orchestrator::{tree_sub_tasks, RootTask, Subtask};
use taskline_types::{ChatOptions, NewAgentSpec};

use crate::{Action, ActionSender, AddTaskRequest, HumanInbox};

/// Chat-style model agent used for classification, direct answers,
/// summaries and engine workers.
#[async_trait]
pub trait ConversationAgent: Send + Sync {
    /// Returns the reply text; an empty string means the model said nothing.
    async fn step(&self, prompt: &str) -> anyhow::Result<String>;

    /// Forgets accumulated memory.
    async fn reset(&self);
}

/// Everything an engine needs to report back into the task's queue.
#[derive(Clone)]
pub struct EngineContext {
    pub options: ChatOptions,
    pub actions: ActionSender,
    pub inbox: HumanInbox,
    pub working_directory: PathBuf,
}

/// The external multi-agent engine. Decomposition and scheduling are its
/// business; the dispatcher only sequences calls into it.
///
/// Implementations use interior mutability: the dispatcher holds the only
/// long-lived handle and passes clones to tracked background work.
#[async_trait]
pub trait OrchestrationEngine: Send + Sync {
    /// Splits `task` into subtasks. `task.content` already carries the
    /// history block; `context` is that same block for coordinator prompts.
    /// Streaming output goes through `observer`.
    async fn decompose(
        &self,
        task: &RootTask,
        context: &str,
        observer: &DecomposeObserver,
    ) -> anyhow::Result<Vec<Subtask>>;

    async fn start_execution(&self, subtasks: Vec<Subtask>) -> anyhow::Result<()>;

    fn is_running(&self) -> bool;

    fn is_paused(&self) -> bool;

    async fn pause(&self);

    async fn resume(&self);

    async fn stop(&self);

    async fn stop_gracefully(&self);

    async fn add_task(&self, request: &AddTaskRequest) -> anyhow::Result<()>;

    async fn remove_task(&self, task_id: &str) -> anyhow::Result<()>;

    async fn add_worker(
        &self,
        description: &str,
        agent: Arc<dyn ConversationAgent>,
    ) -> anyhow::Result<()>;

    async fn install_mcp(&self, servers: Value) -> anyhow::Result<()>;
}

/// Builds engines and agents for a task.
#[async_trait]
pub trait Collaborators: Send + Sync {
    async fn build_engine(
        &self,
        context: EngineContext,
    ) -> anyhow::Result<Arc<dyn OrchestrationEngine>>;

    /// Persistent agent deciding between direct answers and engine runs.
    fn question_agent(&self, options: &ChatOptions) -> Arc<dyn ConversationAgent>;

    fn summary_agent(&self, options: &ChatOptions) -> Arc<dyn ConversationAgent>;

    async fn worker_agent(
        &self,
        spec: &NewAgentSpec,
        options: &ChatOptions,
    ) -> anyhow::Result<Arc<dyn ConversationAgent>>;
}

#[derive(Default)]
struct ObserverState {
    last_content: String,
    seen_ids: HashSet<String>,
    collected: Vec<Subtask>,
}

/// Streaming hooks handed to [`OrchestrationEngine::decompose`].
///
/// Both callbacks are synchronous so engines can call them from worker
/// threads; output is re-enqueued onto the task's own queue.
pub struct DecomposeObserver {
    actions: ActionSender,
    project_id: String,
    task_id: String,
    state: Mutex<ObserverState>,
}

impl DecomposeObserver {
    pub fn new(actions: ActionSender, project_id: String, task_id: String) -> Self {
        Self {
            actions,
            project_id,
            task_id,
            state: Mutex::new(ObserverState::default()),
        }
    }

    /// Accepts the accumulated decomposition text so far and forwards only
    /// the new part.
    pub fn on_text(&self, accumulated: &str) {
        let delta = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let delta = match accumulated.strip_prefix(state.last_content.as_str()) {
                Some(suffix) => suffix.to_string(),
                None => accumulated.to_string(),
            };
            state.last_content = accumulated.to_string();
            delta
        };
        if delta.is_empty() {
            return;
        }
        self.actions.send(Action::DecomposeText { content: delta });
    }

    /// Accepts a batch of subtasks; ids already seen are ignored.
    pub fn on_batch(&self, batch: &[Subtask]) {
        let (fresh, collected) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let fresh = batch
                .iter()
                .filter(|s| state.seen_ids.insert(s.id.clone()))
                .cloned()
                .collect::<Vec<_>>();
            state.collected.extend(fresh.iter().cloned());
            (fresh, state.collected.clone())
        };
        if fresh.is_empty() {
            return;
        }
        self.actions.send(Action::DecomposeProgress {
            payload: json!({
                "project_id": self.project_id,
                "task_id": self.task_id,
                "sub_tasks": tree_sub_tasks(&collected),
                "delta_sub_tasks": tree_sub_tasks(&fresh),
                "is_final": false,
                "summary_task": "",
            }),
            settled: None,
        });
    }

    pub fn collected(&self) -> Vec<Subtask> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .collected
            .clone()
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}
