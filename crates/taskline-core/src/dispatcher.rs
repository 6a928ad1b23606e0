use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use taskline_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use taskline_orchestrator::{
    add_sub_tasks, ensure_fallback_subtask, fallback_summary, follow_up_summary,
    strip_subtask_banner, tree_sub_tasks, update_sub_tasks, RootTask, Subtask, SubtaskEdit,
    SubtaskState,
};
use taskline_types::{ConversationRole, NewAgentSpec, StreamEvent, TaskRecord, TaskStatus};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::context::{
    compose_task_content, conversation_context, history_length, HISTORY_HEADER,
    PREVIOUS_CONVERSATION_HEADER,
};
use crate::prompts::{self, CONTEXT_TOO_LONG, ERROR_ANSWER, FALLBACK_ANSWER, SKIP_RESULT};
use crate::{
    classify_failure, now_ms, workspace, Action, ActionSender, AddTaskRequest, Collaborators,
    ControlPlaneConfig, ConversationAgent, DecomposeObserver, EngineContext, EventSink,
    FailureKind, OrchestrationEngine, SettledDecomposition, TaskActor,
};

const COMPONENT: &str = "action_dispatcher";

const TASK_NOT_INITIALIZED_ADD: &str =
    "Cannot add task: task not initialized. Please start a task first.";
const TASK_NOT_INITIALIZED_UPDATE: &str =
    "Cannot update task: task not initialized. Please start a task first.";
const TASK_NOT_INITIALIZED_SUPPLEMENT: &str =
    "Cannot supplement task: task not initialized. Please start a task first.";
const TASK_NOT_DONE_SUPPLEMENT: &str =
    "Cannot supplement task: please wait until the current task is done.";
const TASK_NOT_INITIALIZED_NEW_STATE: &str =
    "Cannot process new task state: current task not initialized.";
const WORKFORCE_NOT_INITIALIZED: &str = "Workforce not initialized. Please start the task first.";
const TASK_BUSY: &str =
    "Cannot start a new question while the current task is processing. Stop or skip it first.";
const BUDGET_MESSAGE: &str = "budget not enouth";

enum Flow {
    Continue,
    Terminate,
}

/// Handles returned by [`ActionDispatcher::spawn`].
pub struct DispatcherHandle {
    /// Events in production order. Ends when the dispatcher terminates.
    pub events: mpsc::Receiver<StreamEvent>,
    /// Cancel to signal that the client went away.
    pub connection: CancellationToken,
    pub join: JoinHandle<()>,
}

/// The single consumer of one actor's queue. Owns the engine and the active
/// task; everything else reaches them by enqueueing an [`Action`].
pub struct ActionDispatcher {
    actor: Arc<TaskActor>,
    services: Arc<dyn Collaborators>,
    config: Arc<ControlPlaneConfig>,
    sink: EventSink,
    connection: CancellationToken,
    engine: Option<Arc<dyn OrchestrationEngine>>,
    task: Option<RootTask>,
    /// Last task closed by End or SkipTask, kept so it can be supplemented.
    finished_task: Option<RootTask>,
    /// Bumped per decomposition; only the latest one may replace the plan.
    decomposition_seq: u64,
    turn_task_id: String,
    working_directory: PathBuf,
    summary_task: String,
    last_completed_result: String,
}

impl ActionDispatcher {
    pub fn new(
        actor: Arc<TaskActor>,
        services: Arc<dyn Collaborators>,
        config: Arc<ControlPlaneConfig>,
        sink: EventSink,
        connection: CancellationToken,
    ) -> Self {
        let options = actor.options();
        let turn_task_id = options.task_id.clone();
        let working_directory = workspace::working_directory(&config.workspace_root, options);
        Self {
            actor,
            services,
            config,
            sink,
            connection,
            engine: None,
            task: None,
            finished_task: None,
            decomposition_seq: 0,
            turn_task_id,
            working_directory,
            summary_task: String::new(),
            last_completed_result: String::new(),
        }
    }

    pub fn spawn(
        actor: Arc<TaskActor>,
        services: Arc<dyn Collaborators>,
        config: Arc<ControlPlaneConfig>,
    ) -> DispatcherHandle {
        let (sink, events) = EventSink::channel(config.event_buffer);
        let connection = CancellationToken::new();
        let dispatcher = Self::new(actor, services, config, sink, connection.clone());
        let join = tokio::spawn(dispatcher.run());
        DispatcherHandle {
            events,
            connection,
            join,
        }
    }

    pub async fn run(mut self) {
        self.log(Level::INFO, "dispatcher.start", None, "");
        loop {
            if self.disconnected() {
                self.log(Level::WARN, "dispatcher.disconnect", None, "");
                self.teardown(false).await;
                break;
            }

            let next = tokio::select! {
                biased;
                _ = self.connection.cancelled() => None,
                _ = self.actor.cancellation().cancelled() => None,
                _ = self.sink.closed() => None,
                action = self.actor.dequeue() => action,
            };
            let Some(action) = next else {
                self.log(Level::WARN, "dispatcher.disconnect", None, "while waiting");
                self.teardown(false).await;
                break;
            };

            let name = action.name();
            self.log(Level::DEBUG, "action.received", Some(name), "");
            match self.handle(action).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Terminate) => break,
                Err(err) => match classify_failure(&err) {
                    FailureKind::Budget => {
                        self.log(Level::WARN, "budget.exceeded", Some(name), "");
                        self.on_budget_exceeded().await;
                    }
                    FailureKind::Cancelled => {
                        self.log(Level::WARN, "action.cancelled", Some(name), "");
                        self.teardown(false).await;
                        break;
                    }
                    FailureKind::Other => {
                        let detail = err.to_string();
                        self.log(Level::ERROR, "action.failed", Some(name), &detail);
                        self.emit_error(&detail).await;
                    }
                },
            }
        }
        self.log(Level::INFO, "dispatcher.stop", None, "");
    }

    fn disconnected(&self) -> bool {
        self.connection.is_cancelled()
            || self.sink.is_closed()
            || self.actor.cancellation().is_cancelled()
    }

    async fn handle(&mut self, action: Action) -> anyhow::Result<Flow> {
        match action {
            Action::Improve {
                question,
                new_task_id,
                attachments,
            } => self.on_improve(question, new_task_id, attachments).await?,
            Action::Start => self.on_start().await?,
            Action::Supplement { question } => self.on_supplement(question).await?,
            Action::UpdateTask { edits } => self.on_update_task(&edits).await,
            Action::AddTask(request) => self.on_add_task(request).await?,
            Action::RemoveTask { task_id } => self.on_remove_task(task_id).await?,
            Action::SkipTask => self.on_skip().await?,
            Action::End { result } => self.on_end(result).await?,
            Action::Stop => {
                self.log(Level::INFO, "task.stop", Some("stop"), "");
                self.teardown(true).await;
                return Ok(Flow::Terminate);
            }
            Action::Pause => match &self.engine {
                Some(engine) => engine.pause().await,
                None => tracing::warn!("pause ignored for {}: no engine", self.actor.id()),
            },
            Action::Resume => match &self.engine {
                Some(engine) => engine.resume().await,
                None => tracing::warn!("resume ignored for {}: no engine", self.actor.id()),
            },
            Action::HumanReply { agent, reply } => {
                self.actor.record_human_input(&agent, &reply).await;
            }
            Action::InstallMcp { servers } => self.on_install_mcp(servers).await,
            Action::TaskState {
                task_id,
                state,
                result,
                failure_count,
            } => {
                self.on_task_state(&task_id, &state, &result);
                self.emit(
                    "task_state",
                    json!({
                        "task_id": task_id,
                        "state": state,
                        "result": result,
                        "failure_count": failure_count,
                    }),
                )
                .await;
            }
            Action::NewTaskState {
                task_id,
                state,
                result,
                content,
            } => {
                self.on_new_task_state(task_id, state, result, content)
                    .await?
            }
            Action::BudgetExceeded => self.on_budget_exceeded().await,
            Action::NewAgent(spec) => self.on_new_agent(&spec).await?,
            Action::DecomposeText { content } => {
                let payload = json!({
                    "project_id": self.actor.id(),
                    "task_id": self.turn_task_id,
                    "content": content,
                });
                self.emit("decompose_text", payload).await;
            }
            Action::DecomposeProgress { payload, settled } => {
                if let Some(settled) = settled {
                    self.apply_settled(settled).await;
                }
                self.emit("decompose_progress", payload).await;
            }
            Action::AssignTask(payload) => self.emit("assign_task", payload).await,
            Action::Terminal {
                process_task_id,
                output,
            } => {
                self.emit(
                    "terminal",
                    json!({"output": output, "process_task_id": process_task_id}),
                )
                .await
            }
            Action::WriteFile {
                process_task_id,
                file_path,
            } => {
                self.emit(
                    "write_file",
                    json!({"file_path": file_path, "process_task_id": process_task_id}),
                )
                .await
            }
            Action::Notice {
                process_task_id,
                notice,
            } => {
                self.emit(
                    "notice",
                    json!({"notice": notice, "process_task_id": process_task_id}),
                )
                .await
            }
            Action::Ask(payload) => self.emit("ask", payload).await,
            Action::CreateAgent(payload) => self.emit("create_agent", payload).await,
            Action::ActivateAgent(payload) => self.emit("activate_agent", payload).await,
            Action::DeactivateAgent(payload) => self.emit("deactivate_agent", payload).await,
            Action::ActivateToolkit(payload) => self.emit("activate_toolkit", payload).await,
            Action::DeactivateToolkit(payload) => self.emit("deactivate_toolkit", payload).await,
            Action::SearchMcp(payload) => self.emit("search_mcp", payload).await,
            Action::Error { message } => self.emit_error(&message).await,
        }
        Ok(Flow::Continue)
    }

    async fn on_improve(
        &mut self,
        question: String,
        new_task_id: Option<String>,
        attachments: Vec<String>,
    ) -> anyhow::Result<()> {
        self.actor.reopen_if_done().await;
        if self.actor.status().await == TaskStatus::Processing {
            self.emit_error(TASK_BUSY).await;
            return Ok(());
        }
        if !self.within_history_bound().await {
            return Ok(());
        }

        let complex = !attachments.is_empty() || self.classify(&question).await;
        let detail = format!("complex={complex} question={}", redact_text(&question));
        self.log(Level::INFO, "turn.classified", Some("improve"), &detail);

        if !complex {
            self.answer_directly(&question).await;
            if let Some(folder) = self.actor.take_pending_folder().await {
                workspace::remove_if_empty(&folder).await;
            }
            return Ok(());
        }

        if let Some(turn_id) = new_task_id.filter(|id| !id.is_empty()) {
            self.turn_task_id = turn_id;
        }
        if let Some(folder) = self.actor.take_pending_folder().await {
            self.working_directory = folder;
        }
        self.emit("confirmed", json!({ "question": question })).await;

        let context = self.context(HISTORY_HEADER).await;
        let engine = self.ensure_engine().await?;
        self.actor.transition(TaskStatus::Confirmed).await?;

        let question = format!("{question}{}", self.actor.options().summary_prompt);
        let task = RootTask::new(
            self.turn_task_id.clone(),
            compose_task_content(&context, &question),
        )
        .with_attachments(&attachments);
        self.task = Some(task.clone());
        self.finished_task = None;
        self.spawn_decomposition(engine, task, context, false).await;
        Ok(())
    }

    async fn on_start(&mut self) -> anyhow::Result<()> {
        if !self.within_history_bound().await {
            return Ok(());
        }
        let Some(engine) = self.engine.clone() else {
            tracing::warn!("start ignored for {}: no engine", self.actor.id());
            return Ok(());
        };
        if engine.is_paused() {
            engine.resume().await;
            return Ok(());
        }

        self.actor.transition(TaskStatus::Processing).await?;
        let cached = self.actor.decomposition().await;
        let subtasks = if cached.is_empty() {
            self.task
                .as_ref()
                .map(|t| t.subtasks.clone())
                .unwrap_or_default()
        } else {
            cached
        };
        let detail = format!("subtasks={}", subtasks.len());
        self.log(Level::INFO, "execution.start", Some("start"), &detail);
        self.spawn_execution(engine, subtasks).await;
        Ok(())
    }

    /// Appends a subtask to a finished task and runs it again.
    async fn on_supplement(&mut self, question: String) -> anyhow::Result<()> {
        if self.task.is_none() && self.finished_task.is_none() {
            self.emit_error(TASK_NOT_INITIALIZED_SUPPLEMENT).await;
            return Ok(());
        }
        if !self.actor.status().await.is_done() {
            self.emit_error(TASK_NOT_DONE_SUPPLEMENT).await;
            return Ok(());
        }
        let Some(mut task) = self.task.take().or_else(|| self.finished_task.take()) else {
            return Ok(());
        };
        let id = format!("{}.{}", task.id, task.subtasks.len() + 1);
        task.add_subtask(Subtask::new(id, question));
        let subtasks = task.subtasks.clone();
        self.turn_task_id = task.id.clone();
        self.task = Some(task);

        self.actor.reopen_if_done().await;
        let engine = self.ensure_engine().await?;
        self.actor.transition(TaskStatus::Processing).await?;
        let detail = format!("subtasks={}", subtasks.len());
        self.log(Level::INFO, "execution.start", Some("supplement"), &detail);
        self.spawn_execution(engine, subtasks).await;
        Ok(())
    }

    async fn on_update_task(&mut self, edits: &[SubtaskEdit]) {
        let Some(task) = self.task.as_mut() else {
            self.emit_error(TASK_NOT_INITIALIZED_UPDATE).await;
            return;
        };
        let mut subtasks = self.actor.decomposition().await;
        if subtasks.is_empty() {
            subtasks = task.subtasks.clone();
        }
        update_sub_tasks(&mut subtasks, edits);
        task.subtasks = subtasks;
        add_sub_tasks(task, edits);

        let sub_tasks = tree_sub_tasks(&task.subtasks);
        self.actor.set_decomposition(task.subtasks.clone()).await;
        let summary_task = self.summary_task.clone();
        self.emit(
            "to_sub_tasks",
            json!({ "summary_task": summary_task, "sub_tasks": sub_tasks }),
        )
        .await;
    }

    async fn on_add_task(&mut self, request: AddTaskRequest) -> anyhow::Result<()> {
        if self.task.is_none() && self.engine.is_none() {
            self.emit_error(TASK_NOT_INITIALIZED_ADD).await;
            return Ok(());
        }
        let Some(engine) = self.engine.clone() else {
            self.emit_error(WORKFORCE_NOT_INITIALIZED).await;
            return Ok(());
        };
        engine.add_task(&request).await?;

        let task_id = match request.task_id.filter(|id| !id.is_empty()) {
            Some(id) => Value::String(id),
            None => json!(self.task.as_ref().map(|t| t.subtasks.len()).unwrap_or(0) + 1),
        };
        self.emit(
            "add_task",
            json!({ "project_id": self.actor.id(), "task_id": task_id }),
        )
        .await;
        Ok(())
    }

    async fn on_remove_task(&mut self, task_id: String) -> anyhow::Result<()> {
        let Some(engine) = self.engine.clone() else {
            self.emit_error(WORKFORCE_NOT_INITIALIZED).await;
            return Ok(());
        };
        engine.remove_task(&task_id).await?;
        if let Some(task) = self.task.as_mut() {
            task.subtasks.retain(|s| s.id != task_id);
        }
        self.emit(
            "remove_task",
            json!({ "project_id": self.actor.id(), "task_id": task_id }),
        )
        .await;
        Ok(())
    }

    async fn on_skip(&mut self) -> anyhow::Result<()> {
        if self.actor.status().await.is_done() {
            tracing::debug!("skip ignored for {}: already done", self.actor.id());
            return Ok(());
        }
        self.log(Level::INFO, "task.skip", Some("skip_task"), "");
        if let Some(engine) = self.engine.take() {
            if engine.is_running() {
                engine.stop().await;
            }
            engine.stop_gracefully().await;
        }

        self.actor.transition(TaskStatus::Done).await?;
        self.actor.set_last_result(SKIP_RESULT).await;
        self.record_turn(SKIP_RESULT).await;
        self.finished_task = self.task.take();
        self.emit("end", json!({ "result": SKIP_RESULT })).await;
        Ok(())
    }

    async fn on_end(&mut self, reported: String) -> anyhow::Result<()> {
        if self.actor.status().await.is_done() {
            tracing::debug!("end ignored for {}: already done", self.actor.id());
            return Ok(());
        }
        let result = match self.task.clone() {
            Some(task) => self.final_result(&task, &reported).await,
            None if reported.is_empty() => prompts::TASK_COMPLETED.to_string(),
            None => reported,
        };

        self.actor.transition(TaskStatus::Done).await?;
        self.actor.set_last_result(&result).await;
        self.record_turn(&result).await;
        self.log(Level::INFO, "task.end", Some("end"), &redact_text(&result));
        self.emit("end", json!({ "result": result })).await;

        if let Some(engine) = self.engine.take() {
            engine.stop_gracefully().await;
        }
        self.finished_task = self.task.take();
        self.question_agent().await.reset().await;
        Ok(())
    }

    fn on_task_state(&mut self, task_id: &str, state: &str, result: &str) {
        if state.eq_ignore_ascii_case("DONE") && !result.is_empty() {
            self.last_completed_result = result.to_string();
        }
        let Some(subtask) = self
            .task
            .as_mut()
            .and_then(|task| task.find_subtask_mut(task_id))
        else {
            return;
        };
        if let Some(parsed) = SubtaskState::parse(state) {
            subtask.state = parsed;
        }
        if !result.is_empty() {
            subtask.result = Some(result.to_string());
        }
    }

    async fn on_new_task_state(
        &mut self,
        task_id: Option<String>,
        state: String,
        result: String,
        content: String,
    ) -> anyhow::Result<()> {
        let Some(current) = self.task.take() else {
            self.emit_error(TASK_NOT_INITIALIZED_NEW_STATE).await;
            return Ok(());
        };

        let old_result = self.final_result(&current, "").await;
        self.append_record(current.question(), &old_result).await;

        let next_id = task_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("{}-multi", now_ms()));
        if content.is_empty() {
            self.task = Some(current);
        } else {
            let mut next = RootTask::new(next_id.clone(), content.clone());
            next.additional_info = current.additional_info.clone();
            self.task = Some(next);
        }

        self.emit("end", json!({ "result": old_result })).await;
        self.emit(
            "new_task_state",
            json!({
                "task_id": task_id,
                "state": state,
                "result": result,
                "content": content,
            }),
        )
        .await;
        self.emit("remove_task", json!({ "task_id": task_id })).await;

        let Some(engine) = self.engine.clone() else {
            tracing::warn!("new task state for {} arrived without an engine", self.actor.id());
            return Ok(());
        };
        if content.is_empty() {
            return Ok(());
        }

        self.actor.transition(TaskStatus::Done).await?;
        self.actor.reopen_if_done().await;
        engine.pause().await;

        if !self.classify(&content).await {
            self.answer_directly(&content).await;
            engine.resume().await;
            return Ok(());
        }

        self.turn_task_id = next_id.clone();
        self.emit("confirmed", json!({ "question": content })).await;
        self.actor.transition(TaskStatus::Confirmed).await?;

        let context = self.context(HISTORY_HEADER).await;
        let mut task = RootTask::new(next_id, compose_task_content(&context, &content));
        if let Some(previous) = &self.task {
            task.additional_info = previous.additional_info.clone();
        }
        self.task = Some(task.clone());
        self.spawn_decomposition(engine, task, context, true).await;
        Ok(())
    }

    async fn on_new_agent(&mut self, spec: &NewAgentSpec) -> anyhow::Result<()> {
        let Some(engine) = self.engine.clone() else {
            tracing::warn!("new agent {} ignored for {}: no engine", spec.name, self.actor.id());
            return Ok(());
        };
        engine.pause().await;
        let added: anyhow::Result<()> = async {
            let worker = self
                .services
                .worker_agent(spec, self.actor.options())
                .await?;
            engine.add_worker(&spec.describe(), worker).await
        }
        .await;
        engine.resume().await;
        added
    }

    async fn on_install_mcp(&mut self, servers: Value) {
        let Some(engine) = self.engine.clone() else {
            self.emit_error(WORKFORCE_NOT_INITIALIZED).await;
            return;
        };
        let actions = self.actor.sender();
        self.track(async move {
            if let Err(err) = engine.install_mcp(servers).await {
                report_background_failure(&actions, "Failed to install MCP servers", err);
            }
        })
        .await;
    }

    async fn on_budget_exceeded(&mut self) {
        if let Some(engine) = &self.engine {
            engine.pause().await;
        }
        self.emit("budget_not_enough", json!({ "message": BUDGET_MESSAGE }))
            .await;
    }

    async fn apply_settled(&mut self, settled: SettledDecomposition) {
        let latest = settled.seq == self.decomposition_seq;
        let Some(task) = self
            .task
            .as_mut()
            .filter(|t| latest && t.id == settled.task_id)
        else {
            tracing::debug!(
                "decomposition {} for {} settled after the task moved on",
                settled.seq,
                settled.task_id
            );
            return;
        };
        task.subtasks = settled.subtasks.clone();
        self.summary_task = settled.summary_task.clone();
        self.actor
            .cache_decomposition(settled.subtasks, &settled.summary_task)
            .await;
    }

    async fn ensure_engine(&mut self) -> anyhow::Result<Arc<dyn OrchestrationEngine>> {
        if let Some(engine) = &self.engine {
            return Ok(engine.clone());
        }
        if let Err(err) = tokio::fs::create_dir_all(&self.working_directory).await {
            tracing::warn!(
                "failed to create working directory {}: {}",
                self.working_directory.display(),
                err
            );
        }

        let options = self.actor.options().clone();
        let engine = self
            .services
            .build_engine(EngineContext {
                options: options.clone(),
                actions: self.actor.sender(),
                inbox: self.actor.inbox(),
                working_directory: self.working_directory.clone(),
            })
            .await?;
        for spec in &options.new_agents {
            let worker = self.services.worker_agent(spec, &options).await?;
            engine.add_worker(&spec.describe(), worker).await?;
        }

        let detail = format!("workers={}", options.new_agents.len());
        self.log(Level::INFO, "engine.created", None, &detail);
        self.engine = Some(engine.clone());
        Ok(engine)
    }

    async fn spawn_decomposition(
        &mut self,
        engine: Arc<dyn OrchestrationEngine>,
        task: RootTask,
        context: String,
        follow_up: bool,
    ) {
        let actions = self.actor.sender();
        let observer = DecomposeObserver::new(
            actions.clone(),
            self.actor.id().to_string(),
            task.id.clone(),
        );
        let summary_agent = self.services.summary_agent(self.actor.options());
        let summary_timeout = self.config.summary_timeout();
        let project_id = self.actor.id().to_string();
        self.decomposition_seq += 1;
        let seq = self.decomposition_seq;
        self.track(async move {
            let settled = settle_decomposition(
                engine.as_ref(),
                task,
                seq,
                &context,
                &observer,
                summary_agent.as_ref(),
                summary_timeout,
                follow_up,
                &project_id,
            )
            .await;
            match settled {
                Ok(action) => {
                    actions.send(action);
                }
                Err(err) => report_background_failure(&actions, "Failed to decompose task", err),
            }
        })
        .await;
    }

    async fn spawn_execution(&self, engine: Arc<dyn OrchestrationEngine>, subtasks: Vec<Subtask>) {
        let actions = self.actor.sender();
        self.track(async move {
            if let Err(err) = engine.start_execution(subtasks).await {
                report_background_failure(&actions, "Task execution failed", err);
            }
        })
        .await;
    }

    async fn track<F>(&self, work: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if !self.actor.track(work).await {
            tracing::warn!("background work dropped for {}: actor torn down", self.actor.id());
        }
    }

    /// Stops the engine, marks the task done and tears the actor down.
    /// `force` stops the engine even when it reports idle.
    async fn teardown(&mut self, force: bool) {
        if let Some(engine) = self.engine.take() {
            if force || engine.is_running() {
                engine.stop().await;
            }
            engine.stop_gracefully().await;
        }
        self.task = None;
        self.finished_task = None;
        if let Err(err) = self.actor.transition(TaskStatus::Done).await {
            tracing::warn!("teardown of {}: {}", self.actor.id(), err);
        }
        self.actor.cleanup().await;
    }

    async fn context(&self, header: &'static str) -> String {
        conversation_context(self.actor.history().await, header).await
    }

    async fn question_agent(&self) -> Arc<dyn ConversationAgent> {
        let services = self.services.clone();
        let options = self.actor.options().clone();
        self.actor
            .question_agent_or_init(move || services.question_agent(&options))
            .await
    }

    /// True when the request needs the engine. Agent failures count as
    /// complex.
    async fn classify(&self, question: &str) -> bool {
        let context = self.context(PREVIOUS_CONVERSATION_HEADER).await;
        let agent = self.question_agent().await;
        match agent.step(&prompts::classify(&context, question)).await {
            Ok(reply) => prompts::is_complex_reply(&reply),
            Err(err) => {
                tracing::warn!("classification failed for {}: {}", self.actor.id(), err);
                true
            }
        }
    }

    async fn answer_directly(&self, question: &str) {
        let context = self.context(PREVIOUS_CONVERSATION_HEADER).await;
        let agent = self.question_agent().await;
        let content = match agent.step(&prompts::direct_answer(&context, question)).await {
            Ok(reply) => {
                let answer = if reply.trim().is_empty() {
                    FALLBACK_ANSWER.to_string()
                } else {
                    reply
                };
                self.actor
                    .append_history(ConversationRole::Assistant, answer.as_str())
                    .await;
                answer
            }
            Err(err) => {
                tracing::warn!("direct answer failed for {}: {}", self.actor.id(), err);
                ERROR_ANSWER.to_string()
            }
        };
        self.emit(
            "wait_confirm",
            json!({ "content": content, "question": question }),
        )
        .await;
    }

    async fn within_history_bound(&self) -> bool {
        let current_length = history_length(&self.actor.history().await);
        let max_length = self.config.max_history_chars;
        if current_length <= max_length {
            return true;
        }
        let detail = format!("current_length={current_length} max_length={max_length}");
        self.log(Level::WARN, "context.too_long", None, &detail);
        self.emit(
            "context_too_long",
            json!({
                "message": CONTEXT_TOO_LONG,
                "current_length": current_length,
                "max_length": max_length,
            }),
        )
        .await;
        false
    }

    /// Final text of a turn. Several subtasks are summarized; a single one
    /// loses its result banner.
    async fn final_result(&self, task: &RootTask, reported: &str) -> String {
        let raw = [reported, task.result.as_deref().unwrap_or_default()]
            .into_iter()
            .find(|r| !r.is_empty())
            .unwrap_or(self.last_completed_result.as_str())
            .to_string();

        match task.subtasks.len() {
            0 => raw,
            1 => strip_subtask_banner(&raw),
            _ => {
                let agent = self.services.summary_agent(self.actor.options());
                match agent.step(&prompts::subtask_results(task)).await {
                    Ok(summary) if !summary.trim().is_empty() => summary,
                    Ok(_) => raw,
                    Err(err) => {
                        tracing::warn!("result summary failed for {}: {}", task.id, err);
                        raw
                    }
                }
            }
        }
    }

    /// Appends the active turn to history as a task result.
    async fn record_turn(&self, result: &str) {
        let content = match &self.task {
            Some(task) => task.question().to_string(),
            None => format!("Task {}", self.turn_task_id),
        };
        self.append_record(&content, result).await;
    }

    async fn append_record(&self, content: &str, result: &str) {
        self.actor
            .append_history(
                ConversationRole::TaskResult,
                TaskRecord {
                    task_content: content.to_string(),
                    task_result: result.to_string(),
                    working_directory: Some(self.working_directory.display().to_string()),
                },
            )
            .await;
    }

    async fn emit(&self, name: &str, payload: Value) {
        if !self.sink.publish(StreamEvent::new(name, payload)).await {
            tracing::debug!("event {} dropped for {}: stream closed", name, self.actor.id());
        }
    }

    async fn emit_error(&self, message: &str) {
        self.emit("error", json!({ "message": message })).await;
    }

    fn log(&self, level: Level, event: &str, action: Option<&str>, detail: &str) {
        let mut record = ObservabilityEvent::new(COMPONENT, event)
            .project(self.actor.id())
            .task(&self.turn_task_id)
            .detail(detail);
        if let Some(action) = action {
            record = record.action(action);
        }
        emit_event(level, ProcessKind::Dispatcher, record);
    }
}

#[allow(clippy::too_many_arguments)]
async fn settle_decomposition(
    engine: &dyn OrchestrationEngine,
    mut task: RootTask,
    seq: u64,
    context: &str,
    observer: &DecomposeObserver,
    summary_agent: &dyn ConversationAgent,
    summary_timeout: Duration,
    follow_up: bool,
    project_id: &str,
) -> anyhow::Result<Action> {
    let returned = engine.decompose(&task, context, observer).await?;
    let streamed = observer.collected();
    let mut delta = if streamed.is_empty() { returned } else { streamed };

    task.subtasks = delta.clone();
    if ensure_fallback_subtask(&mut task) {
        delta = task.subtasks.clone();
    }

    let prompt = prompts::task_summary(&task);
    let summary = match tokio::time::timeout(summary_timeout, summary_agent.step(&prompt)).await {
        Ok(Ok(text)) if !text.trim().is_empty() => text.trim().to_string(),
        Ok(Ok(_)) => fallback_for(&task, follow_up),
        Ok(Err(err)) => {
            tracing::warn!("summary for {} failed: {}", task.id, err);
            fallback_for(&task, follow_up)
        }
        Err(_) => {
            tracing::warn!("summary for {} timed out", task.id);
            fallback_for(&task, follow_up)
        }
    };

    let payload = json!({
        "project_id": project_id,
        "task_id": task.id,
        "sub_tasks": tree_sub_tasks(&task.subtasks),
        "delta_sub_tasks": tree_sub_tasks(&delta),
        "is_final": true,
        "summary_task": summary,
    });
    Ok(Action::DecomposeProgress {
        payload,
        settled: Some(SettledDecomposition {
            seq,
            task_id: task.id.clone(),
            subtasks: task.subtasks,
            summary_task: summary,
        }),
    })
}

fn fallback_for(task: &RootTask, follow_up: bool) -> String {
    if follow_up {
        follow_up_summary(task.question())
    } else {
        fallback_summary(task.question())
    }
}

/// Routes a tracked task's failure back through the queue so the dispatcher
/// reports it in order.
fn report_background_failure(actions: &ActionSender, context: &str, err: anyhow::Error) {
    let action = match classify_failure(&err) {
        FailureKind::Budget => Action::BudgetExceeded,
        FailureKind::Cancelled => return,
        FailureKind::Other => Action::Error {
            message: format!("{context}: {err}"),
        },
    };
    actions.send(action);
}
