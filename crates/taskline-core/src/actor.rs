use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use taskline_observability::{emit_event, ObservabilityEvent, ProcessKind};
use taskline_orchestrator::Subtask;
use taskline_types::{ChatOptions, ConversationEntry, ConversationRole, EntryContent, TaskStatus};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::registry::ActorMap;
use crate::{now_ms, Action, ControlPlaneError, ConversationAgent};

/// Cloneable enqueue handle. Never blocks, so synchronous producers such as
/// engine callbacks can use it directly.
#[derive(Clone, Debug)]
pub struct ActionSender {
    tx: mpsc::UnboundedSender<Action>,
}

impl ActionSender {
    /// Returns false once the owning actor has been dropped.
    pub fn send(&self, action: Action) -> bool {
        self.tx.send(action).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct InboxInner {
    slots: Mutex<HashMap<String, String>>,
    notify: Notify,
}

/// Per-agent latest-value register for human replies. Reads are destructive.
#[derive(Clone)]
pub struct HumanInbox {
    inner: Arc<InboxInner>,
}

impl Default for HumanInbox {
    fn default() -> Self {
        Self {
            inner: Arc::new(InboxInner {
                slots: Mutex::new(HashMap::new()),
                notify: Notify::new(),
            }),
        }
    }
}

impl HumanInbox {
    pub async fn record(&self, agent: &str, reply: &str) {
        self.inner
            .slots
            .lock()
            .await
            .insert(agent.to_string(), reply.to_string());
        self.inner.notify.notify_waiters();
    }

    pub async fn take(&self, agent: &str) -> Option<String> {
        self.inner.slots.lock().await.remove(agent)
    }

    /// Waits until a reply for `agent` arrives or `cancel` fires.
    pub async fn wait_for(&self, agent: &str, cancel: &CancellationToken) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(reply) = self.take(agent).await {
                return Some(reply);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }
}

#[derive(Default)]
struct TurnMemory {
    last_result: String,
    question_agent: Option<Arc<dyn ConversationAgent>>,
    decomposition: Vec<Subtask>,
    summary_task: String,
    pending_folder: Option<PathBuf>,
}

/// Serialized state of one task: its queue, status, history, inbox and the
/// background work spawned on its behalf.
pub struct TaskActor {
    id: String,
    options: ChatOptions,
    tx: mpsc::UnboundedSender<Action>,
    rx: Mutex<mpsc::UnboundedReceiver<Action>>,
    status: RwLock<TaskStatus>,
    history: RwLock<Vec<ConversationEntry>>,
    inbox: HumanInbox,
    background: Mutex<JoinSet<()>>,
    memory: Mutex<TurnMemory>,
    cancel: CancellationToken,
    cleaned_up: AtomicBool,
    created_at_ms: u64,
    last_activity_ms: AtomicU64,
    registry: Weak<ActorMap>,
}

impl std::fmt::Debug for TaskActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskActor")
            .field("id", &self.id)
            .field("task_id", &self.options.task_id)
            .field("cleaned_up", &self.is_cleaned_up())
            .finish_non_exhaustive()
    }
}

impl TaskActor {
    pub(crate) fn new(options: ChatOptions, registry: Weak<ActorMap>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let bootstrap = Action::Improve {
            question: options.question.clone(),
            new_task_id: Some(options.task_id.clone()).filter(|id| !id.is_empty()),
            attachments: options.attaches.clone(),
        };
        let _ = tx.send(bootstrap);
        let now = now_ms();
        Arc::new(Self {
            id: options.project_id.clone(),
            options,
            tx,
            rx: Mutex::new(rx),
            status: RwLock::new(TaskStatus::Confirming),
            history: RwLock::new(Vec::new()),
            inbox: HumanInbox::default(),
            background: Mutex::new(JoinSet::new()),
            memory: Mutex::new(TurnMemory::default()),
            cancel: CancellationToken::new(),
            cleaned_up: AtomicBool::new(false),
            created_at_ms: now,
            last_activity_ms: AtomicU64::new(now),
            registry,
        })
    }

    /// An actor that is not tracked by any registry.
    pub fn detached(options: ChatOptions) -> Arc<Self> {
        Self::new(options, Weak::new())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &ChatOptions {
        &self.options
    }

    pub fn sender(&self) -> ActionSender {
        ActionSender {
            tx: self.tx.clone(),
        }
    }

    pub fn inbox(&self) -> HumanInbox {
        self.inbox.clone()
    }

    pub fn enqueue(&self, action: Action) -> bool {
        self.touch();
        self.tx.send(action).is_ok()
    }

    /// Waits for the next action. Only the dispatcher calls this.
    pub async fn dequeue(&self) -> Option<Action> {
        let next = self.rx.lock().await.recv().await;
        self.touch();
        next
    }

    pub async fn try_dequeue(&self) -> Option<Action> {
        self.rx.lock().await.try_recv().ok()
    }

    pub async fn status(&self) -> TaskStatus {
        *self.status.read().await
    }

    pub async fn transition(&self, to: TaskStatus) -> Result<TaskStatus, ControlPlaneError> {
        let mut status = self.status.write().await;
        *status = status.transition(to)?;
        Ok(*status)
    }

    /// Moves a finished task back to `confirming`. Returns true if it did.
    pub async fn reopen_if_done(&self) -> bool {
        let mut status = self.status.write().await;
        if status.is_done() {
            *status = TaskStatus::Confirming;
            return true;
        }
        false
    }

    pub async fn append_history(&self, role: ConversationRole, content: impl Into<EntryContent>) {
        self.history
            .write()
            .await
            .push(ConversationEntry::new(role, content));
    }

    pub async fn history(&self) -> Vec<ConversationEntry> {
        self.history.read().await.clone()
    }

    pub async fn record_human_input(&self, agent: &str, reply: &str) {
        self.inbox.record(agent, reply).await;
    }

    pub async fn take_human_input(&self, agent: &str) -> Option<String> {
        self.inbox.take(agent).await
    }

    /// Registers background work so cleanup can abort and await it.
    /// Returns false when the actor is already torn down.
    pub async fn track<F>(&self, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = self.background.lock().await;
        if self.is_cleaned_up() {
            return false;
        }
        while set.try_join_next().is_some() {}
        set.spawn(work);
        true
    }

    pub async fn background_len(&self) -> usize {
        let mut set = self.background.lock().await;
        while set.try_join_next().is_some() {}
        set.len()
    }

    pub async fn last_result(&self) -> String {
        self.memory.lock().await.last_result.clone()
    }

    pub async fn set_last_result(&self, result: &str) {
        self.memory.lock().await.last_result = result.to_string();
    }

    pub async fn question_agent_or_init(
        &self,
        init: impl FnOnce() -> Arc<dyn ConversationAgent>,
    ) -> Arc<dyn ConversationAgent> {
        let mut memory = self.memory.lock().await;
        memory.question_agent.get_or_insert_with(init).clone()
    }

    pub async fn cache_decomposition(&self, subtasks: Vec<Subtask>, summary_task: &str) {
        let mut memory = self.memory.lock().await;
        memory.decomposition = subtasks;
        memory.summary_task = summary_task.to_string();
    }

    pub async fn decomposition(&self) -> Vec<Subtask> {
        self.memory.lock().await.decomposition.clone()
    }

    pub async fn set_decomposition(&self, subtasks: Vec<Subtask>) {
        self.memory.lock().await.decomposition = subtasks;
    }

    pub async fn summary_task(&self) -> String {
        self.memory.lock().await.summary_task.clone()
    }

    pub async fn set_pending_folder(&self, folder: PathBuf) {
        self.memory.lock().await.pending_folder = Some(folder);
    }

    pub async fn take_pending_folder(&self) -> Option<PathBuf> {
        self.memory.lock().await.pending_folder.take()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned_up.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    pub fn idle_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_activity_ms.load(Ordering::Relaxed))
    }

    /// Aborts and awaits all tracked work, then removes this actor from its
    /// registry. Only the first call does anything.
    pub async fn cleanup(&self) -> bool {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();

        let mut set = std::mem::take(&mut *self.background.lock().await);
        let pending = set.len();
        set.shutdown().await;

        if let Some(map) = self.registry.upgrade() {
            let mut actors = map.write().await;
            let is_self = actors
                .get(&self.id)
                .map(|a| std::ptr::eq(Arc::as_ptr(a), self))
                .unwrap_or(false);
            if is_self {
                actors.remove(&self.id);
            }
        }

        let detail = format!("aborted_background={pending}");
        emit_event(
            Level::INFO,
            ProcessKind::Dispatcher,
            ObservabilityEvent::new("task_actor", "actor.cleanup")
                .project(&self.id)
                .task(&self.options.task_id)
                .detail(&detail),
        );
        true
    }
}
