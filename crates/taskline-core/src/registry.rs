use std::collections::HashMap;
use std::sync::Arc;

use taskline_types::ChatOptions;
use tokio::sync::RwLock;

use crate::{now_ms, TaskActor};

pub(crate) type ActorMap = RwLock<HashMap<String, Arc<TaskActor>>>;

/// Live task actors keyed by project id.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    actors: Arc<ActorMap>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<TaskActor>> {
        self.actors
            .read()
            .await
            .get(id)
            .filter(|actor| !actor.is_cleaned_up())
            .cloned()
    }

    /// Creates the actor for `options.project_id`, or returns the live one
    /// as the error when it already exists.
    pub async fn acquire(
        &self,
        options: ChatOptions,
    ) -> std::result::Result<Arc<TaskActor>, Arc<TaskActor>> {
        let mut guard = self.actors.write().await;
        if let Some(existing) = guard.get(&options.project_id) {
            if !existing.is_cleaned_up() {
                return Err(existing.clone());
            }
        }
        let actor = TaskActor::new(options, Arc::downgrade(&self.actors));
        guard.insert(actor.id().to_string(), actor.clone());
        Ok(actor)
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<TaskActor>> {
        self.actors.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.actors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.actors.read().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids = self.actors.read().await.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// Detaches actors without activity for longer than `idle_ms`. The caller
    /// runs their cleanup.
    pub async fn reap_idle(&self, idle_ms: u64) -> Vec<Arc<TaskActor>> {
        let now = now_ms();
        let mut guard = self.actors.write().await;
        let stale_ids = guard
            .iter()
            .filter_map(|(id, actor)| {
                if actor.is_cleaned_up() || actor.idle_ms(now) > idle_ms {
                    Some(id.clone())
                } else {
                    None
                }
            })
            .collect::<Vec<_>>();
        let mut out = Vec::with_capacity(stale_ids.len());
        for id in stale_ids {
            if let Some(actor) = guard.remove(&id) {
                out.push(actor);
            }
        }
        out
    }
}
