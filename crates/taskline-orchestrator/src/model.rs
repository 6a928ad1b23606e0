use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Separator placed between the rendered conversation context and the
/// question itself inside a task's content.
pub const CURRENT_TASK_MARKER: &str = "=== CURRENT TASK ===";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubtaskState {
    #[default]
    Open,
    Running,
    Done,
    Failed,
    Deleted,
}

impl SubtaskState {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "OPEN" => Some(Self::Open),
            "RUNNING" => Some(Self::Running),
            "DONE" => Some(Self::Done),
            "FAILED" => Some(Self::Failed),
            "DELETED" => Some(Self::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub state: SubtaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
}

impl Subtask {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            state: SubtaskState::Open,
            result: None,
            subtasks: Vec::new(),
        }
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut Subtask> {
        if self.id == id {
            return Some(self);
        }
        self.subtasks.iter_mut().find_map(|s| s.find_mut(id))
    }
}

/// The task currently driven by the engine for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootTask {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    /// Attachment file name to path.
    #[serde(default)]
    pub additional_info: BTreeMap<String, String>,
}

impl RootTask {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            result: None,
            subtasks: Vec::new(),
            additional_info: BTreeMap::new(),
        }
    }

    pub fn with_attachments<'a>(mut self, paths: impl IntoIterator<Item = &'a String>) -> Self {
        for path in paths {
            let name = std::path::Path::new(path)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(path)
                .to_string();
            self.additional_info.insert(name, path.clone());
        }
        self
    }

    pub fn add_subtask(&mut self, subtask: Subtask) {
        self.subtasks.push(subtask);
    }

    pub fn find_subtask_mut(&mut self, id: &str) -> Option<&mut Subtask> {
        self.subtasks.iter_mut().find_map(|s| s.find_mut(id))
    }

    /// The question part of the content, without any prepended context.
    pub fn question(&self) -> &str {
        match self.content.rsplit_once(CURRENT_TASK_MARKER) {
            Some((_, tail)) => tail.trim(),
            None => self.content.as_str(),
        }
    }

    /// Full text handed to summary agents.
    pub fn describe(&self) -> String {
        let mut out = format!("{}\n", self.content);
        for subtask in &self.subtasks {
            out.push_str(&format!("  - [{}] {}\n", subtask.id, subtask.content));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskEdit {
    #[serde(default)]
    pub id: String,
    pub content: String,
}
