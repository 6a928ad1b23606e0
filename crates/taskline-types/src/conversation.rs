use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationRole {
    User,
    Assistant,
    TaskResult,
}

/// Compact record of a finished task kept for later turns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaskRecord {
    pub task_content: String,
    pub task_result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryContent {
    Text(String),
    Record(TaskRecord),
}

impl EntryContent {
    /// Character count used for the history bound.
    pub fn char_len(&self) -> usize {
        match self {
            EntryContent::Text(text) => text.chars().count(),
            EntryContent::Record(record) => {
                record.task_content.chars().count() + record.task_result.chars().count()
            }
        }
    }
}

impl From<String> for EntryContent {
    fn from(value: String) -> Self {
        EntryContent::Text(value)
    }
}

impl From<&str> for EntryContent {
    fn from(value: &str) -> Self {
        EntryContent::Text(value.to_string())
    }
}

impl From<TaskRecord> for EntryContent {
    fn from(value: TaskRecord) -> Self {
        EntryContent::Record(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: ConversationRole,
    pub content: EntryContent,
    pub timestamp: DateTime<Utc>,
}

impl ConversationEntry {
    pub fn new(role: ConversationRole, content: impl Into<EntryContent>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn task_record(&self) -> Option<&TaskRecord> {
        match (&self.role, &self.content) {
            (ConversationRole::TaskResult, EntryContent::Record(record)) => Some(record),
            _ => None,
        }
    }
}
