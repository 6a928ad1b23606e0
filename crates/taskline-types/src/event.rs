use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry of a task's outgoing event feed.
///
/// Events are delivered to the client in the exact order the dispatcher
/// produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "step")]
    pub name: String,
    #[serde(rename = "data")]
    pub payload: Value,
}

impl StreamEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    /// Renders the event as a single SSE `data:` line body.
    pub fn to_sse_data(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
