use std::hash::{Hash, Hasher};

use serde::Serialize;
use tracing::Level;

/// Target every lifecycle record is emitted on. Filter with
/// `RUST_LOG=taskline.obs=debug` to see only these.
pub const OBS_TARGET: &str = "taskline.obs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Server,
    Dispatcher,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Server => "server",
            ProcessKind::Dispatcher => "dispatcher",
        }
    }
}

/// One lifecycle record. Unset fields are written as empty strings so every
/// JSONL line has the same shape.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub project_id: Option<&'a str>,
    pub task_id: Option<&'a str>,
    pub action: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

impl<'a> ObservabilityEvent<'a> {
    pub fn new(component: &'a str, event: &'a str) -> Self {
        Self {
            event,
            component,
            ..Self::default()
        }
    }

    pub fn project(self, project_id: &'a str) -> Self {
        Self {
            project_id: non_empty(project_id),
            ..self
        }
    }

    pub fn task(self, task_id: &'a str) -> Self {
        Self {
            task_id: non_empty(task_id),
            ..self
        }
    }

    pub fn action(self, action: &'a str) -> Self {
        Self {
            action: non_empty(action),
            ..self
        }
    }

    pub fn status(self, status: &'a str) -> Self {
        Self {
            status: non_empty(status),
            ..self
        }
    }

    pub fn error_code(self, code: &'a str) -> Self {
        Self {
            error_code: non_empty(code),
            ..self
        }
    }

    pub fn detail(self, detail: &'a str) -> Self {
        Self {
            detail: non_empty(detail),
            ..self
        }
    }
}

fn non_empty(value: &str) -> Option<&str> {
    Some(value).filter(|v| !v.is_empty())
}

/// Stand-in for user text in info-level logs: character count plus a hash
/// that lets two records be matched without storing the text.
pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!(
        "[redacted len={} hash={}]",
        trimmed.chars().count(),
        short_hash(trimmed)
    )
}

pub fn short_hash(input: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:08x}", hasher.finish() as u32)
}

macro_rules! lifecycle_record {
    ($level:expr, $process:expr, $ev:expr) => {
        tracing::event!(
            target: OBS_TARGET,
            $level,
            process = $process.as_str(),
            component = $ev.component,
            event = $ev.event,
            project_id = $ev.project_id.unwrap_or_default(),
            task_id = $ev.task_id.unwrap_or_default(),
            action = $ev.action.unwrap_or_default(),
            status = $ev.status.unwrap_or_default(),
            error_code = $ev.error_code.unwrap_or_default(),
            detail = $ev.detail.unwrap_or_default(),
            "{}",
            $ev.event
        )
    };
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    // `tracing::event!` needs the level as a constant.
    if level == Level::ERROR {
        lifecycle_record!(Level::ERROR, process, event);
    } else if level == Level::WARN {
        lifecycle_record!(Level::WARN, process, event);
    } else if level == Level::INFO {
        lifecycle_record!(Level::INFO, process, event);
    } else {
        lifecycle_record!(Level::DEBUG, process, event);
    }
}
