use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskline_orchestrator::{Subtask, SubtaskEdit};
use taskline_types::NewAgentSpec;

/// Outcome of a background decomposition, delivered back to the dispatcher
/// so it stays the only writer of the active task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettledDecomposition {
    /// Per-dispatcher decomposition counter.
    pub seq: u64,
    pub task_id: String,
    pub subtasks: Vec<Subtask>,
    pub summary_task: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddTaskRequest {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<Value>,
    #[serde(default)]
    pub insert_position: Option<usize>,
}

/// One command in a task's queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Start,
    Improve {
        question: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_task_id: Option<String>,
        #[serde(default)]
        attachments: Vec<String>,
    },
    Supplement {
        question: String,
    },
    AddTask(AddTaskRequest),
    RemoveTask {
        task_id: String,
    },
    SkipTask,
    Stop,
    Pause,
    Resume,
    HumanReply {
        agent: String,
        reply: String,
    },
    InstallMcp {
        servers: Value,
    },
    UpdateTask {
        edits: Vec<SubtaskEdit>,
    },
    TaskState {
        task_id: String,
        state: String,
        #[serde(default)]
        result: String,
        #[serde(default)]
        failure_count: u32,
    },
    NewTaskState {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        #[serde(default)]
        state: String,
        #[serde(default)]
        result: String,
        #[serde(default)]
        content: String,
    },
    End {
        #[serde(default)]
        result: String,
    },
    BudgetExceeded,
    NewAgent(NewAgentSpec),
    DecomposeText {
        content: String,
    },
    DecomposeProgress {
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        settled: Option<SettledDecomposition>,
    },
    AssignTask(Value),
    Terminal {
        process_task_id: String,
        output: String,
    },
    WriteFile {
        process_task_id: String,
        file_path: String,
    },
    Notice {
        process_task_id: String,
        notice: String,
    },
    Ask(Value),
    CreateAgent(Value),
    ActivateAgent(Value),
    DeactivateAgent(Value),
    ActivateToolkit(Value),
    DeactivateToolkit(Value),
    SearchMcp(Value),
    /// Failure reported by tracked background work.
    Error {
        message: String,
    },
}

impl Action {
    pub fn improve(question: impl Into<String>) -> Self {
        Action::Improve {
            question: question.into(),
            new_task_id: None,
            attachments: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Improve { .. } => "improve",
            Action::Supplement { .. } => "supplement",
            Action::AddTask(_) => "add_task",
            Action::RemoveTask { .. } => "remove_task",
            Action::SkipTask => "skip_task",
            Action::Stop => "stop",
            Action::Pause => "pause",
            Action::Resume => "resume",
            Action::HumanReply { .. } => "human_reply",
            Action::InstallMcp { .. } => "install_mcp",
            Action::UpdateTask { .. } => "update_task",
            Action::TaskState { .. } => "task_state",
            Action::NewTaskState { .. } => "new_task_state",
            Action::End { .. } => "end",
            Action::BudgetExceeded => "budget_not_enough",
            Action::NewAgent(_) => "new_agent",
            Action::DecomposeText { .. } => "decompose_text",
            Action::DecomposeProgress { .. } => "decompose_progress",
            Action::AssignTask(_) => "assign_task",
            Action::Terminal { .. } => "terminal",
            Action::WriteFile { .. } => "write_file",
            Action::Notice { .. } => "notice",
            Action::Ask(_) => "ask",
            Action::CreateAgent(_) => "create_agent",
            Action::ActivateAgent(_) => "activate_agent",
            Action::DeactivateAgent(_) => "deactivate_agent",
            Action::ActivateToolkit(_) => "activate_toolkit",
            Action::DeactivateToolkit(_) => "deactivate_toolkit",
            Action::SearchMcp(_) => "search_mcp",
            Action::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn actions_are_tagged_by_name() {
        let raw = serde_json::to_value(Action::RemoveTask {
            task_id: "t.2".to_string(),
        })
        .expect("serialize");
        assert_eq!(raw, json!({"action": "remove_task", "task_id": "t.2"}));

        let parsed: Action =
            serde_json::from_value(json!({"action": "improve", "question": "hi"})).expect("parse");
        assert_eq!(parsed, Action::improve("hi"));
        assert_eq!(parsed.name(), "improve");
    }
}
