use std::collections::HashMap;

use serde_json::{json, Value};

use crate::{RootTask, Subtask, SubtaskEdit};

pub const MAX_TREE_DEPTH: usize = 5;

/// Client-facing rendering of a subtask list. Empty subtasks are hidden and
/// nesting stops below [`MAX_TREE_DEPTH`].
pub fn tree_sub_tasks(subtasks: &[Subtask]) -> Value {
    Value::Array(tree_at_depth(subtasks, 0))
}

fn tree_at_depth(subtasks: &[Subtask], depth: usize) -> Vec<Value> {
    if depth > MAX_TREE_DEPTH {
        return Vec::new();
    }
    subtasks
        .iter()
        .filter(|s| !s.content.is_empty())
        .map(|s| {
            json!({
                "id": s.id,
                "content": s.content,
                "state": s.state,
                "subtasks": tree_at_depth(&s.subtasks, depth + 1),
            })
        })
        .collect()
}

/// Applies client edits to a cached decomposition: subtasks whose id is not
/// among the edits are dropped, the rest take the edited content.
pub fn update_sub_tasks(subtasks: &mut Vec<Subtask>, edits: &[SubtaskEdit]) {
    let by_id = edits
        .iter()
        .filter(|e| !e.id.is_empty())
        .map(|e| (e.id.as_str(), e))
        .collect::<HashMap<_, _>>();
    retain_edited(subtasks, &by_id, 0);
}

fn retain_edited(subtasks: &mut Vec<Subtask>, by_id: &HashMap<&str, &SubtaskEdit>, depth: usize) {
    if depth > MAX_TREE_DEPTH {
        subtasks.clear();
        return;
    }
    subtasks.retain(|s| by_id.contains_key(s.id.as_str()));
    for subtask in subtasks.iter_mut() {
        if let Some(edit) = by_id.get(subtask.id.as_str()) {
            subtask.content = edit.content.clone();
        }
        retain_edited(&mut subtask.subtasks, by_id, depth + 1);
    }
}

/// Appends edits without an id as new subtasks numbered after the existing ones.
pub fn add_sub_tasks(task: &mut RootTask, edits: &[SubtaskEdit]) -> usize {
    let mut added = 0;
    for edit in edits.iter().filter(|e| e.id.is_empty()) {
        let id = format!("{}.{}", task.id, task.subtasks.len() + 1);
        task.add_subtask(Subtask::new(id, edit.content.clone()));
        added += 1;
    }
    added
}

/// Guarantees the task has something to execute. Returns true when the
/// fallback subtask was synthesized.
pub fn ensure_fallback_subtask(task: &mut RootTask) -> bool {
    if !task.subtasks.is_empty() {
        return false;
    }
    let content = task.question().to_string();
    task.subtasks = vec![Subtask::new(format!("{}.1", task.id), content)];
    true
}

/// Drops the `--- Subtask N Result ---` banner a single-subtask run leaves
/// in front of its output.
pub fn strip_subtask_banner(result: &str) -> String {
    if result.contains("--- Subtask") && result.contains("Result ---") {
        if let Some((_, tail)) = result.split_once("Result ---") {
            return tail.trim().to_string();
        }
    }
    result.to_string()
}

/// `Task|<preview>` summary used when the summary agent is slow or fails.
pub fn fallback_summary(content: &str) -> String {
    format!("Task|{}", preview(content, 80, 80))
}

/// `Follow-up Task|<preview>` summary for tasks created mid-run.
pub fn follow_up_summary(content: &str) -> String {
    format!("Follow-up Task|{}", preview(content, 100, 97))
}

fn preview(content: &str, limit: usize, keep: usize) -> String {
    if content.chars().count() > limit {
        format!("{}...", content.chars().take(keep).collect::<String>())
    } else {
        content.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SubtaskState;

    fn sample() -> Vec<Subtask> {
        let mut parent = Subtask::new("t.1", "gather data");
        parent.subtasks.push(Subtask::new("t.1.1", "download"));
        parent.subtasks.push(Subtask::new("t.1.2", ""));
        vec![parent, Subtask::new("t.2", "write report")]
    }

    #[test]
    fn tree_hides_empty_subtasks() {
        let tree = tree_sub_tasks(&sample());
        let items = tree.as_array().expect("array");
        assert_eq!(items.len(), 2);
        let children = items[0]["subtasks"].as_array().expect("children");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0]["id"], "t.1.1");
        assert_eq!(items[1]["state"], "OPEN");
    }

    #[test]
    fn tree_stops_below_depth_limit() {
        let mut node = Subtask::new("leaf", "x");
        for depth in 0..8 {
            let mut parent = Subtask::new(format!("n{depth}"), "x");
            parent.subtasks.push(node);
            node = parent;
        }
        let tree = tree_sub_tasks(&[node]);
        let mut depth = 0;
        let mut cursor = &tree;
        while let Some(first) = cursor.as_array().and_then(|a| a.first()) {
            depth += 1;
            cursor = &first["subtasks"];
        }
        assert_eq!(depth, MAX_TREE_DEPTH + 1);
    }

    #[test]
    fn update_keeps_only_edited_ids() {
        let mut subtasks = sample();
        update_sub_tasks(
            &mut subtasks,
            &[
                SubtaskEdit {
                    id: "t.2".to_string(),
                    content: "write a short report".to_string(),
                },
                SubtaskEdit {
                    id: String::new(),
                    content: "new item".to_string(),
                },
            ],
        );
        assert_eq!(subtasks.len(), 1);
        assert_eq!(subtasks[0].content, "write a short report");
    }

    #[test]
    fn add_numbers_after_existing_subtasks() {
        let mut task = RootTask::new("t", "root");
        task.subtasks = sample();
        let added = add_sub_tasks(
            &mut task,
            &[
                SubtaskEdit {
                    id: String::new(),
                    content: "third".to_string(),
                },
                SubtaskEdit {
                    id: "t.1".to_string(),
                    content: "ignored".to_string(),
                },
            ],
        );
        assert_eq!(added, 1);
        assert_eq!(task.subtasks[2].id, "t.3");
        assert_eq!(task.subtasks[2].state, SubtaskState::Open);
    }

    #[test]
    fn fallback_subtask_copies_question() {
        let mut task = RootTask::new("t9", "ctx\n=== CURRENT TASK ===\nsummarize logs");
        assert!(ensure_fallback_subtask(&mut task));
        assert_eq!(task.subtasks.len(), 1);
        assert_eq!(task.subtasks[0].id, "t9.1");
        assert_eq!(task.subtasks[0].content, "summarize logs");
        assert!(!ensure_fallback_subtask(&mut task));
    }

    #[test]
    fn banner_is_stripped_from_single_result() {
        let raw = "--- Subtask t.1 Result ---\n  the answer";
        assert_eq!(strip_subtask_banner(raw), "the answer");
        assert_eq!(strip_subtask_banner("plain"), "plain");
    }

    #[test]
    fn summaries_truncate_long_content() {
        let long = "x".repeat(120);
        assert_eq!(fallback_summary("short"), "Task|short");
        assert_eq!(fallback_summary(&long), format!("Task|{}...", "x".repeat(80)));
        assert_eq!(
            follow_up_summary(&long),
            format!("Follow-up Task|{}...", "x".repeat(97))
        );
        assert_eq!(follow_up_summary("hi"), "Follow-up Task|hi");
    }
}
