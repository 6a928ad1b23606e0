use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use taskline_orchestrator::CURRENT_TASK_MARKER;
use taskline_types::{ConversationEntry, ConversationRole, EntryContent, TaskRecord};

pub const HISTORY_HEADER: &str = "=== CONVERSATION HISTORY ===";
pub const PREVIOUS_CONVERSATION_HEADER: &str = "=== Previous Conversation ===";

const SKIPPED_DIRS: [&str; 3] = ["node_modules", "__pycache__", "venv"];
const SKIPPED_SUFFIXES: [&str; 2] = [".pyc", ".tmp"];

/// Cumulative character length of the history.
pub fn history_length(history: &[ConversationEntry]) -> usize {
    history.iter().map(|e| e.content.char_len()).sum()
}

/// Renders prior turns into one block for prompts and the engine.
///
/// Generated files of every referenced working directory are listed once,
/// at the end, sorted.
pub fn build_conversation_context(history: &[ConversationEntry], header: &str) -> String {
    if history.is_empty() {
        return String::new();
    }

    let mut context = format!("{header}\n");
    let mut working_directories = BTreeSet::new();

    for entry in history {
        match (&entry.role, &entry.content) {
            (ConversationRole::TaskResult, EntryContent::Record(record)) => {
                context.push_str(&format_task_record(record));
                context.push_str("\n\n");
                if let Some(dir) = record.working_directory.as_deref().filter(|d| !d.is_empty()) {
                    working_directories.insert(dir.to_string());
                }
            }
            (ConversationRole::TaskResult, EntryContent::Text(text)) => {
                context.push_str(text);
                context.push('\n');
            }
            (ConversationRole::Assistant, content) => {
                context.push_str(&format!("Assistant: {}\n\n", content_text(content)));
            }
            (ConversationRole::User, _) => {}
        }
    }

    let files = working_directories
        .iter()
        .flat_map(|dir| collect_generated_files(Path::new(dir)))
        .collect::<BTreeSet<_>>();
    if !files.is_empty() {
        context.push_str("Generated Files from Previous Tasks:\n");
        for file in &files {
            context.push_str(&format!("  - {}\n", file.display()));
        }
        context.push('\n');
    }

    context.push('\n');
    context
}

/// [`build_conversation_context`] with the generated-file walk moved onto
/// the blocking pool.
pub async fn conversation_context(history: Vec<ConversationEntry>, header: &'static str) -> String {
    match tokio::task::spawn_blocking(move || build_conversation_context(&history, header)).await {
        Ok(context) => context,
        Err(err) => {
            tracing::warn!("conversation context build failed: {}", err);
            String::new()
        }
    }
}

fn format_task_record(record: &TaskRecord) -> String {
    let mut parts = Vec::new();
    if !record.task_content.is_empty() {
        parts.push(format!("Previous Task: {}", record.task_content));
    }
    if !record.task_result.is_empty() {
        parts.push(format!("Previous Task Result: {}", record.task_result));
    }
    parts.join("\n")
}

fn content_text(content: &EntryContent) -> String {
    match content {
        EntryContent::Text(text) => text.clone(),
        EntryContent::Record(record) => format_task_record(record),
    }
}

/// Absolute paths of user-visible files below `dir`. Hidden entries, caches
/// and dependency folders are left out. A missing directory yields nothing.
pub fn collect_generated_files(dir: &Path) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }
    let root = std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf());

    let walker = WalkBuilder::new(&root)
        .hidden(true)
        .parents(false)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .follow_links(false)
        .filter_entry(|entry| {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir || entry.depth() == 0 {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            !SKIPPED_DIRS.contains(&name.as_ref())
        })
        .build();

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!("skipping unreadable path under {}: {}", root.display(), err);
                continue;
            }
        };
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.starts_with('.') || SKIPPED_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            continue;
        }
        files.push(entry.into_path());
    }
    files.sort();
    files
}

/// Task content handed to the engine: prior context, the marker, then the
/// question.
pub fn compose_task_content(context: &str, question: &str) -> String {
    if context.is_empty() {
        return question.to_string();
    }
    format!("{context}\n{CURRENT_TASK_MARKER}\n{question}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn record(dir: Option<&Path>, content: &str, result: &str) -> ConversationEntry {
        ConversationEntry::new(
            ConversationRole::TaskResult,
            TaskRecord {
                task_content: content.to_string(),
                task_result: result.to_string(),
                working_directory: dir.map(|d| d.display().to_string()),
            },
        )
    }

    #[test]
    fn empty_history_renders_nothing() {
        assert_eq!(build_conversation_context(&[], HISTORY_HEADER), "");
        assert_eq!(history_length(&[]), 0);
    }

    #[test]
    fn renders_records_assistant_and_skips_user() {
        let history = vec![
            ConversationEntry::new(ConversationRole::User, "ignored question"),
            ConversationEntry::new(ConversationRole::Assistant, "Hi there"),
            record(None, "draft a plan", "plan ready"),
            ConversationEntry::new(ConversationRole::TaskResult, "raw note"),
        ];
        let text = build_conversation_context(&history, PREVIOUS_CONVERSATION_HEADER);
        assert_eq!(
            text,
            "=== Previous Conversation ===\n\
             Assistant: Hi there\n\n\
             Previous Task: draft a plan\nPrevious Task Result: plan ready\n\n\
             raw note\n\n"
        );
        assert!(!text.contains("ignored question"));
    }

    #[test]
    fn generated_files_are_listed_once_and_sorted() {
        let dir = tempfile::Builder::new()
            .prefix("taskline-ctx")
            .tempdir()
            .expect("tempdir");
        let other = tempfile::Builder::new()
            .prefix("taskline-ctx-other")
            .tempdir()
            .expect("tempdir");
        let root = dir.path();
        fs::create_dir_all(root.join("sub")).expect("mkdir");
        fs::create_dir_all(root.join("node_modules/pkg")).expect("mkdir");
        fs::create_dir_all(root.join(".cache")).expect("mkdir");
        fs::write(root.join("b.txt"), "b").expect("write");
        fs::write(root.join("sub/a.md"), "a").expect("write");
        fs::write(root.join(".env"), "secret").expect("write");
        fs::write(root.join("x.pyc"), "").expect("write");
        fs::write(root.join("y.tmp"), "").expect("write");
        fs::write(root.join("node_modules/pkg/index.js"), "").expect("write");
        fs::write(root.join(".cache/c.txt"), "").expect("write");
        fs::write(other.path().join("report.csv"), "").expect("write");

        let history = vec![
            record(Some(root), "one", "r1"),
            record(Some(root), "two", "r2"),
            record(Some(other.path()), "three", "r3"),
        ];
        let text = build_conversation_context(&history, HISTORY_HEADER);

        let listed = text
            .lines()
            .filter_map(|l| l.strip_prefix("  - "))
            .map(PathBuf::from)
            .collect::<Vec<_>>();
        let mut expected = vec![
            std::path::absolute(root.join("b.txt")).expect("abs"),
            std::path::absolute(root.join("sub/a.md")).expect("abs"),
            std::path::absolute(other.path().join("report.csv")).expect("abs"),
        ];
        expected.sort();
        assert_eq!(listed, expected);
        assert_eq!(text.matches("Generated Files from Previous Tasks:").count(), 1);
        assert!(text.ends_with("\n\n\n"));
    }

    #[tokio::test]
    async fn blocking_pool_build_matches_inline_build() {
        let dir = tempfile::Builder::new()
            .prefix("taskline-ctx-async")
            .tempdir()
            .expect("tempdir");
        fs::write(dir.path().join("notes.md"), "n").expect("write");
        let history = vec![
            ConversationEntry::new(ConversationRole::Assistant, "Hi there"),
            record(Some(dir.path()), "write notes", "done"),
        ];

        let inline = build_conversation_context(&history, HISTORY_HEADER);
        let pooled = conversation_context(history, HISTORY_HEADER).await;
        assert_eq!(pooled, inline);
        assert!(pooled.contains("notes.md"));
        assert_eq!(conversation_context(Vec::new(), HISTORY_HEADER).await, "");
    }

    #[test]
    fn history_length_sums_characters() {
        let history = vec![
            ConversationEntry::new(ConversationRole::Assistant, "héllo"),
            record(None, "ab", "cd"),
        ];
        assert_eq!(history_length(&history), 9);
    }

    #[test]
    fn composed_content_round_trips_question() {
        let content = compose_task_content("ctx\n\n", "build it");
        let task = taskline_orchestrator::RootTask::new("t", content);
        assert_eq!(task.question(), "build it");
        assert_eq!(compose_task_content("", "q"), "q");
    }
}
