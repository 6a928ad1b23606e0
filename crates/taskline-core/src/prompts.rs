//! Prompt text for the control plane's own agent calls.

use taskline_orchestrator::RootTask;

pub const FALLBACK_ANSWER: &str =
    "I understand your question, but I'm having trouble generating a response right now.";
pub const ERROR_ANSWER: &str = "I encountered an error while processing your question.";
pub const SKIP_RESULT: &str = "<summary>Task stopped</summary>Task stopped by user";
pub const CONTEXT_TOO_LONG: &str =
    "The conversation history is too long. Please create a new project to continue.";
pub const TASK_COMPLETED: &str = "Task completed";

const CLASSIFY_INSTRUCTIONS: &str = r#"Determine if this user query is a complex task or a simple question.

**Complex task** (answer "yes"): Requires tools, code execution, file operations, multi-step planning, or creating/modifying content
- Examples: "create a file", "search for X", "implement feature Y", "write code", "analyze data", "build something"

**Simple question** (answer "no"): Can be answered directly with knowledge or conversation history, no action needed
- Examples: greetings ("hello", "hi"), fact queries ("what is X?"), clarifications ("what did you mean?"), status checks ("how are you?")

Answer only "yes" or "no". Do not provide any explanation.

Is this a complex task? (yes/no):"#;

pub fn classify(context: &str, question: &str) -> String {
    format!("{context}User Query: {question}\n\n{CLASSIFY_INSTRUCTIONS}")
}

/// True when the classifier reply asks for engine execution.
pub fn is_complex_reply(reply: &str) -> bool {
    let normalized = reply.trim().to_lowercase();
    normalized.is_empty() || normalized.contains("yes")
}

pub fn direct_answer(context: &str, question: &str) -> String {
    format!(
        "{context}User Query: {question}\n\nProvide a direct, helpful answer to this simple question."
    )
}

pub fn task_summary(task: &RootTask) -> String {
    format!(
        r#"The user's task is:
---
{}
---
Your instructions are:
1.  Come up with a short and descriptive name for this task.
2.  Create a concise summary of the task's main points and objectives.
3.  Return the task name and the summary, separated by a vertical bar (|).

Example format: "Task Name|This is the summary of the task."
Do not include any other text or formatting.
"#,
        task.describe()
    )
}

pub fn subtask_results(task: &RootTask) -> String {
    let mut info = String::new();
    for (i, subtask) in task.subtasks.iter().enumerate() {
        info.push_str(&format!("\n**Subtask {}**\n", i + 1));
        info.push_str(&format!("Description: {}\n", subtask.content));
        info.push_str(&format!(
            "Result: {}\n---\n",
            subtask.result.as_deref().unwrap_or("No result")
        ));
    }
    format!(
        r#"You are a professional summarizer. Summarize the results of the following subtasks.

Main Task: {}

Subtasks (with descriptions and results):
---
{info}
---

Instructions:
1. Provide a concise summary of what was accomplished
2. Highlight key findings or outputs from each subtask
3. Mention any important files created or actions taken
4. Use bullet points or sections for clarity
5. DO NOT repeat the task name in your summary - go straight to the results
6. Keep it professional but conversational

Summary:
"#,
        task.content
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskline_orchestrator::Subtask;

    #[test]
    fn classifier_reply_parsing() {
        assert!(is_complex_reply(" Yes."));
        assert!(is_complex_reply(""));
        assert!(!is_complex_reply("no"));
        assert!(!is_complex_reply("  No  "));
    }

    #[test]
    fn subtask_results_lists_missing_results() {
        let mut task = RootTask::new("t", "main");
        task.add_subtask(Subtask::new("t.1", "first"));
        let prompt = subtask_results(&task);
        assert!(prompt.contains("Main Task: main"));
        assert!(prompt.contains("Description: first\nResult: No result\n---\n"));
    }
}
