use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelConfig {
    #[serde(default)]
    pub model_platform: String,
    #[serde(default)]
    pub model_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_params: Option<Value>,
}

/// Worker agent requested by the client, either at start or mid-run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NewAgentSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_tools: Option<Value>,
}

impl NewAgentSpec {
    /// One-line worker description handed to the engine.
    pub fn describe(&self) -> String {
        let mut parts = vec![format!("{}:", self.name)];
        let description = self.description.trim();
        if description.is_empty() {
            parts.push("A specialized agent".to_string());
        } else {
            parts.push(description.to_string());
        }

        let mut tool_names = self.tools.iter().map(|t| titleize(t)).collect::<Vec<_>>();
        if let Some(servers) = self
            .mcp_tools
            .as_ref()
            .and_then(|v| v.get("mcpServers"))
            .and_then(|v| v.as_object())
        {
            tool_names.extend(servers.keys().map(|k| titleize(k)));
        }
        if !tool_names.is_empty() {
            parts.push(format!(
                "with access to {} tools : <{:?}>",
                tool_names.join(", "),
                tool_names
            ));
        }
        parts.join(" ")
    }
}

fn titleize(raw: &str) -> String {
    raw.split(['_', '-', ' '])
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Start-of-conversation parameters shared by every turn of a task.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatOptions {
    pub project_id: String,
    pub task_id: String,
    pub question: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub attaches: Vec<String>,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub new_agents: Vec<NewAgentSpec>,
    #[serde(default)]
    pub summary_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

impl ChatOptions {
    pub fn has_attachments(&self) -> bool {
        !self.attaches.is_empty()
    }

    /// Folder-safe form of the user part of `email`.
    pub fn user_slug(&self) -> String {
        let local = self.email.split('@').next().unwrap_or_default();
        let slug = local
            .chars()
            .map(|c| {
                if c.is_whitespace() || "\\/*?:\"<>|".contains(c) {
                    '_'
                } else {
                    c
                }
            })
            .collect::<String>();
        let slug = slug.trim_matches('.').to_string();
        if slug.is_empty() {
            "anonymous".to_string()
        } else {
            slug
        }
    }
}
