//! Session-scoped conversation log.
//!
//! An append-only sequence of role-tagged messages persisted as
//! `history.json` inside the session directory, so it lives and dies with
//! the session. Used only to enrich later queries with recent context.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Load the conversation log. A missing or unreadable file is an empty
/// conversation, not an error: history is best-effort context.
pub fn load(path: &Path) -> Vec<Message> {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

/// Append messages to the log and write it back.
pub fn append(path: &Path, new_messages: &[Message]) -> Result<()> {
    let mut messages = load(path);
    messages.extend_from_slice(new_messages);
    let json = serde_json::to_string(&messages)
        .map_err(|e| crate::error::RagError::CorruptArtifact(format!("history.json: {}", e)))?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Rewrite generic follow-up queries ("explain it", "tell me more") by
/// substituting the most recent substantial assistant turn as the implied
/// topic, so retrieval targets the right passage instead of a vague phrase.
pub fn enhance_query(original: &str, conversation: &[Message]) -> String {
    if conversation.is_empty() {
        return original.to_string();
    }

    let lower = original.to_lowercase();
    let generic = ["explain it", "tell me more", "elaborate", "explain this"]
        .iter()
        .any(|phrase| lower.contains(phrase));

    if generic {
        // Most recent assistant turn with enough substance to be a topic.
        if let Some(topic) = conversation
            .iter()
            .rev()
            .find(|m| m.role == "assistant" && m.content.len() > 50)
        {
            let head: String = topic.content.chars().take(200).collect();
            return format!(
                "Explain in detail the following topic from the document: {}",
                head
            );
        }
    }

    original.to_string()
}
