use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tokens::{estimate_file_tokens, estimate_tokens};

/// Opaque session identifier, owned by the persistence layer.
pub type SessionId = i64;

/// Identifier of a (session, file) association row.
pub type LinkId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A single chat message. Immutable once created; the token estimate is fixed
/// at construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    role: Role,
    content: String,
    timestamp: DateTime<Utc>,
    estimated_tokens: usize,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self::with_timestamp(role, content, Utc::now())
    }

    pub fn with_timestamp(role: Role, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        let content = content.into();
        let estimated_tokens = estimate_tokens(&content);
        Self { role, content, timestamp, estimated_tokens }
    }

    pub fn role(&self) -> Role { self.role }
    pub fn content(&self) -> &str { &self.content }
    pub fn timestamp(&self) -> DateTime<Utc> { self.timestamp }
    pub fn estimated_tokens(&self) -> usize { self.estimated_tokens }
}

/// Sum of the per-message estimates.
pub fn estimate_message_tokens(messages: &[ChatMessage]) -> usize {
    messages.iter().map(ChatMessage::estimated_tokens).sum()
}

/// A (session, file) association as stored by the file link store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLink {
    pub link_id: LinkId,
    pub display_name: String,
    pub original_name: String,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub use_summary: bool,
    pub excluded: bool,
    pub order_index: i64,
}

impl FileLink {
    /// Summary when requested and present, else full text, else empty.
    pub fn resolved_content(&self) -> &str {
        match (&self.summary, &self.content) {
            (Some(summary), _) if self.use_summary && !summary.is_empty() => summary,
            (_, Some(content)) => content,
            _ => "",
        }
    }
}

/// Input for attaching a file to a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewFile {
    pub display_name: String,
    pub original_name: String,
    pub content: Option<String>,
    pub summary: Option<String>,
    #[serde(default)]
    pub use_summary: bool,
}

/// File content as presented to the model, resolved at build time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct FileContext {
    pub display_name: String,
    pub original_name: String,
    pub content: String,
    pub use_summary: bool,
    pub order_index: i64,
    pub excluded: bool,
}

impl FileContext {
    pub fn character_count(&self) -> usize {
        self.content.chars().count()
    }

    pub fn estimate_tokens(&self) -> usize {
        if self.excluded {
            return 0;
        }
        estimate_file_tokens(&self.display_name, &self.content)
    }
}

impl From<&FileLink> for FileContext {
    fn from(link: &FileLink) -> Self {
        Self {
            display_name: link.display_name.clone(),
            original_name: link.original_name.clone(),
            content: link.resolved_content().to_string(),
            use_summary: link.use_summary,
            order_index: link.order_index,
            excluded: link.excluded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(content: Option<&str>, summary: Option<&str>, use_summary: bool) -> FileLink {
        FileLink {
            link_id: 1,
            display_name: "a".into(),
            original_name: "a.txt".into(),
            content: content.map(Into::into),
            summary: summary.map(Into::into),
            use_summary,
            excluded: false,
            order_index: 0,
        }
    }

    #[test]
    fn resolves_summary_only_when_requested_and_present() {
        assert_eq!(link(Some("full"), Some("short"), true).resolved_content(), "short");
        assert_eq!(link(Some("full"), Some("short"), false).resolved_content(), "full");
        assert_eq!(link(Some("full"), Some(""), true).resolved_content(), "full");
        assert_eq!(link(Some("full"), None, true).resolved_content(), "full");
        assert_eq!(link(None, None, true).resolved_content(), "");
    }

    #[test]
    fn message_token_estimate_fixed_at_construction() {
        let m = ChatMessage::new(Role::User, "hello world");
        assert_eq!(m.estimated_tokens(), estimate_tokens("hello world"));
    }

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!("Assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert!("tool".parse::<Role>().is_err());
    }

    #[test]
    fn excluded_file_costs_nothing() {
        let mut f = FileContext::from(&link(Some("abc"), None, false));
        assert!(f.estimate_tokens() > 0);
        f.excluded = true;
        assert_eq!(f.estimate_tokens(), 0);
    }
}
