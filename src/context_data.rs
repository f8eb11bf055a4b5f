use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{ChatMessage, FileContext, estimate_message_tokens};
use crate::tokens::estimate_tokens;

pub const FALLBACK_ASSISTANT_ROLE: &str = "You are a helpful assistant.";

/// Structured context handed to model-provider adapters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextData {
    pub message_history: Vec<ChatMessage>,
    pub files: Vec<FileContext>,
    pub assistant_role: String,
    pub context_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenBreakdown {
    pub messages: usize,
    pub files: usize,
    pub assistant_role: usize,
    pub total: usize,
}

impl Default for ContextData {
    fn default() -> Self {
        Self {
            message_history: Vec::new(),
            files: Vec::new(),
            assistant_role: FALLBACK_ASSISTANT_ROLE.to_string(),
            context_date: Utc::now(),
        }
    }
}

impl ContextData {
    /// No files, no history.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn file_count(&self) -> usize {
        self.files.iter().filter(|f| !f.excluded).count()
    }

    pub fn message_count(&self) -> usize {
        self.message_history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.file_count() == 0 && self.message_count() == 0
    }

    pub fn total_characters(&self) -> usize {
        self.files.iter().filter(|f| !f.excluded).map(FileContext::character_count).sum()
    }

    pub fn token_breakdown(&self) -> TokenBreakdown {
        let messages = estimate_message_tokens(&self.message_history);
        let files = self.files.iter().map(FileContext::estimate_tokens).sum();
        let assistant_role = estimate_tokens(&self.assistant_role);
        TokenBreakdown { messages, files, assistant_role, total: messages + files + assistant_role }
    }

    pub fn total_tokens(&self) -> usize {
        self.token_breakdown().total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    #[test]
    fn empty_context_counts_only_the_role() {
        let data = ContextData::empty();
        assert!(data.is_empty());
        assert_eq!(data.total_tokens(), estimate_tokens(FALLBACK_ASSISTANT_ROLE));
    }

    #[test]
    fn excluded_files_are_not_counted() {
        let mut data = ContextData {
            message_history: vec![ChatMessage::new(Role::User, "hi")],
            assistant_role: "role".into(),
            ..ContextData::empty()
        };
        data.files.push(FileContext { display_name: "a".into(), content: "abcd".into(), ..Default::default() });
        data.files.push(FileContext { display_name: "b".into(), content: "efgh".into(), excluded: true, ..Default::default() });

        assert_eq!(data.file_count(), 1);
        assert_eq!(data.total_characters(), 4);
        let b = data.token_breakdown();
        assert_eq!(b.files, data.files[0].estimate_tokens());
        assert_eq!(b.total, b.messages + b.files + b.assistant_role);
    }
}
