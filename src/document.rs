//! The serialized context document and the builder that derives it.
//!
//! A document is never edited: it is rebuilt wholesale from the file link
//! store and the conversation window. Encoding always writes the snake_case
//! schema. Decoding goes section by section through [`serde_json::Value`]:
//! each field is looked up under its legacy camelCase name first, then its
//! snake_case name, and the first one present wins. A section or list of the
//! wrong shape decodes as empty without touching its siblings.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{ContextError, Result};
use crate::models::{ChatMessage, FileContext, SessionId};
use crate::settings::ContextSettings;
use crate::storage::FileLinkStore;
use crate::window::ConversationWindows;

/// Version written by [`ContextBuilder`]. Documents without a tag are version 1.
pub const SCHEMA_VERSION: u32 = 2;

const LEGACY_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextDocument {
    pub schema_version: u32,
    pub assistant_role: Option<AssistantRoleSection>,
    pub file_context: Option<FileSection>,
    pub message_history: Option<MessageSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct AssistantRoleSection {
    pub description: Option<String>,
    pub context_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct FileSection {
    pub total_files: usize,
    pub total_characters: usize,
    pub files: Vec<DocumentFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct DocumentFile {
    pub order_index: i64,
    pub display_name: String,
    pub original_name: String,
    pub character_count: usize,
    pub use_summary: bool,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct MessageSection {
    pub total_messages: usize,
    pub messages: Vec<DocumentMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct DocumentMessage {
    pub timestamp: String,
    pub role: String,
    pub content: String,
}

/// Lenient field access over one JSON object. `null` counts as absent.
struct Fields<'a>(&'a Map<String, Value>);

impl<'a> Fields<'a> {
    fn of(value: &'a Value) -> Option<Self> {
        value.as_object().map(Fields)
    }

    fn get(&self, keys: &[&str]) -> Option<&'a Value> {
        keys.iter().find_map(|k| self.0.get(*k).filter(|v| !v.is_null()))
    }

    fn string(&self, keys: &[&str]) -> Option<String> {
        self.get(keys).and_then(Value::as_str).map(str::to_string)
    }

    fn text(&self, keys: &[&str]) -> String {
        self.string(keys).unwrap_or_default()
    }

    fn int(&self, keys: &[&str]) -> i64 {
        self.get(keys).and_then(Value::as_i64).unwrap_or_default()
    }

    fn count(&self, keys: &[&str]) -> usize {
        self.get(keys).and_then(Value::as_u64).map(|n| n as usize).unwrap_or_default()
    }

    fn flag(&self, keys: &[&str]) -> bool {
        self.get(keys).and_then(Value::as_bool).unwrap_or_default()
    }

    fn list(&self, keys: &[&str]) -> &'a [Value] {
        match self.get(keys) {
            Some(Value::Array(items)) => items,
            Some(other) => {
                warn!(field = keys[keys.len() - 1], kind = json_kind(other), "expected a list; reading as empty");
                &[]
            }
            None => &[],
        }
    }

    fn section(&self, keys: &[&str]) -> Option<Fields<'a>> {
        self.get(keys).and_then(Fields::of)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl ContextDocument {
    /// Decodes a document, tolerating legacy key names and malformed
    /// sections. Fails only when the top level is not an object.
    pub fn from_value(value: &Value) -> Result<Self> {
        let root = Fields::of(value)
            .ok_or_else(|| ContextError::Parse(format!("expected a JSON object, got {}", json_kind(value))))?;

        let schema_version = root
            .get(&["schemaVersion", "schema_version"])
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(LEGACY_SCHEMA_VERSION);

        let assistant_role = root.section(&["assistantRole", "assistant_role"]).map(|s| AssistantRoleSection {
            description: s.string(&["description"]),
            context_date: s.string(&["contextDate", "context_date"]),
        });

        let file_context = root.section(&["fileContext", "file_context"]).map(|s| FileSection {
            total_files: s.count(&["totalFiles", "total_files"]),
            total_characters: s.count(&["totalCharacters", "total_characters"]),
            files: s.list(&["files"]).iter().filter_map(Fields::of).map(|f| DocumentFile {
                order_index: f.int(&["orderIndex", "order_index"]),
                display_name: f.text(&["displayName", "display_name"]),
                original_name: f.text(&["originalName", "original_name"]),
                character_count: f.count(&["characterCount", "character_count"]),
                use_summary: f.flag(&["useSummary", "use_summary"]),
                content: f.text(&["content"]),
            }).collect(),
        });

        let message_history = root.section(&["messageHistory", "message_history"]).map(|s| MessageSection {
            total_messages: s.count(&["totalMessages", "total_messages"]),
            messages: s.list(&["messages"]).iter().filter_map(Fields::of).map(|m| DocumentMessage {
                timestamp: m.text(&["timestamp"]),
                role: m.text(&["role"]),
                content: m.text(&["content"]),
            }).collect(),
        });

        Ok(Self { schema_version, assistant_role, file_context, message_history })
    }
}

impl<'de> Deserialize<'de> for ContextDocument {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).map_err(serde::de::Error::custom)
    }
}

pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, false)
}

impl ContextDocument {
    /// Assembles a document. Excluded files are dropped here; an empty file
    /// list is still written out as an empty section.
    pub fn compose(
        assistant_role: &str,
        built_at: DateTime<Utc>,
        files: &[FileContext],
        messages: &[ChatMessage],
    ) -> Self {
        let files: Vec<DocumentFile> = files
            .iter()
            .filter(|f| !f.excluded)
            .map(|f| DocumentFile {
                order_index: f.order_index,
                display_name: f.display_name.clone(),
                original_name: f.original_name.clone(),
                character_count: f.character_count(),
                use_summary: f.use_summary,
                content: f.content.clone(),
            })
            .collect();
        let messages: Vec<DocumentMessage> = messages
            .iter()
            .map(|m| DocumentMessage {
                timestamp: format_timestamp(m.timestamp()),
                role: m.role().as_str().to_string(),
                content: m.content().to_string(),
            })
            .collect();

        Self {
            schema_version: SCHEMA_VERSION,
            assistant_role: Some(AssistantRoleSection {
                description: Some(assistant_role.to_string()),
                context_date: Some(format_timestamp(built_at)),
            }),
            file_context: Some(FileSection {
                total_files: files.len(),
                total_characters: files.iter().map(|f| f.character_count).sum(),
                files,
            }),
            message_history: Some(MessageSection { total_messages: messages.len(), messages }),
        }
    }

    pub fn files(&self) -> &[DocumentFile] {
        self.file_context.as_ref().map(|s| s.files.as_slice()).unwrap_or_default()
    }

    pub fn messages(&self) -> &[DocumentMessage] {
        self.message_history.as_ref().map(|s| s.messages.as_slice()).unwrap_or_default()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub type SharedSettings = Arc<RwLock<ContextSettings>>;

/// Derives a session's context document from already-durable state.
pub struct ContextBuilder {
    windows: Arc<ConversationWindows>,
    files: Arc<dyn FileLinkStore>,
    settings: SharedSettings,
}

impl ContextBuilder {
    pub fn new(windows: Arc<ConversationWindows>, files: Arc<dyn FileLinkStore>, settings: SharedSettings) -> Self {
        Self { windows, files, settings }
    }

    pub async fn build(&self, session_id: SessionId) -> Result<ContextDocument> {
        let (context_messages, assistant_role) = {
            let s = self.settings.read().unwrap_or_else(|p| p.into_inner());
            (s.context_messages, s.assistant_role.clone())
        };

        // Store order is (order_index, link id); excluded links never reach the document.
        let links = self.files.load_file_links(session_id).await?;
        let files: Vec<FileContext> = links.iter().filter(|l| !l.excluded).map(FileContext::from).collect();

        let messages = self.windows.context_slice(session_id, context_messages).await?;

        debug!(session_id, files = files.len(), messages = messages.len(), "built context document");
        Ok(ContextDocument::compose(&assistant_role, Utc::now(), &files, &messages))
    }

    pub async fn build_json(&self, session_id: SessionId) -> Result<String> {
        self.build(session_id).await?.to_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewFile, Role};
    use crate::storage::{MemoryStore, MessageStore};

    fn builder(store: Arc<MemoryStore>, settings: ContextSettings) -> ContextBuilder {
        let windows = Arc::new(ConversationWindows::new(store.clone(), settings.max_memory_messages));
        ContextBuilder::new(windows, store, Arc::new(RwLock::new(settings)))
    }

    fn new_file(name: &str, content: &str) -> NewFile {
        NewFile {
            display_name: name.into(),
            original_name: name.into(),
            content: Some(content.into()),
            summary: Some(format!("summary of {name}")),
            use_summary: false,
        }
    }

    #[tokio::test]
    async fn empty_session_has_empty_sections_not_missing_ones() {
        let store = Arc::new(MemoryStore::new());
        let doc = builder(store, ContextSettings::default()).build(1).await.unwrap();
        assert!(doc.files().is_empty());
        assert!(doc.messages().is_empty());

        let v: serde_json::Value = serde_json::from_str(&doc.to_json().unwrap()).unwrap();
        assert_eq!(v["file_context"]["files"], serde_json::json!([]));
        assert_eq!(v["message_history"]["messages"], serde_json::json!([]));
        assert_eq!(v["schema_version"], SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn excluded_files_filtered_and_empty_content_kept() {
        let store = Arc::new(MemoryStore::new());
        let a = store.add_file(1, new_file("a", "alpha")).await.unwrap();
        store.add_file(1, new_file("empty", "")).await.unwrap();
        store.set_excluded(1, a, true).await.unwrap();

        let doc = builder(store, ContextSettings::default()).build(1).await.unwrap();
        assert_eq!(doc.files().len(), 1);
        assert_eq!(doc.files()[0].display_name, "empty");
        assert_eq!(doc.files()[0].character_count, 0);
        assert_eq!(doc.file_context.as_ref().unwrap().total_files, 1);
    }

    #[tokio::test]
    async fn summary_used_when_flagged() {
        let store = Arc::new(MemoryStore::new());
        let a = store.add_file(1, new_file("a", "alpha")).await.unwrap();
        store.set_use_summary(1, a, true).await.unwrap();
        let doc = builder(store, ContextSettings::default()).build(1).await.unwrap();
        assert_eq!(doc.files()[0].content, "summary of a");
        assert!(doc.files()[0].use_summary);
    }

    #[tokio::test]
    async fn message_slice_respects_context_messages() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..12 {
            store.append_message(1, &ChatMessage::new(Role::User, format!("m{i}"))).await.unwrap();
        }
        let settings = ContextSettings { context_messages: 4, ..ContextSettings::default() };
        let doc = builder(store, settings).build(1).await.unwrap();
        let contents: Vec<_> = doc.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["m8", "m9", "m10", "m11"]);
        assert!(doc.messages().iter().all(|m| m.role == "user"));
    }

    #[tokio::test]
    async fn building_twice_yields_same_files_and_messages() {
        let store = Arc::new(MemoryStore::new());
        store.add_file(1, new_file("a", "alpha")).await.unwrap();
        store.append_message(1, &ChatMessage::new(Role::User, "hi")).await.unwrap();
        let b = builder(store, ContextSettings::default());
        let first = b.build(1).await.unwrap();
        let second = b.build(1).await.unwrap();
        assert_eq!(first.file_context, second.file_context);
        assert_eq!(first.message_history, second.message_history);
    }

    #[tokio::test]
    async fn file_order_follows_order_index() {
        let store = Arc::new(MemoryStore::new());
        let a = store.add_file(1, new_file("a", "1")).await.unwrap();
        store.add_file(1, new_file("b", "2")).await.unwrap();
        store.set_excluded(1, a, true).await.unwrap();
        let b = builder(store.clone(), ContextSettings::default());
        assert_eq!(b.build(1).await.unwrap().files()[0].display_name, "b");

        store.set_excluded(1, a, false).await.unwrap();
        let names: Vec<_> = b.build(1).await.unwrap().files().iter().map(|f| f.display_name.clone()).collect();
        assert_eq!(names, ["a", "b"]);
    }
}
