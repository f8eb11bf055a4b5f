//! Durable store adapters consumed by the context pipeline.
//!
//! The pipeline never creates sessions; it only appends messages and reads
//! and mutates file links for ids handed to it.

use async_trait::async_trait;

use crate::models::{ChatMessage, FileLink, LinkId, NewFile, SessionId};

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteContextStore;

/// Append-only message log, ordered by time per session.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append_message(&self, session_id: SessionId, message: &ChatMessage) -> anyhow::Result<()>;

    /// Up to `limit` most recent messages, returned in ascending time order.
    async fn load_recent_messages(&self, session_id: SessionId, limit: usize) -> anyhow::Result<Vec<ChatMessage>>;
}

/// (session, file) associations with their per-link flags.
///
/// Mutations return `false` when no link with that id exists in the session.
#[async_trait]
pub trait FileLinkStore: Send + Sync {
    /// All links for the session, excluded ones included, ordered by
    /// `order_index` then link id.
    async fn load_file_links(&self, session_id: SessionId) -> anyhow::Result<Vec<FileLink>>;

    /// Attaches a file at the end of the session's order.
    async fn add_file(&self, session_id: SessionId, file: NewFile) -> anyhow::Result<LinkId>;

    async fn set_excluded(&self, session_id: SessionId, link_id: LinkId, excluded: bool) -> anyhow::Result<bool>;

    async fn set_use_summary(&self, session_id: SessionId, link_id: LinkId, use_summary: bool) -> anyhow::Result<bool>;

    async fn rename(&self, session_id: SessionId, link_id: LinkId, display_name: &str) -> anyhow::Result<bool>;

    async fn remove_link(&self, session_id: SessionId, link_id: LinkId) -> anyhow::Result<bool>;
}
