use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{FileLinkStore, MessageStore};
use crate::models::{ChatMessage, FileLink, LinkId, NewFile, SessionId};

/// Process-local store for ephemeral runs. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    messages: RwLock<HashMap<SessionId, Vec<ChatMessage>>>,
    links: RwLock<HashMap<SessionId, Vec<FileLink>>>,
    next_link_id: RwLock<LinkId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message ever appended for the session.
    pub async fn all_messages(&self, session_id: SessionId) -> Vec<ChatMessage> {
        self.messages.read().await.get(&session_id).cloned().unwrap_or_default()
    }

    async fn update_link<F>(&self, session_id: SessionId, link_id: LinkId, f: F) -> bool
    where
        F: FnOnce(&mut FileLink),
    {
        let mut links = self.links.write().await;
        match links.get_mut(&session_id).and_then(|v| v.iter_mut().find(|l| l.link_id == link_id)) {
            Some(link) => {
                f(link);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append_message(&self, session_id: SessionId, message: &ChatMessage) -> anyhow::Result<()> {
        self.messages.write().await.entry(session_id).or_default().push(message.clone());
        Ok(())
    }

    async fn load_recent_messages(&self, session_id: SessionId, limit: usize) -> anyhow::Result<Vec<ChatMessage>> {
        let messages = self.messages.read().await;
        let all = messages.get(&session_id).map(Vec::as_slice).unwrap_or_default();
        // stable sort keeps append order for equal timestamps
        let mut sorted = all.to_vec();
        sorted.sort_by_key(ChatMessage::timestamp);
        let skip = sorted.len().saturating_sub(limit);
        Ok(sorted.into_iter().skip(skip).collect())
    }
}

#[async_trait]
impl FileLinkStore for MemoryStore {
    async fn load_file_links(&self, session_id: SessionId) -> anyhow::Result<Vec<FileLink>> {
        let mut links = self.links.read().await.get(&session_id).cloned().unwrap_or_default();
        links.sort_by_key(|l| (l.order_index, l.link_id));
        Ok(links)
    }

    async fn add_file(&self, session_id: SessionId, file: NewFile) -> anyhow::Result<LinkId> {
        let link_id = {
            let mut next = self.next_link_id.write().await;
            *next += 1;
            *next
        };
        let mut links = self.links.write().await;
        let session_links = links.entry(session_id).or_default();
        let order_index = session_links.iter().map(|l| l.order_index).max().map_or(0, |m| m + 1);
        session_links.push(FileLink {
            link_id,
            display_name: file.display_name,
            original_name: file.original_name,
            content: file.content,
            summary: file.summary,
            use_summary: file.use_summary,
            excluded: false,
            order_index,
        });
        Ok(link_id)
    }

    async fn set_excluded(&self, session_id: SessionId, link_id: LinkId, excluded: bool) -> anyhow::Result<bool> {
        Ok(self.update_link(session_id, link_id, |l| l.excluded = excluded).await)
    }

    async fn set_use_summary(&self, session_id: SessionId, link_id: LinkId, use_summary: bool) -> anyhow::Result<bool> {
        Ok(self.update_link(session_id, link_id, |l| l.use_summary = use_summary).await)
    }

    async fn rename(&self, session_id: SessionId, link_id: LinkId, display_name: &str) -> anyhow::Result<bool> {
        Ok(self.update_link(session_id, link_id, |l| l.display_name = display_name.to_string()).await)
    }

    async fn remove_link(&self, session_id: SessionId, link_id: LinkId) -> anyhow::Result<bool> {
        let mut links = self.links.write().await;
        let Some(session_links) = links.get_mut(&session_id) else { return Ok(false) };
        let before = session_links.len();
        session_links.retain(|l| l.link_id != link_id);
        Ok(session_links.len() < before)
    }
}
