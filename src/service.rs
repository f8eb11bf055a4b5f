//! Facade over the pipeline: the only surface provider adapters and the
//! presentation layer need.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::{CacheStats, ContextCache};
use crate::context_data::ContextData;
use crate::document::{ContextBuilder, SharedSettings};
use crate::error::{ContextError, Result};
use crate::events::{ChangeEvent, ChangeKind, EventBus, Subscription};
use crate::models::{ChatMessage, FileLink, LinkId, NewFile, Role, SessionId};
use crate::parser;
use crate::settings::{ContextSettings, ContextSettingsPatch};
use crate::storage::{FileLinkStore, MessageStore};
use crate::window::{ConversationWindows, WindowStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub windows: WindowStats,
    pub cache: CacheStats,
    pub subscribers: usize,
}

/// Changes to one file link; unset fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileLinkUpdate {
    pub display_name: Option<String>,
    pub excluded: Option<bool>,
    pub use_summary: Option<bool>,
}

pub struct ContextService {
    settings: SharedSettings,
    files: Arc<dyn FileLinkStore>,
    windows: Arc<ConversationWindows>,
    cache: Arc<ContextCache>,
    bus: EventBus,
    _cache_subscription: Subscription,
}

impl ContextService {
    /// Wires a service over one store implementing both adapters.
    pub fn new<S>(store: Arc<S>, settings: ContextSettings) -> Result<Self>
    where
        S: MessageStore + FileLinkStore + 'static,
    {
        Self::with_stores(store.clone(), store, settings)
    }

    pub fn with_stores(
        messages: Arc<dyn MessageStore>,
        files: Arc<dyn FileLinkStore>,
        settings: ContextSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let ttl = settings.cache_ttl;
        let windows = Arc::new(ConversationWindows::new(messages, settings.max_memory_messages));
        let settings: SharedSettings = Arc::new(RwLock::new(settings));
        let builder = Arc::new(ContextBuilder::new(windows.clone(), files.clone(), settings.clone()));
        let cache = Arc::new(ContextCache::new(builder, ttl));
        let bus = EventBus::new();
        let cache_subscription = cache.attach(&bus);
        Ok(Self { settings, files, windows, cache, bus, _cache_subscription: cache_subscription })
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &ContextCache {
        &self.cache
    }

    #[cfg(test)]
    pub(crate) fn windows(&self) -> &ConversationWindows {
        &self.windows
    }

    /// Registers a change listener for as long as the guard is held.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(handler)
    }

    /// The serialized document, served from cache when valid.
    pub async fn get_context_document(&self, session_id: SessionId) -> Result<Arc<str>> {
        self.cache.get(session_id).await
    }

    /// Fails when no document could be built for the session.
    pub async fn try_get_context_data(&self, session_id: SessionId) -> Result<ContextData> {
        let document = self.cache.get(session_id).await?;
        let data = parser::parse(&document);
        info!(
            session_id,
            files = data.file_count(),
            messages = data.message_count(),
            tokens = data.total_tokens(),
            "context assembled"
        );
        Ok(data)
    }

    /// Like [`try_get_context_data`](Self::try_get_context_data), but a failed
    /// build degrades to an empty context so a prompt can still be sent.
    pub async fn get_context_data(&self, session_id: SessionId) -> ContextData {
        match self.try_get_context_data(session_id).await {
            Ok(data) => data,
            Err(e) => {
                warn!(session_id, error = %e, "no file or history context available");
                ContextData::empty()
            }
        }
    }

    pub async fn get_context_token_count(&self, session_id: SessionId) -> usize {
        self.get_context_data(session_id).await.total_tokens()
    }

    /// Persists and windows a message. A persistence failure is returned,
    /// but the message may already sit in the in-memory window, so the
    /// change is published either way.
    pub async fn add_message(&self, session_id: SessionId, role: Role, content: impl Into<String>) -> Result<ChatMessage> {
        let message = ChatMessage::new(role, content);
        let appended = self.windows.append(session_id, message.clone()).await;
        self.publish(ChangeEvent::new(session_id, ChangeKind::MessageAdded).with_detail(role.as_str()));
        appended.map(|()| message)
    }

    /// All links for the session, excluded ones included.
    pub async fn list_files(&self, session_id: SessionId) -> Result<Vec<FileLink>> {
        Ok(self.files.load_file_links(session_id).await?)
    }

    pub async fn add_file(&self, session_id: SessionId, file: NewFile) -> Result<LinkId> {
        validate_display_name(&file.display_name)?;
        self.ensure_unique_name(session_id, None, &file.display_name).await?;
        let name = file.display_name.clone();
        let link_id = self.files.add_file(session_id, file).await?;
        self.publish(ChangeEvent::new(session_id, ChangeKind::FileAdded).with_file(link_id).with_detail(name));
        Ok(link_id)
    }

    pub async fn set_file_excluded(&self, session_id: SessionId, link_id: LinkId, excluded: bool) -> Result<()> {
        let found = self.files.set_excluded(session_id, link_id, excluded).await?;
        self.require(found, session_id, link_id)?;
        let kind = if excluded { ChangeKind::FileExcluded } else { ChangeKind::FileIncluded };
        self.publish(ChangeEvent::new(session_id, kind).with_file(link_id));
        Ok(())
    }

    pub async fn set_file_use_summary(&self, session_id: SessionId, link_id: LinkId, use_summary: bool) -> Result<()> {
        let found = self.files.set_use_summary(session_id, link_id, use_summary).await?;
        self.require(found, session_id, link_id)?;
        self.publish(
            ChangeEvent::new(session_id, ChangeKind::SummaryToggled)
                .with_file(link_id)
                .with_detail(format!("use_summary = {use_summary}")),
        );
        Ok(())
    }

    pub async fn rename_file(&self, session_id: SessionId, link_id: LinkId, display_name: &str) -> Result<()> {
        let display_name = display_name.trim();
        validate_display_name(display_name)?;
        let links = self.files.load_file_links(session_id).await?;
        let current = links
            .iter()
            .find(|l| l.link_id == link_id)
            .ok_or(ContextError::FileLinkNotFound { session_id, link_id })?;
        if current.display_name == display_name {
            return Ok(());
        }
        let old_name = current.display_name.clone();
        self.ensure_unique_name(session_id, Some(link_id), display_name).await?;

        let found = self.files.rename(session_id, link_id, display_name).await?;
        self.require(found, session_id, link_id)?;
        self.publish(
            ChangeEvent::new(session_id, ChangeKind::FileRenamed)
                .with_file(link_id)
                .with_detail(format!("{old_name} -> {display_name}")),
        );
        Ok(())
    }

    /// Applies several link changes in one call. The whole update is checked
    /// (link exists, new name valid and unique) before anything is written.
    /// The writes themselves are separate, so a store failure partway leaves
    /// the earlier ones in place.
    pub async fn update_file(&self, session_id: SessionId, link_id: LinkId, update: FileLinkUpdate) -> Result<()> {
        let links = self.files.load_file_links(session_id).await?;
        if !links.iter().any(|l| l.link_id == link_id) {
            return Err(ContextError::FileLinkNotFound { session_id, link_id });
        }
        if let Some(name) = update.display_name.as_deref().map(str::trim) {
            validate_display_name(name)?;
            if links.iter().any(|l| l.link_id != link_id && l.display_name == name) {
                return Err(ContextError::DuplicateDisplayName { session_id, name: name.to_string() });
            }
        }

        if let Some(name) = update.display_name.as_deref() {
            self.rename_file(session_id, link_id, name).await?;
        }
        if let Some(excluded) = update.excluded {
            self.set_file_excluded(session_id, link_id, excluded).await?;
        }
        if let Some(use_summary) = update.use_summary {
            self.set_file_use_summary(session_id, link_id, use_summary).await?;
        }
        Ok(())
    }

    pub async fn remove_file(&self, session_id: SessionId, link_id: LinkId) -> Result<()> {
        let found = self.files.remove_link(session_id, link_id).await?;
        self.require(found, session_id, link_id)?;
        self.publish(ChangeEvent::new(session_id, ChangeKind::FileDeleted).with_file(link_id));
        Ok(())
    }

    /// Drops the in-memory window for a reset session. Durable history stays.
    pub async fn clear_session(&self, session_id: SessionId) {
        self.windows.clear(session_id).await;
        self.publish(ChangeEvent::new(session_id, ChangeKind::SessionCleared));
    }

    pub fn refresh(&self, session_id: SessionId, detail: Option<&str>) {
        let mut event = ChangeEvent::new(session_id, ChangeKind::ManualRefresh);
        if let Some(detail) = detail {
            event = event.with_detail(detail);
        }
        self.publish(event);
    }

    pub fn settings(&self) -> ContextSettings {
        self.settings.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Applies a settings patch; every cached document is dropped when the
    /// window size or preamble actually changed.
    pub fn update_settings(&self, patch: ContextSettingsPatch) -> Result<ContextSettings> {
        let (changed, updated) = {
            let mut settings = self.settings.write().unwrap_or_else(|p| p.into_inner());
            let changed = settings.apply_patch(patch)?;
            (changed, settings.clone())
        };
        if changed {
            info!(context_messages = updated.context_messages, "context settings changed");
            self.cache.clear_all();
        }
        Ok(updated)
    }

    pub async fn stats(&self) -> ServiceStats {
        ServiceStats {
            windows: self.windows.stats().await,
            cache: self.cache.stats(),
            subscribers: self.bus.subscriber_count(),
        }
    }

    fn publish(&self, event: ChangeEvent) {
        self.bus.publish(&event);
    }

    fn require(&self, found: bool, session_id: SessionId, link_id: LinkId) -> Result<()> {
        if found { Ok(()) } else { Err(ContextError::FileLinkNotFound { session_id, link_id }) }
    }

    async fn ensure_unique_name(&self, session_id: SessionId, except: Option<LinkId>, name: &str) -> Result<()> {
        let links = self.files.load_file_links(session_id).await?;
        if links.iter().any(|l| Some(l.link_id) != except && l.display_name == name) {
            return Err(ContextError::DuplicateDisplayName { session_id, name: name.to_string() });
        }
        Ok(())
    }
}

fn validate_display_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ContextError::Config("display name must not be empty".into()));
    }
    Ok(())
}
