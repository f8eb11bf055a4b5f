//! Per-session bounded message windows fronting the message store.
//!
//! Each window retains up to `max_memory_messages` of the most recent
//! messages. Only the last `context_messages` of those are exposed to the
//! model, so shrinking the AI-facing slice never needs a store round trip.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{ChatMessage, SessionId};
use crate::storage::MessageStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowStats {
    pub sessions: usize,
    pub total_messages: usize,
}

pub struct ConversationWindows {
    store: Arc<dyn MessageStore>,
    max_memory_messages: usize,
    windows: RwLock<HashMap<SessionId, VecDeque<ChatMessage>>>,
}

impl ConversationWindows {
    pub fn new(store: Arc<dyn MessageStore>, max_memory_messages: usize) -> Self {
        Self { store, max_memory_messages, windows: RwLock::new(HashMap::new()) }
    }

    /// Persists `message`, then appends it to the session window.
    ///
    /// A failed write is returned to the caller, but the in-memory append
    /// still happens. The durable store wins on the next reload.
    ///
    /// A failed seed read never blocks the write. If the write landed, the
    /// window stays unseeded and the next read loads the message with the
    /// rest of the history. If it did not, the message starts a fresh window.
    pub async fn append(&self, session_id: SessionId, message: ChatMessage) -> Result<()> {
        // Seed first so the window holds prior history rather than only this message.
        let seeded = self.ensure_loaded(session_id).await.is_ok();

        let persisted = self.store.append_message(session_id, &message).await;
        if let Err(e) = &persisted {
            metrics::counter!("context_store_failures_total").increment(1);
            warn!(session_id, error = %e, "message not persisted; keeping in-memory append");
        }

        let mut windows = self.windows.write().await;
        let window = match windows.entry(session_id) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(_) if persisted.is_ok() => {
                debug!(session_id, seeded, "no window to append to; next read seeds from store");
                return Ok(());
            }
            Entry::Vacant(slot) => slot.insert(VecDeque::new()),
        };
        window.push_back(message);
        let mut trimmed = 0;
        while window.len() > self.max_memory_messages {
            window.pop_front();
            trimmed += 1;
        }
        if trimmed > 0 {
            metrics::counter!("context_window_trims_total").increment(1);
            debug!(session_id, trimmed, retained = window.len(), "trimmed conversation window");
        }

        persisted.map_err(Into::into)
    }

    /// The retained window, loading it from the store on first use.
    pub async fn window_for(&self, session_id: SessionId) -> Result<Vec<ChatMessage>> {
        self.ensure_loaded(session_id).await?;
        let windows = self.windows.read().await;
        Ok(windows.get(&session_id).map(|w| w.iter().cloned().collect()).unwrap_or_default())
    }

    /// The last `context_messages` of the retained window, oldest first.
    pub async fn context_slice(&self, session_id: SessionId, context_messages: usize) -> Result<Vec<ChatMessage>> {
        let window = self.window_for(session_id).await?;
        let skip = window.len().saturating_sub(context_messages);
        Ok(window.into_iter().skip(skip).collect())
    }

    /// Drops the in-memory window only; durable history is untouched.
    pub async fn clear(&self, session_id: SessionId) -> bool {
        let removed = self.windows.write().await.remove(&session_id).is_some();
        debug!(session_id, removed, "cleared conversation window");
        removed
    }

    pub async fn stats(&self) -> WindowStats {
        let windows = self.windows.read().await;
        WindowStats {
            sessions: windows.len(),
            total_messages: windows.values().map(VecDeque::len).sum(),
        }
    }

    // The store read happens without holding the lock, and the result is only
    // installed if no window appeared meanwhile. A cancelled or failed load
    // leaves the map exactly as it was.
    async fn ensure_loaded(&self, session_id: SessionId) -> Result<()> {
        if self.windows.read().await.contains_key(&session_id) {
            return Ok(());
        }
        let loaded = self.store.load_recent_messages(session_id, self.max_memory_messages).await
            .inspect_err(|e| {
                metrics::counter!("context_store_failures_total").increment(1);
                warn!(session_id, error = %e, "failed to load conversation window");
            })?;
        debug!(session_id, count = loaded.len(), "seeded conversation window from store");
        let mut windows = self.windows.write().await;
        windows.entry(session_id).or_insert_with(|| {
            let mut window: VecDeque<ChatMessage> = loaded.into();
            while window.len() > self.max_memory_messages {
                window.pop_front();
            }
            window
        });
        Ok(())
    }
}
