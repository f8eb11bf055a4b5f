//! Per-session cache of serialized context documents.
//!
//! Per session: Empty -> Valid -> (expired | invalidated) -> Empty. An entry
//! is served only while it is younger than the TTL and no invalidation has
//! arrived since its build started. Every invalidation stamps the session
//! with a fresh generation, so a build that raced with an invalidation is
//! returned to its caller but never stored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::document::ContextBuilder;
use crate::error::Result;
use crate::events::{ChangeEvent, ChangeKind, EventBus, Subscription};
use crate::models::{LinkId, SessionId};

struct CacheEntry {
    document: Arc<str>,
    stored_at: Instant,
}

struct Slot {
    entry: Option<CacheEntry>,
    generation: u64,
}

#[derive(Default)]
struct Slots {
    sessions: HashMap<SessionId, Slot>,
    // Shared by all slots and never reset, so a slot removed by `clear_all`
    // and created again cannot reuse a generation a pending build holds.
    generation: u64,
}

impl Slots {
    fn slot(&mut self, session_id: SessionId) -> &mut Slot {
        let generation = self.generation;
        self.sessions.entry(session_id).or_insert(Slot { entry: None, generation })
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_cached_sessions: usize,
    pub valid: usize,
    pub expired: usize,
    pub ttl_secs: u64,
}

pub struct ContextCache {
    builder: Arc<ContextBuilder>,
    ttl: Duration,
    slots: Mutex<Slots>,
}

impl ContextCache {
    pub fn new(builder: Arc<ContextBuilder>, ttl: Duration) -> Self {
        Self { builder, ttl, slots: Mutex::new(Slots::default()) }
    }

    /// Cached document for the session, rebuilding on miss or expiry.
    pub async fn get(&self, session_id: SessionId) -> Result<Arc<str>> {
        let generation = {
            let mut slots = self.lock();
            let slot = slots.slot(session_id);
            if let Some(entry) = slot.entry.as_ref().filter(|e| self.is_fresh(e)) {
                metrics::counter!("context_cache_hits_total").increment(1);
                debug!(session_id, "context cache hit");
                return Ok(entry.document.clone());
            }
            metrics::counter!("context_cache_misses_total").increment(1);
            slot.generation
        };
        self.rebuild(session_id, generation).await
    }

    /// Discards the session's entry and rebuilds it right away. A failed
    /// rebuild is logged and leaves the session empty for the next `get`.
    pub async fn invalidate(
        &self,
        session_id: SessionId,
        change_kind: ChangeKind,
        file_id: Option<LinkId>,
        detail: Option<&str>,
    ) {
        info!(session_id, %change_kind, file_id, detail, "invalidating context cache");
        let generation = self.discard(session_id);
        if let Err(e) = self.rebuild(session_id, generation).await {
            metrics::counter!("context_rebuild_failures_total").increment(1);
            warn!(session_id, error = %e, "proactive context rebuild failed; deferring to next read");
        }
    }

    /// Synchronous half of invalidation: drops the entry and returns the
    /// session's new generation.
    pub fn discard(&self, session_id: SessionId) -> u64 {
        metrics::counter!("context_cache_invalidations_total").increment(1);
        let mut slots = self.lock();
        let generation = slots.next_generation();
        let slot = slots.slot(session_id);
        slot.entry = None;
        slot.generation = generation;
        generation
    }

    /// Subscribes this cache to `bus`. Each event discards its session's entry
    /// and, when a tokio runtime is available, schedules a background rebuild.
    /// The handler holds only a weak reference to the cache.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> Subscription {
        let weak: Weak<ContextCache> = Arc::downgrade(self);
        bus.subscribe(move |event: &ChangeEvent| {
            let Some(cache) = weak.upgrade() else { return };
            debug!(session_id = event.session_id, change_kind = %event.change_kind, "context change received");
            let generation = cache.discard(event.session_id);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let session_id = event.session_id;
                handle.spawn(async move {
                    if let Err(e) = cache.rebuild(session_id, generation).await {
                        metrics::counter!("context_rebuild_failures_total").increment(1);
                        warn!(session_id, error = %e, "background context rebuild failed");
                    }
                });
            }
        })
    }

    pub fn has_cached_context(&self, session_id: SessionId) -> bool {
        self.lock()
            .sessions
            .get(&session_id)
            .and_then(|s| s.entry.as_ref())
            .is_some_and(|e| self.is_fresh(e))
    }

    /// Forgets every session. Builds still in flight are not stored.
    pub fn clear_all(&self) -> usize {
        let mut slots = self.lock();
        let cleared = slots.sessions.values().filter(|s| s.entry.is_some()).count();
        slots.sessions.clear();
        slots.next_generation();
        info!(cleared, "cleared context cache");
        cleared
    }

    pub fn stats(&self) -> CacheStats {
        let slots = self.lock();
        let (valid, expired) = slots
            .sessions
            .values()
            .filter_map(|s| s.entry.as_ref())
            .fold((0, 0), |(v, x), e| if self.is_fresh(e) { (v + 1, x) } else { (v, x + 1) });
        CacheStats { total_cached_sessions: valid + expired, valid, expired, ttl_secs: self.ttl.as_secs() }
    }

    async fn rebuild(&self, session_id: SessionId, generation: u64) -> Result<Arc<str>> {
        metrics::counter!("context_cache_rebuilds_total").increment(1);
        let document: Arc<str> = self.builder.build_json(session_id).await?.into();
        let mut slots = self.lock();
        match slots.sessions.get_mut(&session_id).filter(|s| s.generation == generation) {
            Some(slot) => {
                slot.entry = Some(CacheEntry { document: document.clone(), stored_at: Instant::now() });
                debug!(session_id, chars = document.len(), "context cache refreshed");
            }
            None => debug!(session_id, "invalidated during rebuild; not storing"),
        }
        Ok(document)
    }

    fn is_fresh(&self, entry: &CacheEntry) -> bool {
        entry.stored_at.elapsed() < self.ttl
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::SharedSettings;
    use crate::models::{ChatMessage, NewFile, Role};
    use crate::settings::{CACHE_TTL, ContextSettings};
    use crate::storage::{FileLinkStore, MemoryStore, MessageStore};
    use crate::window::ConversationWindows;
    use std::sync::RwLock;

    struct Fixture {
        store: Arc<MemoryStore>,
        cache: Arc<ContextCache>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let settings: SharedSettings = Arc::new(RwLock::new(ContextSettings::default()));
        let windows = Arc::new(ConversationWindows::new(store.clone(), 15));
        let builder = Arc::new(ContextBuilder::new(windows, store.clone(), settings));
        Fixture { store, cache: Arc::new(ContextCache::new(builder, CACHE_TTL)) }
    }

    fn file(name: &str) -> NewFile {
        NewFile { display_name: name.into(), original_name: name.into(), content: Some("body".into()), ..Default::default() }
    }

    #[tokio::test]
    async fn valid_entry_is_served_without_rebuild() {
        let f = fixture();
        let first = f.cache.get(1).await.unwrap();
        // Mutating the store without invalidating must not show through.
        f.store.add_file(1, file("late")).await.unwrap();
        let second = f.cache.get(1).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!second.contains("late"));
    }

    #[tokio::test]
    async fn invalidate_makes_next_get_reflect_mutation() {
        let f = fixture();
        f.cache.get(1).await.unwrap();
        f.store.add_file(1, file("fresh")).await.unwrap();
        f.cache.invalidate(1, ChangeKind::FileAdded, None, None).await;
        assert!(f.cache.has_cached_context(1));
        assert!(f.cache.get(1).await.unwrap().contains("fresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_rebuilt() {
        let f = fixture();
        let first = f.cache.get(1).await.unwrap();
        f.store.append_message(1, &ChatMessage::new(Role::User, "hello")).await.unwrap();

        tokio::time::advance(CACHE_TTL - Duration::from_secs(1)).await;
        assert!(Arc::ptr_eq(&first, &f.cache.get(1).await.unwrap()));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!f.cache.has_cached_context(1));
        assert_eq!(f.cache.stats().expired, 1);
        let rebuilt = f.cache.get(1).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &rebuilt));
    }

    #[tokio::test]
    async fn invalidation_is_per_session() {
        let f = fixture();
        f.cache.get(4).await.unwrap();
        let five = f.cache.get(5).await.unwrap();
        f.cache.discard(4);
        assert!(!f.cache.has_cached_context(4));
        assert!(f.cache.has_cached_context(5));
        assert!(Arc::ptr_eq(&five, &f.cache.get(5).await.unwrap()));
    }

    #[tokio::test]
    async fn bus_event_discards_only_its_session() {
        let f = fixture();
        let bus = EventBus::new();
        let _sub = f.cache.attach(&bus);
        let link = f.store.add_file(4, file("old")).await.unwrap();
        f.cache.get(4).await.unwrap();
        let five = f.cache.get(5).await.unwrap();

        f.store.rename(4, link, "new").await.unwrap();
        bus.publish(&ChangeEvent::new(4, ChangeKind::FileRenamed).with_file(link));

        assert!(f.cache.get(4).await.unwrap().contains("\"new\""));
        assert!(Arc::ptr_eq(&five, &f.cache.get(5).await.unwrap()));
    }

    #[tokio::test]
    async fn build_racing_an_invalidation_is_not_stored() {
        let f = fixture();
        let generation = f.cache.discard(1);
        f.cache.discard(1);
        let doc = f.cache.rebuild(1, generation).await.unwrap();
        assert!(!doc.is_empty());
        assert!(!f.cache.has_cached_context(1));
    }

    #[tokio::test]
    async fn dropped_cache_ignores_events() {
        let f = fixture();
        let bus = EventBus::new();
        let sub = f.cache.attach(&bus);
        drop(f);
        bus.publish(&ChangeEvent::new(1, ChangeKind::ManualRefresh));
        drop(sub);
    }

    #[tokio::test]
    async fn stats_and_clear_all() {
        let f = fixture();
        f.cache.get(1).await.unwrap();
        f.cache.get(2).await.unwrap();
        assert_eq!(f.cache.stats(), CacheStats { total_cached_sessions: 2, valid: 2, expired: 0, ttl_secs: 300 });
        assert_eq!(f.cache.clear_all(), 2);
        assert_eq!(f.cache.stats().total_cached_sessions, 0);
    }

    #[tokio::test]
    async fn clear_all_forgets_sessions_and_fences_pending_builds() {
        let f = fixture();
        f.cache.get(1).await.unwrap();
        f.cache.discard(2);
        let pending = f.cache.lock().sessions[&1].generation;
        assert_eq!(f.cache.lock().sessions.len(), 2);

        f.cache.clear_all();
        assert!(f.cache.lock().sessions.is_empty());

        f.cache.rebuild(1, pending).await.unwrap();
        assert!(!f.cache.has_cached_context(1));
        assert!(f.cache.lock().sessions.is_empty());

        f.cache.get(1).await.unwrap();
        assert!(f.cache.has_cached_context(1));
        assert_ne!(f.cache.lock().sessions[&1].generation, pending);
    }
}
