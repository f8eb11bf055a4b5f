//! Typed change notifications.
//!
//! Publishing is a synchronous fan-out to the handlers registered at that
//! moment. There is no queue and no replay, so consumers must tolerate
//! missed, duplicated or reordered events.

use std::fmt;
use std::sync::{Arc, RwLock, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::models::{LinkId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    FileExcluded,
    FileIncluded,
    FileDeleted,
    FileRenamed,
    SummaryToggled,
    FileAdded,
    MessageAdded,
    SessionCleared,
    ManualRefresh,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::FileExcluded => "FileExcluded",
            ChangeKind::FileIncluded => "FileIncluded",
            ChangeKind::FileDeleted => "FileDeleted",
            ChangeKind::FileRenamed => "FileRenamed",
            ChangeKind::SummaryToggled => "SummaryToggled",
            ChangeKind::FileAdded => "FileAdded",
            ChangeKind::MessageAdded => "MessageAdded",
            ChangeKind::SessionCleared => "SessionCleared",
            ChangeKind::ManualRefresh => "ManualRefresh",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub session_id: SessionId,
    pub change_kind: ChangeKind,
    pub file_id: Option<LinkId>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(session_id: SessionId, change_kind: ChangeKind) -> Self {
        Self { session_id, change_kind, file_id: None, detail: None, timestamp: Utc::now() }
    }

    pub fn with_file(mut self, file_id: LinkId) -> Self {
        self.file_id = Some(file_id);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

pub type EventHandler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

#[derive(Default)]
struct Registry {
    handlers: RwLock<Vec<(SubscriptionId, EventHandler)>>,
}

impl Registry {
    fn remove(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() < before
    }
}

/// Cheap to clone; clones share one registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` until the returned guard is dropped.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(Uuid::new_v4());
        self.registry
            .handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push((id, Arc::new(handler)));
        Subscription { id, registry: Arc::downgrade(&self.registry) }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.remove(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.handlers.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Calls every current handler in registration order. Handlers run
    /// outside the registry lock, so they may subscribe or unsubscribe.
    pub fn publish(&self, event: &ChangeEvent) {
        let handlers: Vec<EventHandler> = self
            .registry
            .handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        debug!(
            session_id = event.session_id,
            change_kind = %event.change_kind,
            subscribers = handlers.len(),
            "publishing context change"
        );
        for handler in handlers {
            handler(event);
        }
    }
}

/// Unsubscribes on drop.
pub struct Subscription {
    id: SubscriptionId,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}
