//! Context assembly and invalidation for chat sessions.
//!
//! Decides which messages and attached-file content go to the model for a
//! session, caches the assembled document, invalidates it on change events,
//! and estimates its size in tokens.

pub mod cache;
pub mod context_data;
pub mod document;
pub mod error;
pub mod events;
pub mod models;
pub mod parser;
pub mod server;
pub mod service;
pub mod settings;
pub mod storage;
pub mod tokens;
pub mod window;

pub use context_data::{ContextData, TokenBreakdown};
pub use error::{ContextError, Result};
pub use events::{ChangeEvent, ChangeKind, EventBus, Subscription};
pub use models::{ChatMessage, FileContext, FileLink, LinkId, NewFile, Role, SessionId};
pub use service::ContextService;
pub use settings::ContextSettings;
