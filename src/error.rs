//! Error type shared by the context pipeline.

use thiserror::Error;

use crate::models::{LinkId, SessionId};

#[derive(Error, Debug)]
pub enum ContextError {
    /// Durable store failures (connection, IO, constraint violations)
    #[error("storage error: {0}")]
    Store(#[from] anyhow::Error),

    /// The context document could not be serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A serialized context document could not be decoded
    #[error("context document parse error: {0}")]
    Parse(String),

    /// Invalid settings or arguments
    #[error("configuration error: {0}")]
    Config(String),

    #[error("display name already used in session {session_id}: {name}")]
    DuplicateDisplayName { session_id: SessionId, name: String },

    #[error("file link {link_id} not found in session {session_id}")]
    FileLinkNotFound { session_id: SessionId, link_id: LinkId },
}

pub type Result<T> = std::result::Result<T, ContextError>;
