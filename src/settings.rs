use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ContextError, Result};

pub const DEFAULT_CONTEXT_MESSAGES: usize = 10;
pub const MAX_MEMORY_MESSAGES: usize = 15;
pub const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

pub const DEFAULT_ASSISTANT_ROLE: &str = "You are a clear and precise assistant. If a more specific role would help, \
ask for it in the chat and look for the answer in the message history below.";

pub const ENV_CONTEXT_MESSAGES: &str = "CHAT_CONTEXT_MESSAGES";
pub const ENV_ASSISTANT_ROLE: &str = "CHAT_CONTEXT_ASSISTANT_ROLE";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextSettings {
    /// Number of retained messages exposed to the model.
    pub context_messages: usize,
    /// Memory retention bound per session window.
    pub max_memory_messages: usize,
    #[serde(with = "duration_secs")]
    pub cache_ttl: Duration,
    /// Preamble written into every context document.
    pub assistant_role: String,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            context_messages: DEFAULT_CONTEXT_MESSAGES,
            max_memory_messages: MAX_MEMORY_MESSAGES,
            cache_ttl: CACHE_TTL,
            assistant_role: DEFAULT_ASSISTANT_ROLE.to_string(),
        }
    }
}

impl ContextSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_memory_messages == 0 {
            return Err(ContextError::Config("max_memory_messages must be at least 1".into()));
        }
        if self.context_messages == 0 || self.context_messages > self.max_memory_messages {
            return Err(ContextError::Config(format!(
                "context_messages must be between 1 and {}, got {}",
                self.max_memory_messages, self.context_messages
            )));
        }
        if self.assistant_role.trim().is_empty() {
            return Err(ContextError::Config("assistant_role must not be empty".into()));
        }
        Ok(())
    }

    /// Applies a runtime patch. Returns whether anything that shapes a built
    /// document changed.
    pub fn apply_patch(&mut self, patch: ContextSettingsPatch) -> Result<bool> {
        let mut next = self.clone();
        if let Some(n) = patch.context_messages {
            next.context_messages = n;
        }
        if let Some(role) = patch.assistant_role {
            next.assistant_role = role;
        }
        next.validate()?;
        let changed = next != *self;
        *self = next;
        Ok(changed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ContextSettingsPatch {
    pub context_messages: Option<usize>,
    pub assistant_role: Option<String>,
}

/// One configuration layer; unset fields fall through to the layer below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SettingsOverrides {
    pub context_messages: Option<usize>,
    pub assistant_role: Option<String>,
}

impl SettingsOverrides {
    pub fn from_env() -> Result<Self> {
        let context_messages = match std::env::var(ENV_CONTEXT_MESSAGES) {
            Ok(raw) => Some(raw.trim().parse::<usize>().map_err(|e| {
                ContextError::Config(format!("{ENV_CONTEXT_MESSAGES}={raw:?}: {e}"))
            })?),
            Err(_) => None,
        };
        let assistant_role = std::env::var(ENV_ASSISTANT_ROLE).ok();
        Ok(Self { context_messages, assistant_role })
    }
}

/// Precedence: cli over env over defaults.
pub fn resolve_effective_settings(
    defaults: &ContextSettings,
    env: &SettingsOverrides,
    cli: &SettingsOverrides,
) -> Result<ContextSettings> {
    let context_messages = cli
        .context_messages
        .or(env.context_messages)
        .unwrap_or(defaults.context_messages);
    let assistant_role = cli
        .assistant_role
        .clone()
        .or_else(|| env.assistant_role.clone())
        .unwrap_or_else(|| defaults.assistant_role.clone());

    let settings = ContextSettings {
        context_messages,
        max_memory_messages: defaults.max_memory_messages,
        cache_ttl: defaults.cache_ttl,
        assistant_role,
    };
    settings.validate()?;
    Ok(settings)
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
