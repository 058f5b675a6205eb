//! Core types for Chatrelay

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub struct $name(Arc<str>);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(Arc::from(s.into()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::new(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0.to_string()
            }
        }
    };
}

string_id!(
    /// Persona identifier - cheaply cloneable
    PersonaId
);
string_id!(
    /// Backend identifier - cheaply cloneable
    BackendId
);
string_id!(
    /// Session identifier - cheaply cloneable
    SessionId
);

/// Longest accepted session id. Ids double as file names on disk.
pub const MAX_SESSION_ID_LEN: usize = 128;

impl SessionId {
    /// Parse an externally supplied session id.
    ///
    /// Accepts 1-128 characters from `[A-Za-z0-9_-]` so the id is always a
    /// safe file name for session persistence.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() || raw.len() > MAX_SESSION_ID_LEN {
            return Err(Error::InvalidRequest(format!(
                "session id must be 1-{} characters",
                MAX_SESSION_ID_LEN
            )));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::InvalidRequest(
                "session id may only contain [A-Za-z0-9_-]".to_string(),
            ));
        }
        Ok(Self::new(raw))
    }
}

/// Message role
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A message in a conversation. Immutable once appended to a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// How strictly moderation policy is applied for a persona.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SafetyLevel {
    /// Monitored categories are allowed without a warning.
    Relaxed,
    #[default]
    Standard,
    /// Monitored categories are blocked.
    Strict,
}

/// What the moderation policy does with a flagged category.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModerationAction {
    Allow,
    Monitor,
    Block,
}

impl SafetyLevel {
    pub fn adjust(&self, action: ModerationAction) -> ModerationAction {
        match (self, action) {
            (SafetyLevel::Strict, ModerationAction::Monitor) => ModerationAction::Block,
            (SafetyLevel::Relaxed, ModerationAction::Monitor) => ModerationAction::Allow,
            (_, action) => action,
        }
    }
}

/// A named configuration bundling a system prompt, safety level, and an
/// allow-list of backends. Immutable after load.
#[derive(Clone, Debug, Serialize)]
pub struct Persona {
    pub id: PersonaId,
    pub display_name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub system_prompt: String,
    pub allowed_categories: BTreeSet<String>,
    /// Effective allow-list in declaration order.
    pub allowed_backend_ids: Vec<BackendId>,
    pub default_backend_id: BackendId,
    pub safety_level: SafetyLevel,
}

impl Persona {
    pub fn allows(&self, backend: &BackendId) -> bool {
        self.allowed_backend_ids.contains(backend)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Remote,
    Local,
}

/// Where a backend's generation capability comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum BackendSource {
    Remote {
        model: String,
        base_url: String,
        /// Environment variable holding the API key.
        api_key_env: Option<String>,
        /// Inline key, mostly for local development.
        api_key: Option<String>,
    },
    Local {
        artifact: PathBuf,
    },
}

impl BackendSource {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendSource::Remote { .. } => BackendKind::Remote,
            BackendSource::Local { .. } => BackendKind::Local,
        }
    }

    /// Resolve the remote credential, preferring the inline key.
    pub fn credential(&self) -> Option<String> {
        match self {
            BackendSource::Remote {
                api_key,
                api_key_env,
                ..
            } => api_key
                .clone()
                .filter(|k| !k.trim().is_empty())
                .or_else(|| {
                    api_key_env
                        .as_ref()
                        .and_then(|var| std::env::var(var).ok())
                        .filter(|k| !k.trim().is_empty())
                }),
            BackendSource::Local { .. } => None,
        }
    }
}

/// A generation backend as known to the capability registry.
#[derive(Clone, Debug)]
pub struct BackendDescriptor {
    pub id: BackendId,
    pub display_name: String,
    pub category: String,
    pub source: BackendSource,
    pub resource_cost_units: u32,
    pub context_limit: u32,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Resident slot this backend loads into (Local only).
    pub slot: usize,
    /// Last computed availability. See `BackendRegistry::refresh_availability`.
    pub available: bool,
}

impl BackendDescriptor {
    pub fn kind(&self) -> BackendKind {
        self.source.kind()
    }

    pub fn is_local(&self) -> bool {
        self.kind() == BackendKind::Local
    }
}

/// Outcome of the moderation gate. Produced fresh per request.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModerationResult {
    pub safe: bool,
    pub categories: BTreeSet<String>,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ModerationResult {
    pub fn allow() -> Self {
        Self {
            safe: true,
            categories: BTreeSet::new(),
            confidence: 1.0,
            reason: None,
        }
    }
}

/// Category recorded when the external classifier could not be consulted.
pub const MODERATION_UNAVAILABLE: &str = "moderation_unavailable";
