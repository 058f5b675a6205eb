//! Chatrelay configuration
//!
//! Everything is loaded once at startup from a single TOML file. Sections
//! fall back to defaults when omitted, but a file that exists and fails to
//! parse or validate is a fatal startup error.

use crate::error::{Error, Result};
use crate::types::{
    BackendDescriptor, BackendId, BackendKind, BackendSource, ModerationAction, SafetyLevel,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Backend id reserved for the automatic-routing entry of the degraded catalog.
pub const AUTO_BACKEND_ID: &str = "auto";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub sessions: SessionConfig,
    pub residency: ResidencyConfig,
    pub generation: GenerationConfig,
    pub moderation: ModerationConfig,
    pub local_runtime: LocalRuntimeConfig,
    pub backends: Vec<BackendConfig>,
    pub personas: Vec<PersonaConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: BindMode,
    /// Persona used when a chat request names none. First registered persona if unset.
    pub default_persona: Option<String>,
}

/// Bind mode for the HTTP server
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    #[default]
    Loopback,
    Lan,
}

impl BindMode {
    pub fn to_addr(&self) -> &str {
        match self {
            BindMode::Loopback => "127.0.0.1",
            BindMode::Lan => "0.0.0.0",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Most recent messages included in a prompt.
    pub window_size: usize,
    /// Sessions untouched for longer than this are reaped.
    pub ttl_secs: u64,
    pub reap_interval_secs: u64,
    /// Directory for file-per-session persistence. In-memory only if unset.
    pub persist_dir: Option<PathBuf>,
    pub flush_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResidencyConfig {
    /// One entry per resident slot, each independently guarded.
    pub slots: Vec<SlotConfig>,
    /// Upper bound on waiting for a busy occupant to drain.
    pub acquire_timeout_ms: u64,
    /// Upper bound on a single model load. The slot is held for the duration.
    pub load_timeout_secs: u64,
    /// Unload idle residents after this long. Never if unset.
    pub idle_unload_secs: Option<u64>,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConfig {
    pub budget_units: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Bound on every backend invocation.
    pub timeout_secs: u64,
    /// Retry once on timeout / rate limit / network failure.
    pub retry_transient: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationConfig {
    /// Case-insensitive whole-word blacklist, reported as category "blacklist".
    pub blacklist: Vec<String>,
    pub patterns: Vec<PatternRule>,
    /// Character ceiling for a single message.
    pub max_chars: usize,
    /// Action for flagged classifier categories missing from `categories`.
    pub default_action: ModerationAction,
    pub categories: BTreeMap<String, ModerationAction>,
    /// Optional external safety classifier.
    pub classifier: Option<ClassifierConfig>,
    /// JSON Lines file receiving block and monitor decisions. Falls back to
    /// `moderation.jsonl` inside `sessions.persist_dir` when that is set.
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRule {
    pub pattern: String,
    pub category: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub base_url: String,
    pub api_key_env: String,
    pub model: Option<String>,
    pub timeout_ms: u64,
}

/// How local artifacts are turned into running models.
///
/// `args` may reference `{artifact}`, `{host}` and `{port}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalRuntimeConfig {
    pub command: String,
    pub args: Vec<String>,
    pub host: String,
    pub base_port: u16,
    pub port_range: u16,
    pub startup_timeout_secs: u64,
    pub health_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_category")]
    pub category: String,
    pub kind: BackendKind,
    /// Remote model name. Defaults to the backend id.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Local model artifact.
    #[serde(default)]
    pub artifact: Option<PathBuf>,
    #[serde(default)]
    pub cost_units: u32,
    #[serde(default = "default_context_limit")]
    pub context_limit: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default)]
    pub slot: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub system_prompt: String,
    /// Read the system prompt from a file instead (relative to the config file).
    #[serde(default)]
    pub system_prompt_file: Option<PathBuf>,
    #[serde(default)]
    pub allowed_categories: Vec<String>,
    #[serde(default)]
    pub allowed_backends: Vec<String>,
    pub default_backend: Option<String>,
    #[serde(default)]
    pub safety_level: SafetyLevel,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_context_limit() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_output_tokens() -> u32 {
    1024
}

// ============================================================
// Defaults
// ============================================================

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            sessions: SessionConfig::default(),
            residency: ResidencyConfig::default(),
            generation: GenerationConfig::default(),
            moderation: ModerationConfig::default(),
            local_runtime: LocalRuntimeConfig::default(),
            backends: vec![BackendConfig {
                id: "openai".into(),
                display_name: Some("OpenAI GPT-4o mini".into()),
                category: default_category(),
                kind: BackendKind::Remote,
                model: Some("gpt-4o-mini".into()),
                base_url: None,
                api_key_env: Some("OPENAI_API_KEY".into()),
                api_key: None,
                artifact: None,
                cost_units: 0,
                context_limit: 16_384,
                temperature: default_temperature(),
                max_output_tokens: default_max_output_tokens(),
                slot: 0,
            }],
            personas: vec![PersonaConfig {
                id: "assistant".into(),
                display_name: Some("Assistant".into()),
                description: "General purpose conversational assistant.".into(),
                tags: Vec::new(),
                system_prompt: "You are a helpful, concise assistant.".into(),
                system_prompt_file: None,
                allowed_categories: vec![default_category()],
                allowed_backends: Vec::new(),
                default_backend: Some("openai".into()),
                safety_level: SafetyLevel::Standard,
            }],
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8001,
            bind: BindMode::default(),
            default_persona: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            ttl_secs: 24 * 60 * 60,
            reap_interval_secs: 300,
            persist_dir: None,
            flush_interval_secs: 60,
        }
    }
}

impl Default for ResidencyConfig {
    fn default() -> Self {
        Self {
            slots: vec![SlotConfig { budget_units: 16 }],
            acquire_timeout_ms: 30_000,
            load_timeout_secs: 180,
            idle_unload_secs: Some(15 * 60),
            sweep_interval_secs: 60,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            retry_transient: true,
        }
    }
}

impl Default for ModerationConfig {
    fn default() -> Self {
        use ModerationAction::*;
        let categories = [
            ("sexual", Monitor),
            ("violence", Monitor),
            ("hate", Block),
            ("self-harm", Monitor),
            ("harassment", Monitor),
            ("self-harm/instructions", Block),
            ("hate/threatening", Block),
            ("self-harm/intent", Block),
            ("sexual/minors", Block),
            ("violence/graphic", Monitor),
            ("illicit/violent", Block),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            blacklist: Vec::new(),
            patterns: Vec::new(),
            max_chars: 8_000,
            default_action: Monitor,
            categories,
            classifier: None,
            log_path: None,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            model: Some("omni-moderation-latest".into()),
            timeout_ms: 3_000,
        }
    }
}

impl Default for LocalRuntimeConfig {
    fn default() -> Self {
        Self {
            command: "llama-server".into(),
            args: vec![
                "-m".into(),
                "{artifact}".into(),
                "--host".into(),
                "{host}".into(),
                "--port".into(),
                "{port}".into(),
            ],
            host: "127.0.0.1".into(),
            base_port: 18_100,
            port_range: 32,
            startup_timeout_secs: 120,
            health_path: "/health".into(),
        }
    }
}

// ============================================================
// Loading
// ============================================================

impl AppConfig {
    /// Load config from a TOML file, falling back to defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = Self::from_toml_str(&content)
                    .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
                tracing::info!("Loaded config from {}", path.display());
                config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config at {} - using defaults", path.display());
                Self::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.resolve_prompt_files(path.parent().unwrap_or_else(|| Path::new(".")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(e.to_string()))
    }

    /// Where moderation events are appended, if anywhere.
    pub fn moderation_log_path(&self) -> Option<PathBuf> {
        self.moderation.log_path.clone().or_else(|| {
            self.sessions
                .persist_dir
                .as_ref()
                .map(|dir| dir.join("moderation.jsonl"))
        })
    }

    /// Inline `system_prompt_file` contents into `system_prompt`.
    fn resolve_prompt_files(&mut self, base: &Path) -> Result<()> {
        for persona in &mut self.personas {
            if let Some(file) = persona.system_prompt_file.take() {
                let path = if file.is_absolute() { file } else { base.join(file) };
                persona.system_prompt = std::fs::read_to_string(&path)
                    .map_err(|e| {
                        Error::config(format!(
                            "persona {}: cannot read {}: {}",
                            persona.id,
                            path.display(),
                            e
                        ))
                    })?
                    .trim()
                    .to_string();
            }
        }
        Ok(())
    }

    /// Structural checks that do not need the registries.
    /// Persona admission rules are validated by the persona registry.
    pub fn validate(&self) -> Result<()> {
        if self.residency.slots.is_empty() {
            return Err(Error::config("at least one resident slot is required"));
        }
        if let Some(i) = self.residency.slots.iter().position(|s| s.budget_units == 0) {
            return Err(Error::config(format!("slot {} has a zero budget", i)));
        }
        if self.sessions.window_size == 0 {
            return Err(Error::config("sessions.window_size must be positive"));
        }
        if self.moderation.max_chars == 0 {
            return Err(Error::config("moderation.max_chars must be positive"));
        }
        if self.generation.timeout_secs == 0 {
            return Err(Error::config("generation.timeout_secs must be positive"));
        }
        if self.residency.load_timeout_secs == 0 {
            return Err(Error::config("residency.load_timeout_secs must be positive"));
        }
        let mut seen = HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.id.as_str()) {
                return Err(Error::config(format!("duplicate backend id: {}", backend.id)));
            }
            if backend.kind == BackendKind::Local && backend.slot >= self.residency.slots.len() {
                return Err(Error::config(format!(
                    "backend {} refers to slot {} but only {} slot(s) are configured",
                    backend.id,
                    backend.slot,
                    self.residency.slots.len()
                )));
            }
            backend.to_descriptor()?;
        }
        Ok(())
    }
}

impl BackendConfig {
    pub fn to_descriptor(&self) -> Result<BackendDescriptor> {
        if self.id.trim().is_empty() {
            return Err(Error::config("backend id must not be empty"));
        }
        if self.id == AUTO_BACKEND_ID {
            return Err(Error::config(format!(
                "backend id '{}' is reserved",
                AUTO_BACKEND_ID
            )));
        }
        let source = match self.kind {
            BackendKind::Remote => BackendSource::Remote {
                model: self.model.clone().unwrap_or_else(|| self.id.clone()),
                base_url: self
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                api_key_env: self.api_key_env.clone(),
                api_key: self.api_key.clone(),
            },
            BackendKind::Local => BackendSource::Local {
                artifact: self.artifact.clone().ok_or_else(|| {
                    Error::config(format!("local backend {} has no artifact", self.id))
                })?,
            },
        };
        Ok(BackendDescriptor {
            id: BackendId::new(&self.id),
            display_name: self.display_name.clone().unwrap_or_else(|| self.id.clone()),
            category: self.category.clone(),
            source,
            resource_cost_units: self.cost_units,
            context_limit: self.context_limit,
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
            slot: self.slot,
            available: false,
        })
    }
}
