//! Chat orchestration
//!
//! One request moves through
//! `Received -> Moderated -> BackendAcquired -> Generated -> Recorded -> Responded`.
//! Any failure is terminal and reported as a [`ChatError`] naming the last
//! state the request reached.

use crate::backend::BackendRegistry;
use crate::catalog::{Catalog, DegradedCatalog};
use crate::context::ContextManager;
use crate::moderation::ModerationGate;
use crate::persist::{ModerationEvent, ModerationLog};
use crate::persona::PersonaRegistry;
use crate::session::SessionStore;
use crate::slot::{Lease, SlotManager};
use crate::usage::UsageLedger;
use chatrelay_core::{
    AppConfig, BackendId, Error, ErrorKind, Message, ModerationAction, ModerationResult, Persona,
    PersonaId, Result, SessionId, AUTO_BACKEND_ID, MODERATION_UNAVAILABLE,
};
use chatrelay_llm::{GenerateRequest, Generation, GenerationParams, LlmError, LlmResult, RemoteProvider};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Reply given when no backend can be reached at all.
pub const DEGRADED_REPLY: &str =
    "I'm having trouble reaching my language models right now. Please try again in a moment.";

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub persona: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Preferred backend; ignored unless the persona allows it.
    #[serde(default)]
    pub backend: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChatResult {
    pub response: String,
    pub persona: PersonaId,
    pub session_id: SessionId,
    pub backend_used: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u32>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "is_false")]
    pub degraded: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Received,
    Moderated,
    BackendAcquired,
    Generated,
    Recorded,
    Responded,
}

#[derive(Clone, Debug, Serialize, thiserror::Error)]
#[error("{kind}: {reason}")]
pub struct ChatError {
    pub kind: ErrorKind,
    pub reason: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(skip)]
    pub failed_at: RequestState,
}

impl ChatError {
    fn at(state: RequestState, error: Error) -> Self {
        let categories = match &error {
            Error::ContentRejected { categories, .. } => categories.clone(),
            _ => Vec::new(),
        };
        let reason = match &error {
            Error::ContentRejected { reason, .. } => reason.clone(),
            other => other.to_string(),
        };
        Self {
            kind: error.kind(),
            reason,
            categories,
            failed_at: state,
        }
    }
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Most recent messages included in a prompt.
    pub window_size: usize,
    pub generation_timeout: Duration,
    pub retry_transient: bool,
    pub default_persona: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            generation_timeout: Duration::from_secs(120),
            retry_transient: true,
            default_persona: None,
        }
    }
}

impl From<&AppConfig> for OrchestratorConfig {
    fn from(c: &AppConfig) -> Self {
        Self {
            window_size: c.sessions.window_size,
            generation_timeout: Duration::from_secs(c.generation.timeout_secs),
            retry_transient: c.generation.retry_transient,
            default_persona: c.server.default_persona.clone(),
        }
    }
}

/// Everything the orchestrator composes.
pub struct Components {
    pub personas: Arc<PersonaRegistry>,
    pub backends: Arc<BackendRegistry>,
    pub slots: Arc<SlotManager>,
    pub gate: Arc<ModerationGate>,
    pub sessions: Arc<SessionStore>,
    pub providers: HashMap<BackendId, Arc<dyn RemoteProvider>>,
    pub usage: Arc<UsageLedger>,
}

pub struct Orchestrator {
    c: Components,
    config: OrchestratorConfig,
    degraded: DegradedCatalog,
    moderation_log: Option<Arc<dyn ModerationLog>>,
}

impl Orchestrator {
    pub fn new(components: Components, config: OrchestratorConfig) -> Result<Self> {
        for backend in components.backends.list(None) {
            if !backend.is_local() && !components.providers.contains_key(&backend.id) {
                return Err(Error::config(format!(
                    "remote backend {} has no provider",
                    backend.id
                )));
            }
        }
        if let Some(default) = &config.default_persona {
            components.personas.resolve(default).map_err(|_| {
                Error::config(format!("default persona {} is not registered", default))
            })?;
        }
        let degraded = DegradedCatalog::new(&components.personas);
        Ok(Self {
            c: components,
            config,
            degraded,
            moderation_log: None,
        })
    }

    /// Record every block and monitor decision to `log`.
    pub fn with_moderation_log(mut self, log: Arc<dyn ModerationLog>) -> Self {
        self.moderation_log = Some(log);
        self
    }

    pub fn moderation_log(&self) -> Option<&Arc<dyn ModerationLog>> {
        self.moderation_log.as_ref()
    }

    pub fn personas(&self) -> &Arc<PersonaRegistry> {
        &self.c.personas
    }

    pub fn backends(&self) -> &Arc<BackendRegistry> {
        &self.c.backends
    }

    pub fn slots(&self) -> &Arc<SlotManager> {
        &self.c.slots
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.c.sessions
    }

    pub fn usage(&self) -> &Arc<UsageLedger> {
        &self.c.usage
    }

    /// Current catalog, or the static fallback if the backend tier is down.
    pub fn catalog(&self) -> Catalog {
        Catalog::discover(&self.c.personas, &self.c.backends, &self.degraded)
    }

    fn resolve_persona(&self, requested: Option<&str>) -> Result<Arc<Persona>> {
        match requested
            .filter(|p| !p.trim().is_empty())
            .or(self.config.default_persona.as_deref())
        {
            Some(id) => self.c.personas.resolve(id),
            None => self
                .c
                .personas
                .first()
                .cloned()
                .ok_or_else(|| Error::UnknownPersona("(none registered)".to_string())),
        }
    }

    pub async fn handle(&self, request: ChatRequest) -> std::result::Result<ChatResult, ChatError> {
        let started = Instant::now();
        let fail = |state: RequestState| move |e: Error| ChatError::at(state, e);

        if request.message.trim().is_empty() {
            return Err(ChatError::at(
                RequestState::Received,
                Error::InvalidRequest("message must not be empty".to_string()),
            ));
        }
        let session_id = match request.session_id.as_deref() {
            Some(raw) => SessionId::parse(raw).map_err(fail(RequestState::Received))?,
            None => SessionId::new(uuid::Uuid::new_v4().to_string()),
        };
        let persona = self
            .resolve_persona(request.persona.as_deref())
            .map_err(fail(RequestState::Received))?;

        // Moderation
        let verdict = self.c.gate.check(&request.message, persona.safety_level).await;
        if !verdict.safe {
            info!(
                session = %session_id,
                persona = %persona.id,
                "message rejected: {:?}", verdict.categories
            );
            self.record_moderation(
                &session_id,
                &persona.id,
                ModerationAction::Block,
                verdict.categories.iter().cloned().collect(),
                &verdict,
            );
            return Err(ChatError::at(
                RequestState::Received,
                Error::ContentRejected {
                    categories: verdict.categories.into_iter().collect(),
                    reason: verdict
                        .reason
                        .unwrap_or_else(|| "content rejected".to_string()),
                },
            ));
        }
        let mut warnings = Vec::new();
        if verdict.categories.contains(MODERATION_UNAVAILABLE) {
            warnings.push("moderation unavailable; message was not classified".to_string());
        }
        let monitored: Vec<&str> = verdict
            .categories
            .iter()
            .map(String::as_str)
            .filter(|c| *c != MODERATION_UNAVAILABLE)
            .collect();
        if !monitored.is_empty() {
            warnings.push(format!("monitored content: {}", monitored.join(", ")));
            self.record_moderation(
                &session_id,
                &persona.id,
                ModerationAction::Monitor,
                monitored.iter().map(|c| c.to_string()).collect(),
                &verdict,
            );
        }

        // Backend selection and acquisition
        let hint = request.backend.as_deref().map(BackendId::new);
        if let Some(h) = &hint {
            if !persona.allows(h) {
                warnings.push(format!(
                    "backend {} is not allowed for persona {}; ignoring",
                    h, persona.id
                ));
            }
        }
        let backend = match self.c.backends.select(&persona, hint.as_ref()) {
            Ok(b) => b,
            Err(Error::BackendUnreachable(reason)) => {
                warn!(persona = %persona.id, "backend tier unreachable, degrading: {}", reason);
                warnings.push(format!("backend tier unreachable: {}", reason));
                return Ok(ChatResult {
                    response: DEGRADED_REPLY.to_string(),
                    persona: persona.id.clone(),
                    session_id,
                    backend_used: AUTO_BACKEND_ID.to_string(),
                    tokens_used: None,
                    latency_ms: started.elapsed().as_millis() as u64,
                    degraded: true,
                    warnings,
                });
            }
            Err(e) => return Err(ChatError::at(RequestState::Moderated, e)),
        };
        let lease = self
            .c
            .slots
            .acquire(&backend)
            .await
            .map_err(fail(RequestState::Moderated))?;

        // Prompt assembly. The persona is applied per message, so the system
        // prompt always comes from this request's persona.
        let history = self
            .c
            .sessions
            .get_or_create(&session_id, &persona.id)
            .await
            .window(self.config.window_size)
            .to_vec();
        let prompt = ContextManager::for_backend(&backend).assemble(&persona, &history, &request.message);
        let generate_request = GenerateRequest {
            messages: prompt.messages,
            params: GenerationParams::from(&backend),
        };

        // Generation
        let generation = match self.generate_with_retry(&lease, generate_request).await {
            Ok(g) => g,
            Err(e) => {
                self.c.usage.record_failure(&backend.id);
                return Err(ChatError::at(
                    RequestState::BackendAcquired,
                    Error::generation_failed(backend.id.as_str(), e.to_string()),
                ));
            }
        };
        drop(lease);
        self.c.usage.record(&backend.id, generation.usage);

        // Record
        self.c
            .sessions
            .record_turn(
                &session_id,
                &persona.id,
                Message::user(request.message),
                Message::assistant(generation.text.clone()),
            )
            .await;

        let latency_ms = started.elapsed().as_millis() as u64;
        info!(
            session = %session_id,
            persona = %persona.id,
            backend = %backend.id,
            latency_ms,
            "chat turn complete"
        );

        Ok(ChatResult {
            response: generation.text,
            persona: persona.id.clone(),
            session_id,
            backend_used: backend.id.to_string(),
            tokens_used: generation.usage.map(|u| u.total()),
            latency_ms,
            degraded: false,
            warnings,
        })
    }

    fn record_moderation(
        &self,
        session_id: &SessionId,
        persona: &PersonaId,
        action: ModerationAction,
        categories: Vec<String>,
        verdict: &ModerationResult,
    ) {
        let Some(log) = &self.moderation_log else {
            return;
        };
        let event = ModerationEvent {
            created_at: chrono::Utc::now(),
            session_id: session_id.clone(),
            persona: persona.clone(),
            action,
            categories,
            confidence: verdict.confidence,
        };
        if let Err(e) = log.record(&event) {
            warn!(session = %session_id, "failed to record moderation event: {}", e);
        }
    }

    async fn generate_with_retry(&self, lease: &Lease, request: GenerateRequest) -> LlmResult<Generation> {
        match self.generate_once(lease, request.clone()).await {
            Err(e) if e.is_transient() && self.config.retry_transient => {
                warn!(backend = %lease.backend_id(), "transient failure, retrying once: {}", e);
                self.generate_once(lease, request).await
            }
            other => other,
        }
    }

    /// The single place a lease turns into a generation call.
    async fn generate_once(&self, lease: &Lease, request: GenerateRequest) -> LlmResult<Generation> {
        let call = async {
            match lease {
                Lease::Remote { backend_id } => match self.c.providers.get(backend_id) {
                    Some(provider) => provider.generate(request).await,
                    None => Err(LlmError::RequestFailed(format!(
                        "no provider for {}",
                        backend_id
                    ))),
                },
                Lease::Local(local) => local.model().generate(request).await,
            }
        };
        match tokio::time::timeout(self.config.generation_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(
                self.config.generation_timeout.as_millis() as u64,
            )),
        }
    }
}
