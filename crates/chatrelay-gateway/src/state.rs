//! Shared application state, wired from configuration

use anyhow::Context;
use chatrelay_core::{AppConfig, BackendId, BackendSource};
use chatrelay_llm::{
    ModerationClassifier, OpenAiModeration, OpenAiProvider, ProcessRuntime, RemoteProvider,
};
use chatrelay_router::{
    BackendRegistry, Components, DefaultProbe, JsonDirStore, JsonlModerationLog, ModerationGate,
    Orchestrator, OrchestratorConfig, PersonaRegistry, SessionStore, SlotManager, UsageLedger,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub config: AppConfig,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, config: AppConfig) -> Self {
        Self {
            orchestrator,
            config,
            started_at: Instant::now(),
        }
    }

    /// Build every component from a validated configuration.
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let backends = Arc::new(
            BackendRegistry::from_config(&config.backends, Arc::new(DefaultProbe))
                .context("building backend registry")?,
        );
        let personas = Arc::new(
            PersonaRegistry::from_config(&config.personas, &backends)
                .context("building persona registry")?,
        );

        let mut providers: HashMap<BackendId, Arc<dyn RemoteProvider>> = HashMap::new();
        for backend in backends.list(None) {
            if let BackendSource::Remote {
                model, base_url, ..
            } = &backend.source
            {
                let mut provider =
                    OpenAiProvider::new(backend.id.as_str(), model.as_str()).with_base_url(base_url.as_str());
                match backend.source.credential() {
                    Some(key) => provider = provider.with_api_key(key),
                    None => warn!(backend = %backend.id, "No credential found; backend reported unavailable"),
                }
                providers.insert(backend.id.clone(), Arc::new(provider));
            }
        }

        let runtime = Arc::new(ProcessRuntime::new(config.local_runtime.clone()));
        let slots = Arc::new(SlotManager::from_config(&config.residency, runtime));

        let classifier: Option<Arc<dyn ModerationClassifier>> =
            match &config.moderation.classifier {
                Some(c) => match std::env::var(&c.api_key_env) {
                    Ok(key) if !key.trim().is_empty() => Some(Arc::new(
                        OpenAiModeration::new(key)
                            .with_base_url(c.base_url.as_str())
                            .with_model(c.model.clone()),
                    )),
                    _ => {
                        warn!(
                            "Moderation classifier configured but {} is not set; running pattern checks only",
                            c.api_key_env
                        );
                        None
                    }
                },
                None => None,
            };
        let gate = Arc::new(
            ModerationGate::from_config(&config.moderation, classifier)
                .context("building moderation gate")?,
        );

        let sessions = match &config.sessions.persist_dir {
            Some(dir) => {
                let store = JsonDirStore::new(dir.as_path())
                    .with_context(|| format!("opening session directory {}", dir.display()))?;
                let sessions = SessionStore::with_persistence(Arc::new(store))
                    .context("loading persisted sessions")?;
                info!("Loaded {} sessions from {}", sessions.len(), dir.display());
                sessions
            }
            None => SessionStore::new(),
        };

        let mut orchestrator = Orchestrator::new(
            Components {
                personas,
                backends,
                slots,
                gate,
                sessions: Arc::new(sessions),
                providers,
                usage: Arc::new(UsageLedger::new()),
            },
            OrchestratorConfig::from(&config),
        )
        .context("building orchestrator")?;

        if let Some(path) = config.moderation_log_path() {
            let log = JsonlModerationLog::new(path.as_path())
                .with_context(|| format!("opening moderation log {}", path.display()))?;
            info!("Recording moderation events to {}", path.display());
            orchestrator = orchestrator.with_moderation_log(Arc::new(log));
        }

        Ok(Self::new(Arc::new(orchestrator), config))
    }
}
