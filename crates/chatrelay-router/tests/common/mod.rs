//! Shared test doubles: scripted runtimes, providers, classifiers and probes
//! that count how often they are called.

#![allow(dead_code)]

use chatrelay_core::{
    BackendDescriptor, BackendId, BackendSource, Persona, PersonaId, SafetyLevel,
};
use chatrelay_llm::{
    Classification, GenerateRequest, Generation, GenerationParams, LlmError, LlmResult,
    LoadedModel, LocalRuntime, ModerationClassifier, RemoteProvider, Usage,
};
use chatrelay_router::{AvailabilityProbe, ProbeError};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ===========================================================================
// Descriptors and personas
// ===========================================================================

pub fn remote(id: &str, category: &str) -> BackendDescriptor {
    BackendDescriptor {
        id: BackendId::new(id),
        display_name: id.to_string(),
        category: category.to_string(),
        source: BackendSource::Remote {
            model: format!("{}-model", id),
            base_url: "http://127.0.0.1:9/v1".to_string(),
            api_key_env: None,
            api_key: Some("sk-test".to_string()),
        },
        resource_cost_units: 0,
        context_limit: 8192,
        temperature: 0.7,
        max_output_tokens: 512,
        slot: 0,
        available: false,
    }
}

pub fn local(id: &str, cost: u32, slot: usize) -> BackendDescriptor {
    BackendDescriptor {
        id: BackendId::new(id),
        display_name: id.to_string(),
        category: "local".to_string(),
        source: BackendSource::Local {
            artifact: PathBuf::from(format!("/models/{}.gguf", id)),
        },
        resource_cost_units: cost,
        context_limit: 4096,
        temperature: 0.7,
        max_output_tokens: 512,
        slot,
        available: false,
    }
}

pub fn persona(id: &str, allowed: &[&str], default: &str) -> Persona {
    Persona {
        id: PersonaId::new(id),
        display_name: id.to_string(),
        description: format!("{} persona", id),
        tags: Vec::new(),
        system_prompt: format!("You are {}.", id),
        allowed_categories: Default::default(),
        allowed_backend_ids: allowed.iter().map(|b| BackendId::new(*b)).collect(),
        default_backend_id: BackendId::new(default),
        safety_level: SafetyLevel::Standard,
    }
}

// ===========================================================================
// Probe
// ===========================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeState {
    Up,
    Down,
    Unreachable,
}

/// Availability decided by the test. Unlisted backends are up.
#[derive(Default)]
pub struct ScriptedProbe {
    states: Mutex<HashMap<String, ProbeState>>,
    pub calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, backend: &str, state: ProbeState) {
        self.states
            .lock()
            .unwrap()
            .insert(backend.to_string(), state);
    }

    pub fn set_all(&self, backends: &[&str], state: ProbeState) {
        for b in backends {
            self.set(b, state);
        }
    }
}

impl AvailabilityProbe for ScriptedProbe {
    fn probe(&self, backend: &BackendDescriptor) -> Result<bool, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let state = self
            .states
            .lock()
            .unwrap()
            .get(backend.id.as_str())
            .copied()
            .unwrap_or(ProbeState::Up);
        match state {
            ProbeState::Up => Ok(true),
            ProbeState::Down => Ok(false),
            ProbeState::Unreachable => Err(ProbeError::Unreachable("probe offline".into())),
        }
    }
}

// ===========================================================================
// Local runtime
// ===========================================================================

pub struct MockModel {
    pub name: String,
    pub calls: AtomicUsize,
    unloads: Arc<AtomicUsize>,
    delay: Duration,
}

#[async_trait::async_trait]
impl LoadedModel for MockModel {
    async fn generate(&self, request: GenerateRequest) -> LlmResult<Generation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let last = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(Generation {
            text: format!("{} says: {}", self.name, last),
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
            }),
        })
    }

    async fn unload(&self) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockRuntime {
    pub loads: AtomicUsize,
    pub unloads: Arc<AtomicUsize>,
    pub loaded: Mutex<Vec<PathBuf>>,
    /// Artifacts whose load fails.
    pub failing: Mutex<Vec<PathBuf>>,
    pub load_delay: Duration,
    pub generate_delay: Duration,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow_generation(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            generate_delay: delay,
            ..Default::default()
        })
    }

    pub fn fail_on(&self, backend: &str) {
        self.failing
            .lock()
            .unwrap()
            .push(PathBuf::from(format!("/models/{}.gguf", backend)));
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unload_count(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LocalRuntime for MockRuntime {
    async fn load(
        &self,
        artifact: &Path,
        _params: &GenerationParams,
    ) -> LlmResult<Arc<dyn LoadedModel>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        if self.failing.lock().unwrap().iter().any(|p| p == artifact) {
            return Err(LlmError::LoadFailed("out of memory".into()));
        }
        self.loaded.lock().unwrap().push(artifact.to_path_buf());
        let name = artifact
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Arc::new(MockModel {
            name,
            calls: AtomicUsize::new(0),
            unloads: self.unloads.clone(),
            delay: self.generate_delay,
        }))
    }
}

// ===========================================================================
// Remote provider
// ===========================================================================

/// Replays scripted results, then echoes the last prompt message.
pub struct MockProvider {
    name: String,
    pub calls: AtomicUsize,
    script: Mutex<VecDeque<LlmResult<Generation>>>,
    pub last_request: Mutex<Option<GenerateRequest>>,
    delay: Duration,
}

impl MockProvider {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            calls: AtomicUsize::new(0),
            script: Mutex::new(VecDeque::new()),
            last_request: Mutex::new(None),
            delay: Duration::ZERO,
        })
    }

    pub fn slow(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            calls: AtomicUsize::new(0),
            script: Mutex::new(VecDeque::new()),
            last_request: Mutex::new(None),
            delay,
        })
    }

    pub fn push(&self, result: LlmResult<Generation>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_messages(&self) -> Vec<(String, String)> {
        self.last_request
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| {
                r.messages
                    .iter()
                    .map(|m| (m.role.clone(), m.content.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl RemoteProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: GenerateRequest) -> LlmResult<Generation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(result) = self.script.lock().unwrap().pop_front() {
            return result;
        }
        let last = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(Generation {
            text: format!("{}: {}", self.name, last),
            usage: Some(Usage {
                prompt_tokens: 20,
                completion_tokens: 7,
            }),
        })
    }
}

// ===========================================================================
// Classifier
// ===========================================================================

pub struct MockClassifier {
    pub calls: AtomicUsize,
    flagged: Vec<(String, f32)>,
    fail: bool,
    delay: Duration,
}

impl MockClassifier {
    pub fn clean() -> Arc<Self> {
        Self::flagging(&[])
    }

    pub fn flagging(categories: &[(&str, f32)]) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            flagged: categories
                .iter()
                .map(|(c, s)| (c.to_string(), *s))
                .collect(),
            fail: false,
            delay: Duration::ZERO,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            flagged: Vec::new(),
            fail: true,
            delay: Duration::ZERO,
        })
    }

    pub fn hanging(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            flagged: Vec::new(),
            fail: false,
            delay,
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ModerationClassifier for MockClassifier {
    async fn classify(&self, _text: &str) -> LlmResult<Classification> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(LlmError::RequestFailed("503: classifier down".into()));
        }
        Ok(Classification {
            flagged: !self.flagged.is_empty(),
            categories: self.flagged.iter().cloned().collect(),
        })
    }
}
