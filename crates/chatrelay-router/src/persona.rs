//! Persona registry

use crate::backend::BackendRegistry;
use chatrelay_core::{BackendId, Error, Persona, PersonaConfig, PersonaId, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::info;

/// Static persona catalog, built once at startup.
pub struct PersonaRegistry {
    personas: Vec<Arc<Persona>>,
    index: HashMap<PersonaId, usize>,
}

impl PersonaRegistry {
    pub fn new(personas: Vec<Persona>) -> Result<Self> {
        let mut index = HashMap::new();
        let mut list = Vec::with_capacity(personas.len());
        for persona in personas {
            if !persona.allows(&persona.default_backend_id) {
                return Err(Error::config(format!(
                    "persona {}: default backend {} is not in its allowed set",
                    persona.id, persona.default_backend_id
                )));
            }
            if index.insert(persona.id.clone(), list.len()).is_some() {
                return Err(Error::config(format!("duplicate persona id: {}", persona.id)));
            }
            list.push(Arc::new(persona));
        }
        Ok(Self {
            personas: list,
            index,
        })
    }

    /// Build personas from config, expanding allowed categories against the
    /// backend registry.
    pub fn from_config(configs: &[PersonaConfig], backends: &BackendRegistry) -> Result<Self> {
        let personas = configs
            .iter()
            .map(|c| build_persona(c, backends))
            .collect::<Result<Vec<_>>>()?;
        let registry = Self::new(personas)?;
        info!("Loaded {} persona(s)", registry.len());
        Ok(registry)
    }

    pub fn resolve(&self, id: &str) -> Result<Arc<Persona>> {
        self.index
            .get(&PersonaId::new(id))
            .map(|&i| self.personas[i].clone())
            .ok_or_else(|| Error::UnknownPersona(id.to_string()))
    }

    /// Personas in registration order.
    pub fn list(&self) -> &[Arc<Persona>] {
        &self.personas
    }

    pub fn first(&self) -> Option<&Arc<Persona>> {
        self.personas.first()
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }
}

fn build_persona(config: &PersonaConfig, backends: &BackendRegistry) -> Result<Persona> {
    if config.id.trim().is_empty() {
        return Err(Error::config("persona id must not be empty"));
    }
    let default = config.default_backend.as_deref().ok_or_else(|| {
        Error::config(format!("persona {} has no default_backend", config.id))
    })?;

    // Explicit ids first, in declared order.
    let mut allowed: Vec<BackendId> = Vec::new();
    for raw in &config.allowed_backends {
        let id = BackendId::new(raw.as_str());
        if !backends.contains(&id) {
            return Err(Error::config(format!(
                "persona {} allows unknown backend {}",
                config.id, raw
            )));
        }
        if !allowed.contains(&id) {
            allowed.push(id);
        }
    }

    // Then every backend in an allowed category, in backend order.
    let categories: BTreeSet<String> = config.allowed_categories.iter().cloned().collect();
    if !categories.is_empty() {
        for backend in backends.list(None) {
            if categories.contains(&backend.category) && !allowed.contains(&backend.id) {
                allowed.push(backend.id);
            }
        }
    }

    let default_backend_id = BackendId::new(default);
    if !backends.contains(&default_backend_id) {
        return Err(Error::config(format!(
            "persona {} defaults to unknown backend {}",
            config.id, default
        )));
    }

    Ok(Persona {
        id: PersonaId::new(config.id.as_str()),
        display_name: config
            .display_name
            .clone()
            .unwrap_or_else(|| config.id.clone()),
        description: config.description.clone(),
        tags: config.tags.clone(),
        system_prompt: config.system_prompt.clone(),
        allowed_categories: categories,
        allowed_backend_ids: allowed,
        default_backend_id,
        safety_level: config.safety_level,
    })
}
