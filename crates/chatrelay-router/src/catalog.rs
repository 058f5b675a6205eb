//! Persona/backend catalog, with a static fallback for when the backend tier
//! cannot be reached.

use crate::backend::BackendRegistry;
use crate::persona::PersonaRegistry;
use chatrelay_core::{BackendDescriptor, BackendKind, Persona, SafetyLevel, AUTO_BACKEND_ID};
use serde::Serialize;
use tracing::warn;

#[derive(Clone, Debug, Serialize)]
pub struct PersonaSummary {
    pub id: String,
    pub display_name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub allowed_backends: Vec<String>,
    pub default_backend: String,
    pub safety_level: SafetyLevel,
}

impl From<&Persona> for PersonaSummary {
    fn from(p: &Persona) -> Self {
        Self {
            id: p.id.to_string(),
            display_name: p.display_name.clone(),
            description: p.description.clone(),
            tags: p.tags.clone(),
            allowed_backends: p.allowed_backend_ids.iter().map(|b| b.to_string()).collect(),
            default_backend: p.default_backend_id.to_string(),
            safety_level: p.safety_level,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct BackendSummary {
    pub id: String,
    pub display_name: String,
    pub category: String,
    pub kind: &'static str,
    pub available: bool,
    pub cost_units: u32,
    pub context_limit: u32,
}

impl From<&BackendDescriptor> for BackendSummary {
    fn from(d: &BackendDescriptor) -> Self {
        Self {
            id: d.id.to_string(),
            display_name: d.display_name.clone(),
            category: d.category.clone(),
            kind: match d.kind() {
                BackendKind::Remote => "remote",
                BackendKind::Local => "local",
            },
            available: d.available,
            cost_units: d.resource_cost_units,
            context_limit: d.context_limit,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Catalog {
    pub personas: Vec<PersonaSummary>,
    pub backends: Vec<BackendSummary>,
    #[serde(skip_serializing_if = "is_false")]
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Catalog {
    /// Probe every backend and describe what is available. Falls back to the
    /// degraded catalog when the whole tier is unreachable.
    pub fn discover(
        personas: &PersonaRegistry,
        backends: &BackendRegistry,
        fallback: &DegradedCatalog,
    ) -> Self {
        match backends.refresh_all() {
            Ok(descriptors) => Self {
                personas: personas.list().iter().map(|p| PersonaSummary::from(&**p)).collect(),
                backends: descriptors.iter().map(BackendSummary::from).collect(),
                degraded: false,
                warning: None,
            },
            Err(e) => {
                warn!("Serving degraded catalog: {}", e);
                fallback.with_warning(e.to_string())
            }
        }
    }
}

/// Static catalog served when the backend tier is unreachable: every persona
/// routes to a single `auto` backend.
#[derive(Clone, Debug)]
pub struct DegradedCatalog {
    catalog: Catalog,
}

impl DegradedCatalog {
    pub fn new(personas: &PersonaRegistry) -> Self {
        let personas = personas
            .list()
            .iter()
            .map(|p| PersonaSummary {
                allowed_backends: vec![AUTO_BACKEND_ID.to_string()],
                default_backend: AUTO_BACKEND_ID.to_string(),
                ..PersonaSummary::from(&**p)
            })
            .collect();
        let auto = BackendSummary {
            id: AUTO_BACKEND_ID.to_string(),
            display_name: "Automatic".to_string(),
            category: "general".to_string(),
            kind: AUTO_BACKEND_ID,
            available: true,
            cost_units: 0,
            context_limit: 0,
        };
        Self {
            catalog: Catalog {
                personas,
                backends: vec![auto],
                degraded: true,
                warning: None,
            },
        }
    }

    pub fn with_warning(&self, warning: impl Into<String>) -> Catalog {
        Catalog {
            warning: Some(warning.into()),
            ..self.catalog.clone()
        }
    }
}
