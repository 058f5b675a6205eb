//! Backend capability registry
//!
//! Descriptors are fixed at startup. Only the per-backend availability flag
//! changes afterwards, and each flag is its own atomic.

use chatrelay_core::{
    BackendConfig, BackendDescriptor, BackendId, BackendSource, Error, Persona, Result,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// The backend tier could not be asked at all.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("backend tier unreachable: {0}")]
    Unreachable(String),
}

/// Decides whether a backend can currently serve requests.
pub trait AvailabilityProbe: Send + Sync {
    fn probe(&self, backend: &BackendDescriptor) -> std::result::Result<bool, ProbeError>;
}

/// Local: the artifact exists on disk. Remote: a credential is configured.
pub struct DefaultProbe;

impl AvailabilityProbe for DefaultProbe {
    fn probe(&self, backend: &BackendDescriptor) -> std::result::Result<bool, ProbeError> {
        match &backend.source {
            BackendSource::Local { artifact } => match std::fs::metadata(artifact) {
                Ok(meta) => Ok(meta.is_file()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(ProbeError::Unreachable(format!(
                    "{}: {}",
                    artifact.display(),
                    e
                ))),
            },
            BackendSource::Remote { .. } => Ok(backend.source.credential().is_some()),
        }
    }
}

struct BackendEntry {
    descriptor: BackendDescriptor,
    available: AtomicBool,
}

impl BackendEntry {
    fn snapshot(&self) -> BackendDescriptor {
        let mut d = self.descriptor.clone();
        d.available = self.available.load(Ordering::Acquire);
        d
    }
}

pub struct BackendRegistry {
    entries: Vec<BackendEntry>,
    index: HashMap<BackendId, usize>,
    probe: Arc<dyn AvailabilityProbe>,
}

impl BackendRegistry {
    pub fn new(descriptors: Vec<BackendDescriptor>, probe: Arc<dyn AvailabilityProbe>) -> Result<Self> {
        let mut index = HashMap::new();
        let mut entries = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if index
                .insert(descriptor.id.clone(), entries.len())
                .is_some()
            {
                return Err(Error::config(format!(
                    "duplicate backend id: {}",
                    descriptor.id
                )));
            }
            entries.push(BackendEntry {
                available: AtomicBool::new(descriptor.available),
                descriptor,
            });
        }
        Ok(Self {
            entries,
            index,
            probe,
        })
    }

    pub fn from_config(backends: &[BackendConfig], probe: Arc<dyn AvailabilityProbe>) -> Result<Self> {
        let descriptors = backends
            .iter()
            .map(BackendConfig::to_descriptor)
            .collect::<Result<Vec<_>>>()?;
        let registry = Self::new(descriptors, probe)?;
        // Initial availability; failures just leave the flag unset.
        for entry in &registry.entries {
            let _ = registry.refresh_entry(entry);
        }
        Ok(registry)
    }

    /// All backends in declaration order, optionally filtered by category.
    pub fn list(&self, category: Option<&str>) -> Vec<BackendDescriptor> {
        self.entries
            .iter()
            .filter(|e| category.map_or(true, |c| e.descriptor.category == c))
            .map(BackendEntry::snapshot)
            .collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = &BackendId> {
        self.entries.iter().map(|e| &e.descriptor.id)
    }

    pub fn contains(&self, id: &BackendId) -> bool {
        self.index.contains_key(id)
    }

    pub fn resolve(&self, id: &BackendId) -> Result<BackendDescriptor> {
        self.entry(id).map(BackendEntry::snapshot)
    }

    fn entry(&self, id: &BackendId) -> Result<&BackendEntry> {
        self.index
            .get(id)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| Error::UnknownBackend(id.to_string()))
    }

    fn refresh_entry(&self, entry: &BackendEntry) -> std::result::Result<bool, ProbeError> {
        let available = self.probe.probe(&entry.descriptor)?;
        let previous = entry.available.swap(available, Ordering::AcqRel);
        if previous != available {
            debug!(
                backend = %entry.descriptor.id,
                "availability changed: {} -> {}", previous, available
            );
        }
        Ok(available)
    }

    /// Re-probe one backend and store the result.
    pub fn refresh_availability(&self, id: &BackendId) -> Result<bool> {
        let entry = self.entry(id)?;
        self.refresh_entry(entry)
            .map_err(|e| Error::BackendUnreachable(e.to_string()))
    }

    /// Re-probe every backend. The outer error is returned only when every
    /// probe failed, meaning the tier itself is unreachable.
    pub fn refresh_all(&self) -> Result<Vec<BackendDescriptor>> {
        let mut failures = Vec::new();
        for entry in &self.entries {
            if let Err(e) = self.refresh_entry(entry) {
                warn!(backend = %entry.descriptor.id, "probe failed: {}", e);
                failures.push(e.to_string());
            }
        }
        if !self.entries.is_empty() && failures.len() == self.entries.len() {
            return Err(Error::BackendUnreachable(failures.join("; ")));
        }
        Ok(self.list(None))
    }

    /// Choose the backend for one request.
    ///
    /// The hint wins if the persona allows it and it is available, then the
    /// persona default, then the first available allowed backend in declared
    /// order.
    pub fn select(&self, persona: &Persona, hint: Option<&BackendId>) -> Result<BackendDescriptor> {
        let mut candidates: Vec<&BackendId> = Vec::with_capacity(persona.allowed_backend_ids.len() + 2);
        if let Some(h) = hint.filter(|h| persona.allows(h)) {
            candidates.push(h);
        }
        candidates.push(&persona.default_backend_id);
        candidates.extend(persona.allowed_backend_ids.iter());

        let mut probed = 0usize;
        let mut failures = Vec::new();
        let mut tried: Vec<&BackendId> = Vec::new();
        for id in candidates {
            if tried.contains(&id) {
                continue;
            }
            tried.push(id);
            let entry = self.entry(id)?;
            probed += 1;
            match self.refresh_entry(entry) {
                Ok(true) => return Ok(entry.snapshot()),
                Ok(false) => debug!(backend = %id, persona = %persona.id, "backend unavailable"),
                Err(e) => failures.push(e.to_string()),
            }
        }

        if probed > 0 && failures.len() == probed {
            return Err(Error::BackendUnreachable(failures.join("; ")));
        }
        Err(Error::NoBackendAvailable {
            persona: persona.id.to_string(),
        })
    }
}
