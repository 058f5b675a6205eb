//! Resident-model slot manager
//!
//! Each slot holds at most one loaded local model under a fixed memory
//! budget. Requests take a [`Lease`] on the backend they will generate with;
//! a resident model is only evicted once no lease references it.
//!
//! Lease counts are incremented only under the slot lock and decremented
//! lock-free on drop, so an occupant seen with zero leases under the lock
//! cannot gain one until the lock is released.

use chatrelay_core::{
    BackendDescriptor, BackendId, BackendSource, Error, ResidencyConfig, Result,
};
use chatrelay_llm::{GenerationParams, LoadedModel, LocalRuntime};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(180);

struct Resident {
    backend_id: BackendId,
    cost_units: u32,
    model: Arc<dyn LoadedModel>,
    refs: AtomicUsize,
    loaded_at: Instant,
    /// Millis since `loaded_at` of the last acquire or release.
    last_used_ms: AtomicU64,
}

impl Resident {
    fn touch(&self) {
        let ms = self.loaded_at.elapsed().as_millis() as u64;
        self.last_used_ms.store(ms, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_used_ms.load(Ordering::Relaxed));
        self.loaded_at.elapsed().saturating_sub(last)
    }
}

struct SlotState {
    occupant: Option<Arc<Resident>>,
    used_units: u32,
}

struct Slot {
    index: usize,
    budget_units: u32,
    state: Mutex<SlotState>,
    /// Signalled when an occupant's lease count drops to zero.
    drained: Notify,
}

/// Permission to generate with one backend.
pub enum Lease {
    Remote { backend_id: BackendId },
    Local(LocalLease),
}

impl Lease {
    pub fn backend_id(&self) -> &BackendId {
        match self {
            Lease::Remote { backend_id } => backend_id,
            Lease::Local(lease) => &lease.resident.backend_id,
        }
    }
}

/// Keeps a resident model loaded while held.
pub struct LocalLease {
    slot: Arc<Slot>,
    resident: Arc<Resident>,
}

impl LocalLease {
    pub fn model(&self) -> &Arc<dyn LoadedModel> {
        &self.resident.model
    }

    pub fn slot(&self) -> usize {
        self.slot.index
    }
}

impl Drop for LocalLease {
    fn drop(&mut self) {
        self.resident.touch();
        if self.resident.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.slot.drained.notify_waiters();
        }
    }
}

/// Point-in-time view of one slot.
#[derive(Clone, Debug, Serialize)]
pub struct SlotStatus {
    pub index: usize,
    pub budget_units: u32,
    /// Unknown while `transitioning`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_units: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occupant: Option<String>,
    pub leases: usize,
    /// A load or eviction is in progress.
    pub transitioning: bool,
}

enum Step {
    Reuse(Arc<Resident>),
    Wait(BackendId),
    Evict,
    Load,
}

pub struct SlotManager {
    slots: Vec<Arc<Slot>>,
    runtime: Arc<dyn LocalRuntime>,
    acquire_timeout: Duration,
    load_timeout: Duration,
}

impl SlotManager {
    pub fn new(budgets: &[u32], runtime: Arc<dyn LocalRuntime>, acquire_timeout: Duration) -> Self {
        let slots = budgets
            .iter()
            .enumerate()
            .map(|(index, &budget_units)| {
                Arc::new(Slot {
                    index,
                    budget_units,
                    state: Mutex::new(SlotState {
                        occupant: None,
                        used_units: 0,
                    }),
                    drained: Notify::new(),
                })
            })
            .collect();
        Self {
            slots,
            runtime,
            acquire_timeout,
            load_timeout: DEFAULT_LOAD_TIMEOUT,
        }
    }

    pub fn from_config(config: &ResidencyConfig, runtime: Arc<dyn LocalRuntime>) -> Self {
        let budgets: Vec<u32> = config.slots.iter().map(|s| s.budget_units).collect();
        Self::new(
            &budgets,
            runtime,
            Duration::from_millis(config.acquire_timeout_ms),
        )
        .with_load_timeout(Duration::from_secs(config.load_timeout_secs))
    }

    pub fn with_load_timeout(mut self, load_timeout: Duration) -> Self {
        self.load_timeout = load_timeout;
        self
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub async fn acquire(&self, backend: &BackendDescriptor) -> Result<Lease> {
        match &backend.source {
            BackendSource::Remote { .. } => Ok(Lease::Remote {
                backend_id: backend.id.clone(),
            }),
            BackendSource::Local { artifact } => {
                self.acquire_local(backend, artifact).await.map(Lease::Local)
            }
        }
    }

    async fn acquire_local(&self, backend: &BackendDescriptor, artifact: &Path) -> Result<LocalLease> {
        let slot = self.slots.get(backend.slot).cloned().ok_or_else(|| {
            Error::config(format!(
                "backend {} refers to missing slot {}",
                backend.id, backend.slot
            ))
        })?;

        if backend.resource_cost_units > slot.budget_units {
            return Err(Error::InsufficientBudget {
                backend: backend.id.to_string(),
                cost: backend.resource_cost_units,
                budget: slot.budget_units,
                slot: slot.index,
            });
        }

        let deadline = tokio::time::Instant::now() + self.acquire_timeout;
        loop {
            // Register for the drain signal before inspecting the occupant so
            // a release between the check and the wait is not lost.
            let notified = slot.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut state = match tokio::time::timeout_at(deadline, slot.state.lock()).await {
                Ok(guard) => guard,
                Err(_) => {
                    return Err(Error::SlotBusy {
                        slot: slot.index,
                        occupant: "loading".to_string(),
                    })
                }
            };

            let step = match state.occupant.as_ref() {
                Some(r) if r.backend_id == backend.id => Step::Reuse(r.clone()),
                Some(r) if r.refs.load(Ordering::Acquire) > 0 => Step::Wait(r.backend_id.clone()),
                Some(_) => Step::Evict,
                None => Step::Load,
            };

            match step {
                Step::Reuse(resident) => {
                    resident.refs.fetch_add(1, Ordering::AcqRel);
                    resident.touch();
                    debug!(backend = %backend.id, slot = slot.index, "reusing resident model");
                    return Ok(LocalLease {
                        slot: slot.clone(),
                        resident,
                    });
                }
                Step::Wait(occupant) => {
                    drop(state);
                    debug!(
                        backend = %backend.id,
                        slot = slot.index,
                        "waiting for {} to drain", occupant
                    );
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        warn!(backend = %backend.id, slot = slot.index, "slot busy with {}", occupant);
                        return Err(Error::SlotBusy {
                            slot: slot.index,
                            occupant: occupant.to_string(),
                        });
                    }
                    continue;
                }
                Step::Evict => {
                    if let Some(evicted) = state.occupant.take() {
                        state.used_units = 0;
                        info!(
                            slot = slot.index,
                            "evicting {} for {}", evicted.backend_id, backend.id
                        );
                        evicted.model.unload().await;
                    }
                }
                Step::Load => {}
            }

            info!(backend = %backend.id, slot = slot.index, "loading {}", artifact.display());
            let params = GenerationParams::from(backend);
            let model = match tokio::time::timeout(
                self.load_timeout,
                self.runtime.load(artifact, &params),
            )
            .await
            {
                Ok(loaded) => {
                    loaded.map_err(|e| Error::load_failure(backend.id.as_str(), e.to_string()))?
                }
                Err(_) => {
                    warn!(backend = %backend.id, slot = slot.index, "load timed out");
                    return Err(Error::load_failure(
                        backend.id.as_str(),
                        format!("load timed out after {}s", self.load_timeout.as_secs_f32()),
                    ));
                }
            };

            let resident = Arc::new(Resident {
                backend_id: backend.id.clone(),
                cost_units: backend.resource_cost_units,
                model,
                refs: AtomicUsize::new(1),
                loaded_at: Instant::now(),
                last_used_ms: AtomicU64::new(0),
            });
            state.used_units = resident.cost_units;
            state.occupant = Some(resident.clone());
            return Ok(LocalLease {
                slot: slot.clone(),
                resident,
            });
        }
    }

    /// Unload residents with no leases that have been idle for at least `idle`.
    /// Slots mid-transition are skipped.
    pub async fn sweep_idle(&self, idle: Duration) -> usize {
        let mut unloaded = 0;
        for slot in &self.slots {
            let Ok(mut state) = slot.state.try_lock() else {
                continue;
            };
            let expired = state.occupant.as_ref().map_or(false, |r| {
                r.refs.load(Ordering::Acquire) == 0 && r.idle_for() >= idle
            });
            if !expired {
                continue;
            }
            if let Some(resident) = state.occupant.take() {
                state.used_units = 0;
                info!(slot = slot.index, "unloading idle {}", resident.backend_id);
                resident.model.unload().await;
                unloaded += 1;
            }
        }
        unloaded
    }

    /// Unload every resident without leases. Used at shutdown.
    pub async fn unload_all(&self) {
        for slot in &self.slots {
            let mut state = slot.state.lock().await;
            let idle = state
                .occupant
                .as_ref()
                .map_or(false, |r| r.refs.load(Ordering::Acquire) == 0);
            if idle {
                if let Some(resident) = state.occupant.take() {
                    state.used_units = 0;
                    resident.model.unload().await;
                }
            }
        }
    }

    pub fn status(&self) -> Vec<SlotStatus> {
        self.slots
            .iter()
            .map(|slot| match slot.state.try_lock() {
                Ok(state) => SlotStatus {
                    index: slot.index,
                    budget_units: slot.budget_units,
                    used_units: Some(state.used_units),
                    occupant: state.occupant.as_ref().map(|r| r.backend_id.to_string()),
                    leases: state
                        .occupant
                        .as_ref()
                        .map_or(0, |r| r.refs.load(Ordering::Acquire)),
                    transitioning: false,
                },
                Err(_) => SlotStatus {
                    index: slot.index,
                    budget_units: slot.budget_units,
                    used_units: None,
                    occupant: None,
                    leases: 0,
                    transitioning: true,
                },
            })
            .collect()
    }
}
