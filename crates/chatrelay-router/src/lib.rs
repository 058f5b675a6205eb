//! Chatrelay Router - Persona-aware routing of chat turns to generation backends

pub mod backend;
pub mod catalog;
pub mod context;
pub mod moderation;
pub mod orchestrator;
pub mod persist;
pub mod persona;
pub mod session;
pub mod slot;
pub mod usage;

pub use backend::{AvailabilityProbe, BackendRegistry, DefaultProbe, ProbeError};
pub use catalog::{BackendSummary, Catalog, DegradedCatalog, PersonaSummary};
pub use context::{AssembledPrompt, ContextManager};
pub use moderation::{Checker, ClassifierChecker, LengthChecker, ModerationGate, PatternChecker, Verdict};
pub use orchestrator::{
    ChatError, ChatRequest, ChatResult, Components, Orchestrator, OrchestratorConfig, RequestState,
};
pub use persist::{
    JsonDirStore, JsonlModerationLog, ModerationEvent, ModerationLog, SessionPersistence,
};
pub use persona::PersonaRegistry;
pub use session::{Session, SessionStore, SessionSummary};
pub use slot::{Lease, LocalLease, SlotManager, SlotStatus};
pub use usage::{BackendUsage, UsageLedger};
