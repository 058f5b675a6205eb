//! Session store
//!
//! Each session lives behind its own async mutex so appends to one
//! conversation are serialized without blocking any other. The map itself is
//! a `DashMap` and is never locked across an await.

use crate::persist::SessionPersistence;
use chatrelay_core::{Error, Message, PersonaId, Result, SessionId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A conversation. Callers only ever see clones.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub persona: PersonaId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

impl Session {
    pub fn new(id: SessionId, persona: PersonaId) -> Self {
        let now = Utc::now();
        Self {
            id,
            persona,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    /// The most recent `window` messages, oldest first.
    pub fn window(&self, window: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(window);
        &self.messages[start..]
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            persona: self.persona.clone(),
            message_count: self.messages.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub persona: PersonaId,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct SessionCell {
    session: Mutex<Session>,
    /// Unix millis of the last access, readable without the lock.
    touched_ms: AtomicI64,
    dirty: AtomicBool,
}

impl SessionCell {
    fn new(session: Session, dirty: bool) -> Self {
        Self {
            touched_ms: AtomicI64::new(session.updated_at.timestamp_millis()),
            session: Mutex::new(session),
            dirty: AtomicBool::new(dirty),
        }
    }

    fn touch(&self) {
        self.touched_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<SessionCell>>,
    persistence: Option<Arc<dyn SessionPersistence>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// In-memory only.
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            persistence: None,
        }
    }

    /// Load every persisted session, then write through on flush and delete.
    pub fn with_persistence(persistence: Arc<dyn SessionPersistence>) -> Result<Self> {
        let sessions = DashMap::new();
        for session in persistence.read_all()? {
            sessions.insert(session.id.clone(), Arc::new(SessionCell::new(session, false)));
        }
        info!("Loaded {} persisted session(s)", sessions.len());
        Ok(Self {
            sessions,
            persistence: Some(persistence),
        })
    }

    fn cell(&self, id: &SessionId) -> Result<Arc<SessionCell>> {
        self.sessions
            .get(id)
            .map(|c| c.clone())
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    fn cell_or_create(&self, id: &SessionId, persona: &PersonaId) -> Arc<SessionCell> {
        self.sessions
            .entry(id.clone())
            .or_insert_with(|| {
                debug!(session = %id, persona = %persona, "session created");
                Arc::new(SessionCell::new(
                    Session::new(id.clone(), persona.clone()),
                    true,
                ))
            })
            .clone()
    }

    pub async fn get_or_create(&self, id: &SessionId, persona: &PersonaId) -> Session {
        let cell = self.cell_or_create(id, persona);
        cell.touch();
        let session = cell.session.lock().await;
        session.clone()
    }

    /// Create a new session. A fresh id is generated when none is given.
    pub fn create(&self, id: Option<SessionId>, persona: &PersonaId) -> Result<Session> {
        let id = id.unwrap_or_else(|| SessionId::new(uuid::Uuid::new_v4().to_string()));
        let session = Session::new(id.clone(), persona.clone());
        match self.sessions.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::InvalidRequest(format!(
                "session {} already exists",
                id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(SessionCell::new(session.clone(), true)));
                Ok(session)
            }
        }
    }

    pub async fn append(&self, id: &SessionId, message: Message) -> Result<()> {
        let cell = self.cell(id)?;
        let mut session = cell.session.lock().await;
        session.updated_at = message.timestamp;
        session.messages.push(message);
        cell.touch();
        cell.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Append a user/assistant exchange. Both land or neither does.
    pub async fn append_pair(&self, id: &SessionId, user: Message, assistant: Message) -> Result<()> {
        let cell = self.cell(id)?;
        push_pair(&cell, user, assistant).await;
        Ok(())
    }

    /// Append an exchange, recreating the session if it was reaped while the
    /// reply was being generated.
    pub async fn record_turn(
        &self,
        id: &SessionId,
        persona: &PersonaId,
        user: Message,
        assistant: Message,
    ) {
        let cell = self.cell_or_create(id, persona);
        push_pair(&cell, user, assistant).await;
    }

    /// Up to `window` most recent messages, oldest first.
    pub async fn history(&self, id: &SessionId, window: usize) -> Result<Vec<Message>> {
        let cell = self.cell(id)?;
        let session = cell.session.lock().await;
        Ok(session.window(window).to_vec())
    }

    pub async fn get(&self, id: &SessionId) -> Option<Session> {
        let cell = self.sessions.get(id).map(|c| c.clone())?;
        let session = cell.session.lock().await;
        Some(session.clone())
    }

    /// Summaries, most recently updated first.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let cells: Vec<Arc<SessionCell>> = self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut summaries = Vec::with_capacity(cells.len());
        for cell in cells {
            summaries.push(cell.session.lock().await.summary());
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    pub fn delete(&self, id: &SessionId) -> bool {
        let removed = self.sessions.remove(id).is_some();
        if removed {
            self.forget(id);
        }
        removed
    }

    /// Drop sessions untouched for longer than `max_age`.
    pub fn reap_expired(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now().timestamp_millis() - max_age.as_millis() as i64;
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|e| e.value().touched_ms.load(Ordering::Relaxed) < cutoff)
            .map(|e| e.key().clone())
            .collect();

        let mut reaped = 0;
        for id in expired {
            // Re-check under the shard lock; the session may have been touched since.
            let removed = self
                .sessions
                .remove_if(&id, |_, cell| cell.touched_ms.load(Ordering::Relaxed) < cutoff)
                .is_some();
            if removed {
                self.forget(&id);
                reaped += 1;
            }
        }
        if reaped > 0 {
            info!("Reaped {} expired session(s)", reaped);
        }
        reaped
    }

    fn forget(&self, id: &SessionId) {
        if let Some(p) = &self.persistence {
            if let Err(e) = p.remove(id) {
                warn!(session = %id, "failed to remove persisted session: {}", e);
            }
        }
    }

    /// Write every modified session to persistence. Returns how many were written.
    pub async fn flush(&self) -> Result<usize> {
        let Some(persistence) = &self.persistence else {
            return Ok(0);
        };
        let dirty: Vec<Arc<SessionCell>> = self
            .sessions
            .iter()
            .filter(|e| e.value().dirty.load(Ordering::Acquire))
            .map(|e| e.value().clone())
            .collect();

        let mut written = 0;
        for cell in dirty {
            let snapshot = {
                let session = cell.session.lock().await;
                cell.dirty.store(false, Ordering::Release);
                session.clone()
            };
            if let Err(e) = persistence.write(&snapshot) {
                cell.dirty.store(true, Ordering::Release);
                return Err(e);
            }
            written += 1;
        }
        if written > 0 {
            debug!("Flushed {} session(s)", written);
        }
        Ok(written)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

async fn push_pair(cell: &SessionCell, user: Message, assistant: Message) {
    let mut session = cell.session.lock().await;
    session.updated_at = assistant.timestamp;
    session.messages.push(user);
    session.messages.push(assistant);
    cell.touch();
    cell.dirty.store(true, Ordering::Release);
}
