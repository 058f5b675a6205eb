//! File-per-session persistence and the moderation event log

use crate::session::Session;
use chatrelay_core::{ModerationAction, PersonaId, Result, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

pub trait SessionPersistence: Send + Sync {
    fn read_all(&self) -> Result<Vec<Session>>;
    fn write(&self, session: &Session) -> Result<()>;
    fn remove(&self, id: &SessionId) -> Result<()>;
}

/// One `<session id>.json` file per session in a directory.
pub struct JsonDirStore {
    dir: PathBuf,
}

impl JsonDirStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &SessionId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

impl SessionPersistence for JsonDirStore {
    fn read_all(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if SessionId::parse(stem).is_err() {
                warn!("Skipping {}: not a session file", path.display());
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .map_err(chatrelay_core::Error::from)
                .and_then(|s| serde_json::from_str::<Session>(&s).map_err(Into::into));
            match parsed {
                Ok(session) if session.id.as_str() == stem => sessions.push(session),
                Ok(session) => warn!(
                    "Skipping {}: contains session {}",
                    path.display(),
                    session.id
                ),
                Err(e) => warn!("Skipping unreadable session file {}: {}", path.display(), e),
            }
        }
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sessions)
    }

    fn write(&self, session: &Session) -> Result<()> {
        let path = self.path_for(&session.id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(session)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, id: &SessionId) -> Result<()> {
        match std::fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================
// Moderation events
// ============================================================

/// A non-allow moderation decision. Never carries message text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModerationEvent {
    pub created_at: DateTime<Utc>,
    pub session_id: SessionId,
    pub persona: PersonaId,
    pub action: ModerationAction,
    pub categories: Vec<String>,
    pub confidence: f32,
}

pub trait ModerationLog: Send + Sync {
    fn record(&self, event: &ModerationEvent) -> Result<()>;
    /// Up to `limit` of the most recent events, oldest first.
    fn recent(&self, limit: usize) -> Result<Vec<ModerationEvent>>;
}

/// Append-only JSON Lines file, one event per line.
pub struct JsonlModerationLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlModerationLog {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ModerationLog for JsonlModerationLog {
    fn record(&self, event: &ModerationEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<ModerationEvent>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events: Vec<ModerationEvent> = contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str(l) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("Skipping malformed moderation event in {}: {}", self.path.display(), e);
                    None
                }
            })
            .collect();
        let skip = events.len().saturating_sub(limit);
        events.drain(..skip);
        Ok(events)
    }
}
