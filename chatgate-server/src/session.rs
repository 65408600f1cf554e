//! Ephemeral session lifecycle.
//!
//! A session is a JSON record under `session:<id>` with a one-hour lease.
//! Every touch rewrites the record with the full lease from that moment, so
//! an active client never expires. Nothing is cached in-process: a second
//! connection presenting the same id reads the same record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::store::{Clock, KvStore, StoreError, SystemClock};

/// Lease applied on create and on every touch.
pub const SESSION_TTL: Duration = Duration::from_secs(3600);

const KEY_PREFIX: &str = "session:";

/// Session lookup failures.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Unknown, expired or unreadable session. Terminal for the connection.
    #[error("Invalid session")]
    Invalid,

    /// The shared store could not be reached.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Persisted session record. Timestamps are Unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub created_at: f64,
    pub last_activity: f64,
}

fn unix_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

/// Session operations over the shared store.
#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self::with_clock(kv, Arc::new(SystemClock))
    }

    pub fn with_clock(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            kv,
            clock,
            ttl: SESSION_TTL,
        }
    }

    fn key(id: &str) -> String {
        format!("{KEY_PREFIX}{id}")
    }

    async fn write(&self, session: &Session) -> Result<(), SessionError> {
        let value = serde_json::to_string(session)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.kv
            .set_ex(&Self::key(&session.session_id), &value, self.ttl)
            .await?;
        Ok(())
    }

    /// Create a new session and return its id.
    pub async fn create(&self) -> Result<String, SessionError> {
        let now = unix_seconds(self.clock.now());
        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            created_at: now,
            last_activity: now,
        };
        self.write(&session).await?;

        tracing::info!(session_id = %session.session_id, "Session created");
        Ok(session.session_id)
    }

    /// Look up a live session.
    ///
    /// A pure read: the lease only slides through [`SessionStore::touch`],
    /// which connection authentication calls right after a successful
    /// validation.
    pub async fn validate(&self, id: &str) -> Result<Session, SessionError> {
        if id.trim().is_empty() {
            return Err(SessionError::Invalid);
        }

        let raw = self
            .kv
            .get(&Self::key(id))
            .await?
            .ok_or(SessionError::Invalid)?;

        serde_json::from_str(&raw).map_err(|e| {
            tracing::warn!(session_id = %id, error = %e, "Unreadable session record");
            SessionError::Invalid
        })
    }

    /// Refresh last-activity and reset the lease to the full window.
    ///
    /// Read-modify-write without coordination; concurrent touches race and
    /// the last writer wins.
    pub async fn touch(&self, id: &str) -> Result<Session, SessionError> {
        let mut session = self.validate(id).await?;
        session.last_activity = unix_seconds(self.clock.now());
        self.write(&session).await?;
        Ok(session)
    }
}
