//! Bounded per-session conversation history.
//!
//! Turns are kept in the shared store as a capped list under
//! `conversation:<session_id>`, trimmed server-side on every append, so any
//! gateway instance serving the session sees the same window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use chatgate_common::util::{capitalize, truncate_with_ellipsis};

use crate::session::SESSION_TTL;
use crate::store::{Clock, KvStore, StoreError, StoreResult, SystemClock};

/// Turns retained per session.
pub const MAX_TURNS: usize = 10;

/// Per-turn content limit in the rendered context.
pub const CONTEXT_CHARS: usize = 200;

const KEY_PREFIX: &str = "conversation:";

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One stored turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Rolling conversation window.
#[derive(Clone)]
pub struct ConversationMemory {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl ConversationMemory {
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

    fn key(session_id: &str) -> String {
        format!("{KEY_PREFIX}{session_id}")
    }

    /// Append a turn, evicting the oldest beyond [`MAX_TURNS`]. Content is stored as given.
    pub async fn append(&self, session_id: &str, role: Role, content: &str) -> StoreResult<()> {
        let turn = ConversationTurn {
            role,
            content: content.to_string(),
            timestamp: self.clock.now(),
        };
        let value =
            serde_json::to_string(&turn).map_err(|e| StoreError::Serialization(e.to_string()))?;

        self.kv
            .push_capped(&Self::key(session_id), &value, MAX_TURNS, self.ttl)
            .await
    }

    /// Stored turns, oldest first. Undecodable entries are skipped.
    pub async fn recent(&self, session_id: &str) -> StoreResult<Vec<ConversationTurn>> {
        let raw = self.kv.list(&Self::key(session_id)).await?;
        let skip = raw.len().saturating_sub(MAX_TURNS);

        Ok(raw
            .iter()
            .skip(skip)
            .filter_map(|item| match serde_json::from_str(item) {
                Ok(turn) => Some(turn),
                Err(e) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %e,
                        "Skipping unreadable turn"
                    );
                    None
                }
            })
            .collect())
    }

    /// Render the window as `Role: content` lines, content clipped to [`CONTEXT_CHARS`].
    pub async fn render_context(&self, session_id: &str) -> StoreResult<String> {
        let turns = self.recent(session_id).await?;
        Ok(render_turns(&turns))
    }
}

/// Render turns as context lines.
pub fn render_turns(turns: &[ConversationTurn]) -> String {
    turns
        .iter()
        .map(|turn| {
            format!(
                "{}: {}",
                capitalize(turn.role.as_str()),
                truncate_with_ellipsis(&turn.content, CONTEXT_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
