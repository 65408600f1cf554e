//! Delta reconciliation for backend text streams.
//!
//! Adapters may report text cumulatively (each fragment repeats everything so
//! far) or incrementally. The reconciler turns either into pure deltas tagged
//! with the turn's response id and a strictly increasing sequence number.

use serde::Serialize;

/// One incremental piece of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamDelta {
    pub response_id: String,
    pub sequence: u64,
    pub text: String,
}

/// Per-turn reconciliation state.
#[derive(Debug)]
pub struct StreamReconciler {
    response_id: String,
    sequence: u64,
    prev: Option<String>,
    anomalies: usize,
}

impl StreamReconciler {
    pub fn new(response_id: impl Into<String>) -> Self {
        Self {
            response_id: response_id.into(),
            sequence: 0,
            prev: None,
            anomalies: 0,
        }
    }

    /// Non-cumulative fragments seen so far.
    pub fn anomalies(&self) -> usize {
        self.anomalies
    }

    /// Claim the next sequence number for an out-of-band event on this response.
    pub fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    /// Start a new backend round. Text comparison restarts; numbering does not.
    pub fn begin_round(&mut self) {
        self.prev = None;
    }

    /// Feed one fragment. Returns `None` when it carries nothing new.
    pub fn push(&mut self, fragment: &str) -> Option<StreamDelta> {
        let delta = match self.prev.as_deref() {
            None => fragment.to_string(),
            Some(prev) => match fragment.strip_prefix(prev) {
                Some(rest) => rest.to_string(),
                None => {
                    self.anomalies += 1;
                    tracing::warn!(
                        response_id = %self.response_id,
                        prev_len = prev.len(),
                        fragment_len = fragment.len(),
                        "Non-cumulative stream fragment, forwarding verbatim"
                    );
                    fragment.to_string()
                }
            },
        };

        self.prev = Some(fragment.to_string());

        if delta.is_empty() {
            return None;
        }

        self.sequence += 1;
        Some(StreamDelta {
            response_id: self.response_id.clone(),
            sequence: self.sequence,
            text: delta,
        })
    }
}
