//! Shared gateway state.

use std::sync::Arc;

use chatgate_common::AgentConfig;

use crate::memory::ConversationMemory;
use crate::metrics::GatewayMetrics;
use crate::provider::ChatBackend;
use crate::session::SessionStore;
use crate::store::{Clock, KvStore, SystemClock};
use crate::tools::ToolGateway;

/// Everything a request handler or connection needs, built once at startup.
pub struct AppState {
    pub store: Arc<dyn KvStore>,
    pub sessions: SessionStore,
    pub memory: ConversationMemory,
    pub backend: Arc<dyn ChatBackend>,
    pub tools: Arc<ToolGateway>,
    pub metrics: Arc<dyn GatewayMetrics>,
    pub agent: AgentConfig,
}

impl AppState {
    pub fn new(
        store: Arc<dyn KvStore>,
        backend: Arc<dyn ChatBackend>,
        tools: Arc<ToolGateway>,
        metrics: Arc<dyn GatewayMetrics>,
        agent: AgentConfig,
    ) -> Self {
        Self::with_clock(store, backend, tools, metrics, agent, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn KvStore>,
        backend: Arc<dyn ChatBackend>,
        tools: Arc<ToolGateway>,
        metrics: Arc<dyn GatewayMetrics>,
        agent: AgentConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sessions: SessionStore::with_clock(store.clone(), clock.clone()),
            memory: ConversationMemory::with_clock(store.clone(), clock),
            store,
            backend,
            tools,
            metrics,
            agent,
        }
    }
}
