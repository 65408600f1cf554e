//! Gateway counters.
//!
//! The connection and turn code only calls the [`GatewayMetrics`] hook;
//! [`CounterMetrics`] is the in-process implementation rendered at `/metrics`.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

/// Call-out hook for connection and turn events.
pub trait GatewayMetrics: Send + Sync {
    fn connection_opened(&self);
    fn connection_closed(&self);
    fn message_processed(&self);
    fn provider_error(&self, provider: &str);
    fn http_request(&self, method: &str, path: &str);

    /// Prometheus text exposition of the current values.
    fn render(&self) -> String;
}

/// Atomic counters with Prometheus text rendering.
#[derive(Debug, Default)]
pub struct CounterMetrics {
    connections_total: AtomicU64,
    active_connections: AtomicI64,
    messages_processed: AtomicU64,
    provider_errors: Mutex<BTreeMap<String, u64>>,
    http_requests: Mutex<BTreeMap<(String, String), u64>>,
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn connections_total(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    pub fn provider_errors(&self, provider: &str) -> u64 {
        self.provider_errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(provider)
            .copied()
            .unwrap_or(0)
    }
}

impl GatewayMetrics for CounterMetrics {
    fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    fn message_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    fn provider_error(&self, provider: &str) {
        *self
            .provider_errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(provider.to_string())
            .or_default() += 1;
    }

    fn http_request(&self, method: &str, path: &str) {
        *self
            .http_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry((method.to_string(), path.to_string()))
            .or_default() += 1;
    }

    fn render(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "# HELP http_requests_total Total HTTP requests");
        let _ = writeln!(out, "# TYPE http_requests_total counter");
        for ((method, path), count) in self
            .http_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            let _ = writeln!(
                out,
                "http_requests_total{{method=\"{method}\",endpoint=\"{path}\"}} {count}"
            );
        }

        let _ = writeln!(out, "# HELP websocket_connections_total Total WebSocket connections");
        let _ = writeln!(out, "# TYPE websocket_connections_total counter");
        let _ = writeln!(out, "websocket_connections_total {}", self.connections_total());

        let _ = writeln!(out, "# HELP active_websockets Active WebSocket connections");
        let _ = writeln!(out, "# TYPE active_websockets gauge");
        let _ = writeln!(out, "active_websockets {}", self.active_connections());

        let _ = writeln!(out, "# HELP messages_processed_total Total chat messages processed");
        let _ = writeln!(out, "# TYPE messages_processed_total counter");
        let _ = writeln!(out, "messages_processed_total {}", self.messages_processed());

        let _ = writeln!(out, "# HELP ai_provider_errors_total AI provider errors");
        let _ = writeln!(out, "# TYPE ai_provider_errors_total counter");
        for (provider, count) in self
            .provider_errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            let _ = writeln!(out, "ai_provider_errors_total{{provider=\"{provider}\"}} {count}");
        }

        out
    }
}
