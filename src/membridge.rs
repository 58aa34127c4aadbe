//! External memory bridge: optional query-only adapter to an out-of-process
//! memory service.
//!
//! Health-checked with exponential backoff and a circuit breaker; calls carry
//! explicit timeouts (2 s health, 5 s request) and never block the bridge
//! cycle. Outbound sync records queue offline while the service is down.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::advisor::{ExternalMemory, MemorySource};
use crate::event::now_ms;
use crate::persist;

/// Adapter configuration.
#[derive(Debug, Clone)]
pub struct MemBridgeConfig {
    /// Base URL of the memory service, e.g. `http://127.0.0.1:8230`.
    pub base_url: String,
    pub health_timeout: Duration,
    pub request_timeout: Duration,
    /// Backoff ceiling between health probes.
    pub max_backoff: Duration,
}

impl Default for MemBridgeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8230".into(),
            health_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    /// No calls before this instant (ms since epoch).
    next_attempt_ms: u64,
}

#[derive(Debug, Serialize)]
struct QueryBody<'a> {
    text: &'a str,
    limit: usize,
}

#[derive(Debug, Deserialize)]
struct QueryHit {
    text: String,
    #[serde(default)]
    score: f64,
}

/// The adapter itself.
pub struct MemBridge {
    config: MemBridgeConfig,
    agent: ureq::Agent,
    breaker: Mutex<BreakerState>,
    outbox: PathBuf,
}

impl MemBridge {
    pub fn new(config: MemBridgeConfig, outbox: PathBuf) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(config.request_timeout)
            .build();
        Self {
            config,
            agent,
            breaker: Mutex::new(BreakerState::default()),
            outbox,
        }
    }

    /// Whether the circuit currently permits a call.
    fn circuit_closed(&self) -> bool {
        self.breaker.lock().unwrap().next_attempt_ms <= now_ms()
    }

    fn record_success(&self) {
        let mut state = self.breaker.lock().unwrap();
        state.consecutive_failures = 0;
        state.next_attempt_ms = 0;
    }

    /// Exponential backoff with jitter; doubles per consecutive failure.
    fn record_failure(&self) {
        let mut state = self.breaker.lock().unwrap();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let base = 2u64
            .saturating_pow(state.consecutive_failures.min(16))
            .min(self.config.max_backoff.as_secs());
        let jitter_ms = rand::thread_rng().gen_range(0..500);
        state.next_attempt_ms = now_ms() + base * 1_000 + jitter_ms;
        tracing::debug!(
            failures = state.consecutive_failures,
            backoff_secs = base,
            "memory bridge backing off"
        );
    }

    /// GET /health with the short health timeout.
    pub fn health_check(&self) -> bool {
        if !self.circuit_closed() {
            return false;
        }
        let url = format!("{}/health", self.config.base_url);
        let result = self
            .agent
            .get(&url)
            .timeout(self.config.health_timeout)
            .call();
        match result {
            Ok(_) => {
                self.record_success();
                true
            }
            Err(_) => {
                self.record_failure();
                false
            }
        }
    }

    /// Queue an outbound sync record, shipping directly when healthy and
    /// falling back to the offline outbox otherwise.
    pub fn sync_out(&self, record: &serde_json::Value) {
        if self.circuit_closed() {
            let url = format!("{}/sync", self.config.base_url);
            if self.agent.post(&url).send_json(record).is_ok() {
                self.record_success();
                return;
            }
            self.record_failure();
        }
        match serde_json::to_string(record) {
            Ok(line) => {
                if let Err(e) = persist::append_line(&self.outbox, &line) {
                    tracing::warn!(error = %e, "memory bridge outbox append failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "memory bridge record not serializable"),
        }
    }

    /// Replay queued records once the service is healthy again. Returns how
    /// many shipped.
    pub fn drain_outbox(&self) -> usize {
        if !self.circuit_closed() || !self.outbox.exists() {
            return 0;
        }
        let lines = match std::fs::read_to_string(&self.outbox) {
            Ok(contents) => contents,
            Err(_) => return 0,
        };
        let url = format!("{}/sync", self.config.base_url);
        let mut shipped = 0;
        let mut remaining: Vec<&str> = Vec::new();
        for line in lines.lines().filter(|l| !l.trim().is_empty()) {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
                continue;
            };
            if self.agent.post(&url).send_json(&value).is_ok() {
                shipped += 1;
            } else {
                self.record_failure();
                remaining.push(line);
            }
        }
        let rest = if remaining.is_empty() {
            String::new()
        } else {
            let mut s = remaining.join("\n");
            s.push('\n');
            s
        };
        if let Err(e) = persist::write_atomic(&self.outbox, rest.as_bytes()) {
            tracing::warn!(error = %e, "memory bridge outbox rewrite failed");
        }
        shipped
    }
}

impl MemorySource for MemBridge {
    fn query(&self, text: &str, limit: usize) -> Vec<ExternalMemory> {
        if !self.circuit_closed() {
            return Vec::new();
        }
        let url = format!("{}/query", self.config.base_url);
        let body = QueryBody { text, limit };
        let result = self
            .agent
            .post(&url)
            .timeout(self.config.request_timeout)
            .send_json(&body);
        match result {
            Ok(resp) => match resp.into_json::<Vec<QueryHit>>() {
                Ok(hits) => {
                    self.record_success();
                    hits.into_iter()
                        .map(|h| ExternalMemory {
                            text: h.text,
                            score: h.score,
                        })
                        .collect()
                }
                Err(_) => {
                    self.record_failure();
                    Vec::new()
                }
            },
            Err(_) => {
                self.record_failure();
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge(dir: &std::path::Path) -> MemBridge {
        // Point at a closed port so every call fails fast.
        MemBridge::new(
            MemBridgeConfig {
                base_url: "http://127.0.0.1:1".into(),
                health_timeout: Duration::from_millis(100),
                request_timeout: Duration::from_millis(100),
                max_backoff: Duration::from_secs(300),
            },
            dir.join("membridge_outbox.jsonl"),
        )
    }

    #[test]
    fn failed_health_check_opens_circuit() {
        let dir = tempfile::TempDir::new().unwrap();
        let b = bridge(dir.path());
        assert!(!b.health_check());
        // Circuit open: the next probe is skipped without a network call.
        assert!(!b.health_check());
        assert!(b.breaker.lock().unwrap().consecutive_failures >= 1);
    }

    #[test]
    fn query_on_open_circuit_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let b = bridge(dir.path());
        let _ = b.health_check();
        assert!(b.query("anything", 3).is_empty());
    }

    #[test]
    fn sync_out_queues_offline_when_down() {
        let dir = tempfile::TempDir::new().unwrap();
        let b = bridge(dir.path());
        b.sync_out(&serde_json::json!({"kind": "insight", "text": "x"}));
        let contents = std::fs::read_to_string(dir.path().join("membridge_outbox.jsonl")).unwrap();
        assert!(contents.contains("insight"));
    }

    #[test]
    fn drain_outbox_skips_while_circuit_open() {
        let dir = tempfile::TempDir::new().unwrap();
        let b = bridge(dir.path());
        b.sync_out(&serde_json::json!({"n": 1}));
        // The failed sync_out opened the circuit; drain must not spin.
        assert_eq!(b.drain_outbox(), 0);
    }
}
