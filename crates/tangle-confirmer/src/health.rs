//! Per-endpoint error accounting.
//!
//! A counter, not a circuit breaker: nothing here ever blocks a call or fails. Every call site
//! in [crate::multiapi] reports through [EndpointHealth::record_outcome].
//!
//! Outcomes are keyed by the [EndpointHandle] returned at registration, not by URL, so one node
//! listed in several sets is counted under each set's label separately.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Label reported for endpoints that were never registered.
pub const UNREGISTERED_LABEL: &str = "???";

/// Keep at most this many recent error timestamps per label.
pub const MAX_RECENT_ERRORS: usize = 100;

/// Recent errors older than this are pruned.
pub const RECENT_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Snapshot of one label's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EndpointStats {
    pub calls: u64,
    pub errors: u64,
    /// Errors inside [RECENT_WINDOW], capped at [MAX_RECENT_ERRORS].
    pub recent_errors: usize,
}

#[derive(Default)]
struct LabelCounters {
    calls: u64,
    errors: u64,
    recent: VecDeque<Instant>,
}

impl LabelCounters {
    fn prune(&mut self, now: Instant) {
        while self.recent.len() > MAX_RECENT_ERRORS {
            self.recent.pop_front();
        }
        while let Some(&t) = self.recent.front() {
            if now.duration_since(t) > RECENT_WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}

/// One registration of an endpoint under a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointHandle(u64);

struct Registration {
    endpoint: String,
    label: String,
}

#[derive(Default)]
struct Inner {
    next_handle: u64,
    registrations: HashMap<EndpointHandle, Registration>,
    counters: HashMap<String, LabelCounters>,
}

/// Shared error tracker. Construct once and hand out `Arc<EndpointHealth>`.
#[derive(Default)]
pub struct EndpointHealth {
    inner: Mutex<Inner>,
}

impl EndpointHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint under the label its outcomes are counted under.
    pub fn register_endpoint(&self, endpoint: &str, label: &str) -> EndpointHandle {
        let mut inner = self.lock();
        inner.next_handle += 1;
        let handle = EndpointHandle(inner.next_handle);
        inner.registrations.insert(
            handle,
            Registration {
                endpoint: endpoint.to_string(),
                label: label.to_string(),
            },
        );
        inner.counters.entry(label.to_string()).or_default();
        handle
    }

    /// Account one call outcome. Returns true iff `err` is set.
    pub fn record_outcome<E: fmt::Display + ?Sized>(
        &self,
        handle: EndpointHandle,
        err: Option<&E>,
    ) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        let (endpoint, label) = match inner.registrations.get(&handle) {
            Some(r) => (r.endpoint.clone(), r.label.clone()),
            None => (String::new(), UNREGISTERED_LABEL.to_string()),
        };
        let counters = inner.counters.entry(label.clone()).or_default();
        counters.calls += 1;
        match err {
            None => {
                counters.prune(now);
                false
            }
            Some(e) => {
                counters.errors += 1;
                counters.recent.push_back(now);
                counters.prune(now);
                tracing::debug!(endpoint = %endpoint, label = %label, reason = %e, "endpoint call failed");
                true
            }
        }
    }

    pub fn stats(&self, label: &str) -> EndpointStats {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.counters.get_mut(label) {
            Some(c) => {
                c.prune(now);
                EndpointStats {
                    calls: c.calls,
                    errors: c.errors,
                    recent_errors: c.recent.len(),
                }
            }
            None => EndpointStats::default(),
        }
    }

    /// All labels with their current counters, sorted by label.
    pub fn snapshot(&self) -> Vec<(String, EndpointStats)> {
        let mut labels: Vec<String> = self.lock().counters.keys().cloned().collect();
        labels.sort();
        labels
            .into_iter()
            .map(|l| {
                let s = self.stats(&l);
                (l, s)
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
