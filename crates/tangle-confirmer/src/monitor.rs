//! Deduplicated "tell me when bundle B is confirmed" service.
//!
//! Any number of callers may register interest in the same bundle hash; exactly one poller task
//! per hash queries inclusion state. An optional WebSocket push feed completes entries as soon
//! as a confirmation notification arrives, which turns polling into a slow backstop.

use crate::config::MonitorConfig;
use crate::multiapi::MultiEndpointClient;
use crate::stopwatch::Stopwatch;
use crate::trytes::Hash;
use anyhow::Context;
use futures_util::StreamExt;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Invoked once, on its own task, when the bundle is confirmed.
pub type ConfirmationCallback = Box<dyn FnOnce() + Send + 'static>;

/// Handle for removing one registration again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MonitorError {
    #[error("confirmation watch for {0} was cancelled")]
    Cancelled(Hash),
}

type Callbacks = Vec<(RegistrationId, ConfirmationCallback)>;

/// The one poller task serving a hash. It outlives a cancelled entry until it next wakes, and
/// registrations arriving meanwhile adopt it instead of starting another.
struct Poller {
    id: u64,
    wake: Arc<Notify>,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<Hash, Callbacks>,
    pollers: HashMap<Hash, Poller>,
}

impl Registry {
    fn wake(&self, hash: &Hash) {
        if let Some(poller) = self.pollers.get(hash) {
            poller.wake.notify_one();
        }
    }
}

struct Shared {
    api: Arc<MultiEndpointClient>,
    stopwatch: Arc<Stopwatch>,
    config: MonitorConfig,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    push_connected: AtomicBool,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop poller `id` unless someone is still waiting on `hash`. Returns true if it must exit.
    fn retire(&self, hash: &Hash, id: u64) -> bool {
        let mut registry = self.lock();
        if registry.entries.contains_key(hash) {
            return false;
        }
        if registry.pollers.get(hash).map_or(false, |p| p.id == id) {
            registry.pollers.remove(hash);
        }
        true
    }

    /// Remove the entry and fire its callbacks, each on its own task.
    /// Must be called from within a tokio runtime.
    fn complete(&self, hash: &Hash, source: &'static str) -> bool {
        let callbacks = {
            let mut registry = self.lock();
            let callbacks = registry.entries.remove(hash);
            if callbacks.is_some() {
                registry.wake(hash);
            }
            callbacks
        };
        let Some(callbacks) = callbacks else {
            return false;
        };
        self.stopwatch.stop(hash.as_str());
        tracing::info!(bundle = %hash, source, callbacks = callbacks.len(), "bundle confirmed");
        for (_, callback) in callbacks {
            tokio::spawn(async move { callback() });
        }
        true
    }
}

/// Clears the poller record if the task ends without retiring, e.g. on runtime shutdown.
struct PollerGuard {
    shared: Arc<Shared>,
    bundle: Hash,
    id: u64,
}

impl Drop for PollerGuard {
    fn drop(&mut self) {
        let mut registry = self.shared.lock();
        if registry.pollers.get(&self.bundle).map_or(false, |p| p.id == self.id) {
            registry.pollers.remove(&self.bundle);
        }
    }
}

/// Cheap to clone; all clones share the same registry.
#[derive(Clone)]
pub struct ConfirmationMonitor {
    shared: Arc<Shared>,
}

impl ConfirmationMonitor {
    pub fn new(api: Arc<MultiEndpointClient>, stopwatch: Arc<Stopwatch>, config: MonitorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                api,
                stopwatch,
                config,
                registry: Mutex::new(Registry::default()),
                next_id: AtomicU64::new(1),
                push_connected: AtomicBool::new(false),
            }),
        }
    }

    /// Register `callback` for `bundle`, starting the bundle's poller if it has none.
    /// Must be called from within a tokio runtime.
    pub fn on_confirmation(&self, bundle: Hash, callback: ConfirmationCallback) -> RegistrationId {
        let id = RegistrationId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let new_poller = {
            let mut registry = self.shared.lock();
            registry
                .entries
                .entry(bundle.clone())
                .or_default()
                .push((id, callback));
            if registry.pollers.contains_key(&bundle) {
                None
            } else {
                let wake = Arc::new(Notify::new());
                registry.pollers.insert(
                    bundle.clone(),
                    Poller {
                        id: id.0,
                        wake: Arc::clone(&wake),
                    },
                );
                Some((id.0, wake))
            }
        };
        if let Some((poller_id, wake)) = new_poller {
            tracing::debug!(bundle = %bundle, "starting confirmation poller");
            tokio::spawn(poll_loop(Arc::clone(&self.shared), bundle, poller_id, wake));
        }
        id
    }

    /// Block until `bundle` is confirmed.
    pub async fn wait_for_confirmation(&self, bundle: Hash) -> Result<(), MonitorError> {
        let (tx, rx) = oneshot::channel();
        self.on_confirmation(
            bundle.clone(),
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        rx.await.map_err(|_| MonitorError::Cancelled(bundle))
    }

    /// Remove one registration; the entry (and its poller) goes away with the last one.
    pub fn cancel_registration(&self, bundle: &Hash, id: RegistrationId) -> bool {
        let mut registry = self.shared.lock();
        let Some(callbacks) = registry.entries.get_mut(bundle) else {
            return false;
        };
        let before = callbacks.len();
        callbacks.retain(|(rid, _)| *rid != id);
        let removed = callbacks.len() != before;
        if callbacks.is_empty() {
            registry.entries.remove(bundle);
            registry.wake(bundle);
        }
        removed
    }

    /// Drop every registration for `bundle`. Pending waiters see [MonitorError::Cancelled].
    /// Must not be called synchronously from a callback of this monitor.
    pub fn cancel_confirmation_polling(&self, bundle: &Hash) -> bool {
        let callbacks = {
            let mut registry = self.shared.lock();
            let callbacks = registry.entries.remove(bundle);
            registry.wake(bundle);
            callbacks
        };
        match callbacks {
            Some(_) => {
                tracing::debug!(bundle = %bundle, "confirmation polling cancelled");
                true
            }
            None => false,
        }
    }

    /// Complete `bundle` as if its inclusion had just been observed. Callbacks are spawned, so
    /// this must be called from within a tokio runtime.
    pub fn notify_confirmed(&self, bundle: &Hash) -> bool {
        self.shared.complete(bundle, "push")
    }

    pub fn is_watching(&self, bundle: &Hash) -> bool {
        self.shared.lock().entries.contains_key(bundle)
    }

    pub fn registrations(&self, bundle: &Hash) -> usize {
        self.shared
            .lock()
            .entries
            .get(bundle)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Number of live poller tasks; at most one per hash.
    pub fn active_pollers(&self) -> usize {
        self.shared.lock().pollers.len()
    }

    pub fn push_connected(&self) -> bool {
        self.shared.push_connected.load(Ordering::SeqCst)
    }

    /// Spawn the push feed if a URL is configured.
    pub fn spawn_push_feed(&self) -> Option<JoinHandle<()>> {
        let url = self.shared.config.push_url.clone()?;
        let monitor = self.clone();
        Some(tokio::spawn(async move { monitor.run_push_feed(url).await }))
    }

    /// Follow the push feed forever, reconnecting with backoff.
    pub async fn run_push_feed(&self, url: String) {
        let reconnection = self.shared.config.reconnection.clone();
        let initial = Duration::from_secs(reconnection.initial_backoff_secs);
        let max = Duration::from_secs(reconnection.max_backoff_secs);
        let mut backoff = initial;
        loop {
            let result = self.push_once(&url).await;
            self.shared.push_connected.store(false, Ordering::SeqCst);
            match result {
                Ok(()) => {
                    backoff = initial;
                    sleep(initial).await;
                }
                Err(e) => {
                    tracing::warn!(reason = %e, "push feed failed, reconnecting...");
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
                    sleep(backoff + jitter).await;
                    backoff = std::cmp::min(backoff * 2, max);
                }
            }
        }
    }

    async fn push_once(&self, url: &str) -> anyhow::Result<()> {
        let (ws_stream, _) = connect_async(url).await.context("WS connect")?;
        let (_, mut ws_receiver) = ws_stream.split();
        self.shared.push_connected.store(true, Ordering::SeqCst);
        tracing::info!(url, "push feed connected");
        while let Some(msg) = ws_receiver.next().await {
            let text = match msg.map_err(|e| anyhow::anyhow!("ws: {}", e))? {
                Message::Text(t) => t,
                Message::Close(_) => break,
                _ => continue,
            };
            for line in text.lines() {
                if let Some(bundle) = parse_confirmation_notice(line) {
                    if self.is_watching(&bundle) {
                        self.notify_confirmed(&bundle);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Extract the bundle hash from an `sn` notification:
/// `sn <milestoneIndex> <txHash> <address> <trunk> <branch> <bundle>`.
pub fn parse_confirmation_notice(line: &str) -> Option<Hash> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "sn" {
        return None;
    }
    Hash::new(parts.nth(5)?).ok()
}

async fn poll_loop(shared: Arc<Shared>, bundle: Hash, id: u64, wake: Arc<Notify>) {
    let _guard = PollerGuard {
        shared: Arc::clone(&shared),
        bundle: bundle.clone(),
        id,
    };
    // Set after a confirmation so late registrations are served without waiting a full interval.
    let mut recheck = false;
    loop {
        if !recheck {
            let interval = shared
                .config
                .poll_interval(shared.push_connected.load(Ordering::SeqCst));
            tokio::select! {
                _ = sleep(interval) => {}
                _ = wake.notified() => {}
            }
        }
        recheck = false;
        if shared.retire(&bundle, id) {
            tracing::debug!(bundle = %bundle, "confirmation poller exiting");
            return;
        }
        match shared.api.is_bundle_confirmed(&bundle).await {
            Ok(reply) if reply.value => {
                shared.complete(&bundle, "poll");
                recheck = true;
            }
            Ok(reply) => {
                tracing::debug!(bundle = %bundle, endpoint = %reply.endpoint, "bundle not confirmed yet");
            }
            Err(e) => {
                tracing::warn!(bundle = %bundle, reason = %e, "inclusion poll failed");
            }
        }
    }
}
