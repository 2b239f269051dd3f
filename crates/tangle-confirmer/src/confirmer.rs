//! Confirmer: per-bundle promote/reattach state machine.
//!
//! [Confirmer::start_task] spawns three worker loops and a supervisor:
//!
//! - **promotability**: checks the current tail's consistency and flags the task as not
//!   promotable when the node reports a conflict (a tail that is merely not solid still counts
//!   as promotable). Runs at half rate once [LoadGauge] reaches the slow-down threshold.
//! - **promote**: when promotable and due, attaches a zero-value promotion referencing the
//!   current tail. With `promote_chain` the promotion's tail becomes the next reference.
//! - **reattach**: when not promotable or past the forced-reattach deadline, re-runs
//!   proof-of-work on the whole bundle against fresh tips.
//! - **supervisor**: waits on the [ConfirmationMonitor]; on confirmation emits the single
//!   `Confirm` update, stops the workers, joins them, and only then lets the update stream close.
//!
//! All task fields live behind one async mutex. A promote or reattach decision holds it for
//! the whole attempt, so their network side effects never interleave on the same task.

use crate::config::{ConfirmerConfig, MIN_WEIGHT_MAGNITUDE};
use crate::monitor::{ConfirmationMonitor, MonitorError};
use crate::multiapi::{ApiError, LedgerApis};
use crate::node::{PrepareOptions, Transfer};
use crate::stopwatch::{unix_millis, Stopwatch};
use crate::trytes::{tail_of, Hash, TrytesError};
use crate::update::{ConfirmerUpdate, UpdateKind, UpdateStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

#[derive(Debug, Error)]
pub enum ConfirmerError {
    #[error("invalid bundle: {0}")]
    InvalidBundle(#[from] TrytesError),
    #[error("a confirmation task is already running")]
    AlreadyRunning,
    #[error("inconsistent bundle: tracking {expected}, attachment carries {actual}")]
    InconsistentBundle { expected: Hash, actual: Hash },
    #[error("malformed attachment: {0}")]
    MalformedAttachment(TrytesError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Process-wide count of running promotability loops, shared by every [Confirmer].
#[derive(Debug, Default)]
pub struct LoadGauge {
    running: Arc<AtomicUsize>,
}

impl LoadGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    fn enter(&self) -> CountGuard {
        CountGuard::new(Arc::clone(&self.running))
    }
}

/// Increments a counter for its lifetime.
struct CountGuard(Arc<AtomicUsize>);

impl CountGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for CountGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Confirmed,
    Cancelled,
}

struct TaskState {
    phase: Phase,
    current_tail: Hash,
    current_trytes: Vec<String>,
    next_promo_time: Instant,
    next_force_reattach_time: Instant,
    is_not_promotable: bool,
    num_attach: u64,
    num_promote: u64,
    total_pow_ms: u64,
    total_tipsel_ms: u64,
}

impl TaskState {
    fn update(&self, kind: UpdateKind, error: Option<String>) -> ConfirmerUpdate {
        ConfirmerUpdate {
            num_attaches: self.num_attach,
            num_promotions: self.num_promote,
            total_duration_att_ms: self.total_pow_ms,
            total_duration_gtta_ms: self.total_tipsel_ms,
            update_time: unix_millis(),
            kind,
            error,
        }
    }
}

/// Resolves once the watched flag is set (or its sender is gone).
struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    fn is_set(&self) -> bool {
        *self.0.borrow()
    }

    async fn recv(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }

    /// Like [Shutdown::recv], but a dropped sender means "never".
    async fn requested(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

struct Task {
    bundle_hash: Hash,
    promote_address: Hash,
    config: Arc<ConfirmerConfig>,
    apis: LedgerApis,
    load: Arc<LoadGauge>,
    state: Mutex<TaskState>,
    updates: mpsc::Sender<ConfirmerUpdate>,
    /// Tells the worker loops to exit. Set by the supervisor only.
    stop: watch::Sender<bool>,
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

impl Task {
    /// Send an update unless the task has left `Running`. Gives up on a stalled consumer
    /// after the configured timeout, and immediately once the loops are told to stop.
    async fn emit(
        &self,
        st: &TaskState,
        kind: UpdateKind,
        error: Option<String>,
        shutdown: &mut Shutdown,
    ) {
        if st.phase != Phase::Running || shutdown.is_set() {
            return;
        }
        let update = st.update(kind, error);
        let limit = self.config.update_send_timeout();
        tokio::select! {
            res = self.updates.send_timeout(update, limit) => match res {
                Ok(()) => {}
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    tracing::error!(bundle = %self.bundle_hash, ?kind, "update consumer stalled, event dropped");
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    tracing::warn!(bundle = %self.bundle_hash, ?kind, "update stream dropped by consumer");
                }
            },
            _ = shutdown.recv() => {}
        }
    }

    async fn promote(&self, st: &mut TaskState) -> Result<(), ConfirmerError> {
        let transfer = Transfer {
            address: self.promote_address.clone(),
            value: 0,
            tag: self.config.promote_tag.clone(),
            message: String::new(),
        };
        let prepared = self
            .apis
            .general
            .prepare_transfers(&self.config.promote_seed, &[transfer], &PrepareOptions::default())
            .await?;
        let tips = self.apis.tipsel.select_tips(self.config.tip_depth).await?;
        st.total_tipsel_ms += millis(tips.duration);

        let reference = st.current_tail.clone();
        let attached = self
            .apis
            .pow
            .attach_to_tangle(&reference, &tips.value.branch, MIN_WEIGHT_MAGNITUDE, &prepared.value)
            .await?;
        st.total_pow_ms += millis(attached.duration);
        let promo_tail = tail_of(&attached.value).map_err(ConfirmerError::MalformedAttachment)?;

        self.apis.general.store_and_broadcast(&attached.value).await?;

        st.num_promote += 1;
        if self.config.promote_chain {
            st.current_tail = promo_tail.hash.clone();
        }
        st.next_promo_time = Instant::now() + self.config.promote_every();
        tracing::info!(
            bundle = %self.bundle_hash,
            reference = %reference,
            promotion = %promo_tail.hash,
            num_promote = st.num_promote,
            "promoted"
        );
        Ok(())
    }

    async fn reattach(&self, st: &mut TaskState) -> Result<(), ConfirmerError> {
        let tips = self.apis.tipsel.select_tips(self.config.tip_depth).await?;
        st.total_tipsel_ms += millis(tips.duration);

        let attached = self
            .apis
            .pow
            .attach_to_tangle(
                &tips.value.trunk,
                &tips.value.branch,
                MIN_WEIGHT_MAGNITUDE,
                &st.current_trytes,
            )
            .await?;
        st.total_pow_ms += millis(attached.duration);
        let tail = tail_of(&attached.value).map_err(ConfirmerError::MalformedAttachment)?;
        if tail.bundle != self.bundle_hash {
            return Err(ConfirmerError::InconsistentBundle {
                expected: self.bundle_hash.clone(),
                actual: tail.bundle,
            });
        }

        self.apis.general.store_and_broadcast(&attached.value).await?;

        let now = Instant::now();
        st.num_attach += 1;
        st.current_tail = tail.hash;
        st.current_trytes = attached.value;
        st.next_force_reattach_time = now + self.config.force_reattach_after();
        st.next_promo_time = now;
        st.is_not_promotable = false;
        tracing::info!(
            bundle = %self.bundle_hash,
            tail = %st.current_tail,
            num_attach = st.num_attach,
            "reattached"
        );
        Ok(())
    }
}

async fn promotability_loop(task: Arc<Task>, mut shutdown: Shutdown, _alive: CountGuard) {
    let _load = task.load.enter();
    loop {
        let tail = {
            let st = task.state.lock().await;
            if st.phase != Phase::Running {
                return;
            }
            st.current_tail.clone()
        };
        match task
            .apis
            .general
            .check_consistency(std::slice::from_ref(&tail))
            .await
        {
            Ok(reply) => {
                let promotable = reply.value.is_promotable();
                let mut st = task.state.lock().await;
                // A reattachment in the meantime makes this answer stale.
                if st.current_tail == tail {
                    st.is_not_promotable = !promotable;
                }
                if !promotable {
                    tracing::info!(bundle = %task.bundle_hash, tail = %tail, info = %reply.value.info, "tail not promotable");
                }
            }
            Err(e) => {
                tracing::warn!(bundle = %task.bundle_hash, reason = %e, "consistency check failed");
            }
        }
        let interval = task.config.promotability_interval(task.load.running());
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = sleep(interval) => {}
        }
    }
}

async fn promote_loop(task: Arc<Task>, mut shutdown: Shutdown, _alive: CountGuard) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = sleep(task.config.promote_tick()) => {}
        }
        let mut st = task.state.lock().await;
        if st.phase != Phase::Running {
            return;
        }
        if st.is_not_promotable || Instant::now() < st.next_promo_time {
            continue;
        }
        match task.promote(&mut st).await {
            Ok(()) => {
                task.emit(&st, UpdateKind::Promote, None, &mut shutdown).await;
            }
            Err(e) => {
                tracing::warn!(bundle = %task.bundle_hash, reason = %e, "promotion failed");
                task.emit(&st, UpdateKind::NoAction, Some(e.to_string()), &mut shutdown)
                    .await;
                drop(st);
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = sleep(task.config.error_backoff()) => {}
                }
            }
        }
    }
}

async fn reattach_loop(task: Arc<Task>, mut shutdown: Shutdown, _alive: CountGuard) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = sleep(task.config.reattach_tick()) => {}
        }
        let mut st = task.state.lock().await;
        if st.phase != Phase::Running {
            return;
        }
        if !st.is_not_promotable && Instant::now() <= st.next_force_reattach_time {
            continue;
        }
        match task.reattach(&mut st).await {
            Ok(()) => {
                task.emit(&st, UpdateKind::Reattach, None, &mut shutdown).await;
            }
            Err(e) => {
                if matches!(e, ConfirmerError::InconsistentBundle { .. }) {
                    tracing::error!(bundle = %task.bundle_hash, reason = %e, "reattachment rejected");
                } else {
                    tracing::warn!(bundle = %task.bundle_hash, reason = %e, "reattachment failed");
                }
                task.emit(&st, UpdateKind::NoAction, Some(e.to_string()), &mut shutdown)
                    .await;
                drop(st);
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = sleep(task.config.error_backoff()) => {}
                }
            }
        }
    }
}

/// Wait for confirmation or cancellation, then tear the task down in order:
/// final update, stop workers, join workers, release the update sender.
async fn supervise(
    task: Arc<Task>,
    monitor: ConfirmationMonitor,
    stopwatch: Arc<Stopwatch>,
    workers: Vec<JoinHandle<()>>,
    mut cancel: Shutdown,
    running: Arc<AtomicBool>,
    _alive: CountGuard,
) {
    let hash = task.bundle_hash.clone();
    let confirmed = loop {
        let (tx, rx) = oneshot::channel();
        let registration = monitor.on_confirmation(
            hash.clone(),
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        tokio::select! {
            res = rx => match res {
                Ok(()) => break true,
                Err(_) => {
                    tracing::warn!(bundle = %hash, "confirmation watch dropped externally, re-registering");
                }
            },
            _ = cancel.requested() => {
                monitor.cancel_registration(&hash, registration);
                break false;
            }
        }
    };

    if confirmed {
        let mut st = task.state.lock().await;
        st.phase = Phase::Confirmed;
        task.stop.send_replace(true);
        let update = st.update(UpdateKind::Confirm, None);
        let limit = task.config.update_send_timeout();
        tokio::select! {
            res = task.updates.send_timeout(update, limit) => {
                if res.is_err() {
                    tracing::error!(bundle = %hash, "confirm update could not be delivered");
                }
            }
            _ = cancel.requested() => {}
        }
        tracing::info!(
            bundle = %hash,
            num_attach = st.num_attach,
            num_promote = st.num_promote,
            "bundle confirmed"
        );
    } else {
        task.stop.send_replace(true);
        task.state.lock().await.phase = Phase::Cancelled;
        if let Some((started, stopped)) = stopwatch.get_and_remove(hash.as_str()) {
            tracing::debug!(bundle = %hash, elapsed_ms = stopped - started, "task cancelled");
        }
    }

    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!(bundle = %hash, reason = %e, "confirmer loop panicked");
        }
    }
    running.store(false, Ordering::SeqCst);
    // Dropping the last `Arc<Task>` here closes the update stream.
}

/// Stops a running task.
pub struct CancelHandle {
    cancel: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

impl CancelHandle {
    /// Signal every loop and wait until all of them have exited.
    /// Dropping the handle without calling this leaves the task running.
    pub async fn cancel(self) {
        self.cancel.send_replace(true);
        if let Err(e) = self.supervisor.await {
            tracing::error!(reason = %e, "confirmer supervisor panicked");
        }
    }

    /// True once the task has fully torn down (confirmed or cancelled).
    pub fn is_finished(&self) -> bool {
        self.supervisor.is_finished()
    }
}

/// Confirmation engine; runs at most one task at a time.
pub struct Confirmer {
    config: Arc<ConfirmerConfig>,
    promote_address: Hash,
    apis: LedgerApis,
    monitor: ConfirmationMonitor,
    stopwatch: Arc<Stopwatch>,
    load: Arc<LoadGauge>,
    running: Arc<AtomicBool>,
    active_loops: Arc<AtomicUsize>,
    bundle_hash: std::sync::Mutex<Option<Hash>>,
}

impl Confirmer {
    pub fn new(
        config: ConfirmerConfig,
        apis: LedgerApis,
        monitor: ConfirmationMonitor,
        stopwatch: Arc<Stopwatch>,
        load: Arc<LoadGauge>,
    ) -> Result<Self, ConfirmerError> {
        config.validate().map_err(ConfirmerError::InvalidConfig)?;
        let promote_address = Hash::new(config.promote_address.clone())
            .map_err(|e| ConfirmerError::InvalidConfig(format!("promote_address: {e}")))?;
        Ok(Self {
            config: Arc::new(config),
            promote_address,
            apis,
            monitor,
            stopwatch,
            load,
            running: Arc::new(AtomicBool::new(false)),
            active_loops: Arc::new(AtomicUsize::new(0)),
            bundle_hash: std::sync::Mutex::new(None),
        })
    }

    /// Start confirming `bundle_trytes`. Must be called from within a tokio runtime.
    ///
    /// The returned stream ends after the `Confirm` update, or after [CancelHandle::cancel].
    pub fn start_task(
        &self,
        bundle_trytes: Vec<String>,
    ) -> Result<(UpdateStream, CancelHandle), ConfirmerError> {
        let tail = tail_of(&bundle_trytes)?;
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ConfirmerError::AlreadyRunning);
        }

        let now = Instant::now();
        let bundle_hash = tail.bundle.clone();
        let state = TaskState {
            phase: Phase::Running,
            current_tail: tail.hash.clone(),
            current_trytes: bundle_trytes,
            next_promo_time: now,
            next_force_reattach_time: now + self.config.force_reattach_after(),
            is_not_promotable: false,
            num_attach: 0,
            num_promote: 0,
            total_pow_ms: 0,
            total_tipsel_ms: 0,
        };
        let (updates_tx, updates_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = Arc::new(Task {
            bundle_hash: bundle_hash.clone(),
            promote_address: self.promote_address.clone(),
            config: Arc::clone(&self.config),
            apis: self.apis.clone(),
            load: Arc::clone(&self.load),
            state: Mutex::new(state),
            updates: updates_tx,
            stop: stop_tx,
        });

        if !self.stopwatch.start(bundle_hash.as_str()) {
            tracing::warn!(bundle = %bundle_hash, "stale stopwatch entry, restarting it");
            self.stopwatch.get_and_remove(bundle_hash.as_str());
            self.stopwatch.start(bundle_hash.as_str());
        }
        if let Ok(mut slot) = self.bundle_hash.lock() {
            *slot = Some(bundle_hash.clone());
        }

        let workers = vec![
            tokio::spawn(promotability_loop(
                Arc::clone(&task),
                Shutdown(stop_rx.clone()),
                self.loop_guard(),
            )),
            tokio::spawn(promote_loop(
                Arc::clone(&task),
                Shutdown(stop_rx.clone()),
                self.loop_guard(),
            )),
            tokio::spawn(reattach_loop(
                Arc::clone(&task),
                Shutdown(stop_rx),
                self.loop_guard(),
            )),
        ];
        let supervisor = tokio::spawn(supervise(
            task,
            self.monitor.clone(),
            Arc::clone(&self.stopwatch),
            workers,
            Shutdown(cancel_rx),
            Arc::clone(&self.running),
            self.loop_guard(),
        ));
        tracing::info!(bundle = %bundle_hash, tail = %tail.hash, "confirmation task started");

        Ok((
            UpdateStream::new(updates_rx),
            CancelHandle {
                cancel: cancel_tx,
                supervisor,
            },
        ))
    }

    /// Block until `bundle` is confirmed, independently of any task.
    pub async fn wait_for_confirmation(&self, bundle: Hash) -> Result<(), MonitorError> {
        self.monitor.wait_for_confirmation(bundle).await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bundle hash of the most recently started task.
    pub fn bundle_hash(&self) -> Option<Hash> {
        self.bundle_hash.lock().ok().and_then(|h| h.clone())
    }

    /// Live loop tasks of this engine, supervisor included.
    pub fn active_loops(&self) -> usize {
        self.active_loops.load(Ordering::SeqCst)
    }

    fn loop_guard(&self) -> CountGuard {
        CountGuard::new(Arc::clone(&self.active_loops))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_guard_tracks_lifetime() {
        let gauge = LoadGauge::new();
        let a = gauge.enter();
        let b = gauge.enter();
        assert_eq!(gauge.running(), 2);
        drop(a);
        assert_eq!(gauge.running(), 1);
        drop(b);
        assert_eq!(gauge.running(), 0);
    }

    #[tokio::test]
    async fn shutdown_resolves_after_flag_set() {
        let (tx, rx) = watch::channel(false);
        let mut shutdown = Shutdown(rx);
        assert!(!shutdown.is_set());
        tx.send_replace(true);
        shutdown.recv().await;
        assert!(shutdown.is_set());
    }

    #[tokio::test]
    async fn shutdown_resolves_when_sender_dropped() {
        let (tx, rx) = watch::channel(false);
        let mut shutdown = Shutdown(rx);
        drop(tx);
        shutdown.recv().await;
    }

    #[test]
    fn dropped_cancel_sender_never_requests_cancel() {
        let (tx, rx) = watch::channel(false);
        let mut shutdown = Shutdown(rx);
        let mut requested = tokio_test::task::spawn(shutdown.requested());
        tokio_test::assert_pending!(requested.poll());
        drop(tx);
        tokio_test::assert_pending!(requested.poll());
    }

    #[test]
    fn cancel_request_is_observed() {
        let (tx, rx) = watch::channel(false);
        let mut shutdown = Shutdown(rx);
        let mut requested = tokio_test::task::spawn(shutdown.requested());
        tokio_test::assert_pending!(requested.poll());
        tx.send_replace(true);
        assert!(requested.is_woken());
        tokio_test::assert_ready!(requested.poll());
    }
}
