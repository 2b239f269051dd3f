//! Named start/stop timers, keyed by bundle hash in practice.
//!
//! The engine starts a watch when a task begins, the confirmation monitor stops it when the
//! bundle is confirmed, and the driver reads it once with [Stopwatch::get_and_remove].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy)]
struct Entry {
    started_ms: u64,
    /// 0 while running.
    stopped_ms: u64,
}

/// Unix time in milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Default)]
pub struct Stopwatch {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Stopwatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a watch. Returns false (keeping the original start) if `name` already exists.
    pub fn start(&self, name: &str) -> bool {
        let mut entries = self.lock();
        if entries.contains_key(name) {
            return false;
        }
        entries.insert(
            name.to_string(),
            Entry {
                started_ms: unix_millis(),
                stopped_ms: 0,
            },
        );
        true
    }

    /// Stop a running watch. Returns false if unknown or already stopped.
    pub fn stop(&self, name: &str) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(name) {
            Some(e) if e.stopped_ms == 0 => {
                e.stopped_ms = unix_millis().max(e.started_ms);
                true
            }
            _ => false,
        }
    }

    /// `(started_ms, stopped_ms)`; a running watch reports now as its provisional stop.
    pub fn get(&self, name: &str) -> Option<(u64, u64)> {
        self.lock().get(name).map(Self::read)
    }

    pub fn get_and_remove(&self, name: &str) -> Option<(u64, u64)> {
        self.lock().remove(name).as_ref().map(Self::read)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.lock()
            .get(name)
            .map(|e| e.stopped_ms == 0)
            .unwrap_or(false)
    }

    fn read(e: &Entry) -> (u64, u64) {
        let stopped = if e.stopped_ms == 0 {
            unix_millis().max(e.started_ms)
        } else {
            e.stopped_ms
        };
        (e.started_ms, stopped)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
