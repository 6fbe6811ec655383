//! Trigger fired explicitly by its owner.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Result;
use log::info;

use super::{
    lock,
    trigger::{
        SubscriptionId, Subscribers, UpdateSubscriber, UpdateTrigger, duration_to_nanos, guarded,
    },
};

/// Trigger without a thread: updates run on whoever calls
/// [`trigger_update`](Self::trigger_update).
///
/// Data hints are only counted, so callers can decide when a flush is worth
/// it. Tests and single-threaded render loops use this flavour.
pub struct ManualUpdateTrigger {
    name: String,
    subscribers: Subscribers,
    running: AtomicBool,
    pending_hints: AtomicUsize,
    last_update_nanos: AtomicU64,
    // Serializes start, subscribe and update dispatch.
    flush: Mutex<()>,
}

impl ManualUpdateTrigger {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: Subscribers::default(),
            running: AtomicBool::new(false),
            pending_hints: AtomicUsize::new(0),
            last_update_nanos: AtomicU64::new(0),
            flush: Mutex::new(()),
        }
    }

    /// Fires `update` on the calling thread.
    ///
    /// Returns `false` without firing when the trigger is not running.
    pub fn trigger_update(&self) -> bool {
        let _flush = lock(&self.flush);
        if !self.is_running() {
            return false;
        }

        self.pending_hints.store(0, Ordering::Relaxed);
        let started = Instant::now();
        self.subscribers.notify_update(&self.name);
        self.last_update_nanos
            .store(duration_to_nanos(started.elapsed()), Ordering::Relaxed);
        true
    }

    /// Number of has-data hints received since the last update.
    pub fn pending_hints(&self) -> usize {
        self.pending_hints.load(Ordering::Relaxed)
    }
}

impl UpdateTrigger for ManualUpdateTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    fn subscribe(&self, subscriber: Arc<dyn UpdateSubscriber>) -> SubscriptionId {
        let _flush = lock(&self.flush);
        if self.is_running() {
            guarded(&self.name, "starting", || subscriber.on_starting());
        }
        self.subscribers.insert(subscriber)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(id)
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn trigger_has_data(&self) {
        self.pending_hints.fetch_add(1, Ordering::Relaxed);
    }

    fn start(&self) -> Result<()> {
        let _flush = lock(&self.flush);
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.subscribers.notify_starting(&self.name);
        info!("Trigger '{}' started", self.name);
        Ok(())
    }

    fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("Trigger '{}' stopped", self.name);
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn last_update_time(&self) -> Duration {
        Duration::from_nanos(self.last_update_nanos.load(Ordering::Relaxed))
    }
}
