//! Fixed-interval trigger.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Result;

use super::{
    device_trigger::DEFAULT_UPDATE_FREQUENCY,
    trigger::{SubscriptionId, TriggerCore, UpdateSubscriber, UpdateTrigger, duration_to_nanos},
};

/// Fires `update` every `update_frequency`, whether or not queues have data.
///
/// Suited to back ends that expect a steady refresh, such as DMX receivers
/// that fall back to a default scene when packets stop.
pub struct TimerUpdateTrigger {
    core: Arc<TriggerCore>,
    update_frequency: Arc<AtomicU64>,
}

impl TimerUpdateTrigger {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_update_frequency(name, DEFAULT_UPDATE_FREQUENCY)
    }

    pub fn with_update_frequency(name: impl Into<String>, update_frequency: Duration) -> Self {
        Self {
            core: Arc::new(TriggerCore::new(name.into())),
            update_frequency: Arc::new(AtomicU64::new(duration_to_nanos(update_frequency))),
        }
    }

    pub fn update_frequency(&self) -> Duration {
        Duration::from_nanos(self.update_frequency.load(Ordering::Relaxed))
    }

    pub fn set_update_frequency(&self, update_frequency: Duration) {
        self.update_frequency
            .store(duration_to_nanos(update_frequency), Ordering::Relaxed);
    }
}

impl UpdateTrigger for TimerUpdateTrigger {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn subscribe(&self, subscriber: Arc<dyn UpdateSubscriber>) -> SubscriptionId {
        self.core.subscribe(subscriber)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.core.subscribers().remove(id)
    }

    fn subscriber_count(&self) -> usize {
        self.core.subscribers().len()
    }

    /// Ignored: the interval alone decides when to fire.
    fn trigger_has_data(&self) {}

    fn start(&self) -> Result<()> {
        let frequency = Arc::clone(&self.update_frequency);
        self.core.start(move |core| {
            while core.is_running() {
                let started = Instant::now();
                core.dispatch_update();
                let interval = Duration::from_nanos(frequency.load(Ordering::Relaxed));
                core.pause_until(started + interval);
            }
        })
    }

    fn stop(&self) {
        self.core.stop();
    }

    fn is_running(&self) -> bool {
        self.core.is_running()
    }

    fn last_update_time(&self) -> Duration {
        self.core.last_update_time()
    }
}

impl Drop for TimerUpdateTrigger {
    fn drop(&mut self) {
        self.core.stop();
    }
}
