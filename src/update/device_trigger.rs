//! On-demand trigger with a rate floor, the default for device providers.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Result;

use super::trigger::{
    SubscriptionId, TriggerCore, UpdateSubscriber, UpdateTrigger, duration_to_nanos,
};

/// Default minimum interval between two updates (30 Hz).
pub const DEFAULT_UPDATE_FREQUENCY: Duration = Duration::from_nanos(1_000_000_000 / 30);

/// How long the worker waits for a hint before re-checking for shutdown.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Schedule {
    update_frequency: AtomicU64,
    update_rate_hard_limit: AtomicU64,
    timeout: AtomicU64,
}

impl Schedule {
    fn load(value: &AtomicU64) -> Duration {
        Duration::from_nanos(value.load(Ordering::Relaxed))
    }

    fn effective_interval(&self) -> Duration {
        Self::load(&self.update_frequency).max(Self::load(&self.update_rate_hard_limit))
    }
}

/// Fires `update` as soon as a queue reports data, but never more often
/// than `max(update_frequency, update_rate_hard_limit)`.
///
/// Hints that arrive while the trigger is throttled are remembered and
/// served right after the interval elapses, so no write is left behind.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use rgbd::update::{DeviceUpdateTrigger, UpdateTrigger};
///
/// let trigger = DeviceUpdateTrigger::new("usb-0", Duration::from_millis(20));
/// trigger.start()?;
/// // queues subscribe and call trigger_has_data() when they have writes
/// trigger.stop();
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct DeviceUpdateTrigger {
    core: Arc<TriggerCore>,
    schedule: Arc<Schedule>,
}

impl DeviceUpdateTrigger {
    pub fn new(name: impl Into<String>, update_rate_hard_limit: Duration) -> Self {
        Self {
            core: Arc::new(TriggerCore::new(name.into())),
            schedule: Arc::new(Schedule {
                update_frequency: AtomicU64::new(duration_to_nanos(DEFAULT_UPDATE_FREQUENCY)),
                update_rate_hard_limit: AtomicU64::new(duration_to_nanos(update_rate_hard_limit)),
                timeout: AtomicU64::new(duration_to_nanos(DEFAULT_TIMEOUT)),
            }),
        }
    }

    pub fn with_update_frequency(self, update_frequency: Duration) -> Self {
        self.set_update_frequency(update_frequency);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.schedule
            .timeout
            .store(duration_to_nanos(timeout), Ordering::Relaxed);
        self
    }

    pub fn update_frequency(&self) -> Duration {
        Schedule::load(&self.schedule.update_frequency)
    }

    /// Takes effect from the next update on.
    pub fn set_update_frequency(&self, update_frequency: Duration) {
        self.schedule
            .update_frequency
            .store(duration_to_nanos(update_frequency), Ordering::Relaxed);
    }

    pub fn update_rate_hard_limit(&self) -> Duration {
        Schedule::load(&self.schedule.update_rate_hard_limit)
    }

    pub fn set_update_rate_hard_limit(&self, limit: Duration) {
        self.schedule
            .update_rate_hard_limit
            .store(duration_to_nanos(limit), Ordering::Relaxed);
    }

    /// The interval actually enforced between two updates.
    pub fn effective_interval(&self) -> Duration {
        self.schedule.effective_interval()
    }
}

impl UpdateTrigger for DeviceUpdateTrigger {
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

    fn trigger_has_data(&self) {
        self.core.signal_data();
    }

    fn start(&self) -> Result<()> {
        let schedule = Arc::clone(&self.schedule);
        self.core.start(move |core| {
            while core.is_running() {
                if core.wait_for_data(Schedule::load(&schedule.timeout)) {
                    let started = Instant::now();
                    core.dispatch_update();
                    core.pause_until(started + schedule.effective_interval());
                }
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

impl Drop for DeviceUpdateTrigger {
    fn drop(&mut self) {
        self.core.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::trigger::tests::RecordingSubscriber;
    use pretty_assertions::assert_eq;
    use std::{
        sync::{Mutex, OnceLock, Weak, atomic::AtomicUsize},
        thread::sleep,
    };

    fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn effective_interval_respects_hard_limit() {
        let trigger = DeviceUpdateTrigger::new("limit", Duration::from_millis(50))
            .with_update_frequency(Duration::from_millis(10));
        assert_eq!(trigger.effective_interval(), Duration::from_millis(50));

        trigger.set_update_frequency(Duration::from_millis(80));
        assert_eq!(trigger.effective_interval(), Duration::from_millis(80));
    }

    #[test]
    fn no_update_without_data() {
        let trigger = DeviceUpdateTrigger::new("idle", Duration::ZERO)
            .with_timeout(Duration::from_millis(5));
        let recorder = Arc::new(RecordingSubscriber::default());
        trigger.subscribe(recorder.clone());

        trigger.start().unwrap();
        sleep(Duration::from_millis(40));
        trigger.stop();

        assert_eq!(recorder.signals(), vec!["starting"]);
    }

    #[test]
    fn hint_fires_update_after_starting() {
        let trigger = DeviceUpdateTrigger::new("hint", Duration::ZERO)
            .with_update_frequency(Duration::ZERO)
            .with_timeout(Duration::from_millis(5));
        let recorder = Arc::new(RecordingSubscriber::default());
        trigger.subscribe(recorder.clone());
        trigger.start().unwrap();

        trigger.trigger_has_data();
        assert!(wait_until(Duration::from_secs(2), || recorder.update_count() >= 1));
        trigger.stop();

        assert_eq!(recorder.signals()[..2], ["starting", "update"]);
    }

    #[test]
    fn updates_are_rate_limited() {
        struct Stamps(Mutex<Vec<Instant>>);
        impl UpdateSubscriber for Stamps {
            fn on_update(&self) {
                self.0.lock().unwrap().push(Instant::now());
            }
        }

        let interval = Duration::from_millis(30);
        let trigger = DeviceUpdateTrigger::new("limited", interval)
            .with_update_frequency(Duration::ZERO)
            .with_timeout(Duration::from_millis(5));
        let stamps = Arc::new(Stamps(Mutex::new(Vec::new())));
        trigger.subscribe(stamps.clone());
        trigger.start().unwrap();

        let deadline = Instant::now() + Duration::from_millis(200);
        while Instant::now() < deadline {
            trigger.trigger_has_data();
            sleep(Duration::from_millis(1));
        }
        trigger.stop();

        let stamps = stamps.0.lock().unwrap();
        assert!(stamps.len() >= 2);
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= interval);
        }
    }

    #[test]
    fn restart_fires_starting_again() {
        let trigger = DeviceUpdateTrigger::new("restart", Duration::ZERO)
            .with_timeout(Duration::from_millis(5));
        let recorder = Arc::new(RecordingSubscriber::default());
        trigger.subscribe(recorder.clone());

        trigger.start().unwrap();
        trigger.start().unwrap();
        trigger.stop();
        trigger.start().unwrap();
        trigger.stop();

        assert_eq!(recorder.signals(), vec!["starting", "starting"]);
        assert!(!trigger.is_running());
    }

    #[test]
    fn unsubscribed_queue_stops_receiving() {
        let trigger = DeviceUpdateTrigger::new("unsub", Duration::ZERO)
            .with_update_frequency(Duration::ZERO)
            .with_timeout(Duration::from_millis(5));
        let recorder = Arc::new(RecordingSubscriber::default());
        let id = trigger.subscribe(recorder.clone());
        trigger.start().unwrap();

        trigger.trigger_has_data();
        assert!(wait_until(Duration::from_secs(2), || recorder.update_count() == 1));

        assert!(trigger.unsubscribe(id));
        assert_eq!(trigger.subscriber_count(), 0);
        trigger.trigger_has_data();
        sleep(Duration::from_millis(30));
        trigger.stop();

        assert_eq!(recorder.update_count(), 1);
    }

    /// Stops its own trigger on the first update and lingers in the callback.
    #[derive(Default)]
    struct SelfStopping {
        trigger: OnceLock<Weak<DeviceUpdateTrigger>>,
        updates: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl UpdateSubscriber for SelfStopping {
        fn on_update(&self) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if self.updates.fetch_add(1, Ordering::SeqCst) == 0 {
                if let Some(trigger) = self.trigger.get().and_then(Weak::upgrade) {
                    trigger.stop();
                    assert!(trigger.start().is_err());
                }
                sleep(Duration::from_millis(100));
            } else {
                sleep(Duration::from_millis(5));
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn restart_after_stop_from_subscriber_runs_one_worker() {
        let trigger = Arc::new(
            DeviceUpdateTrigger::new("self-stop", Duration::ZERO)
                .with_update_frequency(Duration::ZERO)
                .with_timeout(Duration::from_millis(5)),
        );
        let subscriber = Arc::new(SelfStopping::default());
        assert!(subscriber.trigger.set(Arc::downgrade(&trigger)).is_ok());
        trigger.subscribe(subscriber.clone());

        trigger.start().unwrap();
        trigger.trigger_has_data();
        assert!(wait_until(Duration::from_secs(2), || !trigger.is_running()));

        trigger.start().unwrap();
        for _ in 0..10 {
            trigger.trigger_has_data();
            sleep(Duration::from_millis(10));
        }
        assert!(wait_until(Duration::from_secs(2), || {
            subscriber.updates.load(Ordering::SeqCst) >= 3
        }));
        trigger.stop();

        assert_eq!(subscriber.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(subscriber.in_flight.load(Ordering::SeqCst), 0);
    }
}
