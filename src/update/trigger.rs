//! Trigger contract and the machinery shared by the threaded triggers.
//!
//! A trigger decides *when* queues flush. It exposes two signals,
//! `starting` and `update`, to any number of [`UpdateSubscriber`]s and
//! accepts a "has data" hint from them.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle, ThreadId},
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use event_listener::{Event, Listener};
use log::{debug, error, info};

use super::lock;

/// Receiver of trigger signals. Update queues are the usual subscribers.
pub trait UpdateSubscriber: Send + Sync {
    /// Fired once per trigger start, before the first update.
    fn on_starting(&self) {}

    /// Fired every time a flush should be attempted.
    fn on_update(&self);
}

/// Handle returned by [`UpdateTrigger::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// Scheduling source that decides when subscribed queues flush.
///
/// Implementations must accept `subscribe`/`unsubscribe` concurrently with
/// firing, deliver `starting` to a subscriber before any `update`, and keep
/// firing for the other subscribers when one of them fails.
pub trait UpdateTrigger: Send + Sync {
    fn name(&self) -> &str;

    fn subscribe(&self, subscriber: Arc<dyn UpdateSubscriber>) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    fn subscriber_count(&self) -> usize;

    /// Hint from a queue that pending data is available.
    fn trigger_has_data(&self);

    fn start(&self) -> Result<()>;

    /// Stops future updates. Work already dispatched is not interrupted.
    fn stop(&self);

    fn is_running(&self) -> bool;

    /// Duration of the most recent update dispatch.
    fn last_update_time(&self) -> Duration;
}

/// Concurrent subscriber list. Signals reach subscribers in the order
/// they subscribed.
#[derive(Default)]
pub struct Subscribers {
    next_id: AtomicU64,
    entries: DashMap<SubscriptionId, Arc<dyn UpdateSubscriber>>,
}

impl Subscribers {
    pub fn insert(&self, subscriber: Arc<dyn UpdateSubscriber>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.insert(id, subscriber);
        id
    }

    pub fn remove(&self, id: SubscriptionId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Callbacks run on a snapshot so they may unsubscribe themselves.
    fn snapshot(&self) -> Vec<Arc<dyn UpdateSubscriber>> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        entries.sort_unstable_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, subscriber)| subscriber).collect()
    }

    pub fn notify_starting(&self, trigger: &str) {
        for subscriber in self.snapshot() {
            guarded(trigger, "starting", || subscriber.on_starting());
        }
    }

    /// Fires `update` on every subscriber and returns how long it took.
    pub fn notify_update(&self, trigger: &str) -> Duration {
        let started = Instant::now();
        for subscriber in self.snapshot() {
            guarded(trigger, "update", || subscriber.on_update());
        }
        started.elapsed()
    }
}

pub(crate) fn guarded(trigger: &str, signal: &str, callback: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        error!("Subscriber of trigger '{trigger}' panicked during {signal}");
    }
}

pub(crate) fn duration_to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Worker thread plumbing shared by [`DeviceUpdateTrigger`] and
/// [`TimerUpdateTrigger`].
///
/// [`DeviceUpdateTrigger`]: super::DeviceUpdateTrigger
/// [`TimerUpdateTrigger`]: super::TimerUpdateTrigger
pub(crate) struct TriggerCore {
    name: String,
    subscribers: Subscribers,
    running: AtomicBool,
    has_data: AtomicBool,
    wake: Event,
    last_update_nanos: AtomicU64,
    /// Held by `start`/`stop` for the whole transition, joins included.
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_thread: Mutex<Option<ThreadId>>,
    /// Orders `starting` replays in `subscribe` against `start`.
    signals: Mutex<()>,
}

impl TriggerCore {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            subscribers: Subscribers::default(),
            running: AtomicBool::new(false),
            has_data: AtomicBool::new(false),
            wake: Event::new(),
            last_update_nanos: AtomicU64::new(0),
            worker: Mutex::new(None),
            worker_thread: Mutex::new(None),
            signals: Mutex::new(()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn subscribers(&self) -> &Subscribers {
        &self.subscribers
    }

    /// Subscribes; a trigger that already started replays `starting` first.
    pub(crate) fn subscribe(&self, subscriber: Arc<dyn UpdateSubscriber>) -> SubscriptionId {
        let _signals = lock(&self.signals);
        if self.is_running() {
            guarded(&self.name, "starting", || subscriber.on_starting());
        }
        self.subscribers.insert(subscriber)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn on_worker_thread(&self) -> bool {
        *lock(&self.worker_thread) == Some(thread::current().id())
    }

    /// Fires `starting` and spawns the worker running `body`.
    ///
    /// Starting an already running trigger is a no-op. A worker left over
    /// from a stop issued inside a subscriber is joined first, so two
    /// workers never dispatch at once.
    pub(crate) fn start<F>(self: &Arc<Self>, body: F) -> Result<()>
    where
        F: FnOnce(&TriggerCore) + Send + 'static,
    {
        if self.on_worker_thread() {
            bail!("Trigger '{}' cannot be started from its own worker", self.name);
        }

        let mut worker = lock(&self.worker);
        if self.is_running() {
            return Ok(());
        }

        // Left by a stop from a subscriber; it sees `running == false` until joined.
        if let Some(previous) = worker.take() {
            if previous.join().is_err() {
                error!("Previous worker of trigger '{}' panicked", self.name);
            }
        }

        {
            let _signals = lock(&self.signals);
            self.running.store(true, Ordering::Release);
            self.subscribers.notify_starting(&self.name);
        }

        let core = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{}-update", self.name))
            .spawn(move || {
                *lock(&core.worker_thread) = Some(thread::current().id());
                debug!("Trigger '{}' worker started", core.name);
                body(&*core);
                debug!("Trigger '{}' worker finished", core.name);
            })
            .with_context(|| format!("Failed to spawn worker for trigger '{}'", self.name));

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                info!("Trigger '{}' started", self.name);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Stops the worker and waits for it, unless called from the worker
    /// itself. That worker is then joined by the next `start` or `stop`.
    pub(crate) fn stop(&self) {
        if self.on_worker_thread() {
            if self.running.swap(false, Ordering::AcqRel) {
                self.wake.notify(usize::MAX);
                info!("Trigger '{}' stopped by a subscriber", self.name);
            }
            return;
        }

        let mut worker = lock(&self.worker);
        let was_running = self.running.swap(false, Ordering::AcqRel);
        self.wake.notify(usize::MAX);

        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                error!("Worker of trigger '{}' panicked", self.name);
            }
        }
        if was_running {
            info!("Trigger '{}' stopped", self.name);
        }
    }

    pub(crate) fn signal_data(&self) {
        self.has_data.store(true, Ordering::Release);
        self.wake.notify(usize::MAX);
    }

    fn take_data(&self) -> bool {
        self.has_data.swap(false, Ordering::AcqRel)
    }

    /// Blocks up to `timeout` for a data hint. Returns whether one arrived.
    pub(crate) fn wait_for_data(&self, timeout: Duration) -> bool {
        if self.take_data() {
            return true;
        }

        let listener = self.wake.listen();
        if self.take_data() {
            return true;
        }
        if !self.is_running() {
            return false;
        }

        let _ = listener.wait_timeout(timeout);
        self.take_data()
    }

    /// Sleeps until `deadline`; returns early only when the trigger stops.
    pub(crate) fn pause_until(&self, deadline: Instant) {
        while self.is_running() {
            let listener = self.wake.listen();
            if !self.is_running() || Instant::now() >= deadline {
                break;
            }
            if listener.wait_deadline(deadline).is_none() {
                break;
            }
        }
    }

    pub(crate) fn dispatch_update(&self) -> Duration {
        let elapsed = self.subscribers.notify_update(&self.name);
        self.last_update_nanos
            .store(duration_to_nanos(elapsed), Ordering::Relaxed);
        elapsed
    }

    pub(crate) fn last_update_time(&self) -> Duration {
        Duration::from_nanos(self.last_update_nanos.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    /// Records the order of signals it receives.
    #[derive(Default)]
    pub(crate) struct RecordingSubscriber {
        pub(crate) log: Mutex<Vec<&'static str>>,
        pub(crate) updates: AtomicUsize,
    }

    impl RecordingSubscriber {
        pub(crate) fn signals(&self) -> Vec<&'static str> {
            self.log.lock().unwrap().clone()
        }

        pub(crate) fn update_count(&self) -> usize {
            self.updates.load(Ordering::SeqCst)
        }
    }

    impl UpdateSubscriber for RecordingSubscriber {
        fn on_starting(&self) {
            self.log.lock().unwrap().push("starting");
        }

        fn on_update(&self) {
            self.log.lock().unwrap().push("update");
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingSubscriber;

    impl UpdateSubscriber for PanickingSubscriber {
        fn on_update(&self) {
            panic!("native call exploded");
        }
    }

    #[test]
    fn subscribers_insert_and_remove() {
        let subscribers = Subscribers::default();
        let id = subscribers.insert(Arc::new(RecordingSubscriber::default()));
        assert_eq!(subscribers.len(), 1);
        assert!(subscribers.remove(id));
        assert!(!subscribers.remove(id));
        assert!(subscribers.is_empty());
    }

    #[test]
    fn panicking_subscriber_does_not_starve_others() {
        let subscribers = Subscribers::default();
        let recorder = Arc::new(RecordingSubscriber::default());
        subscribers.insert(Arc::new(PanickingSubscriber));
        subscribers.insert(recorder.clone());

        subscribers.notify_update("test");
        subscribers.notify_update("test");

        assert_eq!(recorder.update_count(), 2);
    }

    #[test]
    fn updates_follow_subscription_order() {
        struct Tagged(u32, Arc<Mutex<Vec<u32>>>);
        impl UpdateSubscriber for Tagged {
            fn on_update(&self) {
                self.1.lock().unwrap().push(self.0);
            }
        }

        let order = Arc::new(Mutex::new(Vec::new()));
        let subscribers = Subscribers::default();
        let ids: Vec<_> = (0..32)
            .map(|tag| subscribers.insert(Arc::new(Tagged(tag, Arc::clone(&order)))))
            .collect();
        subscribers.remove(ids[7]);

        subscribers.notify_update("test");

        let expected: Vec<u32> = (0..32).filter(|tag| *tag != 7).collect();
        assert_eq!(*order.lock().unwrap(), expected);
    }

    #[test]
    fn core_replays_starting_for_late_subscribers() {
        let core = Arc::new(TriggerCore::new("late".into()));
        core.start(|core| {
            while core.is_running() {
                core.pause_until(Instant::now() + Duration::from_millis(5));
            }
        })
        .unwrap();

        let recorder = Arc::new(RecordingSubscriber::default());
        core.subscribe(recorder.clone());
        core.stop();

        assert_eq!(recorder.signals(), vec!["starting"]);
    }

    #[test]
    fn wait_for_data_consumes_hint() {
        let core = TriggerCore::new("hint".into());
        core.signal_data();
        assert!(core.wait_for_data(Duration::from_millis(1)));
        assert!(!core.wait_for_data(Duration::from_millis(1)));
    }
}
