//! Coalescing per-device update queue.

use std::{
    collections::HashMap,
    mem,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::Result;
use log::{debug, trace};

use super::{
    key::UpdateKey,
    lock,
    trigger::{SubscriptionId, UpdateSubscriber, UpdateTrigger},
};
use crate::{color::Color, event::ExceptionReporter, led::Led};

/// Vendor side of a queue: turns a coalesced batch into a hardware write.
pub trait UpdateWriter: Send {
    /// Clears cached hardware-mirror state before the first flush of a run.
    fn on_startup(&mut self) {}

    /// Writes one batch, sorted by key, with exactly one entry per key.
    fn update(&mut self, batch: &[(UpdateKey, Color)]) -> Result<()>;
}

struct QueueState {
    name: String,
    pending: Mutex<HashMap<UpdateKey, Color>>,
    writer: Mutex<Box<dyn UpdateWriter>>,
    attached: AtomicBool,
    reporter: ExceptionReporter,
}

impl QueueState {
    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    fn flush(&self) {
        let mut writer = lock(&self.writer);
        if !self.is_attached() {
            return;
        }

        let pending = mem::take(&mut *lock(&self.pending));
        if pending.is_empty() {
            return;
        }

        let mut batch: Vec<_> = pending.into_iter().collect();
        batch.sort_unstable_by_key(|(key, _)| *key);
        trace!("Queue '{}' flushing {} entries", self.name, batch.len());

        if let Err(e) = writer.update(&batch) {
            let error = e.context(format!(
                "Failed to flush {} entries of queue '{}'",
                batch.len(),
                self.name
            ));
            self.reporter.report(error, false);
        }
    }
}

impl UpdateSubscriber for QueueState {
    fn on_starting(&self) {
        let mut writer = lock(&self.writer);
        if self.is_attached() {
            writer.on_startup();
        }
    }

    fn on_update(&self) {
        self.flush();
    }
}

/// Thread-safe buffer that keeps the latest color per key between flushes.
///
/// Any thread may call [`set_data`](Self::set_data); the subscribed trigger
/// decides when the batch reaches the [`UpdateWriter`]. Memory is bounded by
/// the number of distinct keys, never by the write rate.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use rgbd::{
///     color::Color,
///     event::{EventBus, ExceptionReporter},
///     update::{ManualUpdateTrigger, UpdateKey, UpdateQueue, UpdateTrigger, UpdateWriter},
/// };
///
/// struct Print;
/// impl UpdateWriter for Print {
///     fn update(&mut self, batch: &[(UpdateKey, Color)]) -> anyhow::Result<()> {
///         println!("{batch:?}");
///         Ok(())
///     }
/// }
///
/// let trigger = Arc::new(ManualUpdateTrigger::new("demo"));
/// let reporter = ExceptionReporter::new("demo", EventBus::new());
/// let queue = UpdateQueue::new("strip", trigger.clone(), Box::new(Print), reporter);
///
/// trigger.start()?;
/// queue.set_data([(UpdateKey::Channel(1), Color::RED)]);
/// trigger.trigger_update();
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct UpdateQueue {
    state: Arc<QueueState>,
    trigger: Arc<dyn UpdateTrigger>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl UpdateQueue {
    /// Creates the queue and subscribes it to `trigger`.
    pub fn new(
        name: impl Into<String>,
        trigger: Arc<dyn UpdateTrigger>,
        writer: Box<dyn UpdateWriter>,
        reporter: ExceptionReporter,
    ) -> Self {
        let state = Arc::new(QueueState {
            name: name.into(),
            pending: Mutex::new(HashMap::new()),
            writer: Mutex::new(writer),
            attached: AtomicBool::new(true),
            reporter,
        });
        let id = trigger.subscribe(state.clone());
        debug!(
            "Queue '{}' subscribed to trigger '{}'",
            state.name,
            trigger.name()
        );

        Self {
            state,
            trigger,
            subscription: Mutex::new(Some(id)),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn trigger(&self) -> &Arc<dyn UpdateTrigger> {
        &self.trigger
    }

    pub fn is_attached(&self) -> bool {
        self.state.is_attached()
    }

    /// Merges `entries` into the pending batch; repeated keys overwrite.
    ///
    /// An empty input does nothing. Writes to a detached queue are dropped.
    pub fn set_data<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (UpdateKey, Color)>,
    {
        if !self.is_attached() {
            return;
        }

        let merged = {
            let mut pending = lock(&self.state.pending);
            let before = pending.len();
            let mut merged = 0usize;
            for (key, color) in entries {
                pending.insert(key, color);
                merged += 1;
            }
            trace!(
                "Queue '{}' merged {merged} entries ({} new keys)",
                self.state.name,
                pending.len() - before
            );
            merged
        };

        if merged > 0 {
            self.trigger.trigger_has_data();
        }
    }

    /// Queues the current color of every LED under its update key.
    pub fn set_leds<'a, I>(&self, leds: I)
    where
        I: IntoIterator<Item = &'a Led>,
    {
        self.set_data(leds.into_iter().map(|led| (led.update_key(), led.color())));
    }

    /// Discards the pending batch. A flush already in progress is unaffected.
    pub fn reset(&self) {
        lock(&self.state.pending).clear();
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.state.pending).len()
    }

    /// Unsubscribes from the trigger and drops pending data.
    ///
    /// Once this returns no flush reaches the writer. Idempotent.
    pub fn detach(&self) {
        let Some(id) = lock(&self.subscription).take() else {
            return;
        };

        {
            // Waits out a flush in progress.
            let _writer = lock(&self.state.writer);
            self.state.attached.store(false, Ordering::Release);
        }
        self.trigger.unsubscribe(id);
        self.reset();
        debug!(
            "Queue '{}' detached from trigger '{}'",
            self.state.name,
            self.trigger.name()
        );
    }
}

impl Drop for UpdateQueue {
    fn drop(&mut self) {
        self.detach();
    }
}
