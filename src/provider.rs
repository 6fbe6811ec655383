//! Device providers: lifecycle owners of one vendor back end.
//!
//! A [`DeviceProvider`] wraps a [`DeviceLoader`], owns the triggers the
//! loader asks for and the devices it returns, and routes every failure to
//! the [`EventBus`](crate::event::EventBus).

use std::{
    collections::BTreeMap,
    fmt, mem,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, info, warn};

use crate::{
    device::{DeviceTypeFilter, RgbDevice},
    event::{DeviceChange, Event, EventBus, ExceptionReporter, ProviderException},
    id_registry::IdRegistry,
    update::{DeviceUpdateTrigger, UpdateTrigger, lock},
};

/// Identifies a trigger within one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TriggerId(pub u32);

impl TriggerId {
    /// Trigger shared by devices that do not ask for their own.
    pub const DEFAULT: TriggerId = TriggerId(0);
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Builds a trigger from its name and hard rate limit.
pub type TriggerFactory = Arc<dyn Fn(&str, Duration) -> Arc<dyn UpdateTrigger> + Send + Sync>;

/// Factory used unless a loader provides its own.
pub fn device_trigger_factory() -> TriggerFactory {
    Arc::new(|name: &str, hard_limit: Duration| {
        Arc::new(DeviceUpdateTrigger::new(name, hard_limit)) as Arc<dyn UpdateTrigger>
    })
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// Floor for the interval between two updates of any trigger.
    pub update_rate_hard_limit: Duration,
    /// Devices whose type is not in the filter are dropped after loading.
    pub load_filter: DeviceTypeFilter,
    /// Turns errors reported while loading into initialization failures.
    pub throw_exceptions: bool,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            update_rate_hard_limit: Duration::ZERO,
            load_filter: DeviceTypeFilter::ALL,
            throw_exceptions: false,
        }
    }
}

/// Vendor back end plugged into a [`DeviceProvider`].
pub trait DeviceLoader: Send {
    /// Short label used in logs.
    fn name(&self) -> &str;

    /// Opens the vendor SDK or link. An error aborts initialization.
    fn init_sdk(&mut self) -> Result<()>;

    /// Enumerates devices, building each one's queue on a trigger obtained
    /// from `ctx`.
    fn load_devices(&mut self, ctx: &LoadContext<'_>) -> Result<Vec<RgbDevice>>;

    fn trigger_factory(&self) -> TriggerFactory {
        device_trigger_factory()
    }

    /// Releases whatever `init_sdk` acquired.
    fn shutdown_sdk(&mut self) {}
}

/// Services a provider offers to its loader during [`DeviceLoader::load_devices`].
pub struct LoadContext<'a> {
    provider: &'a str,
    settings: &'a ProviderSettings,
    registry: &'a IdRegistry,
    reporter: &'a ExceptionReporter,
    triggers: &'a Mutex<BTreeMap<TriggerId, Arc<dyn UpdateTrigger>>>,
    factory: TriggerFactory,
    errors: Mutex<Vec<ProviderException>>,
}

impl LoadContext<'_> {
    pub fn provider(&self) -> &str {
        self.provider
    }

    pub fn settings(&self) -> &ProviderSettings {
        self.settings
    }

    /// Returns the trigger registered under `id`, creating it on first use.
    ///
    /// The provider's configured hard limit acts as a floor for `hard_limit`.
    pub fn update_trigger(&self, id: TriggerId, hard_limit: Duration) -> Arc<dyn UpdateTrigger> {
        let mut triggers = lock(self.triggers);
        let trigger = triggers.entry(id).or_insert_with(|| {
            let limit = hard_limit.max(self.settings.update_rate_hard_limit);
            let name = format!("{}-{}", self.provider, id);
            debug!("Creating trigger '{name}' with hard limit {limit:?}");
            (self.factory)(&name, limit)
        });
        Arc::clone(trigger)
    }

    /// Shortcut for the default trigger with the configured hard limit.
    pub fn default_trigger(&self) -> Arc<dyn UpdateTrigger> {
        self.update_trigger(TriggerId::DEFAULT, self.settings.update_rate_hard_limit)
    }

    /// Registers `"{manufacturer} {model}"` as a device name unique in this provider.
    pub fn device_name(&self, manufacturer: &str, model: &str) -> String {
        let base = format!("{manufacturer} {model}");
        self.registry.make_unique(self.provider, base.trim())
    }

    pub fn reporter(&self) -> &ExceptionReporter {
        self.reporter
    }

    /// Reports a failure that should skip one device, not the whole load.
    pub fn report(&self, error: anyhow::Error) {
        let exception = self.reporter.report(error, false);
        lock(&self.errors).push(exception);
    }

    fn take_errors(&self) -> Vec<ProviderException> {
        mem::take(&mut *lock(&self.errors))
    }
}

/// Owns the triggers and devices of one back end.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use rgbd::{
///     config::DebugDeviceCfg,
///     drivers::debug::DebugLoader,
///     event::EventBus,
///     id_registry::IdRegistry,
///     provider::{DeviceProvider, ProviderSettings},
/// };
///
/// let provider = DeviceProvider::new(
///     "debug",
///     Box::new(DebugLoader::new(vec![DebugDeviceCfg::strip("Virtual Strip", 30)])),
///     ProviderSettings::default(),
///     Arc::new(IdRegistry::new()),
///     EventBus::new(),
/// );
/// provider.initialize()?;
/// for device in provider.devices() {
///     device.set_all(rgbd::color::Color::RED);
///     device.update(false);
/// }
/// provider.reset();
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct DeviceProvider {
    name: String,
    loader: Mutex<Box<dyn DeviceLoader>>,
    settings: ProviderSettings,
    registry: Arc<IdRegistry>,
    reporter: ExceptionReporter,
    triggers: Mutex<BTreeMap<TriggerId, Arc<dyn UpdateTrigger>>>,
    devices: Mutex<Vec<Arc<RgbDevice>>>,
    sdk_ready: AtomicBool,
    initialized: AtomicBool,
}

impl DeviceProvider {
    pub fn new(
        name: impl Into<String>,
        loader: Box<dyn DeviceLoader>,
        settings: ProviderSettings,
        registry: Arc<IdRegistry>,
        bus: EventBus,
    ) -> Self {
        let name = name.into();
        Self {
            reporter: ExceptionReporter::new(&name, bus),
            name,
            loader: Mutex::new(loader),
            settings,
            registry,
            triggers: Mutex::new(BTreeMap::new()),
            devices: Mutex::new(Vec::new()),
            sdk_ready: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    pub fn reporter(&self) -> &ExceptionReporter {
        &self.reporter
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Loads devices and starts their triggers.
    ///
    /// Any previous state is reset first. On failure the provider is left
    /// reset, a critical exception is published and the error is returned.
    pub fn initialize(&self) -> Result<()> {
        self.reset();
        info!("Initializing provider '{}'", self.name);

        match self.load() {
            Ok(count) => {
                self.initialized.store(true, Ordering::Release);
                info!("Provider '{}' initialized with {count} device(s)", self.name);
                Ok(())
            }
            Err(e) => {
                self.reset();
                self.reporter.report(anyhow!("{e:#}"), true);
                Err(e.context(format!("Failed to initialize provider '{}'", self.name)))
            }
        }
    }

    fn load(&self) -> Result<usize> {
        let devices = {
            let mut loader = lock(&self.loader);
            loader
                .init_sdk()
                .with_context(|| format!("SDK initialization of '{}' failed", loader.name()))?;
            self.sdk_ready.store(true, Ordering::Release);

            let ctx = LoadContext {
                provider: &self.name,
                settings: &self.settings,
                registry: &self.registry,
                reporter: &self.reporter,
                triggers: &self.triggers,
                factory: loader.trigger_factory(),
                errors: Mutex::new(Vec::new()),
            };
            let devices = loader
                .load_devices(&ctx)
                .with_context(|| format!("Loading devices of '{}' failed", loader.name()))?;

            let errors = ctx.take_errors();
            if self.settings.throw_exceptions {
                if let Some(first) = errors.first() {
                    bail!("{} device(s) failed to load, first: {first}", errors.len());
                }
            }
            devices
        };

        let mut added = 0;
        for device in devices {
            if self.settings.load_filter.contains(device.device_type()) {
                self.add_device(device);
                added += 1;
            } else {
                debug!(
                    "Device '{}' of type {:?} filtered out",
                    device.name(),
                    device.device_type()
                );
                self.registry.release(&self.name, device.name());
                device.detach();
            }
        }

        for trigger in lock(&self.triggers).values() {
            trigger.start()?;
        }
        Ok(added)
    }

    /// Takes ownership of a loaded device.
    pub fn add_device(&self, device: RgbDevice) -> Arc<RgbDevice> {
        let device = Arc::new(device);
        lock(&self.devices).push(Arc::clone(&device));
        debug!("Provider '{}' added device '{}'", self.name, device.name());
        self.publish_change(device.name(), DeviceChange::Added);
        device
    }

    /// Detaches and forgets a device. Returns `false` if no device has that name.
    pub fn remove_device(&self, name: &str) -> bool {
        let removed = {
            let mut devices = lock(&self.devices);
            devices
                .iter()
                .position(|device| device.name() == name)
                .map(|index| devices.remove(index))
        };

        let Some(device) = removed else {
            return false;
        };
        device.detach();
        self.registry.release(&self.name, name);
        debug!("Provider '{}' removed device '{name}'", self.name);
        self.publish_change(name, DeviceChange::Removed);
        true
    }

    fn publish_change(&self, device: &str, change: DeviceChange) {
        // A bus without listeners is fine here.
        let _ = self.reporter.bus().publish(Event::DevicesChanged {
            provider: self.name.clone(),
            device: device.to_string(),
            change,
        });
    }

    pub fn devices(&self) -> Vec<Arc<RgbDevice>> {
        lock(&self.devices).clone()
    }

    pub fn device(&self, name: &str) -> Option<Arc<RgbDevice>> {
        lock(&self.devices)
            .iter()
            .find(|device| device.name() == name)
            .cloned()
    }

    pub fn triggers(&self) -> Vec<(TriggerId, Arc<dyn UpdateTrigger>)> {
        lock(&self.triggers)
            .iter()
            .map(|(id, trigger)| (*id, Arc::clone(trigger)))
            .collect()
    }

    /// Pushes requested colors of every device into its queue.
    pub fn update_all(&self, flush_leds: bool) {
        for device in self.devices() {
            device.update(flush_leds);
        }
    }

    /// Tears everything down: triggers stop before any queue is released.
    pub fn reset(&self) {
        let triggers = mem::take(&mut *lock(&self.triggers));
        for trigger in triggers.values() {
            trigger.stop();
        }

        let devices = mem::take(&mut *lock(&self.devices));
        for device in &devices {
            device.detach();
            self.publish_change(device.name(), DeviceChange::Removed);
        }
        drop(devices);
        drop(triggers);

        if self.sdk_ready.swap(false, Ordering::AcqRel) {
            let mut loader = lock(&self.loader);
            debug!("Shutting down SDK of '{}'", loader.name());
            loader.shutdown_sdk();
        }

        self.registry.reset_namespace(&self.name);
        if self.initialized.swap(false, Ordering::AcqRel) {
            info!("Provider '{}' reset", self.name);
        }
    }
}

impl Drop for DeviceProvider {
    fn drop(&mut self) {
        self.reset();
    }
}

impl fmt::Debug for DeviceProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceProvider")
            .field("name", &self.name)
            .field("initialized", &self.is_initialized())
            .field("devices", &lock(&self.devices).len())
            .field("triggers", &lock(&self.triggers).len())
            .finish()
    }
}

/// Logs a device-level failure without failing the load.
pub(crate) fn skip_device(ctx: &LoadContext<'_>, what: &str, error: anyhow::Error) {
    warn!("Skipping {what} in provider '{}'", ctx.provider());
    ctx.report(error.context(format!("Skipped {what}")));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        color::Color,
        device::{DeviceInfo, DeviceType},
        led::{LedId, Point, Size},
        update::{
            ManualUpdateTrigger, SubscriptionId, UpdateQueue, UpdateSubscriber,
            queue::tests::RecordingWriter,
        },
    };
    use pretty_assertions::assert_eq;

    type Journal = Arc<Mutex<Vec<String>>>;

    /// Manual trigger that journals `stop` along with its subscriber count.
    struct JournalTrigger {
        inner: Arc<ManualUpdateTrigger>,
        journal: Journal,
        fail_start: bool,
    }

    impl UpdateTrigger for JournalTrigger {
        fn name(&self) -> &str {
            self.inner.name()
        }
        fn subscribe(&self, subscriber: Arc<dyn UpdateSubscriber>) -> SubscriptionId {
            self.inner.subscribe(subscriber)
        }
        fn unsubscribe(&self, id: SubscriptionId) -> bool {
            self.journal.lock().unwrap().push("unsubscribe".into());
            self.inner.unsubscribe(id)
        }
        fn subscriber_count(&self) -> usize {
            self.inner.subscriber_count()
        }
        fn trigger_has_data(&self) {
            self.inner.trigger_has_data();
        }
        fn start(&self) -> Result<()> {
            self.journal.lock().unwrap().push("start".into());
            if self.fail_start {
                bail!("trigger refused to start");
            }
            self.inner.start()
        }
        fn stop(&self) {
            self.journal
                .lock()
                .unwrap()
                .push(format!("stop with {} subscribers", self.inner.subscriber_count()));
            self.inner.stop();
        }
        fn is_running(&self) -> bool {
            self.inner.is_running()
        }
        fn last_update_time(&self) -> Duration {
            self.inner.last_update_time()
        }
    }

    #[derive(Default)]
    struct FakeLoader {
        journal: Journal,
        created: Arc<Mutex<Vec<Arc<ManualUpdateTrigger>>>>,
        writer: RecordingWriter,
        fail_init: bool,
        fail_start: bool,
        report_error: bool,
        devices: Vec<(DeviceType, &'static str)>,
    }

    impl DeviceLoader for FakeLoader {
        fn name(&self) -> &str {
            "fake"
        }

        fn init_sdk(&mut self) -> Result<()> {
            self.journal.lock().unwrap().push("init".into());
            if self.fail_init {
                bail!("sdk missing");
            }
            Ok(())
        }

        fn load_devices(&mut self, ctx: &LoadContext<'_>) -> Result<Vec<RgbDevice>> {
            if self.report_error {
                ctx.report(anyhow!("one device is broken"));
            }
            let trigger = ctx.default_trigger();
            Ok(self
                .devices
                .iter()
                .map(|(device_type, model)| {
                    let name = ctx.device_name("Acme", model);
                    let queue = UpdateQueue::new(
                        name.clone(),
                        Arc::clone(&trigger),
                        Box::new(self.writer.clone()),
                        ctx.reporter().for_device(&name),
                    );
                    let device = RgbDevice::new(
                        DeviceInfo::new(*device_type, name, "Acme", *model),
                        queue,
                    );
                    device.add_led(LedId::Custom(1), Point::default(), Size::default(), None);
                    device
                })
                .collect())
        }

        fn trigger_factory(&self) -> TriggerFactory {
            let journal = Arc::clone(&self.journal);
            let created = Arc::clone(&self.created);
            let fail_start = self.fail_start;
            Arc::new(move |name: &str, _| {
                let inner = Arc::new(ManualUpdateTrigger::new(name));
                created.lock().unwrap().push(Arc::clone(&inner));
                Arc::new(JournalTrigger {
                    inner,
                    journal: Arc::clone(&journal),
                    fail_start,
                }) as Arc<dyn UpdateTrigger>
            })
        }

        fn shutdown_sdk(&mut self) {
            self.journal.lock().unwrap().push("shutdown".into());
        }
    }

    fn provider(loader: FakeLoader, settings: ProviderSettings, bus: EventBus) -> DeviceProvider {
        DeviceProvider::new(
            "fake",
            Box::new(loader),
            settings,
            Arc::new(IdRegistry::new()),
            bus,
        )
    }

    fn keyboards() -> FakeLoader {
        FakeLoader {
            devices: vec![
                (DeviceType::Keyboard, "K1"),
                (DeviceType::Keyboard, "K1"),
                (DeviceType::Mouse, "M1"),
            ],
            ..FakeLoader::default()
        }
    }

    #[test]
    fn initialize_loads_and_names_devices() {
        let provider = provider(keyboards(), ProviderSettings::default(), EventBus::new());
        provider.initialize().unwrap();

        let names: Vec<_> = provider
            .devices()
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(names, vec!["Acme K1", "Acme K1 (2)", "Acme M1"]);
        assert!(provider.is_initialized());

        let triggers = provider.triggers();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].0, TriggerId::DEFAULT);
        assert!(triggers[0].1.is_running());
    }

    #[test]
    fn load_filter_drops_devices() {
        let settings = ProviderSettings {
            load_filter: [DeviceType::Mouse].into_iter().collect(),
            ..ProviderSettings::default()
        };
        let provider = provider(keyboards(), settings, EventBus::new());
        provider.initialize().unwrap();

        assert_eq!(provider.devices().len(), 1);
        assert!(provider.device("Acme M1").is_some());
        assert_eq!(provider.triggers()[0].1.subscriber_count(), 1);
    }

    #[test]
    fn devices_flush_through_shared_trigger() {
        let loader = keyboards();
        let writer = loader.writer.clone();
        let created = Arc::clone(&loader.created);
        let provider = provider(loader, ProviderSettings::default(), EventBus::new());
        provider.initialize().unwrap();

        for device in provider.devices() {
            device.set_all(Color::RED);
        }
        provider.update_all(false);
        let trigger = Arc::clone(&created.lock().unwrap()[0]);
        assert!(trigger.trigger_update());

        let batches = writer.batches();
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|batch| batch
            == &vec![(crate::update::UpdateKey::Led(LedId::Custom(1)), Color::RED)]));
    }

    #[test]
    fn sdk_failure_is_critical_and_returned() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let loader = FakeLoader {
            fail_init: true,
            ..keyboards()
        };
        let journal = Arc::clone(&loader.journal);
        let provider = provider(loader, ProviderSettings::default(), bus);

        let error = provider.initialize().unwrap_err();
        assert!(format!("{error:#}").contains("sdk missing"));
        assert!(!provider.is_initialized());
        assert!(provider.devices().is_empty());
        assert_eq!(*journal.lock().unwrap(), vec!["init"]);

        match events.try_recv().unwrap() {
            Event::Exception(exception) => assert!(exception.is_critical),
            other => panic!("Expected Exception event, got {other:?}"),
        }
    }

    #[test]
    fn reported_errors_abort_only_when_throwing() {
        let lenient = provider(
            FakeLoader {
                report_error: true,
                ..keyboards()
            },
            ProviderSettings::default(),
            EventBus::new(),
        );
        lenient.initialize().unwrap();
        assert_eq!(lenient.devices().len(), 3);

        let strict = provider(
            FakeLoader {
                report_error: true,
                ..keyboards()
            },
            ProviderSettings {
                throw_exceptions: true,
                ..ProviderSettings::default()
            },
            EventBus::new(),
        );
        assert!(strict.initialize().is_err());
        assert!(strict.devices().is_empty());
        assert!(strict.triggers().is_empty());
    }

    #[test]
    fn reset_stops_triggers_before_releasing_queues() {
        let loader = keyboards();
        let journal = Arc::clone(&loader.journal);
        let provider = provider(loader, ProviderSettings::default(), EventBus::new());
        provider.initialize().unwrap();
        journal.lock().unwrap().clear();

        provider.reset();

        let journal = journal.lock().unwrap().clone();
        assert_eq!(journal[0], "stop with 3 subscribers");
        assert_eq!(&journal[1..4], ["unsubscribe", "unsubscribe", "unsubscribe"]);
        assert_eq!(journal[4], "shutdown");
        assert!(provider.devices().is_empty());
        assert!(!provider.is_initialized());
    }

    #[test]
    fn remove_device_detaches_and_publishes() {
        let bus = EventBus::new();
        let provider = provider(keyboards(), ProviderSettings::default(), bus.clone());
        provider.initialize().unwrap();
        let mut events = bus.subscribe();

        let device = provider.device("Acme K1 (2)").unwrap();
        assert!(provider.remove_device("Acme K1 (2)"));
        assert!(!provider.remove_device("Acme K1 (2)"));
        assert!(!device.queue().is_attached());
        assert_eq!(provider.triggers()[0].1.subscriber_count(), 2);

        match events.try_recv().unwrap() {
            Event::DevicesChanged { device, change, .. } => {
                assert_eq!(device, "Acme K1 (2)");
                assert_eq!(change, DeviceChange::Removed);
            }
            other => panic!("Expected DevicesChanged event, got {other:?}"),
        }
    }

    #[test]
    fn reset_publishes_removed_for_every_device() {
        let bus = EventBus::new();
        let provider = provider(keyboards(), ProviderSettings::default(), bus.clone());
        provider.initialize().unwrap();
        let mut events = bus.subscribe();

        provider.reset();

        let mut removed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let Event::DevicesChanged {
                device,
                change: DeviceChange::Removed,
                ..
            } = event
            {
                removed.push(device);
            }
        }
        assert_eq!(removed, vec!["Acme K1", "Acme K1 (2)", "Acme M1"]);
    }

    #[test]
    fn failed_initialize_removes_loaded_devices() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let provider = provider(
            FakeLoader {
                fail_start: true,
                ..keyboards()
            },
            ProviderSettings::default(),
            bus,
        );
        assert!(provider.initialize().is_err());
        assert!(provider.devices().is_empty());

        let (mut added, mut removed) = (0, 0);
        while let Ok(event) = events.try_recv() {
            match event {
                Event::DevicesChanged {
                    change: DeviceChange::Added,
                    ..
                } => added += 1,
                Event::DevicesChanged {
                    change: DeviceChange::Removed,
                    ..
                } => removed += 1,
                _ => {}
            }
        }
        assert_eq!((added, removed), (3, 3));
    }

    #[test]
    fn reinitialize_reuses_names() {
        let provider = provider(keyboards(), ProviderSettings::default(), EventBus::new());
        provider.initialize().unwrap();
        provider.initialize().unwrap();

        assert!(provider.device("Acme K1").is_some());
        assert!(provider.device("Acme K1 (3)").is_none());
    }

    #[test]
    fn drop_shuts_down_sdk() {
        let loader = keyboards();
        let journal = Arc::clone(&loader.journal);
        {
            let provider = provider(loader, ProviderSettings::default(), EventBus::new());
            provider.initialize().unwrap();
        }
        assert_eq!(journal.lock().unwrap().last().unwrap(), "shutdown");
    }
}
