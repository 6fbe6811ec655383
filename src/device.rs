//! Devices: a named set of LEDs bound to one update queue.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};

use crate::{
    color::Color,
    led::{Led, LedId, Point, Size},
    update::{UpdateKey, UpdateQueue, lock},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum DeviceType {
    Keyboard,
    Mouse,
    Headset,
    Mousepad,
    LedStripe,
    LedMatrix,
    Mainboard,
    GraphicsCard,
    Dram,
    HeadsetStand,
    Keypad,
    Fan,
    Speaker,
    Cooler,
    Monitor,
    LedController,
    GameController,
    Unknown,
}

impl DeviceType {
    const fn bit(self) -> u32 {
        1 << self as u8
    }

    /// LED id of the family matching this device type.
    pub fn led_id(self, index: u16) -> LedId {
        match self {
            DeviceType::Keyboard => LedId::Keyboard(index),
            DeviceType::Mouse => LedId::Mouse(index),
            DeviceType::Headset => LedId::Headset(index),
            DeviceType::Mousepad => LedId::Mousepad(index),
            DeviceType::LedStripe => LedId::LedStripe(index),
            DeviceType::LedMatrix => LedId::LedMatrix(index),
            DeviceType::Mainboard => LedId::Mainboard(index),
            DeviceType::GraphicsCard => LedId::GraphicsCard(index),
            DeviceType::Dram => LedId::Dram(index),
            DeviceType::HeadsetStand => LedId::HeadsetStand(index),
            DeviceType::Keypad => LedId::Keypad(index),
            DeviceType::Fan => LedId::Fan(index),
            DeviceType::Speaker => LedId::Speaker(index),
            DeviceType::Cooler => LedId::Cooler(index),
            DeviceType::Monitor => LedId::Monitor(index),
            DeviceType::LedController => LedId::LedController(index),
            DeviceType::GameController => LedId::GameController(index),
            DeviceType::Unknown => LedId::Custom(index),
        }
    }
}

/// Set of device types a provider accepts while loading.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DeviceTypeFilter(u32);

impl DeviceTypeFilter {
    pub const ALL: DeviceTypeFilter = DeviceTypeFilter(u32::MAX);
    pub const NONE: DeviceTypeFilter = DeviceTypeFilter(0);

    pub fn contains(&self, device_type: DeviceType) -> bool {
        self.0 & device_type.bit() != 0
    }

    pub fn insert(&mut self, device_type: DeviceType) {
        self.0 |= device_type.bit();
    }

    pub fn with(mut self, device_type: DeviceType) -> Self {
        self.insert(device_type);
        self
    }
}

impl Default for DeviceTypeFilter {
    fn default() -> Self {
        Self::ALL
    }
}

impl FromIterator<DeviceType> for DeviceTypeFilter {
    fn from_iter<T: IntoIterator<Item = DeviceType>>(iter: T) -> Self {
        iter.into_iter().fold(Self::NONE, Self::with)
    }
}

impl fmt::Debug for DeviceTypeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::ALL {
            return f.write_str("DeviceTypeFilter(ALL)");
        }
        write!(f, "DeviceTypeFilter({:#x})", self.0)
    }
}

/// Static description of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub device_type: DeviceType,
    /// Unique within the owning provider.
    pub device_name: String,
    pub manufacturer: String,
    pub model: String,
}

impl DeviceInfo {
    pub fn new(
        device_type: DeviceType,
        device_name: impl Into<String>,
        manufacturer: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            device_type,
            device_name: device_name.into(),
            manufacturer: manufacturer.into(),
            model: model.into(),
        }
    }
}

/// A physical device: its LEDs and the queue that writes them.
///
/// Colors are set per LED and reach the hardware only after
/// [`update`](Self::update) pushes them into the queue.
pub struct RgbDevice {
    info: DeviceInfo,
    name: Arc<str>,
    leds: Mutex<BTreeMap<LedId, Led>>,
    queue: UpdateQueue,
}

impl RgbDevice {
    pub fn new(info: DeviceInfo, queue: UpdateQueue) -> Self {
        Self {
            name: Arc::from(info.device_name.as_str()),
            info,
            leds: Mutex::new(BTreeMap::new()),
            queue,
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_type(&self) -> DeviceType {
        self.info.device_type
    }

    pub fn queue(&self) -> &UpdateQueue {
        &self.queue
    }

    /// Adds an LED to the layout. Returns `false` if `id` already exists.
    pub fn add_led(
        &self,
        id: LedId,
        location: Point,
        size: Size,
        custom_data: Option<UpdateKey>,
    ) -> bool {
        let mut leds = lock(&self.leds);
        if leds.contains_key(&id) {
            return false;
        }
        leds.insert(
            id,
            Led::new(id, Arc::clone(&self.name), location, size, custom_data),
        );
        true
    }

    pub fn remove_led(&self, id: LedId) -> Option<Led> {
        lock(&self.leds).remove(&id)
    }

    /// Snapshot of a single LED.
    pub fn led(&self, id: LedId) -> Option<Led> {
        lock(&self.leds).get(&id).cloned()
    }

    /// Snapshot of every LED, ordered by id.
    pub fn leds(&self) -> Vec<Led> {
        lock(&self.leds).values().cloned().collect()
    }

    pub fn led_count(&self) -> usize {
        lock(&self.leds).len()
    }

    /// Requests a color for one LED. Returns `false` for an unknown id.
    pub fn set_color(&self, id: LedId, color: Color) -> bool {
        match lock(&self.leds).get_mut(&id) {
            Some(led) => {
                led.request_color(color);
                true
            }
            None => false,
        }
    }

    pub fn set_all(&self, color: Color) {
        for led in lock(&self.leds).values_mut() {
            led.request_color(color);
        }
    }

    /// Commits requested colors and queues the affected LEDs.
    ///
    /// With `flush_leds` every LED is queued, not only the dirty ones.
    /// Fully transparent LEDs are never sent.
    pub fn update(&self, flush_leds: bool) {
        let entries: Vec<(UpdateKey, Color)> = {
            let mut leds = lock(&self.leds);
            leds.values_mut()
                .filter(|led| flush_leds || led.is_dirty())
                .filter_map(|led| {
                    led.apply_requested();
                    (led.color().a() > 0.0).then(|| (led.update_key(), led.color()))
                })
                .collect()
        };
        self.queue.set_data(entries);
    }

    /// Drops pending writes and unsubscribes the queue from its trigger.
    pub fn detach(&self) {
        self.queue.reset();
        self.queue.detach();
    }
}

impl fmt::Debug for RgbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RgbDevice")
            .field("info", &self.info)
            .field("leds", &self.led_count())
            .field("queue", &self.queue.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::{EventBus, ExceptionReporter},
        update::{ManualUpdateTrigger, UpdateTrigger, queue::tests::RecordingWriter},
    };
    use pretty_assertions::assert_eq;

    fn device() -> (Arc<ManualUpdateTrigger>, RecordingWriter, RgbDevice) {
        let trigger = Arc::new(ManualUpdateTrigger::new("device"));
        let writer = RecordingWriter::default();
        let queue = UpdateQueue::new(
            "Keyboard",
            trigger.clone(),
            Box::new(writer.clone()),
            ExceptionReporter::new("test", EventBus::new()),
        );
        let device = RgbDevice::new(
            DeviceInfo::new(DeviceType::Keyboard, "Keyboard", "Acme", "K1"),
            queue,
        );
        for i in 1..=3u16 {
            device.add_led(
                LedId::Keyboard(i),
                Point::new(f32::from(i) * 10.0, 0.0),
                Size::new(10.0, 10.0),
                Some(UpdateKey::Channel(u32::from(i) * 3)),
            );
        }
        trigger.start().unwrap();
        (trigger, writer, device)
    }

    #[test]
    fn filter_membership() {
        let filter: DeviceTypeFilter = [DeviceType::Keyboard, DeviceType::Fan].into_iter().collect();
        assert!(filter.contains(DeviceType::Fan));
        assert!(!filter.contains(DeviceType::Mouse));
        assert!(DeviceTypeFilter::ALL.contains(DeviceType::Unknown));
        assert!(!DeviceTypeFilter::NONE.contains(DeviceType::Keyboard));
        assert_eq!(DeviceTypeFilter::default(), DeviceTypeFilter::ALL);
    }

    #[test]
    fn device_type_maps_to_led_family() {
        assert_eq!(DeviceType::Fan.led_id(3), LedId::Fan(3));
        assert_eq!(DeviceType::Unknown.led_id(1), LedId::Custom(1));
    }

    #[test]
    fn duplicate_led_is_rejected() {
        let (_trigger, _writer, device) = device();
        assert!(!device.add_led(LedId::Keyboard(1), Point::default(), Size::default(), None));
        assert_eq!(device.led_count(), 3);
        assert_eq!(device.led(LedId::Keyboard(1)).unwrap().device(), "Keyboard");
    }

    #[test]
    fn update_sends_only_dirty_leds() {
        let (trigger, writer, device) = device();

        assert!(device.set_color(LedId::Keyboard(2), Color::RED));
        assert!(!device.set_color(LedId::Mouse(1), Color::RED));
        device.update(false);
        trigger.trigger_update();

        assert_eq!(writer.batches(), vec![vec![(UpdateKey::Channel(6), Color::RED)]]);
        assert!(!device.led(LedId::Keyboard(2)).unwrap().is_dirty());
    }

    #[test]
    fn flush_sends_all_visible_leds() {
        let (trigger, writer, device) = device();

        device.set_all(Color::BLUE);
        device.set_color(LedId::Keyboard(3), Color::TRANSPARENT);
        device.update(false);
        trigger.trigger_update();
        device.update(true);
        trigger.trigger_update();

        let expected = vec![
            (UpdateKey::Channel(3), Color::BLUE),
            (UpdateKey::Channel(6), Color::BLUE),
        ];
        assert_eq!(writer.batches(), vec![expected.clone(), expected]);
    }

    #[test]
    fn detach_silences_device() {
        let (trigger, writer, device) = device();

        device.set_all(Color::GREEN);
        device.update(false);
        device.detach();
        trigger.trigger_update();

        assert!(writer.batches().is_empty());
        assert_eq!(trigger.subscriber_count(), 0);
    }
}
