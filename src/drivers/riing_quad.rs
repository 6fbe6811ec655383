//! Thermaltake Riing Quad fan controllers over HID.
//!
//! Every controller drives five fan ports. Each port becomes one
//! [`DeviceType::Fan`] device whose LEDs are keyed by their index on the
//! fan ring; all five share the controller's update trigger.

pub mod controller;
pub mod device_io;
pub mod protocol;

use std::{
    f32::consts::TAU,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use hidapi::HidApi;
use log::{debug, info, warn};

use crate::{
    color::Color,
    config::UsbSelector,
    device::{DeviceInfo, DeviceType, RgbDevice},
    led::{LedId, Point, Size},
    provider::{DeviceLoader, LoadContext, TriggerId, skip_device},
    update::{UpdateKey, UpdateQueue, UpdateWriter, lock},
};

use self::{controller::Controller, device_io::DeviceIO, protocol::MODE_PER_LED};

/// Thermaltake USB vendor ID.
pub const VID: u16 = 0x264A;

/// Fan ports per controller.
pub const PORTS: u8 = 5;

pub const MANUFACTURER: &str = "Thermaltake";

/// A controller stalls when flushed faster than this.
pub const HARD_LIMIT: Duration = Duration::from_millis(20);

const RING_RADIUS: f32 = 40.0;
const LED_SIZE: f32 = 10.0;

type SharedController = Arc<Mutex<Controller<Box<dyn DeviceIO>>>>;

/// Finds and opens controllers.
pub trait ControllerSource: Send {
    fn init(&mut self) -> Result<()>;

    /// One entry per controller found; failures to open are reported
    /// individually.
    fn open_all(&mut self) -> Vec<Result<Box<dyn DeviceIO>>>;

    fn shutdown(&mut self) {}
}

/// Controllers reached through hidapi.
pub struct HidSource {
    selectors: Vec<UsbSelector>,
    api: Option<HidApi>,
}

impl HidSource {
    pub fn new(selectors: Vec<UsbSelector>) -> Self {
        Self {
            selectors,
            api: None,
        }
    }

    fn open(api: &HidApi, selector: &UsbSelector) -> Result<Box<dyn DeviceIO>> {
        let device = match &selector.serial {
            Some(serial) => api.open_serial(selector.vid, selector.pid, serial),
            None => api.open(selector.vid, selector.pid),
        }
        .map_err(|e| {
            anyhow!(
                "Failed to open {:04X}:{:04X}: {e}",
                selector.vid,
                selector.pid
            )
        })?;
        Ok(Box::new(device))
    }
}

impl ControllerSource for HidSource {
    fn init(&mut self) -> Result<()> {
        self.api = Some(HidApi::new().map_err(|e| anyhow!("Failed to initialize hidapi: {e}"))?);
        Ok(())
    }

    fn open_all(&mut self) -> Vec<Result<Box<dyn DeviceIO>>> {
        let Some(api) = &self.api else {
            return vec![Err(anyhow!("hidapi is not initialized"))];
        };

        if !self.selectors.is_empty() {
            return self
                .selectors
                .iter()
                .map(|selector| Self::open(api, selector))
                .collect();
        }

        api.device_list()
            .filter(|d| d.vendor_id() == VID)
            .inspect(|d| info!("{:?} device PID={:04X}", d.product_string(), d.product_id()))
            .map(|d| {
                d.open_device(api)
                    .map(|device| Box::new(device) as Box<dyn DeviceIO>)
                    .map_err(|e| anyhow!("Failed to open {:04X}:{:04X}: {e}", VID, d.product_id()))
            })
            .collect()
    }

    fn shutdown(&mut self) {
        self.api = None;
    }
}

/// Writes one fan port. Colors are kept in wire order `(g, r, b)`.
struct FanWriter {
    controller: SharedController,
    port: u8,
    frame: Vec<(u8, u8, u8)>,
}

impl UpdateWriter for FanWriter {
    fn on_startup(&mut self) {
        self.frame.fill((0, 0, 0));
    }

    fn update(&mut self, batch: &[(UpdateKey, Color)]) -> Result<()> {
        for (key, color) in batch {
            let Some(slot) = key
                .as_channel()
                .and_then(|index| self.frame.get_mut(index as usize))
            else {
                continue;
            };
            let (r, g, b) = color.to_rgb_bytes();
            *slot = (g, r, b);
        }

        lock(&self.controller)
            .set_rgb(self.port, MODE_PER_LED, self.frame.clone())
            .with_context(|| format!("Failed to write fan port {}", self.port))
    }
}

pub struct RiingQuadLoader {
    source: Box<dyn ControllerSource>,
    leds_per_fan: u16,
}

impl RiingQuadLoader {
    pub fn new(controllers: Vec<UsbSelector>, leds_per_fan: u16) -> Self {
        Self::with_source(Box::new(HidSource::new(controllers)), leds_per_fan)
    }

    pub fn with_source(source: Box<dyn ControllerSource>, leds_per_fan: u16) -> Self {
        Self {
            source,
            leds_per_fan,
        }
    }

    /// Handshakes with the controller and builds its five fan devices.
    fn attach(
        &self,
        ctx: &LoadContext<'_>,
        index: u32,
        io: Box<dyn DeviceIO>,
    ) -> Result<Vec<RgbDevice>> {
        let controller = Controller::new(format!("Riing Quad {index}"), io);
        controller.init()?;
        match controller.firmware_version() {
            Ok((major, minor, patch)) => {
                info!("{} firmware {major}.{minor}.{patch}", controller.name)
            }
            Err(e) => warn!("Could not read firmware of {}: {e:#}", controller.name),
        }

        let shared: SharedController = Arc::new(Mutex::new(controller));
        let trigger = ctx.update_trigger(TriggerId(index), HARD_LIMIT);

        let devices = (1..=PORTS)
            .map(|port| {
                let model = format!("Riing Quad {index} Fan {port}");
                let name = ctx.device_name(MANUFACTURER, &model);
                let queue = UpdateQueue::new(
                    name.clone(),
                    Arc::clone(&trigger),
                    Box::new(FanWriter {
                        controller: Arc::clone(&shared),
                        port,
                        frame: vec![(0, 0, 0); usize::from(self.leds_per_fan)],
                    }),
                    ctx.reporter().for_device(&name),
                );
                let device = RgbDevice::new(
                    DeviceInfo::new(DeviceType::Fan, name, MANUFACTURER, &model),
                    queue,
                );
                self.place_ring(&device);
                device
            })
            .collect();
        Ok(devices)
    }

    /// Lays the LEDs out clockwise on a ring.
    fn place_ring(&self, device: &RgbDevice) {
        let count = f32::from(self.leds_per_fan);
        for i in 0..self.leds_per_fan {
            let angle = TAU * f32::from(i) / count;
            let location = Point::new(
                RING_RADIUS + RING_RADIUS * angle.sin(),
                RING_RADIUS - RING_RADIUS * angle.cos(),
            );
            device.add_led(
                LedId::Fan(i + 1),
                location,
                Size::new(LED_SIZE, LED_SIZE),
                Some(UpdateKey::Channel(u32::from(i))),
            );
        }
    }
}

impl DeviceLoader for RiingQuadLoader {
    fn name(&self) -> &str {
        "riing-quad"
    }

    fn init_sdk(&mut self) -> Result<()> {
        self.source.init()
    }

    fn load_devices(&mut self, ctx: &LoadContext<'_>) -> Result<Vec<RgbDevice>> {
        let opened = self.source.open_all();
        debug!("Found {} Riing Quad controller(s)", opened.len());

        let mut devices = Vec::new();
        for (index, io) in (1u32..).zip(opened) {
            let what = format!("Riing Quad controller {index}");
            match io.and_then(|io| self.attach(ctx, index, io)) {
                Ok(fans) => devices.extend(fans),
                Err(e) => skip_device(ctx, &what, e),
            }
        }
        Ok(devices)
    }

    fn shutdown_sdk(&mut self) {
        self.source.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        drivers::riing_quad::{device_io::MockDeviceIO, protocol::STATUS_OK},
        event::{Event, EventBus},
        id_registry::IdRegistry,
        provider::{DeviceProvider, ProviderSettings},
    };
    use pretty_assertions::assert_eq;
    use std::{thread::sleep, time::Instant};

    type Sent = Arc<Mutex<Vec<Vec<u8>>>>;

    fn recording(status: u8, sent: Sent) -> MockDeviceIO {
        let mut dev = MockDeviceIO::new();
        dev.expect_write().returning(move |buf| {
            sent.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        });
        dev.expect_read().returning(move |buf, _| {
            buf[2] = status;
            Ok(())
        });
        dev
    }

    struct FakeSource(Vec<Option<MockDeviceIO>>);

    impl ControllerSource for FakeSource {
        fn init(&mut self) -> Result<()> {
            Ok(())
        }

        fn open_all(&mut self) -> Vec<Result<Box<dyn DeviceIO>>> {
            self.0
                .drain(..)
                .map(|dev| {
                    dev.map(|dev| Box::new(dev) as Box<dyn DeviceIO>)
                        .ok_or_else(|| anyhow!("device busy"))
                })
                .collect()
        }
    }

    fn provider(source: FakeSource, leds_per_fan: u16) -> DeviceProvider {
        DeviceProvider::new(
            "riing",
            Box::new(RiingQuadLoader::with_source(Box::new(source), leds_per_fan)),
            ProviderSettings::default(),
            Arc::new(IdRegistry::new()),
            EventBus::new(),
        )
    }

    fn set_rgb_frames(sent: &Sent) -> Vec<Vec<u8>> {
        sent.lock()
            .unwrap()
            .iter()
            .filter(|buf| buf[1..3] == [0x32, 0x52])
            .cloned()
            .collect()
    }

    #[test]
    fn controller_exposes_five_fans_on_one_trigger() {
        let sent = Sent::default();
        let provider = provider(FakeSource(vec![Some(recording(STATUS_OK, sent))]), 12);
        provider.initialize().unwrap();

        let devices = provider.devices();
        assert_eq!(devices.len(), 5);
        assert!(devices.iter().all(|d| d.device_type() == DeviceType::Fan));
        assert!(devices.iter().all(|d| d.led_count() == 12));
        assert_eq!(provider.triggers().len(), 1);
        assert_eq!(provider.triggers()[0].0, TriggerId(1));
        assert!(provider.device("Thermaltake Riing Quad 1 Fan 3").is_some());
    }

    #[test]
    fn failed_handshake_skips_only_that_controller() {
        let provider = provider(
            FakeSource(vec![
                Some(recording(0x00, Sent::default())),
                None,
                Some(recording(STATUS_OK, Sent::default())),
            ]),
            4,
        );
        let mut events = provider.reporter().bus().subscribe();
        provider.initialize().unwrap();

        assert_eq!(provider.devices().len(), 5);
        assert!(provider.device("Thermaltake Riing Quad 3 Fan 1").is_some());

        let mut skipped = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, Event::Exception(_)) {
                skipped += 1;
            }
        }
        assert_eq!(skipped, 2);
    }

    #[test]
    fn flush_sends_grb_frame_for_port() {
        let sent = Sent::default();
        let provider = provider(
            FakeSource(vec![Some(recording(STATUS_OK, sent.clone()))]),
            3,
        );
        provider.initialize().unwrap();

        let fan = provider.device("Thermaltake Riing Quad 1 Fan 2").unwrap();
        fan.set_color(LedId::Fan(2), Color::from_rgb_bytes(10, 20, 30));
        fan.update(false);

        let deadline = Instant::now() + Duration::from_secs(5);
        while set_rgb_frames(&sent).is_empty() && Instant::now() < deadline {
            sleep(Duration::from_millis(5));
        }

        let frames = set_rgb_frames(&sent);
        assert_eq!(
            frames[0],
            vec![0x00, 0x32, 0x52, 2, MODE_PER_LED, 0, 0, 0, 20, 10, 30, 0, 0, 0]
        );
    }

    #[test]
    fn ring_layout_starts_at_top() {
        let sent = Sent::default();
        let provider = provider(FakeSource(vec![Some(recording(STATUS_OK, sent))]), 4);
        provider.initialize().unwrap();

        let fan = provider.device("Thermaltake Riing Quad 1 Fan 1").unwrap();
        let first = fan.led(LedId::Fan(1)).unwrap();
        assert_eq!(first.boundary().location, Point::new(RING_RADIUS, 0.0));
        assert_eq!(first.custom_data(), Some(UpdateKey::Channel(0)));
    }
}
