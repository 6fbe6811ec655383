//! Virtual devices that log every flush.
//!
//! Useful for trying out configurations without hardware, and as the
//! reference [`DeviceLoader`] in tests.

use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use dashmap::DashMap;
use log::{debug, info, trace};

use crate::{
    color::Color,
    config::DebugDeviceCfg,
    device::{DeviceInfo, RgbDevice},
    led::{Point, Size},
    provider::{DeviceLoader, LoadContext, skip_device},
    update::{UpdateKey, UpdateQueue, UpdateWriter, lock},
};

/// Edge length of one virtual LED in layout units.
const LED_SIZE: f32 = 10.0;

#[derive(Debug, Default)]
struct FrameState {
    last: Vec<(UpdateKey, Color)>,
    flushes: u64,
    startups: u64,
}

/// Shared view of what a debug device last received.
#[derive(Debug, Clone, Default)]
pub struct DebugFrame(Arc<Mutex<FrameState>>);

impl DebugFrame {
    /// Entries of the most recent flush.
    pub fn last_frame(&self) -> Vec<(UpdateKey, Color)> {
        lock(&self.0).last.clone()
    }

    pub fn flush_count(&self) -> u64 {
        lock(&self.0).flushes
    }

    pub fn startup_count(&self) -> u64 {
        lock(&self.0).startups
    }
}

/// Frames of every loaded debug device, keyed by device name.
pub type DebugFrames = Arc<DashMap<String, DebugFrame>>;

struct DebugWriter {
    device: String,
    frame: DebugFrame,
}

impl UpdateWriter for DebugWriter {
    fn on_startup(&mut self) {
        let mut state = lock(&self.frame.0);
        state.last.clear();
        state.startups += 1;
    }

    fn update(&mut self, batch: &[(UpdateKey, Color)]) -> Result<()> {
        for (key, color) in batch {
            trace!("[{}] {key} = {color}", self.device);
        }

        let mut state = lock(&self.frame.0);
        state.flushes += 1;
        state.last = batch.to_vec();
        debug!(
            "[{}] flush #{} with {} entries",
            self.device,
            state.flushes,
            batch.len()
        );
        Ok(())
    }
}

/// Loader producing one virtual device per configuration entry.
pub struct DebugLoader {
    devices: Vec<DebugDeviceCfg>,
    frames: DebugFrames,
}

impl DebugLoader {
    pub fn new(devices: Vec<DebugDeviceCfg>) -> Self {
        Self {
            devices,
            frames: Arc::new(DashMap::new()),
        }
    }

    /// Handle to the frames of loaded devices. Stays valid across reloads;
    /// entries only live while their provider is initialized.
    pub fn frames(&self) -> DebugFrames {
        Arc::clone(&self.frames)
    }

    fn build(&self, ctx: &LoadContext<'_>, cfg: &DebugDeviceCfg) -> Result<RgbDevice> {
        if cfg.leds == 0 {
            return Err(anyhow!("Device '{}' has no LEDs", cfg.model));
        }

        let name = ctx.device_name(&cfg.manufacturer, &cfg.model);
        let frame = DebugFrame::default();
        self.frames.insert(name.clone(), frame.clone());

        let queue = UpdateQueue::new(
            name.clone(),
            ctx.default_trigger(),
            Box::new(DebugWriter {
                device: name.clone(),
                frame,
            }),
            ctx.reporter().for_device(&name),
        );
        let device = RgbDevice::new(
            DeviceInfo::new(cfg.device_type, name, &cfg.manufacturer, &cfg.model),
            queue,
        );

        let columns = cfg.columns.unwrap_or(cfg.leds).max(1);
        for i in 0..cfg.leds {
            let (row, column) = (i / columns, i % columns);
            device.add_led(
                cfg.device_type.led_id(i + 1),
                Point::new(f32::from(column) * LED_SIZE, f32::from(row) * LED_SIZE),
                Size::new(LED_SIZE, LED_SIZE),
                None,
            );
        }
        Ok(device)
    }
}

impl DeviceLoader for DebugLoader {
    fn name(&self) -> &str {
        "debug"
    }

    fn init_sdk(&mut self) -> Result<()> {
        info!("Debug provider ready with {} device(s)", self.devices.len());
        Ok(())
    }

    fn load_devices(&mut self, ctx: &LoadContext<'_>) -> Result<Vec<RgbDevice>> {
        self.frames.clear();
        let mut devices = Vec::with_capacity(self.devices.len());
        for cfg in &self.devices {
            match self.build(ctx, cfg) {
                Ok(device) => devices.push(device),
                Err(e) => skip_device(ctx, &format!("debug device '{}'", cfg.model), e),
            }
        }
        Ok(devices)
    }

    fn shutdown_sdk(&mut self) {
        self.frames.clear();
    }
}
