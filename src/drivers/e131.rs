//! E1.31 (streaming ACN) provider: DMX512 over UDP.
//!
//! Devices that share a receiver and universe share one [`DataPacket`]
//! and one trigger. Their queues only patch the packet; a per-universe
//! sender subscribed after them puts it on the wire once per dispatch.

pub mod packet;

use std::{
    collections::HashMap,
    mem,
    net::UdpSocket,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result, bail};
use log::{debug, info, trace};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    color::Color,
    config::E131DeviceCfg,
    device::{DeviceInfo, RgbDevice},
    event::ExceptionReporter,
    led::{Point, Size},
    provider::{DeviceLoader, LoadContext, TriggerId, skip_device},
    update::{UpdateKey, UpdateQueue, UpdateSubscriber, UpdateWriter, lock},
};

use packet::{DataPacket, SLOT_COUNT};

/// Default sACN port.
pub const DEFAULT_PORT: u16 = 5568;

const DEFAULT_SOURCE_NAME: &str = "rgbd";

/// Order in which a fixture expects its color channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    #[default]
    Rgb,
    Grb,
    Bgr,
    /// Fourth white channel carrying the common part of r, g and b.
    Rgbw,
}

impl ChannelOrder {
    /// Channels taken by one LED.
    pub fn width(self) -> usize {
        match self {
            ChannelOrder::Rgbw => 4,
            _ => 3,
        }
    }

    /// Channel values for one LED; only the first [`width`](Self::width) are used.
    pub fn encode(self, color: Color) -> [u8; 4] {
        let (r, g, b) = color.to_rgb_bytes();
        match self {
            ChannelOrder::Rgb => [r, g, b, 0],
            ChannelOrder::Grb => [g, r, b, 0],
            ChannelOrder::Bgr => [b, g, r, 0],
            ChannelOrder::Rgbw => {
                let w = r.min(g).min(b);
                [r - w, g - w, b - w, w]
            }
        }
    }
}

/// Packet and socket for one (host, port, universe).
struct UniverseLink {
    target: String,
    packet: DataPacket,
    socket: Option<UdpSocket>,
    /// Slots changed since the last send.
    dirty: bool,
}

impl UniverseLink {
    fn send(&mut self) -> Result<()> {
        if self.socket.is_none() {
            let socket = UdpSocket::bind("0.0.0.0:0").context("Failed to open E1.31 socket")?;
            debug!("Opened E1.31 socket for {}", self.target);
            self.socket = Some(socket);
        }

        let Some(socket) = &self.socket else {
            bail!("E1.31 socket unavailable");
        };
        if let Err(e) = socket.send_to(self.packet.as_bytes(), &self.target) {
            // Reopen on the next flush.
            self.socket = None;
            return Err(e).with_context(|| format!("Failed to send E1.31 packet to {}", self.target));
        }

        self.packet.advance_sequence();
        Ok(())
    }
}

type SharedLink = Arc<Mutex<UniverseLink>>;

/// Sends a dirty universe once per trigger dispatch.
struct LinkSender {
    link: SharedLink,
    reporter: ExceptionReporter,
}

impl UpdateSubscriber for LinkSender {
    fn on_update(&self) {
        let mut link = lock(&self.link);
        if !mem::take(&mut link.dirty) {
            return;
        }
        if let Err(e) = link.send() {
            self.reporter.report(e, false);
        }
    }
}

struct E131Writer {
    link: SharedLink,
    first_channel: u32,
    last_channel: u32,
    order: ChannelOrder,
}

impl UpdateWriter for E131Writer {
    fn on_startup(&mut self) {
        let mut link = lock(&self.link);
        link.packet
            .clear_channels(self.first_channel..=self.last_channel);
        link.dirty = true;
    }

    fn update(&mut self, batch: &[(UpdateKey, Color)]) -> Result<()> {
        let width = self.order.width();
        let mut link = lock(&self.link);

        for (key, color) in batch {
            let Some(channel) = key.as_channel() else {
                trace!("Ignoring non-channel key {key}");
                continue;
            };
            if channel < self.first_channel || channel > self.last_channel {
                trace!("Ignoring channel {channel} outside the device");
                continue;
            }
            for (offset, value) in self.order.encode(*color)[..width].iter().enumerate() {
                link.packet.set_channel(channel + offset as u32, *value);
            }
            link.dirty = true;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LinkKey {
    host: String,
    port: u16,
    universe: u16,
}

/// Loader for statically configured E1.31 devices.
pub struct E131Loader {
    devices: Vec<E131DeviceCfg>,
    links: HashMap<LinkKey, (TriggerId, SharedLink)>,
}

impl E131Loader {
    pub fn new(devices: Vec<E131DeviceCfg>) -> Self {
        Self {
            devices,
            links: HashMap::new(),
        }
    }

    fn link(&mut self, cfg: &E131DeviceCfg) -> Result<(TriggerId, SharedLink)> {
        let key = LinkKey {
            host: cfg.host.clone(),
            port: cfg.port,
            universe: cfg.universe,
        };
        if let Some((id, link)) = self.links.get(&key) {
            return Ok((*id, Arc::clone(link)));
        }

        let cid = match &cfg.cid {
            Some(cid) => *Uuid::parse_str(cid)
                .with_context(|| format!("Invalid cid '{cid}'"))?
                .as_bytes(),
            None => *Uuid::new_v4().as_bytes(),
        };
        let source_name = cfg.source_name.as_deref().unwrap_or(DEFAULT_SOURCE_NAME);
        let link = Arc::new(Mutex::new(UniverseLink {
            target: format!("{}:{}", cfg.host, cfg.port),
            packet: DataPacket::new(cid, source_name, cfg.universe, cfg.priority),
            socket: None,
            dirty: false,
        }));

        let id = TriggerId(self.links.len() as u32 + 1);
        info!(
            "E1.31 universe {} at {}:{} uses trigger {id}",
            cfg.universe, cfg.host, cfg.port
        );
        self.links.insert(key, (id, Arc::clone(&link)));
        Ok((id, link))
    }

    fn build(&mut self, ctx: &LoadContext<'_>, cfg: &E131DeviceCfg) -> Result<RgbDevice> {
        if cfg.leds == 0 {
            bail!("Device '{}' has no LEDs", cfg.model);
        }
        if cfg.start_channel == 0 || cfg.last_channel() > u32::from(SLOT_COUNT) {
            bail!(
                "Device '{}' needs channels {}..={} outside the universe",
                cfg.model,
                cfg.start_channel,
                cfg.last_channel()
            );
        }

        let (trigger_id, link) = self.link(cfg)?;
        let name = ctx.device_name(&cfg.manufacturer, &cfg.model);
        let first_channel = u32::from(cfg.start_channel);
        let width = cfg.channel_order.width() as u32;

        let queue = UpdateQueue::new(
            name.clone(),
            ctx.update_trigger(trigger_id, ctx.settings().update_rate_hard_limit),
            Box::new(E131Writer {
                link,
                first_channel,
                last_channel: cfg.last_channel(),
                order: cfg.channel_order,
            }),
            ctx.reporter().for_device(&name),
        );
        let device = RgbDevice::new(
            DeviceInfo::new(cfg.device_type, name, &cfg.manufacturer, &cfg.model),
            queue,
        );

        for i in 0..cfg.leds {
            device.add_led(
                cfg.device_type.led_id(i + 1),
                Point::new(f32::from(i) * 10.0, 0.0),
                Size::new(10.0, 10.0),
                Some(UpdateKey::Channel(first_channel + u32::from(i) * width)),
            );
        }
        Ok(device)
    }
}

impl DeviceLoader for E131Loader {
    fn name(&self) -> &str {
        "e131"
    }

    fn init_sdk(&mut self) -> Result<()> {
        self.links.clear();
        Ok(())
    }

    fn load_devices(&mut self, ctx: &LoadContext<'_>) -> Result<Vec<RgbDevice>> {
        let configs = self.devices.clone();
        let mut devices = Vec::with_capacity(configs.len());
        for cfg in &configs {
            match self.build(ctx, cfg) {
                Ok(device) => devices.push(device),
                Err(e) => skip_device(ctx, &format!("E1.31 device '{}'", cfg.model), e),
            }
        }

        // Subscribed last, so each dispatch reaches every queue of the
        // universe before the sender.
        for (id, link) in self.links.values() {
            let trigger = ctx.update_trigger(*id, ctx.settings().update_rate_hard_limit);
            trigger.subscribe(Arc::new(LinkSender {
                link: Arc::clone(link),
                reporter: ctx.reporter().clone(),
            }));
        }
        Ok(devices)
    }

    fn shutdown_sdk(&mut self) {
        self.links.clear();
    }
}
