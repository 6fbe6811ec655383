//! LED identifiers, layout geometry and the per-LED state kept by devices.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{color::Color, update::UpdateKey};

/// Logical LED identifier: a family plus a 1-based index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "family", content = "index", rename_all = "kebab-case")]
pub enum LedId {
    Keyboard(u16),
    Mouse(u16),
    Headset(u16),
    Mousepad(u16),
    LedStripe(u16),
    LedMatrix(u16),
    Mainboard(u16),
    GraphicsCard(u16),
    Dram(u16),
    HeadsetStand(u16),
    Keypad(u16),
    Fan(u16),
    Speaker(u16),
    Cooler(u16),
    Monitor(u16),
    LedController(u16),
    GameController(u16),
    Custom(u16),
}

impl LedId {
    /// Index within the LED family.
    pub fn index(&self) -> u16 {
        match *self {
            LedId::Keyboard(i)
            | LedId::Mouse(i)
            | LedId::Headset(i)
            | LedId::Mousepad(i)
            | LedId::LedStripe(i)
            | LedId::LedMatrix(i)
            | LedId::Mainboard(i)
            | LedId::GraphicsCard(i)
            | LedId::Dram(i)
            | LedId::HeadsetStand(i)
            | LedId::Keypad(i)
            | LedId::Fan(i)
            | LedId::Speaker(i)
            | LedId::Cooler(i)
            | LedId::Monitor(i)
            | LedId::LedController(i)
            | LedId::GameController(i)
            | LedId::Custom(i) => i,
        }
    }
}

impl fmt::Display for LedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl From<(f32, f32)> for Point {
    fn from((x, y): (f32, f32)) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f32,
    pub height: f32,
}

impl Size {
    pub const fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rectangle {
    pub location: Point,
    pub size: Size,
}

impl Rectangle {
    pub fn center(&self) -> Point {
        Point::new(
            self.location.x + self.size.width / 2.0,
            self.location.y + self.size.height / 2.0,
        )
    }

    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.location.x
            && point.y >= self.location.y
            && point.x <= self.location.x + self.size.width
            && point.y <= self.location.y + self.size.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Shape {
    #[default]
    Rectangle,
    Circle,
}

/// A single addressable light on a device.
///
/// LEDs live inside their [`RgbDevice`](crate::device::RgbDevice); the
/// `device` field only names the owner and never keeps it alive.
#[derive(Debug, Clone)]
pub struct Led {
    id: LedId,
    device: Arc<str>,
    color: Color,
    requested_color: Option<Color>,
    location: Point,
    size: Size,
    shape: Shape,
    custom_data: Option<UpdateKey>,
}

impl Led {
    pub fn new(
        id: LedId,
        device: Arc<str>,
        location: Point,
        size: Size,
        custom_data: Option<UpdateKey>,
    ) -> Self {
        Self {
            id,
            device,
            color: Color::TRANSPARENT,
            requested_color: None,
            location,
            size,
            shape: Shape::default(),
            custom_data,
        }
    }

    pub fn with_shape(mut self, shape: Shape) -> Self {
        self.shape = shape;
        self
    }

    pub fn id(&self) -> LedId {
        self.id
    }

    /// Name of the owning device.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Last committed color.
    pub fn color(&self) -> Color {
        self.color
    }

    pub fn requested_color(&self) -> Option<Color> {
        self.requested_color
    }

    pub fn is_dirty(&self) -> bool {
        self.requested_color.is_some()
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn custom_data(&self) -> Option<UpdateKey> {
        self.custom_data
    }

    pub fn boundary(&self) -> Rectangle {
        Rectangle {
            location: self.location,
            size: self.size,
        }
    }

    /// Key under which this LED is coalesced in its device's update queue.
    pub fn update_key(&self) -> UpdateKey {
        self.custom_data.unwrap_or(UpdateKey::Led(self.id))
    }

    /// Records a color to be committed on the next device update.
    pub fn request_color(&mut self, color: Color) {
        self.requested_color = Some(color);
    }

    /// Commits the requested color, if any, and clears the dirty flag.
    pub fn apply_requested(&mut self) {
        if let Some(color) = self.requested_color.take() {
            self.color = color;
        }
    }
}
