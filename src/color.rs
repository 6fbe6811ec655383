//! Color value type shared by LEDs, update queues and device writers.
//!
//! Components are normalized floats; bytes only appear at the hardware
//! write boundary through [`Color::to_argb_bytes`] and friends.

use std::{fmt, str::FromStr};

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Tolerance used when comparing two color components.
const TOLERANCE: f32 = 1e-6;

/// Immutable ARGB color with components in `[0, 1]`.
///
/// # Example
///
/// ```
/// use rgbd::color::Color;
///
/// let ocean: Color = "#0066CC".parse()?;
/// assert_eq!(ocean.to_rgb_bytes(), (0x00, 0x66, 0xCC));
/// assert_eq!(ocean, Color::from_rgb_bytes(0x00, 0x66, 0xCC));
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Color {
    a: f32,
    r: f32,
    g: f32,
    b: f32,
}

impl Color {
    pub const TRANSPARENT: Color = Color::const_argb(0.0, 0.0, 0.0, 0.0);
    pub const BLACK: Color = Color::const_argb(1.0, 0.0, 0.0, 0.0);
    pub const WHITE: Color = Color::const_argb(1.0, 1.0, 1.0, 1.0);
    pub const RED: Color = Color::const_argb(1.0, 1.0, 0.0, 0.0);
    pub const GREEN: Color = Color::const_argb(1.0, 0.0, 1.0, 0.0);
    pub const BLUE: Color = Color::const_argb(1.0, 0.0, 0.0, 1.0);

    const fn const_argb(a: f32, r: f32, g: f32, b: f32) -> Self {
        Self { a, r, g, b }
    }

    /// Creates a color from float components, clamping each into `[0, 1]`.
    pub fn from_argb(a: f32, r: f32, g: f32, b: f32) -> Self {
        Self {
            a: clamp_unit(a),
            r: clamp_unit(r),
            g: clamp_unit(g),
            b: clamp_unit(b),
        }
    }

    /// Creates an opaque color from float components.
    pub fn from_rgb(r: f32, g: f32, b: f32) -> Self {
        Self::from_argb(1.0, r, g, b)
    }

    pub fn from_argb_bytes(a: u8, r: u8, g: u8, b: u8) -> Self {
        Self {
            a: percentage_from_byte(a),
            r: percentage_from_byte(r),
            g: percentage_from_byte(g),
            b: percentage_from_byte(b),
        }
    }

    pub fn from_rgb_bytes(r: u8, g: u8, b: u8) -> Self {
        Self::from_argb_bytes(u8::MAX, r, g, b)
    }

    pub fn a(&self) -> f32 {
        self.a
    }

    pub fn r(&self) -> f32 {
        self.r
    }

    pub fn g(&self) -> f32 {
        self.g
    }

    pub fn b(&self) -> f32 {
        self.b
    }

    /// Returns `(a, r, g, b)` scaled to bytes.
    pub fn to_argb_bytes(&self) -> (u8, u8, u8, u8) {
        (
            byte_from_percentage(self.a),
            byte_from_percentage(self.r),
            byte_from_percentage(self.g),
            byte_from_percentage(self.b),
        )
    }

    /// Returns `(r, g, b)` scaled to bytes, ignoring alpha.
    pub fn to_rgb_bytes(&self) -> (u8, u8, u8) {
        let (_, r, g, b) = self.to_argb_bytes();
        (r, g, b)
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::TRANSPARENT
    }
}

impl PartialEq for Color {
    fn eq(&self, other: &Self) -> bool {
        (self.a - other.a).abs() < TOLERANCE
            && (self.r - other.r).abs() < TOLERANCE
            && (self.g - other.g).abs() < TOLERANCE
            && (self.b - other.b).abs() < TOLERANCE
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (a, r, g, b) = self.to_argb_bytes();
        write!(f, "#{a:02X}{r:02X}{g:02X}{b:02X}")
    }
}

impl FromStr for Color {
    type Err = anyhow::Error;

    /// Parses `#RRGGBB` or `#AARRGGBB` (the leading `#` is optional).
    fn from_str(s: &str) -> Result<Self> {
        let hex = s.trim().trim_start_matches('#');
        let value =
            u32::from_str_radix(hex, 16).map_err(|e| anyhow!("Invalid color '{s}': {e}"))?;

        match hex.len() {
            6 => {
                let [_, r, g, b] = value.to_be_bytes();
                Ok(Self::from_rgb_bytes(r, g, b))
            }
            8 => {
                let [a, r, g, b] = value.to_be_bytes();
                Ok(Self::from_argb_bytes(a, r, g, b))
            }
            _ => bail!("Invalid color '{s}': expected #RRGGBB or #AARRGGBB"),
        }
    }
}

impl Serialize for Color {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Color {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Scales a normalized component to a byte.
pub fn byte_from_percentage(value: f32) -> u8 {
    if value >= 1.0 {
        u8::MAX
    } else if value <= 0.0 {
        0
    } else {
        (value * 256.0) as u8
    }
}

/// Scales a byte to a normalized component.
pub fn percentage_from_byte(value: u8) -> f32 {
    f32::from(value) / 255.0
}
