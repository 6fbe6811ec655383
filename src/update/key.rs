//! Keys of the coalescing map held by every update queue.

use std::fmt;

use crate::led::LedId;

/// Opaque vendor key packed into 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VendorKey(pub u64);

impl VendorKey {
    /// Packs two 32-bit halves, e.g. a zone and an index within it.
    pub const fn pair(hi: u32, lo: u32) -> Self {
        Self(((hi as u64) << 32) | lo as u64)
    }

    pub const fn split(self) -> (u32, u32) {
        ((self.0 >> 32) as u32, self.0 as u32)
    }
}

/// Identifier a device writer understands.
///
/// LEDs without custom data are keyed by their [`LedId`]; vendors that
/// address hardware by channel index or by some native handle put a
/// `Channel` or `Vendor` key into the LED's custom data instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UpdateKey {
    Led(LedId),
    Channel(u32),
    Vendor(VendorKey),
}

impl UpdateKey {
    pub fn as_channel(&self) -> Option<u32> {
        match *self {
            UpdateKey::Channel(channel) => Some(channel),
            _ => None,
        }
    }
}

impl From<LedId> for UpdateKey {
    fn from(value: LedId) -> Self {
        UpdateKey::Led(value)
    }
}

impl From<u32> for UpdateKey {
    fn from(value: u32) -> Self {
        UpdateKey::Channel(value)
    }
}

impl From<VendorKey> for UpdateKey {
    fn from(value: VendorKey) -> Self {
        UpdateKey::Vendor(value)
    }
}

impl fmt::Display for UpdateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateKey::Led(id) => write!(f, "{id}"),
            UpdateKey::Channel(channel) => write!(f, "channel {channel}"),
            UpdateKey::Vendor(key) => {
                let (hi, lo) = key.split();
                write!(f, "vendor {hi}:{lo}")
            }
        }
    }
}
