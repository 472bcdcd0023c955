//! Host-originated events delivered through event-source descriptors.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Number of known event kinds
pub const WASI_EVENTS_NUM: usize = 2;
/// Bytes of one mask read from an event-source descriptor
pub const WASI_EVENTS_MASK_SIZE: usize = 4;

/// Bitmask of event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(pub u32);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    /// Terminal window resized
    pub const WINCH: EventMask = EventMask(1 << 0);
    /// Interrupt requested (Ctrl+C on the host terminal)
    pub const SIGINT: EventMask = EventMask(1 << 1);

    const KNOWN: u32 = Self::WINCH.0 | Self::SIGINT.0;

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Bits no known event uses
    pub fn unknown_bits(self) -> u32 {
        self.0 & !Self::KNOWN
    }

    /// Decode a mask as read from an event-source descriptor.
    pub fn from_le_bytes(bytes: [u8; WASI_EVENTS_MASK_SIZE]) -> Self {
        EventMask(u32::from_le_bytes(bytes))
    }

    /// Parse names like `winch,sigint`.
    pub fn parse(list: &str) -> Option<Self> {
        let mut mask = EventMask::NONE;
        for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            mask |= match name.to_ascii_lowercase().as_str() {
                "winch" => EventMask::WINCH,
                "sigint" | "int" => EventMask::SIGINT,
                _ => return None,
            };
        }
        Some(mask)
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(EventMask::WINCH) {
            names.push("winch".to_string());
        }
        if self.contains(EventMask::SIGINT) {
            names.push("sigint".to_string());
        }
        if self.unknown_bits() != 0 {
            names.push(format!("{:#x}", self.unknown_bits()));
        }
        write!(f, "{}", names.join(","))
    }
}
