//! Per-pass twin property value object and its dirty-flag set

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Number of application integer slots (`property_1` .. `property_4`)
pub const APP_PROPERTY_SLOTS: usize = 4;

/// Twin encoding of an LED state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LedState {
    #[default]
    NoChange,
    On,
    Off,
    Blink,
}

impl LedState {
    pub fn from_twin(value: i64) -> Option<Self> {
        match value {
            -1 => Some(LedState::NoChange),
            1 => Some(LedState::On),
            2 => Some(LedState::Off),
            3 => Some(LedState::Blink),
            _ => None,
        }
    }

    pub fn to_twin(self) -> i32 {
        match self {
            LedState::NoChange => -1,
            LedState::On => 1,
            LedState::Off => 2,
            LedState::Blink => 3,
        }
    }
}

/// LEDs mirrored into the twin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedColor {
    Yellow,
    Red,
    Green,
    Blue,
}

impl LedColor {
    pub fn property_name(self) -> &'static str {
        match self {
            LedColor::Yellow => "led_y",
            LedColor::Red => "led_r",
            LedColor::Green => "led_g",
            LedColor::Blue => "led_b",
        }
    }

    pub fn dirty_flag(self) -> DirtyFlags {
        match self {
            LedColor::Yellow => DirtyFlags::LED_YELLOW,
            LedColor::Red => DirtyFlags::LED_RED,
            LedColor::Green => DirtyFlags::LED_GREEN,
            LedColor::Blue => DirtyFlags::LED_BLUE,
        }
    }
}

/// One bit per tracked twin field
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct DirtyFlags(u16);

impl DirtyFlags {
    pub const TELEMETRY_INTERVAL: Self = Self(1 << 0);
    pub const LED_YELLOW: Self = Self(1 << 1);
    pub const LED_RED: Self = Self(1 << 2);
    pub const LED_GREEN: Self = Self(1 << 3);
    pub const LED_BLUE: Self = Self(1 << 4);
    pub const IP_ADDRESS: Self = Self(1 << 5);
    pub const APP_PROPERTY_1: Self = Self(1 << 6);
    pub const APP_PROPERTY_2: Self = Self(1 << 7);
    pub const APP_PROPERTY_3: Self = Self(1 << 8);
    pub const APP_PROPERTY_4: Self = Self(1 << 9);
    pub const DEBUG_LEVEL: Self = Self(1 << 10);
    pub const TELEMETRY_DISABLE: Self = Self(1 << 11);
    pub const IS_INITIAL_GET: Self = Self(1 << 12);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Flag for application slot `1..=4`
    pub fn app_property(slot: usize) -> Option<Self> {
        match slot {
            1 => Some(Self::APP_PROPERTY_1),
            2 => Some(Self::APP_PROPERTY_2),
            3 => Some(Self::APP_PROPERTY_3),
            4 => Some(Self::APP_PROPERTY_4),
            _ => None,
        }
    }
}

impl BitOr for DirtyFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DirtyFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for DirtyFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DirtyFlags({:#06x})", self.0)
    }
}

/// Transient result of one reconciliation pass
///
/// Built empty for every inbound twin message or outbound report and dropped
/// after the matching publish. Values are meaningful only where the
/// corresponding dirty flag is set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TwinProperties {
    pub flags: DirtyFlags,
    /// Server version observed on the message this pass was built from
    pub version: Option<i64>,
    pub telemetry_interval: u32,
    pub led_yellow: LedState,
    pub led_red: LedState,
    pub led_green: LedState,
    pub led_blue: LedState,
    pub ip_address: Option<String>,
    pub app_properties: [i32; APP_PROPERTY_SLOTS],
    pub debug_level: u8,
    pub telemetry_disable: u16,
    /// Changed on the device rather than acknowledged from a desired update
    pub device_initiated: bool,
}

impl TwinProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initial_get(&self) -> bool {
        self.flags.contains(DirtyFlags::IS_INITIAL_GET)
    }

    /// True when a report built from this pass would carry nothing
    pub fn nothing_dirty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn set_led(&mut self, color: LedColor, state: LedState) {
        match color {
            LedColor::Yellow => self.led_yellow = state,
            LedColor::Red => self.led_red = state,
            LedColor::Green => self.led_green = state,
            LedColor::Blue => self.led_blue = state,
        }
        self.flags.insert(color.dirty_flag());
    }

    pub fn led(&self, color: LedColor) -> LedState {
        match color {
            LedColor::Yellow => self.led_yellow,
            LedColor::Red => self.led_red,
            LedColor::Green => self.led_green,
            LedColor::Blue => self.led_blue,
        }
    }
}
