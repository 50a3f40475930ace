//! Shared primitive types
//!
//! Small value types used on the wire and across the client API: the device
//! clock, the sample representation selector, and the control-plane records.

use serde::{Deserialize, Serialize};

use crate::constants::TICKS_PER_SECOND;

// =============================================================================
// DEVICE CLOCK
// =============================================================================

/// A device clock reading. The instrument counts ticks at 30 kHz in an
/// unsigned 32-bit register, so the clock wraps after roughly 39.7 hours;
/// arithmetic here wraps with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Tick(pub u32);

impl Tick {
    pub fn zero() -> Self {
        Self(0)
    }

    /// Clock reading `ticks` later, wrapping at the register width.
    pub fn advance(self, ticks: u32) -> Self {
        Tick(self.0.wrapping_add(ticks))
    }

    /// Ticks elapsed since `earlier`, wrapping across the register boundary.
    pub fn since(self, earlier: Tick) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    /// This reading as seconds of device time.
    pub fn as_secs_f64(self) -> f64 {
        f64::from(self.0) / f64::from(TICKS_PER_SECOND)
    }
}

impl std::fmt::Display for Tick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// SAMPLE REPRESENTATION
// =============================================================================

/// Element representation of every sample buffer a session produces.
/// Fixed at session creation. The instrument always ships i16 ADC counts;
/// `Float64` sessions widen during transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SampleKind {
    #[default]
    Int16,
    Float64,
}

impl SampleKind {
    pub fn is_double(self) -> bool {
        matches!(self, SampleKind::Float64)
    }
}

// =============================================================================
// COMMENT EVENTS
// =============================================================================

/// Character set selector carried on comment annotations.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommentCharset {
    /// Plain single-byte text.
    Ansi = 0,
    /// Caller marshalled UTF-16 text.
    Utf16 = 1,
    /// Vendor-reserved ANSI variant.
    VendorAnsi = 255,
}

impl CommentCharset {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CommentCharset::Ansi),
            1 => Some(CommentCharset::Utf16),
            255 => Some(CommentCharset::VendorAnsi),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Pack a display color the way the instrument stores it on comment
/// events: blue in bits 16..24, green in 8..16, red in 0..8.
pub fn pack_comment_color(red: u8, green: u8, blue: u8) -> u32 {
    (u32::from(blue) << 16) | (u32::from(green) << 8) | u32::from(red)
}

/// Inverse of [`pack_comment_color`]; returns (red, green, blue).
pub fn unpack_comment_color(color: u32) -> (u8, u8, u8) {
    (
        (color & 0xFF) as u8,
        ((color >> 8) & 0xFF) as u8,
        ((color >> 16) & 0xFF) as u8,
    )
}

// =============================================================================
// CONTROL RECORDS
// =============================================================================

/// Instrument identity returned by the connect handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentInfo {
    /// Wire protocol revision the instrument speaks.
    pub revision: u16,
    /// Model name, e.g. "spindlesim bench NSP".
    pub model: String,
    /// Serial number.
    pub serial: u32,
    /// Analog channels the instrument can drive (at most 272).
    pub channel_capacity: u16,
}

/// Patient metadata attached to a forthcoming recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PatientRecord {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub dob_month: u8,
    pub dob_day: u8,
    pub dob_year: u16,
}
