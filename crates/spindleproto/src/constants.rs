//! Instrument family constants
//!
//! Fixed properties of the NSP instrument family this client speaks to.
//! Loaded nowhere, mutated never: code that needs one imports it.

/// Device clock rate. One tick is 1/30000 s.
pub const TICKS_PER_SECOND: u32 = 30_000;

/// Front-end (headstage) analog channels.
pub const NUM_FE_CHANNELS: u16 = 256;

/// Auxiliary analog-in channels.
pub const NUM_ANAIN_CHANNELS: u16 = 16;

/// Total analog channel count. Hardware channel numbers are `0..272`.
pub const NUM_ANALOG_CHANNELS: u16 = NUM_FE_CHANNELS + NUM_ANAIN_CHANNELS;

/// Continuous samples the instrument buffers per channel before it starts
/// dropping the oldest. Bounds how slowly a client may poll without loss:
/// 102400 samples at 30 kHz is about 3.4 seconds.
pub const DEVICE_BUFFER_SAMPLES: u32 = 102_400;

/// UDP port the client listens on for instrument traffic.
pub const DEFAULT_INBOUND_PORT: u16 = 51_002;

/// UDP port the instrument listens on for control requests.
pub const DEFAULT_OUTBOUND_PORT: u16 = 51_001;

/// Default client-side receive budget in bytes. Divided across the
/// per-channel receive rings by the transport.
pub const DEFAULT_RECEIVE_BUFFER_BYTES: usize = 8 * 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_arithmetic() {
        assert_eq!(NUM_ANALOG_CHANNELS, 272);
        assert_eq!(NUM_FE_CHANNELS + NUM_ANAIN_CHANNELS, NUM_ANALOG_CHANNELS);
    }
}
