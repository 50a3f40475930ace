//! Error types for the session engine
//!
//! Two layers, matching the propagation policy: `TransportError` is what the
//! link layer can fail with, `SessionError` is what callers of [`crate::Session`]
//! see. Connectivity faults never surface as errors from polling calls; they
//! collapse into `is_online() == false` and empty results, because the
//! caller's recovery is always "keep polling". Programming errors (bad index,
//! use after release) are loud and immediate.

use spindleproto::{FrameError, SampleKind};

/// Errors from the device link layer
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("No reply from instrument within {timeout_ms} ms after {attempts} attempts")]
    ControlTimeout { timeout_ms: u64, attempts: u32 },

    #[error("Transport already shut down")]
    ShutDown,
}

/// Errors visible to callers of a `Session`
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session has been released")]
    Disposed,

    #[error("Transfer without a preceding prefetch in this cycle")]
    TransferWithoutPrefetch,

    #[error("Channel index {index} out of range: {active} active channels")]
    ChannelIndexOutOfRange { index: usize, active: usize },

    #[error("Buffer holds {actual:?} samples, accessor wants {requested:?}")]
    WrongSampleKind {
        requested: SampleKind,
        actual: SampleKind,
    },

    #[error("Channel {channel} reports {requested} samples, device buffer holds at most {capacity}")]
    TransferTooLarge {
        channel: u16,
        requested: u32,
        capacity: u32,
    },

    #[error("Invalid channel number {channel}: instrument family tops out at {max}")]
    InvalidChannel { channel: u16, max: u16 },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let err = SessionError::ChannelIndexOutOfRange {
            index: 3,
            active: 3,
        };
        assert_eq!(
            err.to_string(),
            "Channel index 3 out of range: 3 active channels"
        );

        let err = SessionError::from(TransportError::ControlTimeout {
            timeout_ms: 250,
            attempts: 3,
        });
        assert!(err.to_string().contains("250 ms"));
    }
}
