//! Channel directory
//!
//! The result of one Prefetch: which channels are live right now and how
//! many unconsumed samples each holds, stamped with the device tick at
//! snapshot time. Rebuilt from device state on every prefetch, never cached
//! across polls, because channels can be enabled and disabled externally
//! between calls.

use serde::Serialize;
use spindleproto::constants::NUM_ANALOG_CHANNELS;
use spindleproto::Tick;

use crate::error::SessionError;

/// One channel's row in the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelEntry {
    /// Stable hardware channel number, `0..272`.
    pub channel: u16,
    /// Unconsumed samples for this channel since the last Transfer.
    /// Zero is a legitimate entry: the channel is live but silent.
    pub available: u32,
}

/// Snapshot of the active channel set at one device tick.
///
/// Entries are held in ascending hardware channel order; a channel's
/// position is its "channel index", the 0-based index callers later use
/// against [`crate::SampleBatch::data`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelDirectory {
    tick: Tick,
    entries: Vec<ChannelEntry>,
}

impl ChannelDirectory {
    /// Build a directory from a device snapshot. Entries are normalized to
    /// ascending channel order with duplicates collapsed (first wins).
    /// Channel numbers outside the instrument family range are rejected.
    pub fn new(tick: Tick, mut entries: Vec<ChannelEntry>) -> Result<Self, SessionError> {
        for entry in &entries {
            if entry.channel >= NUM_ANALOG_CHANNELS {
                return Err(SessionError::InvalidChannel {
                    channel: entry.channel,
                    max: NUM_ANALOG_CHANNELS - 1,
                });
            }
        }
        entries.sort_by_key(|e| e.channel);
        entries.dedup_by_key(|e| e.channel);
        Ok(Self { tick, entries })
    }

    /// A directory with no live channels, the shape every offline poll
    /// produces.
    pub fn empty(tick: Tick) -> Self {
        Self {
            tick,
            entries: Vec::new(),
        }
    }

    /// Device tick at snapshot time. Becomes the batch timestamp when this
    /// directory is consumed by a Transfer.
    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn channel_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ChannelEntry] {
        &self.entries
    }

    /// Sum of `available` over all entries.
    pub fn total_samples(&self) -> u64 {
        self.entries.iter().map(|e| u64::from(e.available)).sum()
    }
}
