//! Sample buffers and transfer batches
//!
//! A session produces buffers in exactly one representation, chosen at
//! creation: raw i16 ADC counts or f64. Rather than parallel accessor
//! methods for each width, one tagged buffer type carries the variant and
//! the typed accessors fail fast against the wrong one.
//!
//! A [`SampleBatch`] is what one Transfer hands back: the consumed
//! directory's timestamp plus one buffer per active channel, owned by the
//! caller outright. The session keeps no reference to a batch it returned,
//! so batches outlive the session safely and successive transfers never
//! alias.

use spindleproto::{SampleKind, Tick};

use crate::error::SessionError;

/// One channel's samples in the session's representation.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleBuffer {
    Int16(Vec<i16>),
    Float64(Vec<f64>),
}

impl SampleBuffer {
    /// Wrap raw wire samples in the session's representation, widening
    /// for `Float64` sessions.
    pub(crate) fn from_raw(kind: SampleKind, raw: Vec<i16>) -> Self {
        match kind {
            SampleKind::Int16 => SampleBuffer::Int16(raw),
            SampleKind::Float64 => {
                SampleBuffer::Float64(raw.into_iter().map(f64::from).collect())
            }
        }
    }

    pub fn kind(&self) -> SampleKind {
        match self {
            SampleBuffer::Int16(_) => SampleKind::Int16,
            SampleBuffer::Float64(_) => SampleKind::Float64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SampleBuffer::Int16(v) => v.len(),
            SampleBuffer::Float64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The samples as i16, or `WrongSampleKind` for a Float64 buffer.
    pub fn as_i16(&self) -> Result<&[i16], SessionError> {
        match self {
            SampleBuffer::Int16(v) => Ok(v),
            SampleBuffer::Float64(_) => Err(SessionError::WrongSampleKind {
                requested: SampleKind::Int16,
                actual: SampleKind::Float64,
            }),
        }
    }

    /// The samples as f64, or `WrongSampleKind` for an Int16 buffer.
    pub fn as_f64(&self) -> Result<&[f64], SessionError> {
        match self {
            SampleBuffer::Float64(v) => Ok(v),
            SampleBuffer::Int16(_) => Err(SessionError::WrongSampleKind {
                requested: SampleKind::Float64,
                actual: SampleKind::Int16,
            }),
        }
    }
}

/// One channel's slot in a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelData {
    /// Hardware channel number this buffer came from.
    pub channel: u16,
    pub samples: SampleBuffer,
}

/// Everything one Transfer produced. Caller-owned; the session that made it
/// holds nothing back.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBatch {
    timestamp: Tick,
    channels: Vec<ChannelData>,
}

impl SampleBatch {
    pub(crate) fn new(timestamp: Tick, channels: Vec<ChannelData>) -> Self {
        Self {
            timestamp,
            channels,
        }
    }

    /// Device time at which this batch was captured.
    pub fn timestamp(&self) -> Tick {
        self.timestamp
    }

    /// Number of active channels in this batch.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Buffer for the given 0-based channel index (position in the active
    /// channel list, not the hardware channel number).
    pub fn data(&self, index: usize) -> Result<&SampleBuffer, SessionError> {
        self.channels
            .get(index)
            .map(|c| &c.samples)
            .ok_or(SessionError::ChannelIndexOutOfRange {
                index,
                active: self.channels.len(),
            })
    }

    /// Hardware channel number for the given channel index.
    pub fn channel_number(&self, index: usize) -> Result<u16, SessionError> {
        self.channels
            .get(index)
            .map(|c| c.channel)
            .ok_or(SessionError::ChannelIndexOutOfRange {
                index,
                active: self.channels.len(),
            })
    }

    /// Iterate `(hardware channel, buffer)` pairs in channel index order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &SampleBuffer)> {
        self.channels.iter().map(|c| (c.channel, &c.samples))
    }
}
