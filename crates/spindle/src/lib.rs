//! Spindle: NSP Client Session Engine
//!
//! Client-side session and data engine for a neural-signal acquisition
//! instrument. One [`Session`] per instrument instance: it owns the device
//! link, runs the caller-driven two-phase poll (prefetch a
//! [`ChannelDirectory`], transfer a [`SampleBatch`]), and carries the
//! control operations (comments, file storage, patient info, channel
//! masks, recording queries).
//!
//! The instrument streams continuously; a background receiver drains the
//! wire into per-channel rings so polling cadence never backpressures the
//! device. Connectivity is a state, not an error: an unreachable
//! instrument means `is_online()` is false and polls come back empty, and
//! the session quietly picks the instrument back up when it appears.
//!
//! The shipped link is [`UdpTransport`] speaking the SPNDL1 bench protocol
//! (`spindleproto`); anything implementing [`Transport`] can stand in.

pub mod buffer;
pub mod config;
pub mod directory;
pub mod error;
pub mod ring;
pub mod session;
pub mod transport;
pub mod udp;

pub use buffer::{ChannelData, SampleBatch, SampleBuffer};
pub use config::{ConfigError, SessionConfig};
pub use directory::{ChannelDirectory, ChannelEntry};
pub use error::{SessionError, TransportError};
pub use ring::SampleRing;
pub use session::Session;
pub use transport::{
    ChannelAvailability, ControlReply, ControlRequest, LinkStats, RecordingStatus, Transport,
};
pub use udp::UdpTransport;

pub use spindleproto::{
    CommentCharset, InstrumentInfo, PatientRecord, SampleKind, Tick,
};
