//! Transport abstraction
//!
//! The session engine never talks to a socket directly; it drives one of
//! these. The shipped implementation is [`crate::UdpTransport`] speaking
//! SPNDL1, but the seam exists so a deterministic test double (or a future
//! backend for the real instrument protocol) can stand in. Implementations
//! own whatever sockets, threads, and buffering they need and keep every
//! wait bounded.

use spindleproto::{CommentCharset, InstrumentInfo, PatientRecord, Tick};

use crate::directory::ChannelEntry;
use crate::error::TransportError;

/// Device-side snapshot for one prefetch: the active channels with their
/// unconsumed sample counts, and the device tick the snapshot was taken at.
#[derive(Debug, Clone)]
pub struct ChannelAvailability {
    pub tick: Tick,
    pub channels: Vec<ChannelEntry>,
}

/// Answer to a recording-state query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingStatus {
    pub recording: bool,
    /// Name of the file being written, when recording.
    pub file_name: Option<String>,
}

/// Out-of-band control operations multiplexed over the session link.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    /// Annotation event. Fire-and-forget: no acknowledgement exists.
    Comment {
        color: u32,
        charset: CommentCharset,
        text: String,
    },
    /// Start (`start == true`) or stop recording to a named file.
    FileConfig {
        start: bool,
        name: String,
        comment: String,
    },
    /// Patient metadata for the forthcoming recording.
    Patient(PatientRecord),
    /// Enable or disable one hardware channel.
    ChannelMask { channel: u16, enabled: bool },
}

/// What came back for a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlReply {
    /// Fire-and-forget request: nothing comes back by design.
    None,
    /// The instrument accepted (`true`) or rejected (`false`) the request.
    Accepted(bool),
}

/// Counters a transport keeps about its link, snapshotted for callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Valid frames received.
    pub frames: u64,
    /// Samples received across all channels.
    pub samples: u64,
    /// Samples lost to ring overruns (poller too slow).
    pub overrun_samples: u64,
    /// Datagrams that failed to decode.
    pub decode_errors: u64,
}

/// The device link as the session engine sees it.
///
/// `connect` is called once, at session construction. It must not block
/// past the configured handshake timeout: an unreachable instrument yields
/// `Ok(None)` (the session starts offline and the transport keeps trying in
/// the background), never an error. Errors are for local faults only.
pub trait Transport: Send {
    /// Perform the handshake. `Ok(Some(info))` once the instrument answered,
    /// `Ok(None)` for created-but-offline.
    fn connect(&mut self) -> Result<Option<InstrumentInfo>, TransportError>;

    /// Current link liveness, computed from recent instrument traffic.
    fn online(&self) -> bool;

    /// Latest device tick observed on any frame, if any traffic arrived yet.
    fn device_tick(&self) -> Option<Tick>;

    /// Instrument identity, once a handshake has completed (possibly after
    /// a late power-on).
    fn instrument_info(&self) -> Option<InstrumentInfo>;

    /// Snapshot which channels have unread data and how much. Consumes
    /// nothing.
    fn query_available(&mut self) -> Result<ChannelAvailability, TransportError>;

    /// Consume up to `count` samples for one channel into `out`, returning
    /// how many were appended. Consumed samples never reappear.
    fn read_samples(
        &mut self,
        channel: u16,
        count: usize,
        out: &mut Vec<i16>,
    ) -> Result<usize, TransportError>;

    /// Send one control request and wait (bounded) for its outcome.
    fn write_control(&mut self, request: ControlRequest) -> Result<ControlReply, TransportError>;

    /// Ask the instrument whether it is writing a storage file.
    fn query_recording_state(&mut self) -> Result<RecordingStatus, TransportError>;

    /// Link counters snapshot.
    fn stats(&self) -> LinkStats;

    /// Tear the link down: stop background work, close sockets. Idempotent.
    fn shutdown(&mut self);
}
