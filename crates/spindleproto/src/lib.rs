//! spindleproto - Wire protocol and shared types for the spindle NSP client
//!
//! This crate defines what travels between a spindle client and a neural
//! signal processor (NSP) class instrument: the SPNDL1 datagram framing, the
//! control-plane records, and the primitive types both sides agree on
//! (device ticks, sample representation, comment charsets).
//!
//! The proprietary vendor wire protocol is deliberately NOT implemented
//! here. SPNDL1 is the project's own bench protocol, carrying the same
//! client-facing semantics (continuous sample broadcast, heartbeats with the
//! active channel set, token-correlated control requests) over single UDP
//! datagrams, so the session engine can be exercised against the simulated
//! instrument in `spindlesim` or any future backend that speaks it.
//!
//! No I/O lives in this crate: `frame` is a pure codec over byte slices,
//! `constants` and `types` are plain data. The `spindle` crate owns sockets
//! and threads.

pub mod constants;
pub mod frame;
pub mod types;

pub use frame::{
    Datagram, Frame, FrameError, Opcode, HEADER_LEN, MAX_CHUNK_SAMPLES, MAX_STRING_BYTES,
    PROTOCOL_REVISION, PROTOCOL_VERSION,
};
pub use types::{
    pack_comment_color, unpack_comment_color, CommentCharset, InstrumentInfo, PatientRecord,
    SampleKind, Tick,
};
