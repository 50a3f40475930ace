//! Spindlesim: Bench Instrument Daemon
//!
//! A software stand-in for the acquisition hardware, for developing against
//! the spindle client without a device on the bench. It speaks the same UDP
//! protocol as the real instrument:
//!
//! - **Data plane**: a continuous stream of `SampleChunk` frames plus a
//!   periodic `Heartbeat` carrying the active channel list
//! - **Control plane**: token-correlated request/reply for handshakes,
//!   recording control, patient metadata, and channel masks
//!
//! The device model is deterministic. Two instruments built with the same
//! serial and channel set produce identical sample streams, so tests can
//! assert exact waveforms.

pub mod instrument;
pub mod recorder;
pub mod server;
pub mod signal;

pub use instrument::{CommentEvent, Instrument, MODEL};
pub use recorder::{valid_file_name, Manifest, ManifestComment, Recorder, RecorderError};
pub use server::{Server, ServerConfig, SimError};
pub use signal::ToneSynth;
