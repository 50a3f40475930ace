//! SPNDL1 datagram protocol
//!
//! The bench wire protocol between a spindle client and an instrument (real
//! or simulated). One frame per UDP datagram; a frame never spans datagrams,
//! which is why sample chunks are capped at [`MAX_CHUNK_SAMPLES`].
//!
//! ## Wire Format
//!
//! Every datagram starts with a fixed 12-byte header:
//!
//! ```text
//! Bytes 0..6    Protocol version   "SPNDL1" (6 bytes)
//! Byte  6       Opcode             u8
//! Byte  7       Reserved           0x00
//! Bytes 8..12   Sender clock       u32 big-endian, device ticks
//! ```
//!
//! followed by an opcode-specific body. All multi-byte integers are
//! big-endian. Strings are u16 length-prefixed UTF-8, at most
//! [`MAX_STRING_BYTES`]. The instrument stamps the header clock with its
//! device tick; clients echo their last observed tick (or zero).
//!
//! ## Planes
//!
//! Data plane (instrument -> client, fire-and-forget): `SampleChunk`,
//! `Heartbeat`. Control plane (client -> instrument): request frames carry a
//! client-chosen correlation token which the reply echoes, so a client can
//! discard stale replies from timed-out requests.

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::NUM_ANALOG_CHANNELS;
use crate::types::{CommentCharset, InstrumentInfo, PatientRecord, Tick};

/// Protocol version - bump on breaking changes
pub const PROTOCOL_VERSION: &[u8] = b"SPNDL1";

/// Revision number advertised in `HelloAck`.
pub const PROTOCOL_REVISION: u16 = 1;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 12;

/// Samples per `SampleChunk` frame. Keeps the worst-case datagram
/// (12 + 4 + 512 * 2 = 1040 bytes) under a conservative MTU.
pub const MAX_CHUNK_SAMPLES: usize = 512;

/// Longest string any frame may carry (comment text, file names,
/// patient fields, model names).
pub const MAX_STRING_BYTES: usize = 256;

/// Frame opcodes (1 byte)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Continuous samples for one channel (instrument -> client)
    SampleChunk = 0x01,
    /// Liveness beacon with the active channel set (instrument -> client)
    Heartbeat = 0x02,
    /// Handshake request (client -> instrument)
    Hello = 0x10,
    /// Handshake reply with instrument identity
    HelloAck = 0x11,
    /// Annotation event, unacknowledged (client -> instrument)
    Comment = 0x12,
    /// Start or stop recording to a named file (client -> instrument)
    FileConfig = 0x13,
    /// Patient metadata for the forthcoming recording (client -> instrument)
    PatientInfo = 0x14,
    /// Enable or disable one channel (client -> instrument)
    ChannelMask = 0x15,
    /// Ask for the current recording state (client -> instrument)
    RecordingQuery = 0x16,
    /// Recording state reply
    RecordingState = 0x17,
    /// Accept/reject reply to a control request
    ControlAck = 0x18,
}

impl Opcode {
    /// Parse a u8 into an Opcode
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0x01 => Ok(Opcode::SampleChunk),
            0x02 => Ok(Opcode::Heartbeat),
            0x10 => Ok(Opcode::Hello),
            0x11 => Ok(Opcode::HelloAck),
            0x12 => Ok(Opcode::Comment),
            0x13 => Ok(Opcode::FileConfig),
            0x14 => Ok(Opcode::PatientInfo),
            0x15 => Ok(Opcode::ChannelMask),
            0x16 => Ok(Opcode::RecordingQuery),
            0x17 => Ok(Opcode::RecordingState),
            0x18 => Ok(Opcode::ControlAck),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }

    /// Convert Opcode to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Errors during frame encoding/decoding
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Invalid protocol version: expected SPNDL1")]
    InvalidProtocol,
    #[error("Unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),
    #[error("Frame too short: expected {expected} more bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },
    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("Invalid comment charset: {0:#04x}")]
    InvalidCharset(u8),
    #[error("{field} too long: {len} bytes, max {max}")]
    StringTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("Sample chunk too large: {count} samples, max {max}")]
    ChunkTooLarge { count: usize, max: usize },
    #[error("Channel list too large: {count} channels, max {max}")]
    ChannelListTooLarge { count: usize, max: usize },
    #[error("{0} trailing bytes after frame body")]
    TrailingBytes(usize),
}

/// Body of one SPNDL1 frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    SampleChunk {
        channel: u16,
        samples: Vec<i16>,
    },
    Heartbeat {
        recording: bool,
        /// Hardware channel numbers currently enabled, ascending.
        active: Vec<u16>,
    },
    Hello {
        token: u32,
        /// Which instrument instance the client wants to bind.
        instance: u32,
    },
    HelloAck {
        token: u32,
        info: InstrumentInfo,
    },
    Comment {
        token: u32,
        /// Display color packed per [`crate::types::pack_comment_color`].
        color: u32,
        charset: CommentCharset,
        text: String,
    },
    FileConfig {
        token: u32,
        start: bool,
        name: String,
        comment: String,
    },
    PatientInfo {
        token: u32,
        patient: PatientRecord,
    },
    ChannelMask {
        token: u32,
        channel: u16,
        enabled: bool,
    },
    RecordingQuery {
        token: u32,
    },
    RecordingState {
        token: u32,
        recording: bool,
        file_name: String,
    },
    ControlAck {
        token: u32,
        accepted: bool,
    },
}

impl Frame {
    pub fn opcode(&self) -> Opcode {
        match self {
            Frame::SampleChunk { .. } => Opcode::SampleChunk,
            Frame::Heartbeat { .. } => Opcode::Heartbeat,
            Frame::Hello { .. } => Opcode::Hello,
            Frame::HelloAck { .. } => Opcode::HelloAck,
            Frame::Comment { .. } => Opcode::Comment,
            Frame::FileConfig { .. } => Opcode::FileConfig,
            Frame::PatientInfo { .. } => Opcode::PatientInfo,
            Frame::ChannelMask { .. } => Opcode::ChannelMask,
            Frame::RecordingQuery { .. } => Opcode::RecordingQuery,
            Frame::RecordingState { .. } => Opcode::RecordingState,
            Frame::ControlAck { .. } => Opcode::ControlAck,
        }
    }

    /// Correlation token for control frames; data-plane frames have none.
    pub fn token(&self) -> Option<u32> {
        match self {
            Frame::SampleChunk { .. } | Frame::Heartbeat { .. } => None,
            Frame::Hello { token, .. }
            | Frame::HelloAck { token, .. }
            | Frame::Comment { token, .. }
            | Frame::FileConfig { token, .. }
            | Frame::PatientInfo { token, .. }
            | Frame::ChannelMask { token, .. }
            | Frame::RecordingQuery { token }
            | Frame::RecordingState { token, .. }
            | Frame::ControlAck { token, .. } => Some(*token),
        }
    }
}

/// One SPNDL1 datagram: the header clock plus the frame body
#[derive(Debug, Clone, PartialEq)]
pub struct Datagram {
    /// Sender clock from the header. Device tick for instrument frames,
    /// echoed (or zero) for client frames.
    pub tick: Tick,
    pub frame: Frame,
}

impl Datagram {
    pub fn new(tick: Tick, frame: Frame) -> Self {
        Self { tick, frame }
    }

    /// Serialize into a single datagram's bytes
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(self.capacity_hint());

        buf.put_slice(PROTOCOL_VERSION);
        buf.put_u8(self.frame.opcode().to_u8());
        buf.put_u8(0);
        buf.put_u32(self.tick.0);

        match &self.frame {
            Frame::SampleChunk { channel, samples } => {
                if samples.len() > MAX_CHUNK_SAMPLES {
                    return Err(FrameError::ChunkTooLarge {
                        count: samples.len(),
                        max: MAX_CHUNK_SAMPLES,
                    });
                }
                buf.put_u16(*channel);
                buf.put_u16(samples.len() as u16);
                for s in samples {
                    buf.put_i16(*s);
                }
            }
            Frame::Heartbeat { recording, active } => {
                if active.len() > usize::from(NUM_ANALOG_CHANNELS) {
                    return Err(FrameError::ChannelListTooLarge {
                        count: active.len(),
                        max: usize::from(NUM_ANALOG_CHANNELS),
                    });
                }
                buf.put_u8(u8::from(*recording));
                buf.put_u16(active.len() as u16);
                for chan in active {
                    buf.put_u16(*chan);
                }
            }
            Frame::Hello { token, instance } => {
                buf.put_u32(*token);
                buf.put_u32(*instance);
            }
            Frame::HelloAck { token, info } => {
                buf.put_u32(*token);
                buf.put_u16(info.revision);
                buf.put_u32(info.serial);
                buf.put_u16(info.channel_capacity);
                put_str(&mut buf, "model", &info.model)?;
            }
            Frame::Comment {
                token,
                color,
                charset,
                text,
            } => {
                buf.put_u32(*token);
                buf.put_u32(*color);
                buf.put_u8(charset.to_u8());
                put_str(&mut buf, "comment text", text)?;
            }
            Frame::FileConfig {
                token,
                start,
                name,
                comment,
            } => {
                buf.put_u32(*token);
                buf.put_u8(u8::from(*start));
                put_str(&mut buf, "file name", name)?;
                put_str(&mut buf, "file comment", comment)?;
            }
            Frame::PatientInfo { token, patient } => {
                buf.put_u32(*token);
                put_str(&mut buf, "patient id", &patient.id)?;
                put_str(&mut buf, "patient first name", &patient.first_name)?;
                put_str(&mut buf, "patient last name", &patient.last_name)?;
                buf.put_u8(patient.dob_month);
                buf.put_u8(patient.dob_day);
                buf.put_u16(patient.dob_year);
            }
            Frame::ChannelMask {
                token,
                channel,
                enabled,
            } => {
                buf.put_u32(*token);
                buf.put_u16(*channel);
                buf.put_u8(u8::from(*enabled));
            }
            Frame::RecordingQuery { token } => {
                buf.put_u32(*token);
            }
            Frame::RecordingState {
                token,
                recording,
                file_name,
            } => {
                buf.put_u32(*token);
                buf.put_u8(u8::from(*recording));
                put_str(&mut buf, "file name", file_name)?;
            }
            Frame::ControlAck { token, accepted } => {
                buf.put_u32(*token);
                buf.put_u8(u8::from(*accepted));
            }
        }

        Ok(buf.freeze())
    }

    /// Parse one datagram's bytes
    pub fn decode(raw: &[u8]) -> Result<Self, FrameError> {
        if raw.len() < HEADER_LEN {
            return Err(FrameError::FrameTooShort {
                expected: HEADER_LEN,
                actual: raw.len(),
            });
        }
        if &raw[..PROTOCOL_VERSION.len()] != PROTOCOL_VERSION {
            return Err(FrameError::InvalidProtocol);
        }
        let opcode = Opcode::from_u8(raw[6])?;
        let tick = Tick(u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]));

        let mut body = &raw[HEADER_LEN..];
        let buf = &mut body;
        let frame = match opcode {
            Opcode::SampleChunk => {
                let channel = take_u16(buf)?;
                let count = usize::from(take_u16(buf)?);
                if count > MAX_CHUNK_SAMPLES {
                    return Err(FrameError::ChunkTooLarge {
                        count,
                        max: MAX_CHUNK_SAMPLES,
                    });
                }
                let mut samples = Vec::with_capacity(count);
                for _ in 0..count {
                    samples.push(take_i16(buf)?);
                }
                Frame::SampleChunk { channel, samples }
            }
            Opcode::Heartbeat => {
                let recording = take_u8(buf)? != 0;
                let count = usize::from(take_u16(buf)?);
                if count > usize::from(NUM_ANALOG_CHANNELS) {
                    return Err(FrameError::ChannelListTooLarge {
                        count,
                        max: usize::from(NUM_ANALOG_CHANNELS),
                    });
                }
                let mut active = Vec::with_capacity(count);
                for _ in 0..count {
                    active.push(take_u16(buf)?);
                }
                Frame::Heartbeat { recording, active }
            }
            Opcode::Hello => Frame::Hello {
                token: take_u32(buf)?,
                instance: take_u32(buf)?,
            },
            Opcode::HelloAck => {
                let token = take_u32(buf)?;
                let revision = take_u16(buf)?;
                let serial = take_u32(buf)?;
                let channel_capacity = take_u16(buf)?;
                let model = take_str(buf, "model")?;
                Frame::HelloAck {
                    token,
                    info: InstrumentInfo {
                        revision,
                        model,
                        serial,
                        channel_capacity,
                    },
                }
            }
            Opcode::Comment => {
                let token = take_u32(buf)?;
                let color = take_u32(buf)?;
                let raw_charset = take_u8(buf)?;
                let charset = CommentCharset::from_u8(raw_charset)
                    .ok_or(FrameError::InvalidCharset(raw_charset))?;
                let text = take_str(buf, "comment text")?;
                Frame::Comment {
                    token,
                    color,
                    charset,
                    text,
                }
            }
            Opcode::FileConfig => Frame::FileConfig {
                token: take_u32(buf)?,
                start: take_u8(buf)? != 0,
                name: take_str(buf, "file name")?,
                comment: take_str(buf, "file comment")?,
            },
            Opcode::PatientInfo => {
                let token = take_u32(buf)?;
                let patient = PatientRecord {
                    id: take_str(buf, "patient id")?,
                    first_name: take_str(buf, "patient first name")?,
                    last_name: take_str(buf, "patient last name")?,
                    dob_month: take_u8(buf)?,
                    dob_day: take_u8(buf)?,
                    dob_year: take_u16(buf)?,
                };
                Frame::PatientInfo { token, patient }
            }
            Opcode::ChannelMask => Frame::ChannelMask {
                token: take_u32(buf)?,
                channel: take_u16(buf)?,
                enabled: take_u8(buf)? != 0,
            },
            Opcode::RecordingQuery => Frame::RecordingQuery {
                token: take_u32(buf)?,
            },
            Opcode::RecordingState => Frame::RecordingState {
                token: take_u32(buf)?,
                recording: take_u8(buf)? != 0,
                file_name: take_str(buf, "file name")?,
            },
            Opcode::ControlAck => Frame::ControlAck {
                token: take_u32(buf)?,
                accepted: take_u8(buf)? != 0,
            },
        };

        if !body.is_empty() {
            return Err(FrameError::TrailingBytes(body.len()));
        }

        Ok(Datagram { tick, frame })
    }

    fn capacity_hint(&self) -> usize {
        HEADER_LEN
            + match &self.frame {
                Frame::SampleChunk { samples, .. } => 4 + samples.len() * 2,
                Frame::Heartbeat { active, .. } => 3 + active.len() * 2,
                Frame::Hello { .. } => 8,
                Frame::HelloAck { info, .. } => 14 + info.model.len(),
                Frame::Comment { text, .. } => 11 + text.len(),
                Frame::FileConfig { name, comment, .. } => 9 + name.len() + comment.len(),
                Frame::PatientInfo { patient, .. } => {
                    14 + patient.id.len() + patient.first_name.len() + patient.last_name.len()
                }
                Frame::ChannelMask { .. } => 7,
                Frame::RecordingQuery { .. } => 4,
                Frame::RecordingState { file_name, .. } => 7 + file_name.len(),
                Frame::ControlAck { .. } => 5,
            }
    }
}

fn put_str(buf: &mut BytesMut, field: &'static str, s: &str) -> Result<(), FrameError> {
    if s.len() > MAX_STRING_BYTES {
        return Err(FrameError::StringTooLong {
            field,
            len: s.len(),
            max: MAX_STRING_BYTES,
        });
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn need(buf: &[u8], n: usize) -> Result<(), FrameError> {
    if buf.len() < n {
        return Err(FrameError::FrameTooShort {
            expected: n,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, FrameError> {
    need(buf, 1)?;
    let value = buf[0];
    *buf = &buf[1..];
    Ok(value)
}

fn take_u16(buf: &mut &[u8]) -> Result<u16, FrameError> {
    need(buf, 2)?;
    let value = u16::from_be_bytes([buf[0], buf[1]]);
    *buf = &buf[2..];
    Ok(value)
}

fn take_i16(buf: &mut &[u8]) -> Result<i16, FrameError> {
    Ok(take_u16(buf)? as i16)
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, FrameError> {
    need(buf, 4)?;
    let value = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    *buf = &buf[4..];
    Ok(value)
}

fn take_str(buf: &mut &[u8], field: &'static str) -> Result<String, FrameError> {
    let len = usize::from(take_u16(buf)?);
    if len > MAX_STRING_BYTES {
        return Err(FrameError::StringTooLong {
            field,
            len,
            max: MAX_STRING_BYTES,
        });
    }
    need(buf, len)?;
    let (head, rest) = buf.split_at(len);
    let s = std::str::from_utf8(head)
        .map_err(|_| FrameError::InvalidUtf8(field))?
        .to_string();
    *buf = rest;
    Ok(s)
}
