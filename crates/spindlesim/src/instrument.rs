//! Deterministic device model
//!
//! Everything an NSP-class instrument does that the client can observe,
//! with no I/O and no wall clock: a settable device clock, 272 channels
//! with enable flags and bounded pending buffers, tone synthesis, the
//! recording state machine, and the control-request brain. The server
//! wraps this in sockets; tests drive it directly and get the same
//! behavior every run.

use std::collections::VecDeque;

use spindleproto::constants::{DEVICE_BUFFER_SAMPLES, NUM_ANALOG_CHANNELS};
use spindleproto::{
    CommentCharset, Frame, InstrumentInfo, PatientRecord, Tick, PROTOCOL_REVISION,
};
use tracing::debug;

use crate::signal::ToneSynth;

/// Model string reported in the handshake.
pub const MODEL: &str = "spindlesim bench NSP";

/// Comment annotations kept, oldest dropped first.
const MAX_COMMENT_LOG: usize = 1024;

/// One comment annotation the instrument has received.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentEvent {
    /// Device clock when the comment arrived.
    pub tick: Tick,
    pub color: u32,
    pub charset: CommentCharset,
    pub text: String,
}

struct ChannelState {
    enabled: bool,
    synth: ToneSynth,
    pending: VecDeque<i16>,
}

struct RecordingFile {
    name: String,
    comment: String,
}

/// The simulated instrument.
pub struct Instrument {
    clock: Tick,
    serial: u32,
    channels: Vec<ChannelState>,
    recording: Option<RecordingFile>,
    patient: Option<PatientRecord>,
    comments: Vec<CommentEvent>,
}

impl Instrument {
    /// A powered-on instrument with every channel disabled. Enable some
    /// with [`Instrument::with_enabled`] or a `ChannelMask` request.
    pub fn new(serial: u32) -> Self {
        let channels = (0..NUM_ANALOG_CHANNELS)
            .map(|channel| ChannelState {
                enabled: false,
                synth: ToneSynth::for_channel(channel),
                pending: VecDeque::new(),
            })
            .collect();
        Self {
            clock: Tick::zero(),
            serial,
            channels,
            recording: None,
            patient: None,
            comments: Vec::new(),
        }
    }

    pub fn with_enabled(mut self, channels: &[u16]) -> Self {
        for &channel in channels {
            self.set_channel_enabled(channel, true);
        }
        self
    }

    pub fn info(&self) -> InstrumentInfo {
        InstrumentInfo {
            revision: PROTOCOL_REVISION,
            model: MODEL.to_string(),
            serial: self.serial,
            channel_capacity: NUM_ANALOG_CHANNELS,
        }
    }

    pub fn clock(&self) -> Tick {
        self.clock
    }

    pub fn set_clock(&mut self, tick: Tick) {
        self.clock = tick;
    }

    /// Run the device for `ticks` clock steps: the clock moves and every
    /// enabled channel gains one sample per tick. Pending buffers are
    /// capped at the device buffer size; overflow drops the oldest.
    pub fn advance(&mut self, ticks: u32) {
        if ticks == 0 {
            return;
        }
        self.clock = self.clock.advance(ticks);
        let cap = DEVICE_BUFFER_SAMPLES as usize;
        for state in self.channels.iter_mut().filter(|s| s.enabled) {
            let keep = (ticks as usize).min(cap);
            let skip = ticks as usize - keep;
            if skip > 0 {
                // the buffer would drop these anyway
                state.synth.skip(skip as u32);
            }
            for _ in 0..keep {
                if state.pending.len() == cap {
                    state.pending.pop_front();
                }
                state.pending.push_back(state.synth.next_sample());
            }
        }
    }

    /// Hardware channel numbers currently enabled, ascending.
    pub fn enabled_channels(&self) -> Vec<u16> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, s)| s.enabled)
            .map(|(i, _)| i as u16)
            .collect()
    }

    /// Returns false when the channel number is out of range.
    pub fn set_channel_enabled(&mut self, channel: u16, enabled: bool) -> bool {
        match self.channel_mut(channel) {
            Some(state) => {
                if state.enabled != enabled {
                    debug!(channel, enabled, "channel mask changed");
                }
                state.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn recording_file(&self) -> Option<&str> {
        self.recording.as_ref().map(|r| r.name.as_str())
    }

    pub fn recording_comment(&self) -> Option<&str> {
        self.recording.as_ref().map(|r| r.comment.as_str())
    }

    pub fn patient(&self) -> Option<&PatientRecord> {
        self.patient.as_ref()
    }

    pub fn comments(&self) -> &[CommentEvent] {
        &self.comments
    }

    /// Load exact samples into a channel's pending buffer, for scripted
    /// scenarios. Returns how many old samples overflowed out.
    pub fn push_samples(&mut self, channel: u16, samples: &[i16]) -> usize {
        let cap = DEVICE_BUFFER_SAMPLES as usize;
        let Some(state) = self.channel_mut(channel) else {
            return 0;
        };
        let mut dropped = 0;
        for &sample in samples {
            if state.pending.len() == cap {
                state.pending.pop_front();
                dropped += 1;
            }
            state.pending.push_back(sample);
        }
        dropped
    }

    pub fn pending_len(&self, channel: u16) -> usize {
        self.channels
            .get(usize::from(channel))
            .map_or(0, |s| s.pending.len())
    }

    /// Drain up to `max` samples from a channel, oldest first.
    pub fn take_pending(&mut self, channel: u16, max: usize) -> Vec<i16> {
        match self.channel_mut(channel) {
            Some(state) => {
                let take = max.min(state.pending.len());
                state.pending.drain(..take).collect()
            }
            None => Vec::new(),
        }
    }

    /// Answer one inbound request frame. Data-plane frames and replies are
    /// not requests and produce nothing; so does `Comment`, which is
    /// unacknowledged by design.
    pub fn handle_control(&mut self, frame: Frame) -> Option<Frame> {
        match frame {
            Frame::Hello { token, instance } => {
                debug!(token, instance, "hello received");
                Some(Frame::HelloAck {
                    token,
                    info: self.info(),
                })
            }
            Frame::Comment {
                color,
                charset,
                text,
                ..
            } => {
                if self.comments.len() == MAX_COMMENT_LOG {
                    self.comments.remove(0);
                }
                self.comments.push(CommentEvent {
                    tick: self.clock,
                    color,
                    charset,
                    text,
                });
                None
            }
            Frame::FileConfig {
                token,
                start,
                name,
                comment,
            } => {
                let accepted = self.apply_file_config(start, &name, &comment);
                Some(Frame::ControlAck { token, accepted })
            }
            Frame::PatientInfo { token, patient } => {
                let accepted = if self.recording.is_some() {
                    // metadata is fixed once a file is being written
                    false
                } else {
                    self.patient = Some(patient);
                    true
                };
                Some(Frame::ControlAck { token, accepted })
            }
            Frame::ChannelMask {
                token,
                channel,
                enabled,
            } => {
                let accepted = self.set_channel_enabled(channel, enabled);
                Some(Frame::ControlAck { token, accepted })
            }
            Frame::RecordingQuery { token } => Some(Frame::RecordingState {
                token,
                recording: self.recording.is_some(),
                file_name: self
                    .recording
                    .as_ref()
                    .map(|r| r.name.clone())
                    .unwrap_or_default(),
            }),
            _ => None,
        }
    }

    fn apply_file_config(&mut self, start: bool, name: &str, comment: &str) -> bool {
        match (start, self.recording.is_some()) {
            (true, true) => false,
            (true, false) => {
                if name.is_empty() {
                    return false;
                }
                debug!(name, "recording started");
                self.recording = Some(RecordingFile {
                    name: name.to_string(),
                    comment: comment.to_string(),
                });
                true
            }
            (false, false) => false,
            (false, true) => {
                debug!("recording stopped");
                self.recording = None;
                true
            }
        }
    }

    fn channel_mut(&mut self, channel: u16) -> Option<&mut ChannelState> {
        self.channels.get_mut(usize::from(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn advance_fills_enabled_channels_only() {
        let mut nsp = Instrument::new(1).with_enabled(&[0, 5]);
        nsp.advance(100);

        assert_eq!(nsp.clock(), Tick(100));
        assert_eq!(nsp.pending_len(0), 100);
        assert_eq!(nsp.pending_len(5), 100);
        assert_eq!(nsp.pending_len(1), 0);
    }

    #[test]
    fn pending_caps_at_device_buffer() {
        let mut nsp = Instrument::new(1).with_enabled(&[3]);
        nsp.advance(DEVICE_BUFFER_SAMPLES + 500);
        assert_eq!(nsp.pending_len(3), DEVICE_BUFFER_SAMPLES as usize);
    }

    #[test]
    fn take_pending_is_fifo() {
        let mut nsp = Instrument::new(1).with_enabled(&[2]);
        nsp.push_samples(2, &[10, 20, 30]);

        assert_eq!(nsp.take_pending(2, 2), vec![10, 20]);
        assert_eq!(nsp.pending_len(2), 1);
        assert_eq!(nsp.take_pending(2, 10), vec![30]);
        assert_eq!(nsp.take_pending(2, 10), Vec::<i16>::new());
    }

    #[test]
    fn push_overflow_drops_oldest() {
        let mut nsp = Instrument::new(1);
        let fill = vec![0i16; DEVICE_BUFFER_SAMPLES as usize];
        assert_eq!(nsp.push_samples(9, &fill), 0);
        assert_eq!(nsp.push_samples(9, &[1, 2, 3]), 3);
        assert_eq!(nsp.pending_len(9), DEVICE_BUFFER_SAMPLES as usize);
    }

    #[test]
    fn identical_instruments_stay_identical() {
        let mut a = Instrument::new(1).with_enabled(&[0, 1]);
        let mut b = Instrument::new(1).with_enabled(&[0, 1]);
        a.advance(5000);
        b.advance(5000);
        assert_eq!(a.take_pending(0, 5000), b.take_pending(0, 5000));
        assert_eq!(a.take_pending(1, 5000), b.take_pending(1, 5000));
    }

    #[test]
    fn hello_echoes_token_and_identity() {
        let mut nsp = Instrument::new(77);
        let reply = nsp.handle_control(Frame::Hello {
            token: 9,
            instance: 0,
        });
        match reply {
            Some(Frame::HelloAck { token, info }) => {
                assert_eq!(token, 9);
                assert_eq!(info.serial, 77);
                assert_eq!(info.model, MODEL);
                assert_eq!(info.channel_capacity, NUM_ANALOG_CHANNELS);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn recording_state_machine() {
        let mut nsp = Instrument::new(1);

        let start = |name: &str, token| Frame::FileConfig {
            token,
            start: true,
            name: name.to_string(),
            comment: String::new(),
        };
        let stop = |token| Frame::FileConfig {
            token,
            start: false,
            name: String::new(),
            comment: String::new(),
        };
        let accepted = |frame: Option<Frame>| match frame {
            Some(Frame::ControlAck { accepted, .. }) => accepted,
            other => panic!("expected ack, got {other:?}"),
        };

        // stop while idle is a rejection
        assert!(!accepted(nsp.handle_control(stop(1))));
        // empty name is a rejection
        assert!(!accepted(nsp.handle_control(start("", 2))));

        assert!(accepted(nsp.handle_control(start("run-1", 3))));
        assert!(nsp.is_recording());
        assert_eq!(nsp.recording_file(), Some("run-1"));

        // second start while recording is a rejection
        assert!(!accepted(nsp.handle_control(start("run-2", 4))));
        // patient info is fixed while recording
        assert!(!accepted(nsp.handle_control(Frame::PatientInfo {
            token: 5,
            patient: PatientRecord::default(),
        })));

        assert!(accepted(nsp.handle_control(stop(6))));
        assert!(!nsp.is_recording());

        // patient info is accepted while idle
        assert!(accepted(nsp.handle_control(Frame::PatientInfo {
            token: 7,
            patient: PatientRecord::default(),
        })));
    }

    #[test]
    fn recording_query_reports_state() {
        let mut nsp = Instrument::new(1);
        nsp.handle_control(Frame::FileConfig {
            token: 1,
            start: true,
            name: "session-a".to_string(),
            comment: String::new(),
        });

        match nsp.handle_control(Frame::RecordingQuery { token: 2 }) {
            Some(Frame::RecordingState {
                token,
                recording,
                file_name,
            }) => {
                assert_eq!(token, 2);
                assert!(recording);
                assert_eq!(file_name, "session-a");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn channel_mask_requests() {
        let mut nsp = Instrument::new(1).with_enabled(&[0, 1, 2]);

        let reply = nsp.handle_control(Frame::ChannelMask {
            token: 1,
            channel: 1,
            enabled: false,
        });
        assert!(matches!(
            reply,
            Some(Frame::ControlAck {
                accepted: true,
                ..
            })
        ));
        assert_eq!(nsp.enabled_channels(), vec![0, 2]);

        // disabled channels stop producing
        nsp.advance(10);
        assert_eq!(nsp.pending_len(1), 0);
        assert_eq!(nsp.pending_len(0), 10);

        // out-of-range channel is a rejection
        let reply = nsp.handle_control(Frame::ChannelMask {
            token: 2,
            channel: NUM_ANALOG_CHANNELS,
            enabled: true,
        });
        assert!(matches!(
            reply,
            Some(Frame::ControlAck {
                accepted: false,
                ..
            })
        ));
    }

    #[test]
    fn comments_are_logged_and_unacknowledged() {
        let mut nsp = Instrument::new(1);
        nsp.set_clock(Tick(42));
        let reply = nsp.handle_control(Frame::Comment {
            token: 0,
            color: 0xFF00FF,
            charset: CommentCharset::Ansi,
            text: "marker".to_string(),
        });
        assert!(reply.is_none());
        assert_eq!(
            nsp.comments(),
            &[CommentEvent {
                tick: Tick(42),
                color: 0xFF00FF,
                charset: CommentCharset::Ansi,
                text: "marker".to_string(),
            }]
        );
    }
}
