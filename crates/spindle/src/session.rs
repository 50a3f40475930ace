//! Session lifecycle and the polling contract
//!
//! A [`Session`] is the one handle a caller holds: it owns the transport,
//! runs the two-phase poll (prefetch a directory, transfer a batch), and
//! carries the control operations. The contract that shapes everything
//! here: connectivity trouble is never an error from a polling call. An
//! unreachable instrument means `is_online()` reports false and polls come
//! back empty, because the caller's only recovery is to keep polling.
//! Programming errors (bad index, transfer without prefetch, use after
//! release) fail loudly instead.
//!
//! All mutating operations take `&mut self`, so two calls can never
//! interleave on one session. Callers that share a session across threads
//! put it behind a `Mutex`; independent sessions coexist freely.

use spindleproto::constants::{DEVICE_BUFFER_SAMPLES, NUM_ANALOG_CHANNELS};
use spindleproto::{
    pack_comment_color, CommentCharset, InstrumentInfo, PatientRecord, SampleKind, Tick,
};
use tracing::{debug, info, warn};

use crate::buffer::{ChannelData, SampleBatch, SampleBuffer};
use crate::config::SessionConfig;
use crate::directory::ChannelDirectory;
use crate::error::{SessionError, TransportError};
use crate::transport::{ControlReply, ControlRequest, LinkStats, RecordingStatus, Transport};
use crate::udp::UdpTransport;

/// A client session against one instrument instance.
pub struct Session {
    config: SessionConfig,
    transport: Box<dyn Transport>,
    /// Identity cache, filled from the transport once it has one.
    instrument: Option<InstrumentInfo>,
    /// Directory from the last prefetch, consumed by the next transfer.
    pending: Option<ChannelDirectory>,
    released: bool,
}

impl Session {
    /// Open a session over UDP. Bounded: an instrument that does not
    /// answer the handshake yields an offline session, not an error.
    /// Errors mean local faults, e.g. the inbound port is taken.
    pub fn connect(config: SessionConfig) -> Result<Self, SessionError> {
        let transport = UdpTransport::new(&config)?;
        Self::with_transport(config, Box::new(transport))
    }

    /// Open a session over any transport. This is how test doubles and
    /// alternative backends plug in.
    pub fn with_transport(
        config: SessionConfig,
        mut transport: Box<dyn Transport>,
    ) -> Result<Self, SessionError> {
        let instrument = transport.connect()?;
        match &instrument {
            Some(info) => {
                info!(instance = config.instance, model = %info.model, "session online")
            }
            None => info!(instance = config.instance, "session created offline"),
        }
        Ok(Self {
            config,
            transport,
            instrument,
            pending: None,
            released: false,
        })
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.released {
            return Err(SessionError::Disposed);
        }
        Ok(())
    }

    /// Whether the instrument has been heard from recently. A released
    /// session reports false.
    pub fn is_online(&self) -> bool {
        !self.released && self.transport.online()
    }

    /// Element representation of every batch this session produces.
    pub fn sample_kind(&self) -> SampleKind {
        self.config.sample_kind
    }

    pub fn is_double(&self) -> bool {
        self.config.sample_kind.is_double()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Latest device clock reading observed on the link. None before any
    /// instrument traffic, and after release.
    pub fn device_time(&self) -> Option<Tick> {
        if self.released {
            return None;
        }
        self.transport.device_tick()
    }

    /// Instrument identity from the handshake, once some handshake has
    /// completed. The instrument may come online well after the session.
    pub fn instrument(&mut self) -> Option<&InstrumentInfo> {
        if !self.released && self.instrument.is_none() {
            self.instrument = self.transport.instrument_info();
        }
        self.instrument.as_ref()
    }

    /// Link counters, for diagnostics.
    pub fn link_stats(&self) -> LinkStats {
        self.transport.stats()
    }

    /// Phase one of a poll: which channels have unread data, and how much.
    /// Consumes nothing; the result is also retained as the pending
    /// directory for the next [`Session::transfer`]. Offline or faulted
    /// queries degrade to an empty directory.
    pub fn prefetch(&mut self) -> Result<ChannelDirectory, SessionError> {
        self.ensure_live()?;
        let directory = match self.transport.query_available() {
            Ok(available) => ChannelDirectory::new(available.tick, available.channels)?,
            Err(err) => {
                debug!(error = %err, "prefetch degraded to empty");
                ChannelDirectory::empty(self.transport.device_tick().unwrap_or_else(Tick::zero))
            }
        };
        self.pending = Some(directory.clone());
        Ok(directory)
    }

    /// Phase two of a poll: consume exactly what the pending directory
    /// reported, per channel, and hand the caller an owned batch stamped
    /// with the directory's tick. The pending directory is cleared whether
    /// or not the transfer succeeds; the next cycle prefetches again.
    pub fn transfer(&mut self) -> Result<SampleBatch, SessionError> {
        self.ensure_live()?;
        let directory = self
            .pending
            .take()
            .ok_or(SessionError::TransferWithoutPrefetch)?;

        // Guard before consuming anything: a count past the device buffer
        // capacity is a corrupt directory, not a big poll.
        for entry in directory.entries() {
            if entry.available > DEVICE_BUFFER_SAMPLES {
                return Err(SessionError::TransferTooLarge {
                    channel: entry.channel,
                    requested: entry.available,
                    capacity: DEVICE_BUFFER_SAMPLES,
                });
            }
        }

        let kind = self.config.sample_kind;
        let mut channels = Vec::with_capacity(directory.channel_count());
        for entry in directory.entries() {
            let wanted = entry.available as usize;
            let mut raw = Vec::with_capacity(wanted);
            if wanted > 0 {
                match self.transport.read_samples(entry.channel, wanted, &mut raw) {
                    Ok(got) if got < wanted => {
                        debug!(channel = entry.channel, wanted, got, "short transfer read");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        debug!(channel = entry.channel, error = %err, "transfer read failed");
                    }
                }
            }
            channels.push(ChannelData {
                channel: entry.channel,
                samples: SampleBuffer::from_raw(kind, raw),
            });
        }
        Ok(SampleBatch::new(directory.tick(), channels))
    }

    /// One-shot poll: prefetch then transfer, observably identical to the
    /// two-step form.
    pub fn fetch(&mut self) -> Result<SampleBatch, SessionError> {
        self.prefetch()?;
        self.transfer()
    }

    /// Send an annotation event tagged with a display color and charset.
    /// Fire-and-forget: offline sessions drop it silently. Only a text
    /// that cannot be framed (too long) is an error.
    pub fn set_comment(
        &mut self,
        text: &str,
        red: u8,
        green: u8,
        blue: u8,
        charset: CommentCharset,
    ) -> Result<(), SessionError> {
        self.ensure_live()?;
        let request = ControlRequest::Comment {
            color: pack_comment_color(red, green, blue),
            charset,
            text: text.to_string(),
        };
        match self.transport.write_control(request) {
            Ok(_) => Ok(()),
            Err(TransportError::Frame(err)) => Err(TransportError::Frame(err).into()),
            Err(err) => {
                warn!(error = %err, "comment dropped");
                Ok(())
            }
        }
    }

    /// Start (`start == true`) or stop recording to a named file on the
    /// device. `Ok(false)` when the device rejects or cannot be reached.
    pub fn set_file_storage(
        &mut self,
        file_name: &str,
        file_comment: &str,
        start: bool,
    ) -> Result<bool, SessionError> {
        self.ensure_live()?;
        self.acked_control(
            ControlRequest::FileConfig {
                start,
                name: file_name.to_string(),
                comment: file_comment.to_string(),
            },
            "file storage",
        )
    }

    /// Attach patient metadata to the forthcoming recording. `Ok(false)`
    /// when the device rejects, e.g. while already recording.
    pub fn set_patient_info(
        &mut self,
        id: &str,
        first_name: &str,
        last_name: &str,
        dob_month: u8,
        dob_day: u8,
        dob_year: u16,
    ) -> Result<bool, SessionError> {
        self.ensure_live()?;
        let patient = PatientRecord {
            id: id.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            dob_month,
            dob_day,
            dob_year,
        };
        self.acked_control(ControlRequest::Patient(patient), "patient info")
    }

    /// Enable or disable one hardware channel. Disabled channels leave the
    /// active set on the device's next heartbeat.
    pub fn set_channel_enabled(
        &mut self,
        channel: u16,
        enabled: bool,
    ) -> Result<bool, SessionError> {
        self.ensure_live()?;
        if channel >= NUM_ANALOG_CHANNELS {
            return Err(SessionError::InvalidChannel {
                channel,
                max: NUM_ANALOG_CHANNELS - 1,
            });
        }
        self.acked_control(
            ControlRequest::ChannelMask { channel, enabled },
            "channel mask",
        )
    }

    /// Whether the device is writing a storage file right now. Offline
    /// reports false.
    pub fn is_recording(&mut self) -> Result<bool, SessionError> {
        Ok(self.recording_state()?.recording)
    }

    /// Recording state with the file name, when there is one.
    pub fn recording_state(&mut self) -> Result<RecordingStatus, SessionError> {
        self.ensure_live()?;
        match self.transport.query_recording_state() {
            Ok(status) => Ok(status),
            Err(err) => {
                debug!(error = %err, "recording query failed, reporting idle");
                Ok(RecordingStatus {
                    recording: false,
                    file_name: None,
                })
            }
        }
    }

    /// Tear the transport down. Idempotent; after the first call every
    /// fallible operation fails with [`SessionError::Disposed`].
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.transport.shutdown();
        self.pending = None;
        self.released = true;
        info!(instance = self.config.instance, "session released");
    }

    fn acked_control(
        &mut self,
        request: ControlRequest,
        what: &'static str,
    ) -> Result<bool, SessionError> {
        match self.transport.write_control(request) {
            Ok(ControlReply::Accepted(accepted)) => {
                if !accepted {
                    debug!(what, "instrument rejected request");
                }
                Ok(accepted)
            }
            Ok(ControlReply::None) => {
                debug!(what, "no acknowledgement for acked request");
                Ok(false)
            }
            Err(TransportError::Frame(err)) => Err(TransportError::Frame(err).into()),
            Err(err) => {
                warn!(what, error = %err, "control request failed, treating as rejected");
                Ok(false)
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ChannelEntry;
    use crate::transport::ChannelAvailability;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Deterministic device double: scripted queues, scripted acceptance.
    struct ScriptedTransport {
        online: bool,
        tick: Tick,
        queues: BTreeMap<u16, Vec<i16>>,
        /// Overrides the advertised availability when set, so tests can
        /// claim counts the queues do not back.
        advertised: Option<Vec<ChannelEntry>>,
        accept_control: bool,
        control_fails: bool,
        recording: bool,
        info: Option<InstrumentInfo>,
        shutdowns: Arc<AtomicU32>,
    }

    impl ScriptedTransport {
        fn offline() -> Self {
            Self {
                online: false,
                tick: Tick::zero(),
                queues: BTreeMap::new(),
                advertised: None,
                accept_control: true,
                control_fails: true,
                recording: false,
                info: None,
                shutdowns: Arc::new(AtomicU32::new(0)),
            }
        }

        fn online_at(tick: u32) -> Self {
            Self {
                online: true,
                tick: Tick(tick),
                queues: BTreeMap::new(),
                advertised: None,
                accept_control: true,
                control_fails: false,
                recording: false,
                info: Some(InstrumentInfo {
                    revision: 1,
                    model: "scripted".to_string(),
                    serial: 7,
                    channel_capacity: NUM_ANALOG_CHANNELS,
                }),
                shutdowns: Arc::new(AtomicU32::new(0)),
            }
        }

        fn with_queue(mut self, channel: u16, samples: Vec<i16>) -> Self {
            self.queues.insert(channel, samples);
            self
        }
    }

    impl Transport for ScriptedTransport {
        fn connect(&mut self) -> Result<Option<InstrumentInfo>, TransportError> {
            Ok(self.info.clone())
        }

        fn online(&self) -> bool {
            self.online
        }

        fn device_tick(&self) -> Option<Tick> {
            self.online.then_some(self.tick)
        }

        fn instrument_info(&self) -> Option<InstrumentInfo> {
            self.info.clone()
        }

        fn query_available(&mut self) -> Result<ChannelAvailability, TransportError> {
            if !self.online {
                return Ok(ChannelAvailability {
                    tick: Tick::zero(),
                    channels: Vec::new(),
                });
            }
            let channels = match &self.advertised {
                Some(entries) => entries.clone(),
                None => self
                    .queues
                    .iter()
                    .map(|(&channel, queue)| ChannelEntry {
                        channel,
                        available: queue.len() as u32,
                    })
                    .collect(),
            };
            Ok(ChannelAvailability {
                tick: self.tick,
                channels,
            })
        }

        fn read_samples(
            &mut self,
            channel: u16,
            count: usize,
            out: &mut Vec<i16>,
        ) -> Result<usize, TransportError> {
            let Some(queue) = self.queues.get_mut(&channel) else {
                return Ok(0);
            };
            let take = count.min(queue.len());
            out.extend(queue.drain(..take));
            Ok(take)
        }

        fn write_control(
            &mut self,
            request: ControlRequest,
        ) -> Result<ControlReply, TransportError> {
            if self.control_fails {
                return Err(TransportError::ControlTimeout {
                    timeout_ms: 250,
                    attempts: 3,
                });
            }
            match request {
                ControlRequest::Comment { .. } => Ok(ControlReply::None),
                ControlRequest::FileConfig { start, .. } => {
                    if self.accept_control {
                        self.recording = start;
                    }
                    Ok(ControlReply::Accepted(self.accept_control))
                }
                _ => Ok(ControlReply::Accepted(self.accept_control)),
            }
        }

        fn query_recording_state(&mut self) -> Result<RecordingStatus, TransportError> {
            if self.control_fails {
                return Err(TransportError::ControlTimeout {
                    timeout_ms: 250,
                    attempts: 3,
                });
            }
            Ok(RecordingStatus {
                recording: self.recording,
                file_name: self.recording.then(|| "bench".to_string()),
            })
        }

        fn stats(&self) -> LinkStats {
            LinkStats::default()
        }

        fn shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            self.online = false;
        }
    }

    fn session(transport: ScriptedTransport) -> Session {
        Session::with_transport(SessionConfig::new(0), Box::new(transport))
            .expect("scripted connect cannot fail")
    }

    #[test]
    fn offline_session_fetches_nothing() {
        let mut s = session(ScriptedTransport::offline());
        assert!(!s.is_online());
        assert_eq!(s.device_time(), None);

        let batch = s.fetch().unwrap();
        assert_eq!(batch.channel_count(), 0);
        assert!(matches!(
            batch.data(0),
            Err(SessionError::ChannelIndexOutOfRange { index: 0, active: 0 })
        ));

        let directory = s.prefetch().unwrap();
        assert!(directory.is_empty());
    }

    #[test]
    fn transfer_requires_prefetch() {
        let mut s = session(ScriptedTransport::online_at(10).with_queue(0, vec![1, 2]));
        assert!(matches!(
            s.transfer(),
            Err(SessionError::TransferWithoutPrefetch)
        ));

        // a transfer clears the pending directory
        s.fetch().unwrap();
        assert!(matches!(
            s.transfer(),
            Err(SessionError::TransferWithoutPrefetch)
        ));
    }

    #[test]
    fn double_prefetch_is_stable_when_device_is() {
        let mut s = session(
            ScriptedTransport::online_at(500)
                .with_queue(3, vec![1, 2, 3])
                .with_queue(9, vec![4]),
        );
        let first = s.prefetch().unwrap();
        let second = s.prefetch().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.channel_count(), 2);
    }

    #[test]
    fn fetch_consumes_exactly_what_was_reported() {
        let samples: Vec<i16> = (0..10).collect();
        let mut s = session(
            ScriptedTransport::online_at(1000)
                .with_queue(10, samples.clone())
                .with_queue(0, Vec::new())
                .with_queue(5, vec![7; 5]),
        );

        let batch = s.fetch().unwrap();
        assert_eq!(batch.timestamp(), Tick(1000));
        assert!((batch.timestamp().as_secs_f64() - 1000.0 / 30_000.0).abs() < 1e-12);
        assert_eq!(batch.channel_count(), 3);

        // directory order is ascending hardware channel number
        assert_eq!(batch.channel_number(0).unwrap(), 0);
        assert_eq!(batch.channel_number(1).unwrap(), 5);
        assert_eq!(batch.channel_number(2).unwrap(), 10);
        assert_eq!(batch.data(0).unwrap().len(), 0);
        assert_eq!(batch.data(1).unwrap().len(), 5);
        assert_eq!(batch.data(2).unwrap().as_i16().unwrap(), &samples[..]);
        assert!(matches!(
            batch.data(3),
            Err(SessionError::ChannelIndexOutOfRange { index: 3, active: 3 })
        ));

        // consumed samples never reappear
        let second = s.fetch().unwrap();
        for i in 0..second.channel_count() {
            assert_eq!(second.data(i).unwrap().len(), 0);
        }
    }

    #[test]
    fn float64_sessions_widen() {
        let config = SessionConfig::new(0).with_sample_kind(SampleKind::Float64);
        let transport = ScriptedTransport::online_at(1).with_queue(2, vec![1, -2, 3]);
        let mut s = Session::with_transport(config, Box::new(transport)).unwrap();
        assert!(s.is_double());

        let batch = s.fetch().unwrap();
        let buffer = batch.data(0).unwrap();
        assert_eq!(buffer.as_f64().unwrap(), &[1.0, -2.0, 3.0]);
        assert!(matches!(
            buffer.as_i16(),
            Err(SessionError::WrongSampleKind { .. })
        ));
    }

    #[test]
    fn oversized_directory_entry_fails_the_transfer() {
        let mut transport = ScriptedTransport::online_at(1).with_queue(4, vec![1]);
        transport.advertised = Some(vec![ChannelEntry {
            channel: 4,
            available: DEVICE_BUFFER_SAMPLES + 1,
        }]);
        let mut s = session(transport);

        assert!(matches!(
            s.fetch(),
            Err(SessionError::TransferTooLarge {
                channel: 4,
                requested,
                ..
            }) if requested == DEVICE_BUFFER_SAMPLES + 1
        ));

        // the session survives and the pending directory is gone
        assert!(matches!(
            s.transfer(),
            Err(SessionError::TransferWithoutPrefetch)
        ));
    }

    #[test]
    fn comment_is_safe_offline() {
        let mut s = session(ScriptedTransport::offline());
        s.set_comment("stim onset", 255, 0, 0, CommentCharset::Ansi)
            .unwrap();
    }

    #[test]
    fn unreachable_control_reports_rejection_not_error() {
        let mut s = session(ScriptedTransport::offline());
        assert!(!s.set_file_storage("run-1", "", true).unwrap());
        assert!(!s.set_patient_info("p1", "A", "B", 1, 2, 1990).unwrap());
        assert!(!s.set_channel_enabled(3, false).unwrap());
        assert!(!s.is_recording().unwrap());
    }

    #[test]
    fn rejecting_device_yields_false() {
        let mut transport = ScriptedTransport::online_at(1);
        transport.accept_control = false;
        let mut s = session(transport);
        assert!(!s.set_file_storage("run-1", "", true).unwrap());
        assert!(!s.is_recording().unwrap());
    }

    #[test]
    fn recording_follows_file_storage() {
        let mut s = session(ScriptedTransport::online_at(1));
        assert!(!s.is_recording().unwrap());

        assert!(s.set_file_storage("run-7", "baseline", true).unwrap());
        assert!(s.is_recording().unwrap());
        assert_eq!(
            s.recording_state().unwrap().file_name.as_deref(),
            Some("bench")
        );

        assert!(s.set_file_storage("run-7", "", false).unwrap());
        assert!(!s.is_recording().unwrap());
    }

    #[test]
    fn channel_mask_validates_the_channel_number() {
        let mut s = session(ScriptedTransport::online_at(1));
        assert!(matches!(
            s.set_channel_enabled(NUM_ANALOG_CHANNELS, true),
            Err(SessionError::InvalidChannel { channel, max })
                if channel == NUM_ANALOG_CHANNELS && max == NUM_ANALOG_CHANNELS - 1
        ));
        assert!(s.set_channel_enabled(NUM_ANALOG_CHANNELS - 1, true).unwrap());
    }

    #[test]
    fn release_is_idempotent_and_shuts_down_once() {
        let transport = ScriptedTransport::online_at(1);
        let shutdowns = Arc::clone(&transport.shutdowns);
        let mut s = session(transport);

        s.release();
        s.release();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

        drop(s);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn every_operation_fails_after_release() {
        let mut s = session(ScriptedTransport::online_at(1).with_queue(0, vec![1]));
        s.release();

        assert!(!s.is_online());
        assert_eq!(s.device_time(), None);
        assert!(matches!(s.prefetch(), Err(SessionError::Disposed)));
        assert!(matches!(s.transfer(), Err(SessionError::Disposed)));
        assert!(matches!(s.fetch(), Err(SessionError::Disposed)));
        assert!(matches!(
            s.set_comment("x", 0, 0, 0, CommentCharset::Ansi),
            Err(SessionError::Disposed)
        ));
        assert!(matches!(
            s.set_file_storage("f", "", true),
            Err(SessionError::Disposed)
        ));
        assert!(matches!(
            s.set_patient_info("i", "f", "l", 1, 1, 2000),
            Err(SessionError::Disposed)
        ));
        assert!(matches!(
            s.set_channel_enabled(0, true),
            Err(SessionError::Disposed)
        ));
        assert!(matches!(s.is_recording(), Err(SessionError::Disposed)));
    }
}
