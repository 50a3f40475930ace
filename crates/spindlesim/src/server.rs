//! UDP face of the simulated instrument
//!
//! One worker thread owns the socket and the [`Instrument`], and does three
//! jobs in a short loop:
//!
//! ```text
//! Client                          spindlesim worker
//!   │                                   │
//!   │  Hello / control request ───────▶ │  recv_from (5 ms timeout)
//!   │ ◀─────── HelloAck / ControlAck    │  instrument.handle_control()
//!   │                                   │
//!   │ ◀─────── SampleChunk stream       │  advance clock by wall time,
//!   │ ◀─────── Heartbeat (100 ms)       │  drain pending samples
//! ```
//!
//! Clients are discovered from the source address of their `Hello` frames,
//! so the stream goes back out of the same socket the request came in on.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use spindleproto::constants::{DEFAULT_OUTBOUND_PORT, TICKS_PER_SECOND};
use spindleproto::{Datagram, Frame, FrameError, MAX_CHUNK_SAMPLES};
use tracing::{debug, info, trace, warn};

use crate::instrument::{CommentEvent, Instrument};
use crate::recorder::{valid_file_name, Recorder, RecorderError};

/// How long `recv_from` blocks before the worker services its timers.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Most clients the stream fans out to at once.
const MAX_SUBSCRIBERS: usize = 8;

/// Sample chunks sent per loop iteration across all channels.
const CHUNK_BURST: u32 = 128;

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("Socket error: {0}")]
    Io(#[from] io::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Recorder(#[from] RecorderError),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_address: String,
    pub listen_port: u16,
    /// Channels streaming at boot. Clients can mask others on later.
    pub enabled_channels: Vec<u16>,
    pub serial: u32,
    /// Where recording manifests are written. `None` keeps the recording
    /// state machine but skips the files.
    pub record_dir: Option<PathBuf>,
    pub heartbeat_interval: Duration,
    /// Hold the device clock still instead of tracking wall time. Scripted
    /// scenarios use this to pin sample timestamps.
    pub freeze_clock: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            listen_port: DEFAULT_OUTBOUND_PORT,
            enabled_channels: vec![0, 1, 2, 3],
            serial: 0xC0FFEE,
            record_dir: None,
            heartbeat_interval: Duration::from_millis(100),
            freeze_clock: false,
        }
    }
}

/// Destinations learned from `Hello` sources. Bounded; a full set evicts
/// the oldest subscriber.
struct SubscriberSet {
    addrs: Vec<SocketAddr>,
    cap: usize,
}

impl SubscriberSet {
    fn new(cap: usize) -> Self {
        Self {
            addrs: Vec::new(),
            cap,
        }
    }

    /// Record a `Hello` source. Known addresses move to the back so the
    /// oldest-heard one is always the eviction candidate.
    fn note(&mut self, addr: SocketAddr) {
        if let Some(pos) = self.addrs.iter().position(|&a| a == addr) {
            self.addrs.remove(pos);
            self.addrs.push(addr);
            return;
        }
        if self.addrs.len() == self.cap {
            let evicted = self.addrs.remove(0);
            debug!(%evicted, "subscriber set full, evicting oldest");
        }
        info!(%addr, "subscriber added");
        self.addrs.push(addr);
    }

    fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    fn send_all(&self, socket: &UdpSocket, bytes: &[u8]) {
        for addr in &self.addrs {
            if let Err(err) = socket.send_to(bytes, addr) {
                trace!(error = %err, %addr, "send failed");
            }
        }
    }
}

struct Worker {
    socket: UdpSocket,
    instrument: Instrument,
    recorder: Option<Recorder>,
    subscribers: SubscriberSet,
    running: Arc<AtomicBool>,
    heartbeat_interval: Duration,
    freeze_clock: bool,
}

impl Worker {
    fn run(mut self) {
        let mut buf = [0u8; 2048];
        let started = Instant::now();
        let mut ticks_emitted: u64 = 0;
        let mut last_heartbeat: Option<Instant> = None;

        while self.running.load(Ordering::SeqCst) {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => self.handle_datagram(&buf[..len], from),
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(err) => warn!(error = %err, "receive failed"),
            }

            if !self.freeze_clock {
                // Absolute target keeps the clock drift-free no matter how
                // long handling took.
                let target = started
                    .elapsed()
                    .as_micros()
                    .saturating_mul(u128::from(TICKS_PER_SECOND))
                    / 1_000_000;
                let target = u64::try_from(target).unwrap_or(u64::MAX);
                let delta = target.saturating_sub(ticks_emitted);
                if delta > 0 {
                    self.instrument.advance(delta.min(u64::from(u32::MAX)) as u32);
                    ticks_emitted = target;
                }
            }

            self.stream_chunks();

            let due = last_heartbeat.map_or(true, |at| at.elapsed() >= self.heartbeat_interval);
            if due && !self.subscribers.is_empty() {
                self.send_heartbeat();
                last_heartbeat = Some(Instant::now());
            }
        }
        debug!("server worker stopped");
    }

    fn handle_datagram(&mut self, raw: &[u8], from: SocketAddr) {
        let datagram = match Datagram::decode(raw) {
            Ok(datagram) => datagram,
            Err(err) => {
                debug!(error = %err, %from, "dropping undecodable datagram");
                return;
            }
        };
        trace!(opcode = ?datagram.frame.opcode(), %from, "request");

        if matches!(datagram.frame, Frame::Hello { .. }) {
            self.subscribers.note(from);
        }

        // File names become paths on the instrument's disk, so they are
        // policed here before the device state machine sees the request.
        if let Frame::FileConfig {
            token,
            start: true,
            ref name,
            ..
        } = datagram.frame
        {
            if !valid_file_name(name) {
                debug!(name = %name, "rejecting unsafe file name");
                let nack = Frame::ControlAck {
                    token,
                    accepted: false,
                };
                self.reply(nack, from);
                return;
            }
        }

        let comment_event = match datagram.frame {
            Frame::Comment {
                color,
                charset,
                ref text,
                ..
            } => Some(CommentEvent {
                tick: self.instrument.clock(),
                color,
                charset,
                text: text.clone(),
            }),
            _ => None,
        };

        let was_recording = self.instrument.is_recording();
        let reply = self.instrument.handle_control(datagram.frame);

        self.sync_recorder(was_recording, comment_event);

        if let Some(frame) = reply {
            self.reply(frame, from);
        }
    }

    /// Mirror the instrument's recording transitions into manifest files.
    /// Manifest failures are logged, not surfaced; the device itself has
    /// already accepted the request.
    fn sync_recorder(&mut self, was_recording: bool, comment: Option<CommentEvent>) {
        let Some(recorder) = self.recorder.as_mut() else {
            return;
        };
        let now_recording = self.instrument.is_recording();
        let tick = self.instrument.clock();

        if !was_recording && now_recording {
            let name = self.instrument.recording_file().unwrap_or_default().to_string();
            let file_comment = self
                .instrument
                .recording_comment()
                .unwrap_or_default()
                .to_string();
            let patient = self.instrument.patient().cloned();
            if let Err(err) =
                recorder.start(&name, &file_comment, self.instrument.serial(), tick, patient)
            {
                warn!(error = %err, "manifest start failed");
            }
        } else if was_recording && !now_recording {
            if let Err(err) = recorder.stop(tick) {
                warn!(error = %err, "manifest stop failed");
            }
        }

        if let (Some(event), true) = (comment, now_recording) {
            if let Err(err) = recorder.add_comment(&event) {
                warn!(error = %err, "manifest comment failed");
            }
        }
    }

    fn stream_chunks(&mut self) {
        if self.subscribers.is_empty() {
            return;
        }
        let tick = self.instrument.clock();
        let mut budget = CHUNK_BURST;
        for channel in self.instrument.enabled_channels() {
            while budget > 0 {
                let samples = self.instrument.take_pending(channel, MAX_CHUNK_SAMPLES);
                if samples.is_empty() {
                    break;
                }
                budget -= 1;
                let datagram = Datagram::new(tick, Frame::SampleChunk { channel, samples });
                match datagram.encode() {
                    Ok(bytes) => self.subscribers.send_all(&self.socket, &bytes),
                    Err(err) => debug!(error = %err, "chunk encode failed"),
                }
            }
            if budget == 0 {
                break;
            }
        }
    }

    fn send_heartbeat(&mut self) {
        let frame = Frame::Heartbeat {
            recording: self.instrument.is_recording(),
            active: self.instrument.enabled_channels(),
        };
        match Datagram::new(self.instrument.clock(), frame).encode() {
            Ok(bytes) => self.subscribers.send_all(&self.socket, &bytes),
            Err(err) => debug!(error = %err, "heartbeat encode failed"),
        }
    }

    fn reply(&self, frame: Frame, to: SocketAddr) {
        match Datagram::new(self.instrument.clock(), frame).encode() {
            Ok(bytes) => {
                if let Err(err) = self.socket.send_to(&bytes, to) {
                    debug!(error = %err, %to, "reply send failed");
                }
            }
            Err(err) => debug!(error = %err, "reply encode failed"),
        }
    }
}

/// Handle to a running simulated instrument.
///
/// The worker thread owns the socket and device state; this handle only
/// carries the stop flag and the bound address.
pub struct Server {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl Server {
    pub fn start(config: ServerConfig) -> Result<Self, SimError> {
        let instrument =
            Instrument::new(config.serial).with_enabled(&config.enabled_channels);
        Self::start_with(config, instrument)
    }

    /// Start with a prepared device, for scripted scenarios that pin the
    /// clock or preload sample buffers.
    pub fn start_with(config: ServerConfig, instrument: Instrument) -> Result<Self, SimError> {
        let socket = UdpSocket::bind((config.listen_address.as_str(), config.listen_port))?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let local_addr = socket.local_addr()?;

        let recorder = match &config.record_dir {
            Some(dir) => Some(Recorder::new(dir.clone())?),
            None => None,
        };

        let running = Arc::new(AtomicBool::new(true));
        let worker = Worker {
            socket,
            instrument,
            recorder,
            subscribers: SubscriberSet::new(MAX_SUBSCRIBERS),
            running: Arc::clone(&running),
            heartbeat_interval: config.heartbeat_interval,
            freeze_clock: config.freeze_clock,
        };
        let handle = thread::Builder::new()
            .name("spindlesim-server".to_string())
            .spawn(move || worker.run())?;

        info!(%local_addr, serial = config.serial, "simulated instrument listening");
        Ok(Self {
            running,
            worker: Some(handle),
            local_addr,
        })
    }

    /// The bound socket address. Useful when the config asked for port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    /// Block until the worker exits. It only exits when another handle to
    /// the process stops it, so this is the daemon's park call.
    pub fn join(mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
