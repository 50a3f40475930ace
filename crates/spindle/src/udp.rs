//! UDP link to the instrument
//!
//! Two sockets, two planes. The data socket binds the well-known inbound
//! port and receives the continuous stream (sample chunks, heartbeats); a
//! background receiver thread drains it into per-channel rings so the
//! caller's polling cadence never backpressures the wire. The control
//! socket is ephemeral and connected to the instrument's control port;
//! requests go out with a correlation token and replies are matched against
//! it, with bounded retries, so a dead instrument costs a timeout rather
//! than a hang.
//!
//! The instrument learns where to stream from the source address of our
//! `Hello`, which is why the handshake goes out on the data socket. While
//! the link is quiet the receiver keeps re-sending `Hello`, so an
//! instrument that powers on late (or reboots) picks the client back up
//! without any caller involvement.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use spindleproto::{Datagram, Frame, InstrumentInfo, Tick};
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::directory::ChannelEntry;
use crate::error::TransportError;
use crate::ring::SampleRing;
use crate::transport::{
    ChannelAvailability, ControlReply, ControlRequest, LinkStats, RecordingStatus, Transport,
};

/// Largest datagram we ever expect; comfortably above the biggest legal
/// frame (a full sample chunk is 1040 bytes).
const MAX_DATAGRAM: usize = 2048;

/// Receiver wake-up cadence while no traffic arrives.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Sentinel for "never heard from the instrument".
const NEVER: u64 = u64::MAX;

/// Liveness and counters for the link, shared between the receiver thread
/// and the caller. Plain atomics; nothing here needs a lock.
struct LinkState {
    epoch: Instant,
    last_heard_us: AtomicU64,
    last_tick: AtomicU32,
    tick_seen: AtomicBool,
    frames: AtomicU64,
    samples: AtomicU64,
    overrun_samples: AtomicU64,
    decode_errors: AtomicU64,
}

impl LinkState {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_heard_us: AtomicU64::new(NEVER),
            last_tick: AtomicU32::new(0),
            tick_seen: AtomicBool::new(false),
            frames: AtomicU64::new(0),
            samples: AtomicU64::new(0),
            overrun_samples: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
        }
    }

    fn mark_heard(&self) {
        let now_us = self.epoch.elapsed().as_micros() as u64;
        self.last_heard_us.store(now_us, Ordering::Relaxed);
    }

    fn heard_within(&self, window: Duration) -> bool {
        let last = self.last_heard_us.load(Ordering::Relaxed);
        if last == NEVER {
            return false;
        }
        let now_us = self.epoch.elapsed().as_micros() as u64;
        now_us.saturating_sub(last) <= window.as_micros() as u64
    }

    fn record_tick(&self, tick: Tick) {
        self.last_tick.store(tick.0, Ordering::Relaxed);
        self.tick_seen.store(true, Ordering::Relaxed);
    }

    fn tick(&self) -> Option<Tick> {
        if self.tick_seen.load(Ordering::Relaxed) {
            Some(Tick(self.last_tick.load(Ordering::Relaxed)))
        } else {
            None
        }
    }

    fn note_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LinkStats {
        LinkStats {
            frames: self.frames.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            overrun_samples: self.overrun_samples.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

/// Per-channel receive rings plus the active set from the last heartbeat.
struct ChannelStore {
    rings: HashMap<u16, SampleRing>,
    active: Vec<u16>,
    ring_capacity: usize,
}

impl ChannelStore {
    fn new(ring_capacity: usize) -> Self {
        Self {
            rings: HashMap::new(),
            active: Vec::new(),
            ring_capacity,
        }
    }

    /// Append a chunk, creating the channel's ring on first sight.
    /// Returns how many old samples the ring had to evict.
    fn push(&mut self, channel: u16, samples: &[i16]) -> usize {
        let capacity = self.ring_capacity;
        self.rings
            .entry(channel)
            .or_insert_with(|| SampleRing::new(capacity))
            .push(samples)
    }

    fn set_active(&mut self, channels: &[u16]) {
        self.active.clear();
        self.active.extend_from_slice(channels);
        self.active.sort_unstable();
        self.active.dedup();
    }

    /// Availability for each active channel, in channel order. Channels
    /// that have not delivered a chunk yet report zero.
    fn snapshot(&self) -> Vec<ChannelEntry> {
        self.active
            .iter()
            .map(|&channel| ChannelEntry {
                channel,
                available: self
                    .rings
                    .get(&channel)
                    .map_or(0, |ring| ring.available() as u32),
            })
            .collect()
    }

    fn read(&mut self, channel: u16, count: usize, out: &mut Vec<i16>) -> usize {
        match self.rings.get_mut(&channel) {
            Some(ring) => ring.pop_into(out, count),
            None => 0,
        }
    }
}

/// State shared between the transport handle and its receiver thread.
struct Shared {
    store: Mutex<ChannelStore>,
    link: LinkState,
    instrument: Mutex<Option<InstrumentInfo>>,
}

impl Shared {
    /// Apply one received datagram, whichever socket it came in on.
    fn deliver(&self, datagram: Datagram) {
        self.link.mark_heard();
        self.link.record_tick(datagram.tick);
        self.link.frames.fetch_add(1, Ordering::Relaxed);

        match datagram.frame {
            Frame::SampleChunk { channel, samples } => {
                self.link
                    .samples
                    .fetch_add(samples.len() as u64, Ordering::Relaxed);
                let dropped = lock(&self.store).push(channel, &samples);
                if dropped > 0 {
                    self.link
                        .overrun_samples
                        .fetch_add(dropped as u64, Ordering::Relaxed);
                    trace!(channel, dropped, "receive ring overrun");
                }
            }
            Frame::Heartbeat { active, .. } => {
                lock(&self.store).set_active(&active);
            }
            Frame::HelloAck { info, .. } => {
                let mut slot = lock(&self.instrument);
                if slot.is_none() {
                    info!(
                        model = %info.model,
                        serial = info.serial,
                        channels = info.channel_capacity,
                        "instrument online"
                    );
                } else {
                    debug!("instrument answered hello");
                }
                *slot = Some(info);
            }
            other => {
                trace!(opcode = ?other.opcode(), "ignoring frame on data path");
            }
        }
    }
}

/// A poisoned lock only means a thread panicked mid-update; rings and
/// counters stay structurally valid, so keep going.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transient socket conditions that mean "no datagram right now", not
/// "the link is broken". Linux reports ICMP port-unreachable against a
/// connected UDP socket as `ConnectionRefused`; for us that is just an
/// instrument that has not booted yet.
fn soft_net_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionRefused
    )
}

/// A control reply matched to our token, digested out of its frame.
enum Reply {
    Ack { accepted: bool },
    Recording { recording: bool, file_name: String },
}

/// The background thread that drains the data socket.
struct Receiver {
    socket: UdpSocket,
    outbound: SocketAddr,
    instance: u32,
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    offline_after: Duration,
    hello_interval: Duration,
}

impl Receiver {
    fn run(self) {
        debug!("receiver thread started");
        let mut buf = [0u8; MAX_DATAGRAM];
        let mut last_hello: Option<Instant> = None;

        while self.running.load(Ordering::SeqCst) {
            match self.socket.recv_from(&mut buf) {
                Ok((len, _from)) => match Datagram::decode(&buf[..len]) {
                    Ok(datagram) => self.shared.deliver(datagram),
                    Err(err) => {
                        self.shared.link.note_decode_error();
                        debug!(error = %err, len, "dropping undecodable datagram");
                    }
                },
                Err(err) if soft_net_error(&err) => {}
                Err(err) => {
                    warn!(error = %err, "data socket receive failed");
                    thread::sleep(POLL_INTERVAL);
                }
            }

            // Quiet link: keep offering ourselves so an instrument that
            // boots late starts streaming without caller involvement.
            if !self.shared.link.heard_within(self.offline_after) {
                let due = last_hello.map_or(true, |at| at.elapsed() >= self.hello_interval);
                if due {
                    self.send_hello();
                    last_hello = Some(Instant::now());
                }
            }
        }
        debug!("receiver thread stopped");
    }

    fn send_hello(&self) {
        let datagram = Datagram::new(
            self.shared.link.tick().unwrap_or_else(Tick::zero),
            Frame::Hello {
                token: 0,
                instance: self.instance,
            },
        );
        match datagram.encode() {
            Ok(bytes) => {
                if let Err(err) = self.socket.send_to(&bytes, self.outbound) {
                    if !soft_net_error(&err) {
                        warn!(error = %err, "hello send failed");
                    }
                } else {
                    trace!(instance = self.instance, "hello sent");
                }
            }
            Err(err) => debug!(error = %err, "hello encode failed"),
        }
    }
}

/// SPNDL1 over UDP. The transport a [`crate::Session`] uses unless handed
/// something else.
pub struct UdpTransport {
    config: SessionConfig,
    outbound: SocketAddr,
    control_socket: UdpSocket,
    /// Present until the receiver thread takes ownership at connect.
    data_socket: Option<UdpSocket>,
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
    token_counter: u32,
    shut_down: bool,
}

impl UdpTransport {
    /// Bind both sockets. Fails only on local faults (ports in use,
    /// unresolvable addresses); an absent instrument is not an error.
    pub fn new(config: &SessionConfig) -> Result<Self, TransportError> {
        let outbound = config
            .outbound_addr()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("{} resolved to no addresses", config.outbound_addr()),
                )
            })?;

        let data_socket = UdpSocket::bind(config.inbound_addr())?;
        let control_socket = UdpSocket::bind((config.inbound_address.as_str(), 0))?;
        control_socket.connect(outbound)?;

        debug!(
            data = %data_socket.local_addr()?,
            control = %control_socket.local_addr()?,
            instrument = %outbound,
            "sockets bound"
        );

        let ring_capacity = config.ring_capacity_per_channel();
        Ok(Self {
            config: config.clone(),
            outbound,
            control_socket,
            data_socket: Some(data_socket),
            shared: Arc::new(Shared {
                store: Mutex::new(ChannelStore::new(ring_capacity)),
                link: LinkState::new(),
                instrument: Mutex::new(None),
            }),
            running: Arc::new(AtomicBool::new(false)),
            receiver: None,
            token_counter: 0,
            shut_down: false,
        })
    }

    /// Tokens correlate control replies; zero is reserved for the
    /// receiver's background hellos.
    fn fresh_token(&mut self) -> u32 {
        self.token_counter = self.token_counter.wrapping_add(1);
        if self.token_counter == 0 {
            self.token_counter = 1;
        }
        self.token_counter
    }

    fn spawn_receiver(&mut self) -> Result<(), TransportError> {
        let socket = self.data_socket.take().ok_or(TransportError::ShutDown)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        self.running.store(true, Ordering::SeqCst);

        let receiver = Receiver {
            socket,
            outbound: self.outbound,
            instance: self.config.instance,
            shared: Arc::clone(&self.shared),
            running: Arc::clone(&self.running),
            offline_after: self.config.offline_after(),
            hello_interval: self.config.hello_interval(),
        };
        let handle = thread::Builder::new()
            .name("spindle-receiver".to_string())
            .spawn(move || receiver.run())?;
        self.receiver = Some(handle);
        Ok(())
    }

    /// Send one control request and wait for the reply carrying our token,
    /// resending on silence. Stale replies from earlier timed-out requests
    /// are discarded by token.
    fn await_reply(&mut self, token: u32, bytes: &[u8]) -> Result<Reply, TransportError> {
        let attempts = self.config.control_retries.max(1);
        let timeout = self.config.control_timeout();
        let mut buf = [0u8; MAX_DATAGRAM];

        for attempt in 1..=attempts {
            if let Err(err) = self.control_socket.send(bytes) {
                if !soft_net_error(&err) {
                    return Err(err.into());
                }
                debug!(error = %err, token, "control send failed");
            }

            let deadline = Instant::now() + timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                self.control_socket.set_read_timeout(Some(remaining))?;
                let len = match self.control_socket.recv(&mut buf) {
                    Ok(len) => len,
                    Err(err) if soft_net_error(&err) => continue,
                    Err(err) => return Err(err.into()),
                };
                let datagram = match Datagram::decode(&buf[..len]) {
                    Ok(datagram) => datagram,
                    Err(err) => {
                        self.shared.link.note_decode_error();
                        debug!(error = %err, "undecodable control reply");
                        continue;
                    }
                };
                self.shared.link.mark_heard();
                self.shared.link.record_tick(datagram.tick);
                match datagram.frame {
                    Frame::ControlAck { token: t, accepted } if t == token => {
                        return Ok(Reply::Ack { accepted });
                    }
                    Frame::RecordingState {
                        token: t,
                        recording,
                        file_name,
                    } if t == token => {
                        return Ok(Reply::Recording {
                            recording,
                            file_name,
                        });
                    }
                    other => {
                        trace!(
                            opcode = ?other.opcode(),
                            stale = ?other.token(),
                            "discarding unmatched control reply"
                        );
                    }
                }
            }

            if attempt < attempts {
                let backoff = self.config.backoff_for_attempt(attempt);
                debug!(token, attempt, ?backoff, "control request unanswered");
                thread::sleep(backoff);
            }
        }

        Err(TransportError::ControlTimeout {
            timeout_ms: timeout.as_millis() as u64,
            attempts,
        })
    }

    fn header_tick(&self) -> Tick {
        self.shared.link.tick().unwrap_or_else(Tick::zero)
    }
}

impl Transport for UdpTransport {
    fn connect(&mut self) -> Result<Option<InstrumentInfo>, TransportError> {
        if self.shut_down {
            return Err(TransportError::ShutDown);
        }
        if self.receiver.is_some() {
            return Ok(self.instrument_info());
        }

        let token = self.fresh_token();
        let hello = Datagram::new(
            Tick::zero(),
            Frame::Hello {
                token,
                instance: self.config.instance,
            },
        )
        .encode()?;

        {
            let socket = self.data_socket.as_ref().ok_or(TransportError::ShutDown)?;
            // Source address of this datagram is where the instrument
            // will stream; it must be the data socket.
            if let Err(err) = socket.send_to(&hello, self.outbound) {
                if !soft_net_error(&err) {
                    return Err(err.into());
                }
                debug!(error = %err, "handshake hello send failed");
            }

            socket.set_read_timeout(Some(POLL_INTERVAL))?;
            let deadline = Instant::now() + self.config.handshake_timeout();
            let mut buf = [0u8; MAX_DATAGRAM];
            while Instant::now() < deadline {
                match socket.recv_from(&mut buf) {
                    Ok((len, _from)) => match Datagram::decode(&buf[..len]) {
                        // An instrument mid-stream may send chunks before
                        // the ack; absorb everything.
                        Ok(datagram) => self.shared.deliver(datagram),
                        Err(err) => {
                            self.shared.link.note_decode_error();
                            debug!(error = %err, "undecodable datagram during handshake");
                        }
                    },
                    Err(err) if soft_net_error(&err) => {}
                    Err(err) => return Err(err.into()),
                }
                if lock(&self.shared.instrument).is_some() {
                    break;
                }
            }
        }

        let answered = self.instrument_info();
        if answered.is_none() {
            info!(
                instrument = %self.outbound,
                timeout = ?self.config.handshake_timeout(),
                "instrument not answering, starting offline"
            );
        }
        self.spawn_receiver()?;
        Ok(answered)
    }

    fn online(&self) -> bool {
        !self.shut_down && self.shared.link.heard_within(self.config.offline_after())
    }

    fn device_tick(&self) -> Option<Tick> {
        self.shared.link.tick()
    }

    fn instrument_info(&self) -> Option<InstrumentInfo> {
        lock(&self.shared.instrument).clone()
    }

    fn query_available(&mut self) -> Result<ChannelAvailability, TransportError> {
        if self.shut_down {
            return Err(TransportError::ShutDown);
        }
        let tick = self.header_tick();
        if !self.online() {
            return Ok(ChannelAvailability {
                tick,
                channels: Vec::new(),
            });
        }
        let channels = lock(&self.shared.store).snapshot();
        Ok(ChannelAvailability { tick, channels })
    }

    fn read_samples(
        &mut self,
        channel: u16,
        count: usize,
        out: &mut Vec<i16>,
    ) -> Result<usize, TransportError> {
        if self.shut_down {
            return Err(TransportError::ShutDown);
        }
        Ok(lock(&self.shared.store).read(channel, count, out))
    }

    fn write_control(&mut self, request: ControlRequest) -> Result<ControlReply, TransportError> {
        if self.shut_down {
            return Err(TransportError::ShutDown);
        }
        let token = self.fresh_token();
        let frame = match request {
            ControlRequest::Comment {
                color,
                charset,
                text,
            } => Frame::Comment {
                token,
                color,
                charset,
                text,
            },
            ControlRequest::FileConfig {
                start,
                name,
                comment,
            } => Frame::FileConfig {
                token,
                start,
                name,
                comment,
            },
            ControlRequest::Patient(patient) => Frame::PatientInfo { token, patient },
            ControlRequest::ChannelMask { channel, enabled } => Frame::ChannelMask {
                token,
                channel,
                enabled,
            },
        };
        let fire_and_forget = matches!(frame, Frame::Comment { .. });
        let bytes = Datagram::new(self.header_tick(), frame).encode()?;

        if fire_and_forget {
            if let Err(err) = self.control_socket.send(&bytes) {
                if !soft_net_error(&err) {
                    return Err(err.into());
                }
                debug!(error = %err, "comment send failed");
            }
            trace!(token, "comment sent");
            return Ok(ControlReply::None);
        }

        match self.await_reply(token, &bytes)? {
            Reply::Ack { accepted } => Ok(ControlReply::Accepted(accepted)),
            Reply::Recording { .. } => {
                debug!(token, "recording state in reply to a control request");
                Ok(ControlReply::Accepted(false))
            }
        }
    }

    fn query_recording_state(&mut self) -> Result<RecordingStatus, TransportError> {
        if self.shut_down {
            return Err(TransportError::ShutDown);
        }
        let token = self.fresh_token();
        let bytes = Datagram::new(self.header_tick(), Frame::RecordingQuery { token }).encode()?;
        match self.await_reply(token, &bytes)? {
            Reply::Recording {
                recording,
                file_name,
            } => Ok(RecordingStatus {
                recording,
                file_name: if file_name.is_empty() {
                    None
                } else {
                    Some(file_name)
                },
            }),
            Reply::Ack { .. } => {
                debug!(token, "ack in reply to a recording query");
                Ok(RecordingStatus {
                    recording: false,
                    file_name: None,
                })
            }
        }
    }

    fn stats(&self) -> LinkStats {
        self.shared.link.snapshot()
    }

    fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.receiver.take() {
            if handle.join().is_err() {
                warn!("receiver thread panicked");
            }
        }
        debug!("transport shut down");
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
