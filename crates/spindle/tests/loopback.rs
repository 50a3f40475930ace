//! End-to-end exchange over real loopback sockets
//!
//! A spindlesim server on an ephemeral port, a session pointed at it, and
//! the full SPNDL1 protocol in between. Waits are bounded by a generous
//! deadline so a loaded machine stays green.

use std::thread;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use spindle::{CommentCharset, Session, SessionConfig, SessionError};
use spindleproto::Tick;
use spindlesim::{Instrument, Server, ServerConfig, MODEL};

const DEADLINE: Duration = Duration::from_secs(5);

fn sim_config() -> ServerConfig {
    ServerConfig {
        listen_port: 0,
        heartbeat_interval: Duration::from_millis(25),
        ..ServerConfig::default()
    }
}

fn client_config(server: &Server) -> SessionConfig {
    SessionConfig::new(0)
        .with_inbound("127.0.0.1", 0)
        .with_outbound("127.0.0.1", server.local_addr().port())
        .with_handshake_timeout(Duration::from_millis(2000))
}

fn wait_for<T>(mut probe: impl FnMut() -> Option<T>, what: &str) -> T {
    let deadline = Instant::now() + DEADLINE;
    loop {
        if let Some(value) = probe() {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn handshake_and_identity() {
    let mut server = Server::start(sim_config()).unwrap();
    let mut session = Session::connect(client_config(&server)).unwrap();

    let info = wait_for(|| session.instrument().cloned(), "handshake");
    assert_eq!(info.model, MODEL);
    assert_eq!(info.serial, 0xC0FFEE);
    assert_eq!(info.channel_capacity, 272);
    assert!(session.is_online());

    session.release();
    assert!(!session.is_online());
    server.stop();
}

#[test]
fn poll_consumes_the_scripted_scenario() {
    let mut nsp = Instrument::new(7).with_enabled(&[1, 2, 3]);
    nsp.set_clock(Tick(1000));
    let ten: Vec<i16> = (0..10).collect();
    nsp.push_samples(1, &ten);
    nsp.push_samples(3, &[100, 101, 102, 103, 104]);

    let config = ServerConfig {
        freeze_clock: true,
        ..sim_config()
    };
    let mut server = Server::start_with(config, nsp).unwrap();
    let mut session = Session::connect(client_config(&server)).unwrap();

    // wait until the stream has delivered everything the device had
    wait_for(
        || {
            let directory = session.prefetch().ok()?;
            (directory.channel_count() == 3 && directory.total_samples() == 15).then_some(())
        },
        "the scripted samples",
    );

    let batch = session.transfer().unwrap();
    assert_eq!(batch.timestamp(), Tick(1000));
    assert!((batch.timestamp().as_secs_f64() - 1000.0 / 30_000.0).abs() < 1e-12);
    assert_eq!(batch.channel_count(), 3);

    assert_eq!(batch.channel_number(0).unwrap(), 1);
    assert_eq!(batch.data(0).unwrap().as_i16().unwrap(), &ten[..]);
    assert_eq!(batch.channel_number(1).unwrap(), 2);
    assert!(batch.data(1).unwrap().is_empty());
    assert_eq!(batch.channel_number(2).unwrap(), 3);
    assert_eq!(
        batch.data(2).unwrap().as_i16().unwrap(),
        &[100, 101, 102, 103, 104]
    );
    assert!(matches!(
        batch.data(3),
        Err(SessionError::ChannelIndexOutOfRange { .. })
    ));

    // consumed samples never come back
    let again = session.fetch().unwrap();
    assert!(again.iter().all(|(_, samples)| samples.is_empty()));

    session.release();
    server.stop();
}

#[test]
fn recording_control_and_manifest() {
    let record_dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        record_dir: Some(record_dir.path().to_path_buf()),
        ..sim_config()
    };
    let mut server = Server::start(config).unwrap();
    let mut session = Session::connect(client_config(&server)).unwrap();

    assert!(session
        .set_patient_info("p-1", "Grace", "Hopper", 12, 9, 1906)
        .unwrap());
    assert!(session
        .set_file_storage("loop-1", "loopback run", true)
        .unwrap());
    assert!(session.is_recording().unwrap());
    assert_eq!(
        session.recording_state().unwrap().file_name.as_deref(),
        Some("loop-1")
    );

    // names that would escape the recording directory are refused upstream
    assert!(!session.set_file_storage("../evil", "", true).unwrap());

    session
        .set_comment("marker", 1, 2, 3, CommentCharset::Ansi)
        .unwrap();

    assert!(session.set_file_storage("", "", false).unwrap());
    assert!(!session.is_recording().unwrap());

    // the stop ack arrives after the manifest hits disk
    let manifest =
        std::fs::read_to_string(record_dir.path().join("loop-1.json")).unwrap();
    assert!(manifest.contains("\"loop-1\""));
    assert!(manifest.contains("\"p-1\""));
    assert!(manifest.contains("\"marker\""));
    assert!(manifest.contains("\"stopped_at\""));

    session.release();
    server.stop();
}

#[test]
fn silent_peer_yields_offline_session() {
    // a bound socket that never answers
    let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = peer.local_addr().unwrap().port();

    let config = SessionConfig::new(0)
        .with_inbound("127.0.0.1", 0)
        .with_outbound("127.0.0.1", port)
        .with_handshake_timeout(Duration::from_millis(100))
        .with_control_timeout(Duration::from_millis(50))
        .with_control_retries(1);
    let mut session = Session::connect(config).unwrap();

    assert!(!session.is_online());
    assert!(session.instrument().is_none());

    let batch = session.fetch().unwrap();
    assert!(batch.is_empty());

    // control degrades instead of erroring: comments vanish, acked
    // requests report a rejection
    session
        .set_comment("nobody home", 0, 0, 0, CommentCharset::Ansi)
        .unwrap();
    assert!(!session.set_file_storage("ghost", "", true).unwrap());
    assert!(!session.is_recording().unwrap());

    session.release();
    assert!(matches!(session.fetch(), Err(SessionError::Disposed)));
}
