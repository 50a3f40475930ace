//! Session-driving command handlers
//!
//! Every handler opens one session, performs its operation, and prints
//! either colored human output or JSON. Instrument rejections print to
//! stderr and exit with code 1 so scripts can branch on them.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use owo_colors::OwoColorize;
use serde_json::json;
use spindle::{Session, SessionConfig};
use spindleproto::CommentCharset;

/// How long `status` and `poll` wait for the first heartbeat before
/// treating the instrument as offline.
const LINK_WAIT: Duration = Duration::from_millis(1500);

fn wait_online(session: &mut Session, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if session.is_online() {
            return true;
        }
        thread::sleep(Duration::from_millis(25));
    }
    session.is_online()
}

fn rejected(what: &str) -> ! {
    eprintln!("{} {what}", "rejected:".red().bold());
    std::process::exit(1);
}

pub fn status(config: SessionConfig, json: bool) -> Result<()> {
    let outbound = config.outbound_addr();
    let mut session = Session::connect(config)?;
    let online = wait_online(&mut session, LINK_WAIT);
    let directory = session.prefetch()?;
    let recording = session.recording_state()?;
    let info = session.instrument().cloned();
    let tick = session.device_time();

    if json {
        let payload = json!({
            "device": outbound,
            "online": online,
            "instrument": info.as_ref().map(|i| json!({
                "model": i.model,
                "serial": i.serial,
                "revision": i.revision,
                "channel_capacity": i.channel_capacity,
            })),
            "device_tick": tick.map(|t| t.0),
            "active_channels": directory.channel_count(),
            "recording": recording.recording,
            "file_name": recording.file_name,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!("device       {outbound}");
    if online {
        println!("link         {}", "online".green());
    } else {
        println!("link         {}", "offline".red());
    }
    if let Some(info) = info {
        println!(
            "instrument   {} (serial {}, rev {})",
            info.model.bold(),
            info.serial,
            info.revision
        );
    }
    if let Some(tick) = tick {
        println!(
            "device time  {} ticks ({:.3} s)",
            tick.0,
            tick.as_secs_f64()
        );
    }
    println!("channels     {} active", directory.channel_count());
    match (recording.recording, recording.file_name) {
        (true, Some(name)) => println!("recording    {} -> {name}", "rolling".red()),
        (true, None) => println!("recording    {}", "rolling".red()),
        (false, _) => println!("recording    idle"),
    }
    Ok(())
}

pub fn poll(config: SessionConfig, interval_ms: u64, count: u64, json: bool) -> Result<()> {
    let mut session = Session::connect(config)?;
    wait_online(&mut session, LINK_WAIT);

    let interval = Duration::from_millis(interval_ms);
    let mut polled: u64 = 0;
    while count == 0 || polled < count {
        thread::sleep(interval);
        let batch = session.fetch()?;
        polled += 1;

        if json {
            let channels: Vec<_> = batch
                .iter()
                .map(|(channel, samples)| json!({ "channel": channel, "samples": samples.len() }))
                .collect();
            println!(
                "{}",
                json!({ "tick": batch.timestamp().0, "channels": channels })
            );
        } else {
            let total: usize = batch.iter().map(|(_, samples)| samples.len()).sum();
            println!(
                "tick {:>10}  {:>3} ch  {:>6} samples",
                batch.timestamp().0,
                batch.channel_count(),
                total
            );
        }
    }
    Ok(())
}

pub fn record_start(config: SessionConfig, name: &str, comment: &str) -> Result<()> {
    let mut session = Session::connect(config)?;
    if !session.set_file_storage(name, comment, true)? {
        rejected("the instrument refused to start recording");
    }
    println!("{} {}", "recording".green(), name.bold());
    Ok(())
}

pub fn record_stop(config: SessionConfig) -> Result<()> {
    let mut session = Session::connect(config)?;
    if !session.set_file_storage("", "", false)? {
        rejected("the instrument refused to stop (nothing rolling?)");
    }
    println!("{}", "recording stopped".green());
    Ok(())
}

pub fn comment(
    config: SessionConfig,
    text: &str,
    color: &str,
    charset: CommentCharset,
) -> Result<()> {
    let (red, green, blue) = parse_color(color)?;
    let mut session = Session::connect(config)?;
    session.set_comment(text, red, green, blue, charset)?;
    println!("{} {text}", "comment".cyan());
    Ok(())
}

pub fn patient(
    config: SessionConfig,
    id: &str,
    first_name: &str,
    last_name: &str,
    dob_month: u8,
    dob_day: u8,
    dob_year: u16,
) -> Result<()> {
    let mut session = Session::connect(config)?;
    if !session.set_patient_info(id, first_name, last_name, dob_month, dob_day, dob_year)? {
        rejected("the instrument refused the patient record (already recording?)");
    }
    println!("{} {id} ({first_name} {last_name})", "patient set".green());
    Ok(())
}

pub fn channel(config: SessionConfig, channel: u16, enabled: bool) -> Result<()> {
    let mut session = Session::connect(config)?;
    if !session.set_channel_enabled(channel, enabled)? {
        rejected("the instrument refused the channel mask");
    }
    if enabled {
        println!("channel {channel} {}", "on".green());
    } else {
        println!("channel {channel} {}", "off".yellow());
    }
    Ok(())
}

fn parse_color(color: &str) -> Result<(u8, u8, u8)> {
    let parts: Vec<&str> = color.split(',').collect();
    if parts.len() != 3 {
        bail!("color must be r,g,b with each part 0-255, got {color}");
    }
    let part = |raw: &str| -> Result<u8> {
        raw.trim()
            .parse()
            .with_context(|| format!("invalid color component {raw}"))
    };
    Ok((part(parts[0])?, part(parts[1])?, part(parts[2])?))
}
