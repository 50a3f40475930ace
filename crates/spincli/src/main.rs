//! spincli - command line workbench for spindle sessions
//!
//! Subcommands:
//! - `spincli status` - Instrument identity and link state
//! - `spincli poll` - Stream sample batch summaries to the terminal
//! - `spincli record start|stop` - Drive file storage on the device
//! - `spincli comment <text>` - Drop an annotation into the session
//! - `spincli patient <id> <first> <last>` - Attach patient metadata
//! - `spincli channel on|off <n>` - Mask hardware channels
//!
//! Rejections from the instrument exit with code 1; transport faults and
//! bad arguments report as errors.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use spindle::SessionConfig;
use spindleproto::CommentCharset;

mod commands;

#[derive(Parser)]
#[command(name = "spincli")]
#[command(about = "Command line workbench for NSP sessions")]
#[command(version)]
struct Cli {
    /// Session config as TOML; built-in defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Instrument address as host:port, overriding the config
    #[arg(short, long, global = true)]
    device: Option<String>,

    /// Instrument instance to bind
    #[arg(long, global = true)]
    instance: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show instrument identity and link state
    Status {
        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Poll sample batches and print a line per batch
    Poll {
        /// Delay between polls in milliseconds
        #[arg(short, long, default_value = "100")]
        interval: u64,

        /// Number of polls; 0 runs until interrupted
        #[arg(short = 'n', long, default_value = "10")]
        count: u64,

        /// Emit machine-readable JSON, one object per batch
        #[arg(long)]
        json: bool,
    },

    /// Start or stop recording on the device
    Record {
        #[command(subcommand)]
        action: RecordAction,
    },

    /// Drop an annotation into the session
    Comment {
        /// Annotation text
        text: String,

        /// Display color as r,g,b
        #[arg(long, default_value = "255,255,255")]
        color: String,

        /// Text encoding tag stored with the event
        #[arg(long, value_enum, default_value_t = CharsetArg::Ansi)]
        charset: CharsetArg,
    },

    /// Attach patient metadata to the forthcoming recording
    Patient {
        /// Patient identifier
        id: String,
        first_name: String,
        last_name: String,

        /// Date of birth, month (1-12)
        #[arg(long)]
        dob_month: u8,

        /// Date of birth, day (1-31)
        #[arg(long)]
        dob_day: u8,

        /// Date of birth, year
        #[arg(long)]
        dob_year: u16,
    },

    /// Enable or disable a hardware channel
    Channel {
        #[command(subcommand)]
        action: ChannelAction,
    },
}

#[derive(Subcommand)]
enum RecordAction {
    /// Begin writing a storage file
    Start {
        /// File name on the instrument
        name: String,

        /// Comment stored in the file header
        #[arg(short = 'm', long, default_value = "")]
        comment: String,
    },

    /// Stop the active recording
    Stop,
}

#[derive(Subcommand)]
enum ChannelAction {
    /// Add a channel to the active set
    On { channel: u16 },
    /// Remove a channel from the active set
    Off { channel: u16 },
}

#[derive(Clone, Copy, ValueEnum)]
enum CharsetArg {
    Ansi,
    Utf16,
}

impl From<CharsetArg> for CommentCharset {
    fn from(arg: CharsetArg) -> Self {
        match arg {
            CharsetArg::Ansi => CommentCharset::Ansi,
            CharsetArg::Utf16 => CommentCharset::Utf16,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Status { json } => commands::status(config, json),
        Commands::Poll {
            interval,
            count,
            json,
        } => commands::poll(config, interval, count, json),
        Commands::Record { action } => match action {
            RecordAction::Start { name, comment } => {
                commands::record_start(config, &name, &comment)
            }
            RecordAction::Stop => commands::record_stop(config),
        },
        Commands::Comment {
            text,
            color,
            charset,
        } => commands::comment(config, &text, &color, charset.into()),
        Commands::Patient {
            id,
            first_name,
            last_name,
            dob_month,
            dob_day,
            dob_year,
        } => commands::patient(
            config,
            &id,
            &first_name,
            &last_name,
            dob_month,
            dob_day,
            dob_year,
        ),
        Commands::Channel { action } => match action {
            ChannelAction::On { channel } => commands::channel(config, channel, true),
            ChannelAction::Off { channel } => commands::channel(config, channel, false),
        },
    }
}

fn load_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::from_toml_file(path)?,
        None => SessionConfig::default(),
    };
    if let Some(instance) = cli.instance {
        config.instance = instance;
    }
    if let Some(device) = &cli.device {
        let (host, port) = device
            .rsplit_once(':')
            .with_context(|| format!("--device needs host:port, got {device}"))?;
        config.outbound_address = host.to_string();
        config.outbound_port = port
            .parse()
            .with_context(|| format!("invalid port in --device: {port}"))?;
    }
    Ok(config)
}
