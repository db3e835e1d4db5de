use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use mculink_core::checksum::{Checksum, ExternalChecksum, decode_hex, encode_hex};
use mculink_core::config::{ChecksumAlgorithm, SessionConfig};
use mculink_core::events::{ChannelObserver, Direction, LinkEvent, Observer, TracingObserver};
use mculink_core::session::LinkSession;
use mculink_core::transport::{SerialSettings, TcpSettings, TransportSettings, UdpSettings};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Talk to microcontroller firmware over serial, TCP or UDP", long_about = None)]
struct Args {
    /// Session configuration (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Serial port, overrides the configured transport
    #[arg(long, global = true, conflicts_with_all = ["tcp", "udp"])]
    serial: Option<String>,

    /// Serial baud rate
    #[arg(long, global = true, default_value_t = 115_200)]
    baud: u32,

    /// TCP endpoint as host:port
    #[arg(long, global = true, conflicts_with = "udp")]
    tcp: Option<String>,

    /// UDP remote endpoint as host:port
    #[arg(long, global = true)]
    udp: Option<String>,

    /// Local UDP port to receive on
    #[arg(long, global = true, default_value_t = 0)]
    udp_local: u16,

    /// Checksum algorithm, overrides the configuration
    #[arg(long, global = true, value_parser = parse_algorithm)]
    checksum: Option<ChecksumAlgorithm>,

    /// Seconds to wait for the link to come up
    #[arg(long, global = true, default_value_t = 5)]
    connect_timeout: u64,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a single frame
    Send {
        #[arg(value_parser = parse_key)]
        major: u8,
        #[arg(value_parser = parse_key)]
        minor: u8,
        /// Payload as hex, e.g. 01ff
        payload: Option<String>,
    },
    /// Send a file as a chunked transfer
    SendFile {
        #[arg(value_parser = parse_key)]
        major: u8,
        path: PathBuf,
    },
    /// Print incoming frames and transfers until interrupted
    Listen {
        /// Save completed transfers as MAJOR:PATH (repeatable)
        #[arg(long = "save", value_parser = parse_save)]
        save: Vec<(u8, PathBuf)>,
    },
    /// Compute a checksum locally
    Checksum {
        /// crc8, crc16 or a path to an external helper
        algorithm: String,
        /// Data as hex
        data: String,
        /// Start value
        #[arg(long, default_value_t = 0)]
        seed: u32,
    },
}

fn parse_key(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse::<u8>(),
    };
    parsed.map_err(|e| format!("invalid key {:?}: {}", s, e))
}

fn parse_save(s: &str) -> Result<(u8, PathBuf), String> {
    let (key, path) = s
        .split_once(':')
        .ok_or_else(|| format!("expected MAJOR:PATH, got {:?}", s))?;
    Ok((parse_key(key)?, PathBuf::from(path)))
}

fn parse_algorithm(s: &str) -> Result<ChecksumAlgorithm, String> {
    match s {
        "crc8" => Ok(ChecksumAlgorithm::Crc8),
        "crc16" => Ok(ChecksumAlgorithm::Crc16),
        "external" => Ok(ChecksumAlgorithm::External),
        other => Err(format!("unknown checksum {:?}", other)),
    }
}

fn split_endpoint(s: &str) -> Result<(String, u16)> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("expected host:port, got {:?}", s))?;
    let port = port
        .parse()
        .with_context(|| format!("invalid port in {:?}", s))?;
    Ok((host.to_string(), port))
}

fn session_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => SessionConfig::default(),
    };

    if let Some(port) = &args.serial {
        config.transport = TransportSettings::Serial(SerialSettings {
            port: port.clone(),
            baud_rate: args.baud,
            ..Default::default()
        });
    } else if let Some(endpoint) = &args.tcp {
        let (host, port) = split_endpoint(endpoint)?;
        config.transport = TransportSettings::Tcp(TcpSettings::new(host, port));
    } else if let Some(endpoint) = &args.udp {
        let (remote_host, remote_port) = split_endpoint(endpoint)?;
        config.transport = TransportSettings::Udp(UdpSettings {
            remote_host,
            remote_port,
            local_port: args.udp_local,
            client_port: 0,
        });
    } else if args.config.is_none() {
        bail!("No transport given: use --config, --serial, --tcp or --udp");
    }

    if let Some(algorithm) = args.checksum {
        config.checksum.algorithm = algorithm;
    }
    Ok(config)
}

/// Forwards events to both the log and the console printer.
struct Tee {
    log: TracingObserver,
    console: ChannelObserver,
}

impl Observer for Tee {
    fn on_event(&self, event: &LinkEvent) {
        self.log.on_event(event);
        self.console.on_event(event);
    }
}

async fn open_session(args: &Args) -> Result<(LinkSession, UnboundedReceiver<LinkEvent>)> {
    let config = session_config(args)?;
    let (console, events) = ChannelObserver::new();
    let observer = Arc::new(Tee {
        log: TracingObserver,
        console,
    });
    let session = LinkSession::with_observer(&config, observer)?;
    session
        .connect(Duration::from_secs(args.connect_timeout))
        .await?;
    info!(link = %session.transport().name(), "Link up");
    Ok((session, events))
}

fn print_event(event: &LinkEvent) {
    match event {
        LinkEvent::Received {
            major,
            minor,
            payload,
        } => println!("{:02X} {:02X} [{}] {}", major, minor, payload.len(), encode_hex(payload)),
        LinkEvent::Progress {
            direction,
            major,
            percent,
            label,
        } => eprint!("\r{} {:02X} {:>3}% {:<16}", direction, major, percent, label),
        LinkEvent::TransferComplete {
            direction,
            major,
            length,
            digest,
        } => {
            let digest = digest.as_deref().map(encode_hex).unwrap_or_else(|| "-".into());
            eprintln!();
            println!("{} {:02X} complete: {} bytes, digest {}", direction, major, length, digest);
        }
        LinkEvent::TransferFailed {
            direction,
            major,
            reason,
        } => {
            eprintln!();
            println!("{} {:02X} failed: {}", direction, major, reason);
        }
        _ => {}
    }
}

async fn run(args: Args) -> Result<()> {
    match &args.command {
        Command::Checksum {
            algorithm,
            data,
            seed,
        } => {
            let checksum = match algorithm.as_str() {
                "crc8" => Checksum::Crc8,
                "crc16" => Checksum::Crc16,
                path => Checksum::External(ExternalChecksum::new(path)?),
            };
            let data = decode_hex(data).ok_or_else(|| anyhow!("data is not valid hex"))?;
            let value = checksum.compute(&data, &checksum.seed_bytes(*seed))?;
            println!("{}", encode_hex(&value));
        }
        Command::Send {
            major,
            minor,
            payload,
        } => {
            let payload = match payload {
                Some(hex) => decode_hex(hex).ok_or_else(|| anyhow!("payload is not valid hex"))?,
                None => Vec::new(),
            };
            let (session, _events) = open_session(&args).await?;
            session.send(*major, *minor, &payload)?;
            info!(major, minor, len = payload.len(), "Frame sent");
        }
        Command::SendFile { major, path } => {
            let (session, mut events) = open_session(&args).await?;
            let printer = tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if matches!(
                        event,
                        LinkEvent::Progress {
                            direction: Direction::Send,
                            ..
                        } | LinkEvent::TransferComplete { .. }
                            | LinkEvent::TransferFailed { .. }
                    ) {
                        print_event(&event);
                    }
                }
            });
            let result = session.send_file(*major, path).await;
            drop(session);
            let _ = tokio::time::timeout(Duration::from_millis(200), printer).await;
            result?;
        }
        Command::Listen { save } => {
            let (session, mut events) = open_session(&args).await?;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        print_event(&event);
                        if let LinkEvent::TransferComplete { direction: Direction::Receive, major, .. } = event
                            && let Some((_, path)) = save.iter().find(|(key, _)| *key == major)
                        {
                            let written = session.save_received(major, path)?;
                            info!(major, bytes = written, path = %path.display(), "Transfer saved");
                        }
                    }
                }
            }
            session.close();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args).await {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
