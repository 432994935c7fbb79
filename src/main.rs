//! Device cloud-sync engine - Main Entry Point
//!
//! `run` drives the device against the in-process simulated network; the
//! other subcommands are offline helpers for configuration and serial frames.

use clap::{Parser, Subcommand};
use cloudsync::device::DeviceEvent;
use cloudsync::frame::{encode_frame, FrameDecoder};
use cloudsync::error::{redact_secrets, sanitize_error_message};
use cloudsync::observability::{init_default_logging, DebugLevel, LogLevelHandle};
use cloudsync::telemetry::{DeviceAction, SensorReading};
use cloudsync::testing::MockTransport;
use cloudsync::{CloudSync, SyncConfig};
use std::env;
use std::path::PathBuf;
use std::process;
use tokio::{signal, time};
use tracing::{error, info, warn};

/// Device cloud-sync engine
#[derive(Parser)]
#[command(name = "cloudsync")]
#[command(about = "Keeps a device connected to its cloud hub and its twin in sync")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging, repeat to raise the debug level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the device against the simulated network
    Run {
        /// Stop after this many ticks
        #[arg(long)]
        ticks: Option<u64>,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Decode hex-encoded serial bytes into frames
    Decode {
        /// Bytes as a hex string, e.g. 5401000431323334
        hex: String,
    },
    /// Encode a frame and print it as hex
    Encode {
        /// Command character, `T` for a telemetry push
        command: char,
        index: u8,
        payload: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging from LOG_LEVEL, LOG_FORMAT and LOG_SPANS
    let log_handle = match init_default_logging() {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };
    if let Some(handle) = &log_handle {
        if cli.verbose > 0 {
            let level = handle.current().unwrap_or(DebugLevel::Info).raised(cli.verbose);
            if let Err(e) = handle.set(level) {
                eprintln!("Failed to raise log level: {e}");
            }
        }
    }
    let env_level = env::var("LOG_LEVEL")
        .ok()
        .and_then(|value| DebugLevel::parse(&value));

    let result = match cli.command {
        Commands::Run { ticks } => match load_configuration(&cli.config) {
            Ok(config) => {
                // The configured level applies unless the environment or -v chose one
                if env_level.is_none() && cli.verbose == 0 {
                    if let (Some(handle), Some(level)) =
                        (&log_handle, DebugLevel::from_u8(config.device.debug_level))
                    {
                        if let Err(e) = handle.set(level) {
                            warn!("Failed to apply configured log level: {}", e);
                        }
                    }
                }
                run_device(config, ticks, log_handle).await
            }
            Err(e) => Err(e),
        },
        Commands::Config { show } => {
            load_configuration(&cli.config).and_then(|config| handle_config_command(&config, show))
        }
        Commands::Decode { hex } => decode_frames(&hex),
        Commands::Encode {
            command,
            index,
            payload,
        } => encode(command, index, &payload),
    };

    if let Err(e) = result {
        error!("Command failed: {}", sanitize_error_message(&e.to_string()));
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<SyncConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(SyncConfig::load_from_file(path)?)
        }
        None => {
            for path_str in ["cloudsync.toml", "config/cloudsync.toml"] {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(SyncConfig::load_from_file(&path)?);
                }
            }

            warn!("No configuration file found, using built-in defaults");
            let config = SyncConfig::default_for("cloudsync-sim");
            config.validate()?;
            Ok(config)
        }
    }
}

async fn run_device(
    config: SyncConfig,
    max_ticks: Option<u64>,
    log_handle: Option<LogLevelHandle>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Starting cloudsync v{} as device {}",
        env!("CARGO_PKG_VERSION"),
        config.device.id
    );

    let mut sync = CloudSync::new(MockTransport::simulated(), &config)?;
    if let Some(handle) = log_handle {
        sync = sync.with_log_handle(handle);
    }

    let mut interval = time::interval(config.timing.tick());
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    let mut ticks: u64 = 0;
    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
            _ = interval.tick() => {
                ticks += 1;
                sync.set_sensor_reading(simulated_reading(ticks));
                for event in sync.tick() {
                    handle_device_event(&mut sync, event);
                }
                if max_ticks.is_some_and(|max| ticks >= max) {
                    info!(ticks, "Tick limit reached");
                    break;
                }
            }
        }
    }

    let status = sync.status();
    info!(
        session = ?status.engine.session,
        flags = ?status.engine.flags,
        twin_version = ?status.twin_version,
        frames = status.decoder.frames,
        last_error = ?status.engine.last_error,
        "Final device status"
    );
    Ok(())
}

fn handle_device_event(sync: &mut CloudSync<MockTransport>, event: DeviceEvent) {
    match event {
        DeviceEvent::Connected => info!("Connected to cloud"),
        DeviceEvent::Disconnected => warn!("Disconnected from cloud"),
        DeviceEvent::Provisioned {
            hub_host,
            device_id,
        } => info!("Provisioned as {} on {}", device_id, hub_host),
        DeviceEvent::CloudMessage(payload) => {
            info!("Cloud message: {}", String::from_utf8_lossy(&payload))
        }
        DeviceEvent::Action(DeviceAction::Message(text)) => info!("Message from cloud: {}", text),
        DeviceEvent::Action(DeviceAction::Reboot { delay }) => {
            // The simulated device restarts by reconnecting
            warn!("Reboot requested in {:?}", delay);
            sync.reconnect();
        }
    }
}

/// Slowly varying readings so the telemetry stream is not constant
fn simulated_reading(tick: u64) -> SensorReading {
    let phase = (tick % 40) as i32;
    SensorReading {
        temperature: 20 + (phase - 20).abs() / 4,
        light: 300 + phase * 5,
    }
}

fn handle_config_command(
    config: &SyncConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    info!("Configuration is valid");

    if show {
        println!("{}", redact_secrets(&toml::to_string_pretty(config)?));
    }
    Ok(())
}

fn decode_frames(input: &str) -> Result<(), Box<dyn std::error::Error>> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(cleaned)?;

    let mut decoder = FrameDecoder::new();
    for byte in bytes {
        if let Some(frame) = decoder.feed(byte) {
            let payload = match frame.payload_str() {
                Ok(text) => text.to_string(),
                Err(_) => hex::encode(frame.payload),
            };
            println!(
                "{} index={} length={} payload={}",
                char::from(frame.command),
                frame.index,
                frame.length,
                payload
            );
        }
    }

    let stats = decoder.stats();
    if decoder.cursor() != 0 {
        warn!(bytes = decoder.cursor(), "Input ends inside a frame");
    }
    info!(
        frames = stats.frames,
        unrecognized = stats.unrecognized,
        overflows = stats.overflows,
        "Decoding finished"
    );
    Ok(())
}

fn encode(command: char, index: u8, payload: &str) -> Result<(), Box<dyn std::error::Error>> {
    let command = u8::try_from(command).map_err(|_| format!("command '{command}' is not a single byte"))?;
    let frame = encode_frame(command, index, payload.as_bytes())?;
    println!("{}", hex::encode(frame));
    Ok(())
}
