// exdevice — desktop CLI for BLE medical peripherals
//
// Cross-platform (macOS, Linux, Windows) front-end over exdevice-core: list
// supported devices, scan, run single commands and watch device telemetry.

mod ble;
mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use exdevice_core::{
    BloodPressureReading, Command, DeviceKind, DeviceRegistry, EngineEvent, Frame, GlucoseReading,
    TaskOutcome,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "exdevice")]
#[command(about = "Talk to BLE glucose meters and blood pressure monitors", long_about = None)]
#[command(version)]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List supported devices
    Devices,
    /// Scan for nearby supported devices
    Scan {
        /// Seconds to listen (defaults to the configured scan timeout)
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Connect, send one command and print the response
    Send {
        address: String,
        /// Opcode in hex, e.g. 0x03
        opcode: String,
        /// Payload bytes in hex, e.g. 0a00
        payload: Option<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Connect and print everything the device pushes
    Monitor {
        address: String,
        #[arg(short, long, default_value = "60")]
        seconds: u64,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Path,
    Reset,
    Set { key: String, value: String },
    Get { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Devices => cmd_devices(),
        Commands::Scan { timeout } => cmd_scan(timeout).await,
        Commands::Send {
            address,
            opcode,
            payload,
            timeout_ms,
        } => cmd_send(address, opcode, payload, timeout_ms).await,
        Commands::Monitor { address, seconds } => cmd_monitor(address, seconds).await,
        Commands::Config { action } => cmd_config(action),
    }
}

fn cmd_devices() -> Result<()> {
    println!("{}", "Supported devices".bold());
    println!();
    for kind in DeviceKind::ALL {
        let codec = kind.codec();
        println!("  {} {}", "•".bright_green(), kind.description().bright_cyan());
        println!("    BLE name: {}", kind.ble_name());
        println!("    Model:    {}", kind.model());
        println!("    Tunnels:  {}", codec.tunnels().to_string().dimmed());
    }
    Ok(())
}

async fn cmd_scan(timeout: Option<u64>) -> Result<()> {
    let config = config::Config::load()?;
    let duration = Duration::from_secs(timeout.unwrap_or(config.scan_timeout_secs));
    let adapter = ble::default_adapter().await?;

    println!("Scanning for {}s...", duration.as_secs());
    let found = ble::scan(&adapter, duration).await?;

    if found.is_empty() {
        println!("{}", "No supported devices found.".dimmed());
        return Ok(());
    }
    println!("{} ({} found)", "Devices".bold(), found.len());
    println!();
    for device in found {
        let rssi = device
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} {}  {}  {}",
            "•".bright_green(),
            device.address.bright_cyan(),
            device.kind,
            rssi.dimmed()
        );
    }
    Ok(())
}

async fn cmd_send(
    address: String,
    opcode: String,
    payload: Option<String>,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let opcode = parse_opcode(&opcode)?;
    let payload = match payload {
        Some(hex_payload) => hex::decode(hex_payload.trim()).context("Payload is not valid hex")?,
        None => Vec::new(),
    };
    let config = config::Config::load()?;
    let timeout = timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.engine.response_timeout());

    let adapter = ble::default_adapter().await?;
    let (link, found) = ble::connect(&adapter, &address, Duration::from_secs(config.scan_timeout_secs)).await?;
    let link = Arc::new(link);

    let registry = DeviceRegistry::new(config.engine.clone());
    let session = registry
        .on_connected_named(&found.address, &found.name, link.clone())
        .await
        .context("Failed to open device session")?;

    let command = Command::new(opcode, payload);
    println!("{} {} → {}", "Sending".bold(), command, found.kind);
    let outcome = session.submit_with_timeout(command, timeout).await;

    match &outcome {
        TaskOutcome::Completed(frame) => {
            println!("{} {}", "✓".green(), frame);
            print_reading(frame);
        }
        other => println!("{} {:?}", "✗".red(), other),
    }

    registry.disconnect_all().await;
    link.disconnect().await;

    if !outcome.is_completed() {
        anyhow::bail!("Command did not complete");
    }
    Ok(())
}

async fn cmd_monitor(address: String, seconds: u64) -> Result<()> {
    let config = config::Config::load()?;
    let adapter = ble::default_adapter().await?;
    let (link, found) = ble::connect(&adapter, &address, Duration::from_secs(config.scan_timeout_secs)).await?;
    let link = Arc::new(link);

    let registry = DeviceRegistry::new(config.engine.clone());
    let session = registry
        .on_connected_named(&found.address, &found.name, link.clone())
        .await
        .context("Failed to open device session")?;
    let mut events = session.subscribe_unsolicited();

    println!(
        "{} {} ({}) for {}s, Ctrl-C to stop",
        "Monitoring".bold(),
        found.kind.description().bright_cyan(),
        found.address,
        seconds
    );

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(EngineEvent::Unsolicited(frame)) => {
                    println!("  {} {}", "•".bright_green(), frame);
                    print_reading(&frame);
                }
                Ok(EngineEvent::DecodeError(e)) => println!("  {} {}", "!".yellow(), e),
                Ok(EngineEvent::Desynchronized { buffered, limit }) => {
                    println!("  {} stream desynchronised ({} of {} bytes)", "✗".red(), buffered, limit);
                    break;
                }
                Err(RecvError::Lagged(missed)) => {
                    println!("  {} {} events dropped", "!".yellow(), missed);
                }
                Err(RecvError::Closed) => break,
            },
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    registry.disconnect_all().await;
    link.disconnect().await;
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = config::Config::load()?;
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<22} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }

        ConfigAction::Reset => {
            config::Config::default().save()?;
            println!("{} Configuration reset to defaults", "✓".green());
        }

        ConfigAction::Set { key, value } => {
            let mut config = config::Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            let config = config::Config::load()?;
            match config.get(&key) {
                Some(value) => println!("{} = {}", key.bright_cyan(), value),
                None => anyhow::bail!("Unknown config key: {}", key),
            }
        }
    }
    Ok(())
}

fn print_reading(frame: &Frame) {
    if let Some(reading) = GlucoseReading::from_frame(frame) {
        println!(
            "    glucose {} mg/dL ({:.1} mmol/L) at {:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            reading.mg_dl,
            reading.mmol_per_l(),
            reading.year,
            reading.month,
            reading.day,
            reading.hour,
            reading.minute,
            reading.second
        );
    } else if let Some(reading) = BloodPressureReading::from_frame(frame) {
        println!(
            "    blood pressure {}/{} mmHg, pulse {} bpm",
            reading.systolic, reading.diastolic, reading.pulse
        );
    } else if let Some(pressure) = BloodPressureReading::live_pressure(frame) {
        println!("    cuff {} mmHg", pressure);
    }
}

fn parse_opcode(text: &str) -> Result<u8> {
    let digits = text.trim().trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16).with_context(|| format!("Invalid opcode: {}", text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_opcode() {
        assert_eq!(parse_opcode("0x03").unwrap(), 0x03);
        assert_eq!(parse_opcode("7f").unwrap(), 0x7f);
        assert!(parse_opcode("0x100").is_err());
        assert!(parse_opcode("zz").is_err());
    }

    #[test]
    fn test_cli_parses_send() {
        let cli = Cli::try_parse_from(["exdevice", "send", "AA:BB", "0x04", "0100", "--timeout-ms", "250"])
            .unwrap();
        match cli.command {
            Commands::Send {
                address,
                opcode,
                payload,
                timeout_ms,
            } => {
                assert_eq!(address, "AA:BB");
                assert_eq!(opcode, "0x04");
                assert_eq!(payload.as_deref(), Some("0100"));
                assert_eq!(timeout_ms, Some(250));
            }
            _ => panic!("expected send"),
        }
    }
}
