//! modiflash CLI - Command-line tool for flashing MODI module firmware.
//!
//! ## Features
//!
//! - Update the application firmware of attached MODI modules
//! - Update network modules' own base firmware
//! - Concurrent updates across multiple network modules
//! - Port auto-detection with environment variable support

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use console::style;
use env_logger::Env;
use log::debug;
use modiflash::batch::{UpdateMode, run_batch};
use modiflash::firmware::FirmwareStore;
use modiflash::identity::FirmwareVersion;
use modiflash::port::{PortInfo, PortProvider, SerialProvider};
use modiflash::report::{NullReporter, Reporter};
use modiflash::update::UpdaterConfig;

mod progress;

use progress::BarReporter;

/// modiflash - A cross-platform tool for updating LUXROBO MODI firmware.
///
/// Environment variables:
///   MODIFLASH_PORT          - Serial port(s) to use (comma-separated)
///   MODIFLASH_FIRMWARE_DIR  - Directory holding the firmware binaries
#[derive(Parser)]
#[command(name = "modiflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use; repeat for multiple devices (auto-detected if
    /// not specified).
    #[arg(
        short,
        long = "port",
        global = true,
        env = "MODIFLASH_PORT",
        value_delimiter = ','
    )]
    ports: Vec<String>,

    /// Directory holding the firmware binaries and version files.
    #[arg(
        short,
        long,
        global = true,
        default_value = "firmware",
        env = "MODIFLASH_FIRMWARE_DIR"
    )]
    firmware_dir: PathBuf,

    /// Network firmware version from which the base update requires a
    /// physical replug instead of a port reopen.
    #[arg(long, global = true, default_value = "1.2.1", value_parser = parse_version)]
    hard_reconnect_from: FirmwareVersion,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress progress rendering).
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Update the application firmware of every module attached to the
    /// selected network module(s).
    Modules,

    /// Update the network module(s)' own base firmware.
    Network,

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,

        /// Include ports that do not look like MODI network modules.
        #[arg(long)]
        all: bool,
    },
}

fn parse_version(s: &str) -> Result<FirmwareVersion, String> {
    FirmwareVersion::parse(s).map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Modules => run_update(&cli, UpdateMode::Modules),
        Commands::Network => run_update(&cli, UpdateMode::NetworkBase),
        Commands::ListPorts { json, all } => list_ports(json, all),
    }
}

fn run_update(cli: &Cli, mode: UpdateMode) -> Result<()> {
    let provider = SerialProvider;
    let ports = resolve_ports(&provider, &cli.ports)?;

    if !cli.quiet {
        let what = match mode {
            UpdateMode::Modules => "module firmware",
            UpdateMode::NetworkBase => "network base firmware",
        };
        eprintln!(
            "{} Updating {what} on {} device(s)",
            style("==>").cyan().bold(),
            ports.len()
        );
    }

    let store = Arc::new(FirmwareStore::from_dir(&cli.firmware_dir));
    let config = UpdaterConfig {
        hard_reconnect_from: cli.hard_reconnect_from,
        ..UpdaterConfig::default()
    };

    let reporter: Arc<dyn Reporter> = if cli.quiet {
        Arc::new(NullReporter)
    } else {
        Arc::new(BarReporter::new())
    };

    let outcomes = run_batch(Arc::new(provider), &ports, mode, store, &config, reporter)
        .context("Batch update failed")?;

    let mut failures = 0;
    for outcome in &outcomes {
        if let Some(error) = &outcome.error {
            failures += 1;
            eprintln!("{} {}: {error}", style("✗").red().bold(), outcome.port);
        } else if !cli.quiet {
            eprintln!("{} {}: updated", style("✓").green().bold(), outcome.port);
        }
    }

    if failures > 0 {
        bail!("{failures} of {} device(s) failed to update", outcomes.len());
    }
    Ok(())
}

/// Turn explicit port names into port records, or auto-detect MODI ports.
fn resolve_ports(provider: &SerialProvider, requested: &[String]) -> Result<Vec<PortInfo>> {
    let known = provider.list_ports().context("Port enumeration failed")?;

    if requested.is_empty() {
        let detected: Vec<PortInfo> = known.into_iter().filter(PortInfo::is_likely_modi).collect();
        if detected.is_empty() {
            bail!("No MODI network module found; specify a port with --port");
        }
        debug!("auto-detected {} MODI port(s)", detected.len());
        return Ok(detected);
    }

    Ok(requested
        .iter()
        .map(|name| {
            known
                .iter()
                .find(|p| &p.name == name)
                .cloned()
                // Not enumerable (e.g. a pty); let the open attempt decide.
                .unwrap_or_else(|| PortInfo {
                    name: name.clone(),
                    vid: None,
                    pid: None,
                    manufacturer: None,
                    product: None,
                    serial_number: None,
                })
        })
        .collect())
}

fn list_ports(json: bool, all: bool) -> Result<()> {
    let provider = SerialProvider;
    let mut ports = provider.list_ports().context("Port enumeration failed")?;
    if !all {
        ports.retain(PortInfo::is_likely_modi);
    }

    if json {
        let entries: Vec<serde_json::Value> = ports
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial_number": p.serial_number,
                    "modi": p.is_likely_modi(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if ports.is_empty() {
        eprintln!("No matching serial ports found");
        return Ok(());
    }
    for port in &ports {
        let tag = if port.is_likely_modi() {
            style("MODI").green().to_string()
        } else {
            style("unknown").dim().to_string()
        };
        let product = port.product.as_deref().unwrap_or("-");
        println!("{:<20} {tag:<10} {product}", port.name);
    }
    Ok(())
}
