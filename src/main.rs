use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;

use passthru_session::config::HostConfig;
use passthru_session::error::{ErrorKind, PassThruError, Result};
use passthru_session::j2534::device::{self, DeviceDescriptor, VersionInfo};
use passthru_session::j2534::dll::SystemBackend;
use passthru_session::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "ptprobe", version, about = "Probe J2534 PassThru adapters")]
struct Cli {
    /// Host config JSON (manifest dir, registry key, poll interval)
    #[arg(long, value_name = "PATH", env = "PTPROBE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List installed adapters
    List,
    /// Open an adapter, print its versions and battery voltage, close it
    Info {
        /// Device name or path to a manifest
        target: String,
    },
    /// Poll battery voltage
    Watch {
        /// Device name or path to a manifest
        target: String,
        #[arg(long, default_value_t = 10)]
        samples: u32,
        /// Defaults to the configured poll interval
        #[arg(long, value_name = "MS")]
        interval_ms: Option<u64>,
    },
}

#[derive(Serialize)]
struct InfoReport {
    device: DeviceDescriptor,
    device_id: u32,
    version: VersionInfo,
    voltage_mv: u32,
}

#[derive(Serialize)]
struct VoltageSample {
    time: String,
    mv: u32,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| PassThruError::with_detail(ErrorKind::Failed, e.to_string()))?;
    println!("{}", text);
    Ok(())
}

/// A manifest path, or the name of a discovered device
fn resolve_target(state: &AppState, target: &str) -> Result<DeviceDescriptor> {
    let path = Path::new(target);
    if path.extension().is_some_and(|ext| ext == "json") || path.is_file() {
        return Ok(device::load_manifest(path)?);
    }
    state
        .list_devices()?
        .into_iter()
        .find(|d| d.name.eq_ignore_ascii_case(target))
        .ok_or_else(|| {
            PassThruError::with_detail(ErrorKind::Config, format!("no device named '{}'", target))
        })
}

fn list(state: &AppState, json: bool) -> Result<()> {
    let devices = state.list_devices()?;
    if json {
        return print_json(&devices);
    }
    if devices.is_empty() {
        println!("No PassThru devices found");
    }
    for d in &devices {
        let protocols: Vec<String> = d
            .capabilities
            .protocols()
            .iter()
            .map(|p| p.to_string())
            .collect();
        println!("{} ({})", d.name, d.vendor);
        println!("  library:   {}", d.library_path.display());
        println!("  protocols: {}", protocols.join(", "));
    }
    Ok(())
}

fn info(state: &AppState, target: &str, json: bool) -> Result<()> {
    let descriptor = resolve_target(state, target)?;
    let session = state.open(descriptor)?;
    let report = session.version().and_then(|version| {
        Ok(InfoReport {
            device: session.descriptor().clone(),
            device_id: session.device_id(),
            version,
            voltage_mv: session.voltage()?,
        })
    });
    let closed = state.close();
    let report = report?;
    closed?;

    if json {
        return print_json(&report);
    }
    println!("{} ({})", report.device.name, report.device.vendor);
    println!("  firmware: {}", report.version.fw_version);
    println!("  dll:      {}", report.version.dll_version);
    println!("  api:      {}", report.version.api_version);
    println!("  battery:  {:.2} V", report.voltage_mv as f32 / 1000.0);
    Ok(())
}

fn watch(state: &AppState, target: &str, samples: u32, interval: Duration, json: bool) -> Result<()> {
    let descriptor = resolve_target(state, target)?;
    let session = state.open(descriptor)?;
    let mut result = Ok(());
    for i in 0..samples {
        if i > 0 {
            std::thread::sleep(interval);
        }
        let mv = match session.voltage() {
            Ok(mv) => mv,
            Err(e) => {
                result = Err(e);
                break;
            }
        };
        let sample = VoltageSample {
            time: chrono::Local::now().format("%H:%M:%S%.3f").to_string(),
            mv,
        };
        if json {
            if let Ok(line) = serde_json::to_string(&sample) {
                println!("{}", line);
            }
        } else {
            println!("{}  {:.2} V", sample.time, mv as f32 / 1000.0);
        }
    }
    state.close()?;
    result
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => HostConfig::load(path)?,
        None => HostConfig::default(),
    };
    let poll = Duration::from_millis(config.voltage_poll_ms);
    let state = AppState::new(SystemBackend::new(config.clone()), config);

    match cli.command {
        Command::List => list(&state, cli.json),
        Command::Info { target } => info(&state, &target, cli.json),
        Command::Watch {
            target,
            samples,
            interval_ms,
        } => {
            let interval = interval_ms.map(Duration::from_millis).unwrap_or(poll);
            watch(&state, &target, samples, interval, cli.json)
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    }
}
