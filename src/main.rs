//! devflow - device boot-mode and workflow orchestration
//!
//! Entry point for the command-line binary.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use devflow::{
    config::{Config, LoggingConfig},
    device::{DeviceKey, DeviceSnapshot, Mode},
    events::{EventSink, TracingSink},
    toolbox::ToolboxOperation,
    transport::{
        ActivationFlags, DeviceTransport, LibimobiledeviceTransport, SimulatedDevice,
        SimulatedTransport,
    },
    workflow::{WorkflowKind, WorkflowStart},
    Engine,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for devflow
#[derive(Parser, Debug)]
#[command(name = "devflow")]
#[command(version, about = "Device boot-mode transitions and bypass workflows", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, env = "DEVFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log format (json|pretty|compact), overrides config
    #[arg(long)]
    pub log_format: Option<String>,

    /// Write logs to file (in addition to stderr)
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Use scripted in-memory devices instead of real hardware
    #[arg(long)]
    pub simulate: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    pub show_config: bool,

    /// Output format for command results
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List attached devices
    List,

    /// Print snapshots as devices attach, change mode and detach
    Watch,

    /// Show the capabilities a device's firmware offers
    Probe {
        /// Device key (ECID, UDID or serial)
        device: String,
    },

    /// Move a device to another boot mode (subject to toolbox access)
    Transition {
        device: String,
        /// Target mode (normal|recovery|dfu|purple|bootfiles)
        mode: Mode,
    },

    /// Run a bypass workflow to completion or first failure
    Workflow {
        device: String,
        /// hello-screen | passcode-screen | fmi-off
        kind: WorkflowKind,
        /// Block OTA updates after activation
        #[arg(long)]
        block_updates: bool,
        /// Block host restores after activation
        #[arg(long)]
        block_restores: bool,
        /// Skip the remaining setup screens
        #[arg(long)]
        skip_setup: bool,
        /// Resume this many times after a retryable failure
        #[arg(long, default_value = "0")]
        resume: u32,
    },

    /// Run one toolbox operation
    Toolbox {
        device: String,
        /// Operation name, e.g. exit-to-recovery or jailbreak-checkra1n
        operation: ToolboxOperation,
        /// Ramdisk image for boot-ramdisk, overrides config
        #[arg(long)]
        ramdisk: Option<PathBuf>,
    },

    /// Print the compatibility table in use
    ShowCompat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match Config::load_or_default(args.config.as_deref()) {
        Ok(c) => c.with_overrides(args.simulate, args.log_format.clone()),
        Err(e) => {
            eprintln!("{}", devflow::runtime::format_user_error(&e));
            return Err(e);
        }
    };

    if let Some(Command::Toolbox {
        ramdisk: Some(path),
        ..
    }) = &args.command
    {
        config.toolbox.ramdisk_path = Some(path.clone());
    }

    if args.show_config {
        print!(
            "{}",
            toml::to_string_pretty(&config).context("Failed to serialize config")?
        );
        return Ok(());
    }

    init_logging(&args, &config.logging)?;

    info!("════════════════════════════════════════════════════════");
    info!("  devflow v{}", env!("CARGO_PKG_VERSION"));
    let build = devflow::runtime::BuildInfo::current();
    info!("  Built: {}", build.stamp);
    info!("  Revision: {}", build.revision);
    info!("════════════════════════════════════════════════════════");

    devflow::runtime::log_startup_diagnostics(&config).await;
    tracing::debug!("Config: {:?}", config);

    if let Err(e) = run(&args, &config).await {
        error!("{e:#}");
        eprintln!("{}", devflow::runtime::format_user_error(&e));
        return Err(e);
    }
    Ok(())
}

async fn run(args: &Args, config: &Config) -> Result<()> {
    let transport: Arc<dyn DeviceTransport> = if config.is_simulated() {
        info!("Using simulated transport");
        Arc::new(demo_transport())
    } else {
        Arc::new(LibimobiledeviceTransport::new(config.transport.command_timeout()))
    };
    let events: Arc<dyn EventSink> = Arc::new(TracingSink);

    let engine = Engine::new(config, transport, events).context("Failed to initialize engine")?;
    engine.start().await;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            warn!("Ctrl-C received, cancelling");
            ctrl_c.cancel();
        }
    });

    let json = args.format == OutputFormat::Json;
    let result = match &args.command {
        None | Some(Command::List) => list(&engine, json),
        Some(Command::Watch) => watch(&engine, &cancel, json).await,
        Some(Command::Probe { device }) => probe(&engine, &DeviceKey::new(device), json),
        Some(Command::Transition { device, mode }) => match ToolboxOperation::for_mode(*mode) {
            Some(operation) => {
                let report = engine
                    .toolbox()
                    .run(&DeviceKey::new(device), operation, &cancel)
                    .await;
                print_result(&report, json)
            }
            None => Err(anyhow::anyhow!("No operation moves a device to {mode}")),
        },
        Some(Command::Workflow {
            device,
            kind,
            block_updates,
            block_restores,
            skip_setup,
            resume,
        }) => {
            let options = ActivationFlags {
                block_updates: *block_updates,
                block_restores: *block_restores,
                skip_setup: *skip_setup,
            };
            workflow(&engine, &DeviceKey::new(device), *kind, options, *resume, &cancel, json).await
        }
        Some(Command::Toolbox {
            device, operation, ..
        }) => {
            let report = engine
                .toolbox()
                .run(&DeviceKey::new(device), *operation, &cancel)
                .await;
            print_result(&report, json)
        }
        Some(Command::ShowCompat) => {
            if json {
                println!("{}", serde_json::to_string_pretty(engine.probe().table())?);
            } else {
                print!("{}", toml::to_string_pretty(engine.probe().table())?);
            }
            Ok(())
        }
    };

    engine.shutdown().await;
    result
}

/// Two devices for `--simulate`: one booted, one waiting in DFU
fn demo_transport() -> SimulatedTransport {
    SimulatedTransport::new()
        .with_device(
            "sim-1",
            SimulatedDevice::new("0x1A2B3C4D5E", "15.7.1", Mode::Normal)
                .with_serial("F2LXK0SIM001")
                .with_product_type("iPhone10,3"),
        )
        .with_device(
            "sim-2",
            SimulatedDevice::new("0x6F7A8B9C0D", "16.3", Mode::Dfu).with_product_type("iPhone11,8"),
        )
}

fn print_result<T: Serialize + std::fmt::Display>(value: &T, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{value}");
    }
    Ok(())
}

fn list(engine: &Engine, json: bool) -> Result<()> {
    let devices = engine.devices();
    if json {
        let plain: Vec<&DeviceSnapshot> = devices.iter().map(|s| &**s).collect();
        println!("{}", serde_json::to_string_pretty(&plain)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No devices attached");
    }
    for snapshot in devices {
        println!("{snapshot}");
    }
    Ok(())
}

async fn watch(engine: &Engine, cancel: &CancellationToken, json: bool) -> Result<()> {
    let mut subscriber = engine.monitor().subscribe();
    println!("Watching for device changes (Ctrl-C to stop)");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            next = subscriber.next() => match next {
                Some(snapshot) => {
                    if json {
                        println!("{}", serde_json::to_string(&*snapshot)?);
                    } else if snapshot.is_detached() {
                        println!("{} detached", snapshot.slot);
                    } else {
                        println!("{snapshot}");
                    }
                }
                None => break,
            },
        }
    }

    if subscriber.dropped() > 0 {
        warn!("{} snapshots dropped by a slow consumer", subscriber.dropped());
    }
    Ok(())
}

fn probe(engine: &Engine, key: &DeviceKey, json: bool) -> Result<()> {
    let snapshot = engine
        .registry()
        .latest(key)
        .with_context(|| format!("Device {key} is not attached"))?;

    let mut rows = Vec::new();
    for kind in WorkflowKind::ALL {
        rows.push((kind, engine.probe().probe(&snapshot, kind)));
    }

    if json {
        let mut map = serde_json::Map::new();
        for (kind, caps) in rows {
            map.insert(kind.name().to_string(), serde_json::to_value(caps)?);
        }
        println!("{}", serde_json::to_string_pretty(&map)?);
        return Ok(());
    }

    println!("{snapshot}");
    for (kind, caps) in rows {
        println!("  {:<16} {caps}", kind.name());
    }
    Ok(())
}

async fn workflow(
    engine: &Engine,
    key: &DeviceKey,
    kind: WorkflowKind,
    options: ActivationFlags,
    resumes: u32,
    cancel: &CancellationToken,
    json: bool,
) -> Result<()> {
    let workflows = engine.workflows();
    let mut run = match workflows.start(key, kind, options, cancel).await? {
        WorkflowStart::Running(run) => run,
        WorkflowStart::Gated(gate) => return Err(gate.into()),
    };

    let mut remaining = resumes;
    while !run.is_terminal() && remaining > 0 && !cancel.is_cancelled() {
        remaining -= 1;
        info!("Resuming after: {}", run.last_result().map_or_else(String::new, ToString::to_string));
        run = workflows.resume(run, cancel).await?;
    }

    if !run.is_terminal() {
        info!("Run {} left at checkpoint {}", run.id(), run.checkpoint());
        workflows.discard(run.clone());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        println!("{run}");
        for result in run.results() {
            println!("  {result}");
        }
    }
    Ok(())
}

/// Initialize tracing with the configured format and an optional log file
fn init_logging(args: &Args, logging_config: &LoggingConfig) -> Result<()> {
    use std::fs::{self, File};

    // CLI -v flag overrides config
    let log_level = if args.verbose > 0 {
        match args.verbose {
            1 => "debug",
            _ => "trace",
        }
    } else {
        match logging_config.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => logging_config.level.as_str(),
            _ => "info",
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("devflow={log_level},warn")));

    // CLI --log-file overrides config.log_dir
    let log_file_path: Option<PathBuf> = if let Some(cli_path) = &args.log_file {
        Some(cli_path.clone())
    } else if logging_config.log_dir.is_some() {
        let log_dir = devflow::config::resolve_log_dir(&logging_config.log_dir);
        if let Err(e) = fs::create_dir_all(&log_dir) {
            eprintln!(
                "Warning: Cannot create log directory {}: {e}",
                log_dir.display()
            );
            None
        } else {
            let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
            Some(log_dir.join(format!("devflow-{timestamp}.log")))
        }
    } else {
        None
    };

    let log_file = log_file_path
        .as_ref()
        .and_then(|path| match File::create(path) {
            Ok(f) => Some((f, path.clone())),
            Err(e) => {
                eprintln!(
                    "Warning: Cannot create log file {}: {e}, logging to console only",
                    path.display()
                );
                None
            }
        });

    // Console output goes to stderr so command results on stdout stay parseable
    if let Some((file, ref log_file_path)) = log_file {
        match logging_config.format.as_str() {
            "json" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(std::io::stderr),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
            "compact" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_writer(std::io::stderr),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .compact()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .pretty()
                            .with_writer(std::io::stderr),
                    )
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(file)
                            .with_ansi(false),
                    )
                    .init();
            }
        }
        info!("Logging to file: {}", log_file_path.display());
    } else {
        match logging_config.format.as_str() {
            "json" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                    .init();
            }
            "compact" => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
                    .init();
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_rejects_unknown_value() {
        assert!(Args::try_parse_from(["devflow", "--format", "yaml", "list"]).is_err());

        let args = Args::try_parse_from(["devflow", "--format", "json", "list"]).unwrap();
        assert_eq!(args.format, OutputFormat::Json);
        let args = Args::try_parse_from(["devflow", "list"]).unwrap();
        assert_eq!(args.format, OutputFormat::Text);
    }

    #[test]
    fn test_toolbox_ramdisk_flag() {
        let args = Args::try_parse_from([
            "devflow",
            "toolbox",
            "ecid-1",
            "boot-ramdisk",
            "--ramdisk",
            "/tmp/ramdisk.img4",
        ])
        .unwrap();
        let Some(Command::Toolbox {
            operation, ramdisk, ..
        }) = args.command
        else {
            panic!("expected the toolbox command");
        };
        assert_eq!(operation, ToolboxOperation::BootRamdisk);
        assert_eq!(ramdisk, Some(PathBuf::from("/tmp/ramdisk.img4")));
    }
}
