//! sysprobe - syscall capture sensor
//!
//! Runs the capture core against a simulated workload, drains the ring
//! buffer and prints the decoded events and capture metrics.

use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use sysprobe_capture::sim::{Workload, WorkloadConfig};
use sysprobe_capture::{Abi, EventType, Probe};
use sysprobe_core::config::{ConfigLoader, SensorConfig};
use sysprobe_core::{create_metrics, SENSOR_VERSION};
use sysprobe_decode::RingConsumer;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "sysprobe")]
#[command(version)]
#[command(about = "Syscall event capture sensor", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format (json, text)
    #[arg(short, long, default_value = "text")]
    format: String,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "SYSPROBE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a simulated workload through the real capture handlers
    Demo {
        /// Rounds of traffic per execution context
        #[arg(short, long, default_value = "25")]
        iterations: u64,

        /// Execution contexts to run concurrently (default: from config)
        #[arg(long)]
        contexts: Option<usize>,

        /// Simulate 32-bit tasks calling through socketcall
        #[arg(long)]
        compat: bool,

        /// Every n-th receive fails (0 = never)
        #[arg(long, default_value = "10")]
        failure_every: u64,

        /// Also write decoded events as JSONL
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Do not print individual events
        #[arg(short, long)]
        quiet: bool,
    },

    /// Show effective configuration and event schemas
    Status,

    /// Print the default configuration, or write it to a file
    Config {
        /// Write to this path instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let sensor_config = load_config(cli.config.clone());

    // CLI verbose flag takes precedence, then config
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match sensor_config.sensor.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let json = cli.format == "json";
    match cli.command {
        Commands::Demo {
            iterations,
            contexts,
            compat,
            failure_every,
            output,
            quiet,
        } => {
            demo_command(
                sensor_config,
                DemoConfig {
                    iterations,
                    contexts,
                    compat,
                    failure_every,
                    output,
                    quiet,
                    json,
                },
            )
            .await
        }
        Commands::Status => status_command(&sensor_config, json),
        Commands::Config { output } => config_command(output),
    }
}

/// Load configuration from file/env, with fallback to defaults
fn load_config(cli_path: Option<PathBuf>) -> SensorConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}, using defaults", e);
            SensorConfig::default()
        }
    }
}

struct DemoConfig {
    iterations: u64,
    contexts: Option<usize>,
    compat: bool,
    failure_every: u64,
    output: Option<PathBuf>,
    quiet: bool,
    json: bool,
}

async fn demo_command(sensor_config: SensorConfig, config: DemoConfig) -> anyhow::Result<()> {
    let DemoConfig {
        iterations,
        contexts,
        compat,
        failure_every,
        output,
        quiet,
        json,
    } = config;

    let mut capture = sensor_config.capture;
    if let Some(contexts) = contexts {
        capture.contexts = contexts;
    }
    let contexts = capture.effective_contexts();

    if !json {
        println!();
        println!("  sysprobe v{} - DEMO MODE", SENSOR_VERSION);
        println!();
        println!(
            "  {} contexts x {} rounds, snaplen {}{}",
            contexts,
            iterations,
            capture.snaplen,
            if capture.dynamic_snaplen { " (dynamic)" } else { "" }
        );
        println!();
    }

    let metrics = create_metrics();
    let probe = Arc::new(Probe::new(&capture, metrics.clone()));

    let (tx, mut rx) = mpsc::channel(1024);
    let (stop_tx, stop_rx) = watch::channel(false);
    let consumer = RingConsumer::new(probe.ring().clone(), metrics.clone());
    let consumer_handle = tokio::spawn(consumer.run(tx, stop_rx));

    let mut producers = Vec::with_capacity(contexts);
    for ctx in 0..contexts {
        let probe = probe.clone();
        let workload = Workload::new(
            ctx,
            10_000 + ctx as u64,
            WorkloadConfig {
                iterations,
                failure_every,
                abi: if compat { Abi::Compat32 } else { Abi::Native },
                ..WorkloadConfig::default()
            },
        );
        producers.push(tokio::task::spawn_blocking(move || workload.run(&probe)));
    }

    let printer = tokio::spawn(async move {
        let mut writer = match output {
            Some(path) => Some(BufWriter::new(File::create(&path)?)),
            None => None,
        };
        let mut count = 0u64;
        while let Some(event) = rx.recv().await {
            count += 1;
            if let Some(w) = writer.as_mut() {
                writeln!(w, "{}", event.to_json())?;
            }
            if quiet {
                continue;
            }
            if json {
                println!("{}", event.to_json());
            } else {
                println!("  {}", event);
            }
        }
        if let Some(mut w) = writer {
            w.flush()?;
        }
        anyhow::Ok(count)
    });

    let mut syscalls = 0;
    for producer in producers {
        syscalls += producer.await?;
    }
    info!(syscalls, "All producers finished");

    stop_tx.send(true)?;
    let forwarded = consumer_handle.await?;
    let printed = printer.await??;
    if printed != forwarded {
        warn!(printed, forwarded, "Printer saw fewer events than forwarded");
    }

    if json {
        println!("{}", metrics.to_json());
    } else {
        println!();
        println!("  {} syscalls, {} events decoded", syscalls, forwarded);
        println!();
        print!("{}", metrics.to_prometheus());
    }

    Ok(())
}

fn status_command(config: &SensorConfig, json: bool) -> anyhow::Result<()> {
    if json {
        let schemas: Vec<serde_json::Value> = EventType::ALL
            .iter()
            .map(|ty| {
                let schema = ty.schema();
                serde_json::json!({
                    "tag": ty.tag(),
                    "name": schema.name,
                    "fixed_size": schema.fixed_size(),
                    "params": schema
                        .params
                        .iter()
                        .map(|p| serde_json::json!({ "name": p.name, "kind": p.kind.as_str() }))
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::json!({
                "version": SENSOR_VERSION,
                "platform": format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
                "config_path": ConfigLoader::default_config_path(),
                "capture": {
                    "snaplen": config.capture.snaplen,
                    "dynamic_snaplen": config.capture.dynamic_snaplen,
                    "ringbuf_size": config.capture.ringbuf_size,
                    "contexts": config.capture.effective_contexts(),
                    "snaplen_overrides": config.capture.snaplen_overrides.len(),
                },
                "events": schemas,
            })
        );
        return Ok(());
    }

    println!();
    println!("sysprobe v{}", SENSOR_VERSION);
    println!();
    println!(
        "Platform: {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    if let Some(path) = ConfigLoader::default_config_path() {
        println!("Config path: {}", path.display());
    }

    println!();
    println!("Capture:");
    println!("  Snaplen: {}", config.capture.snaplen);
    println!("  Dynamic snaplen: {}", config.capture.dynamic_snaplen);
    println!("  Ring buffer: {} bytes", config.capture.ringbuf_size);
    println!("  Contexts: {}", config.capture.effective_contexts());
    for rule in &config.capture.snaplen_overrides {
        println!(
            "  Override: {} ports {}-{} -> {}",
            rule.protocol.as_deref().unwrap_or("any"),
            rule.ports.start,
            rule.ports.end,
            rule.snaplen
        );
    }

    println!();
    println!("Events:");
    for ty in EventType::ALL {
        let schema = ty.schema();
        let params: Vec<String> = schema
            .params
            .iter()
            .map(|p| format!("{}:{}", p.name, p.kind.as_str()))
            .collect();
        println!("  {:>3} {:<11} {}", ty.tag(), schema.name, params.join(", "));
    }
    println!();

    Ok(())
}

fn config_command(output: Option<PathBuf>) -> anyhow::Result<()> {
    let config = SensorConfig::default();
    match output {
        Some(path) => {
            ConfigLoader::new().save(&config, &path)?;
            println!("Configuration written to {}", path.display());
        }
        None => print!("{}", config.to_toml()?),
    }
    Ok(())
}
