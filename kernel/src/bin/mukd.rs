//! μKernel Daemon
//!
//! Runs the kernel with the built-in images.
//!
//! # Usage
//!
//! ```bash
//! # Run five idle processes as uid 1000 for ten seconds
//! mukd run --image bin/idle --count 5 --uid 1000 --seconds 10
//!
//! # Validate a configuration file
//! mukd -c kernel.json check
//!
//! # Print the default configuration
//! mukd config
//! ```

use mukernel::prelude::*;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// μKernel - process supervisor for μOS
#[derive(Parser)]
#[command(name = "mukd")]
#[command(version)]
#[command(about = "μKernel process supervisor daemon", long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the kernel and launch processes
    Run(RunArgs),
    /// Check configuration
    Check,
    /// Print the effective configuration as JSON
    Config,
}

#[derive(Args)]
struct RunArgs {
    /// Image to launch
    #[arg(long, default_value = "bin/idle")]
    image: String,

    /// Number of processes to launch
    #[arg(long, default_value = "1")]
    count: usize,

    /// User ID to launch as
    #[arg(long, default_value = "0")]
    uid: u32,

    /// Group ID, defaults to the user ID
    #[arg(long)]
    gid: Option<u32>,

    /// Seconds to run before shutting down; runs until Ctrl-C when unset
    #[arg(long)]
    seconds: Option<u64>,

    /// Arguments passed to every process
    #[arg(last = true)]
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => KernelConfig::load(path)?,
        None => KernelConfig::default(),
    };

    // Setup logging
    let log_level = match cli.verbose {
        0 => config.log_level.clone(),
        1 => "debug".into(),
        _ => "trace".into(),
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();

    match cli.command {
        Commands::Run(args) => run(args, config).await?,
        Commands::Check => check(&config)?,
        Commands::Config => println!("{}", serde_json::to_string_pretty(&config)?),
    }

    Ok(())
}

async fn run(args: RunArgs, config: KernelConfig) -> Result<(), Box<dyn std::error::Error>> {
    let provider = Arc::new(TaskProvider::new(programs::builtin()));
    let (kernel, handle) = Kernel::new(config, provider)?;
    let kernel_task = tokio::spawn(kernel.run());

    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Dropped {} scheduler events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let launch = LaunchSpec::new(&args.image)
        .with_uid(args.uid)
        .with_gid(args.gid.unwrap_or(args.uid))
        .with_args(args.args.clone());

    let pending: Vec<_> = (0..args.count)
        .map(|i| handle.start(launch.clone().with_name(format!("{}#{}", args.image, i))))
        .collect();

    // Requests past the limits stay queued, so don't block on them
    tokio::spawn(async move {
        for future in pending {
            match future.await {
                Ok(pid) => info!("Started pid {}", pid),
                Err(err) => error!("Start failed: {}", err),
            }
        }
    });

    match args.seconds {
        Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Interrupted");
        }
    }

    let status = handle.status().await?;
    info!("{} live, {} running, {} queued", status.live, status.running, status.queued);
    for process in handle.processes().await? {
        info!(
            "  pid {:>3}  ppid {:>3}  uid {:>5}  {:?}/{:?}  {}",
            process.pid, process.ppid, process.uid, process.state, process.heartbeat, process.name
        );
    }

    handle.shutdown().await?;
    kernel_task.await??;
    Ok(())
}

fn check(config: &KernelConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;

    println!("Configuration OK");
    println!("  Max processes: {}", config.scheduler.max_processes);
    println!("  Max per user: {}", config.scheduler.max_user_processes);
    println!("  Heartbeat: {:?} (grace {:?})", config.heartbeat.interval, config.heartbeat.grace_period);
    println!("  Images: {}", programs::builtin().uris().join(", "));
    Ok(())
}

fn log_event(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::HeartbeatAcked { .. } => {}
        SchedulerEvent::Killed { pid, reason } => info!("pid {} killed: {:?}", pid, reason),
        SchedulerEvent::Rejected { uid, error } => warn!("start for uid {} rejected: {}", uid, error),
        other => info!("{:?}", other),
    }
}
