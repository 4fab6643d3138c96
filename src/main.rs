use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{Level, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use svcrig_config::{ServiceConfig, Transport};

use svcrig::env;
use svcrig::exec::{LocalExecutor, RemoteExecutor};
use svcrig::logs::{LogCollector, LogOutcome};
use svcrig::poll::{CancelSignal, Canceller};
use svcrig::probe::{HostProbe, LocalProbe};
use svcrig::progress::PrettyProgressLayer;
use svcrig::service::{HostOutcome, PerHostResult, ServiceController};
use svcrig::ssh::{SshExecutor, SshProbe, new_session_cache};

#[derive(Parser)]
#[command(name = "svcrig")]
#[command(about = "Start, watch and stop a service across a set of hosts", long_about = None)]
struct Cli {
    /// Path to the service file (dotenv syntax)
    #[arg(short, long, default_value = "svcrig.env")]
    config: PathBuf,

    /// Directory receiving collected logs
    #[arg(short, long, default_value = "svcrig-out")]
    out: PathBuf,

    /// Full log output instead of progress lines
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the service file
    Validate {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Start the service on every host and wait until it is ready
    Start,

    /// Probe every host once
    Status,

    /// Stop the service on every host and wait until it is down
    Stop,

    /// Copy remote logs into the output directory
    Logs,

    /// Delete remote logs and scratch files
    ClearLogs,

    /// Clear logs, start, hold steady state, stop and collect logs
    Run {
        /// How long to hold the steady state (until Ctrl-C if omitted)
        #[arg(short, long)]
        duration: Option<humantime::Duration>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let props = env::load_properties(&cli.config).map_err(|e| anyhow::anyhow!("{}", e))?;
    let config = ServiceConfig::from_properties(&props)?;

    if let Commands::Validate { ref format } = cli.command {
        match format.as_str() {
            "json" => println!("{}", serde_json::to_string_pretty(&config)?),
            "text" => {
                println!("{} Service file is valid!", "✓".green());
                println!("  {} {}", "service:".bold(), config.name);
                println!("  {} {}", "hosts:".bold(), host_list(&config));
                println!("  {} {}", "ready:".bold(), config.ready.describe());
            }
            _ => {
                anyhow::bail!("Unknown format: {}. Use text or json", format);
            }
        }
        return Ok(());
    }

    let (executor, probe) = connect(&config);
    let (steady, abort) = watch_interrupts();
    let config = Arc::new(config);

    let mut controller = ServiceController::new(executor, probe.clone()).with_cancel(abort);
    controller.configure_with(ServiceConfig::clone(&config)).await?;
    let collector = LogCollector::new(config.clone(), probe, &cli.out);

    let mut failed = false;
    match cli.command {
        Commands::Validate { .. } => {}

        Commands::Start => {
            let result = controller.start().await?;
            failed = !print_results("start", &result);
        }

        Commands::Status => {
            println!("{}", "Status:".bold());
            for host in &config.hosts {
                match controller.is_up(host).await {
                    Ok(true) => println!("  {} {} up", "●".green(), host),
                    Ok(false) => println!("  {} {} down", "○".dimmed(), host),
                    Err(e) => {
                        failed = true;
                        println!("  {} {} {}", "✗".red(), host, e);
                    }
                }
            }
        }

        Commands::Stop => {
            let result = controller.stop().await?;
            failed = !print_results("stop", &result);
        }

        Commands::Logs => {
            failed = !collect_logs(&collector).await;
        }

        Commands::ClearLogs => {
            failed = !clear_logs(&collector).await;
        }

        Commands::Run { duration } => {
            clear_logs(&collector).await;

            let started = controller.start().await?;
            failed = !print_results("start", &started);

            if !failed {
                let interval = config.startup.interval.max(Duration::from_millis(100));
                let deadline = duration.map(|d| Instant::now() + Duration::from(d));
                loop {
                    tokio::select! {
                        _ = steady.cancelled() => break,
                        _ = sleep(interval) => {}
                    }
                    let exits = controller.monitor().await;
                    if !exits.is_empty() {
                        for err in &exits {
                            warn!(error = %err, "ending run");
                        }
                        failed = true;
                        break;
                    }
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        break;
                    }
                }
            }

            let stopped = controller.stop().await?;
            failed |= !print_results("stop", &stopped);
            failed |= !collect_logs(&collector).await;
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    if verbose {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
            .with(PrettyProgressLayer::new())
            .init();
    }
}

/// Executor and probe for the configured transport
fn connect(config: &ServiceConfig) -> (Arc<dyn RemoteExecutor>, Arc<dyn HostProbe>) {
    match config.transport {
        Transport::Local => (Arc::new(LocalExecutor::new()), Arc::new(LocalProbe::new())),
        Transport::Ssh => {
            let sessions = new_session_cache();
            (
                Arc::new(SshExecutor::new(&config.name, config.ssh.clone(), sessions.clone())),
                Arc::new(SshProbe::new(config.ssh.clone(), sessions)),
            )
        }
    }
}

/// First Ctrl-C ends the steady state of a run, the second aborts polls
fn watch_interrupts() -> (CancelSignal, CancelSignal) {
    let (end_steady, steady) = CancelSignal::new();
    let (abort_polls, abort) = CancelSignal::new();

    tokio::spawn(async move {
        let stages: [&Canceller; 2] = [&end_steady, &abort_polls];
        for stage in stages {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            warn!("interrupted");
            stage.cancel();
        }
    });

    (steady, abort)
}

fn host_list(config: &ServiceConfig) -> String {
    config
        .hosts
        .iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Print per-host outcomes; returns true when every host succeeded
fn print_results(operation: &str, result: &PerHostResult) -> bool {
    println!("\n{} {}", "Results:".bold(), operation.dimmed());
    for (host, outcome) in result.iter() {
        match outcome {
            HostOutcome::Running => println!("  {} {} running", "✓".green(), host),
            HostOutcome::Stopped => println!("  {} {} stopped", "✓".green(), host),
            HostOutcome::Failed(e) => println!("  {} {} {}", "✗".red(), host, e),
        }
    }
    result.is_success()
}

async fn collect_logs(collector: &LogCollector) -> bool {
    let mut ok = true;
    println!("\n{} {}", "Logs:".bold(), collector.out_dir().display().to_string().dimmed());
    for host_logs in collector.collect_all().await {
        for outcome in &host_logs.outcomes {
            match outcome {
                LogOutcome::Collected { local, .. } => {
                    println!("  {} {}", "✓".green(), local.display())
                }
                LogOutcome::Absent { prefix } => {
                    println!("  {} {} {}", "○".dimmed(), prefix, host_logs.host)
                }
                LogOutcome::Failed(e) => {
                    ok = false;
                    println!("  {} {}", "✗".red(), e);
                }
            }
        }
    }
    ok
}

async fn clear_logs(collector: &LogCollector) -> bool {
    let mut ok = true;
    for (host, result) in collector.clear_all().await {
        if let Err(e) = result {
            ok = false;
            warn!(host = %host, error = %e, "could not clear logs");
        }
    }
    ok
}
