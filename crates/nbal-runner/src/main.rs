//! # nbal-runner
//!
//! Main entry point for the NUMA load balancer.
//!
//! Loads a JSON settings file (creating it with defaults on first run),
//! builds the engine over the native OS backend, and drives the
//! sample/rebalance cycle at the configured cadence until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! nbal-runner settings.json --log-level info --log-dir logs
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// NUMA CPU-Load Rebalancer.
#[derive(Parser)]
#[command(name = "nbal-runner", about = "NUMA CPU-Load Rebalancer")]
struct Cli {
    /// Settings file path (JSON); created with defaults when missing.
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Optional log directory for file output.
    #[arg(long)]
    log_dir: Option<String>,

    /// Run a single sample/rebalance cycle and exit.
    #[arg(long)]
    once: bool,

    /// Print topology and tracked-process state after one sample, then exit.
    #[arg(long)]
    status: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Initialize logging
    nbal_core::logging::init_logging(&cli.log_level, cli.log_dir.as_deref(), "nbal-runner");

    info!("nbal-runner starting — config={}, log_level={}", cli.config.display(), cli.log_level,);

    run(cli).await
}

#[cfg(windows)]
async fn run(cli: Cli) -> Result<()> {
    use std::time::{Duration, Instant};

    use nbal_engine::sys::windows::WindowsSystem;
    use nbal_engine::{Balancer, BalancerConfig};
    use tracing::error;

    // 2. Load settings
    let settings = nbal_core::config::load_or_create(&cli.config)?;
    info!(
        "settings loaded — analysis={}s, switching={}s, max={}%, delta={}%",
        settings.analysis_period,
        settings.switching_frequency,
        settings.maximum_cpu_value,
        settings.delta_cpu_values,
    );

    if let Some(dir) = cli.log_dir.as_deref() {
        nbal_core::logging::prune_old_logs(
            std::path::Path::new(dir),
            "nbal-runner",
            settings.log_storage_duration,
        );
    }

    // 3. Build the engine over the native backend
    let sys = WindowsSystem::new().map_err(|e| anyhow::anyhow!("OS backend unavailable: {e}"))?;
    let mut balancer = Balancer::new(sys, &BalancerConfig::from(&settings));
    for name in &settings.processes {
        balancer.add_filter(name.clone());
        info!("tracking process '{name}'");
    }
    if settings.processes.is_empty() {
        info!("no process filter configured — tracking everything");
    }

    if cli.status {
        balancer.read();
        println!("{}", balancer.status_report());
        balancer.shutdown();
        return Ok(());
    }
    if cli.once {
        balancer.read();
        balancer.set_affinity();
        balancer.shutdown();
        return Ok(());
    }

    info!("entering rebalance loop — press Ctrl+C to stop");

    // 4. Drive the cycle until the shutdown signal
    let cadence = Duration::from_secs(settings.switching_frequency.max(1));
    let mut last_cycle = Instant::now();
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("cannot listen for shutdown signal: {e}");
                }
                break;
            }
            // Short tick keeps shutdown responsive at coarse cadences.
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }

        if last_cycle.elapsed() >= cadence {
            balancer.read();
            balancer.set_affinity();
            last_cycle = Instant::now();
        }
    }

    info!("shutdown signal received");

    // 5. Stop the counter loop before exiting
    balancer.shutdown();
    info!("balancer stopped — goodbye");
    Ok(())
}

#[cfg(not(windows))]
async fn run(_cli: Cli) -> Result<()> {
    anyhow::bail!(
        "this build has no OS backend for the current platform; \
         the balancer drives Windows NUMA affinity interfaces"
    )
}
