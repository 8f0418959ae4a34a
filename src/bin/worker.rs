// src/bin/worker.rs
//
// =============================================================================
// RAILYARD-WORKER
// =============================================================================
//
// Detects local hardware, registers with the master, and runs the poll and
// heartbeat loops until interrupted.

use clap::Parser;
use railyard::agent::{AgentConfig, WorkerAgent};
use railyard::client::MasterClient;
use railyard::core::{HardwareDescriptor, NodeClass};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "railyard-worker", about = "Railyard worker agent")]
struct Cli {
    #[arg(long)]
    master_url: Option<String>,

    #[arg(long, env = "RAILYARD_TOKEN")]
    auth_token: Option<String>,

    #[arg(long)]
    max_concurrent_jobs: Option<usize>,

    #[arg(long, value_delimiter = ',')]
    engines: Vec<String>,

    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,

    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let file_cfg = railyard::config::load_worker_file(cli.config.as_deref())?;

    let master_url = railyard::config::layer(cli.master_url, file_cfg.master_url, String::new());
    let auth_token = railyard::config::layer(cli.auth_token, file_cfg.auth_token, String::new());
    let max_concurrent_jobs = railyard::config::layer(
        cli.max_concurrent_jobs,
        file_cfg.max_concurrent_jobs,
        (num_cpus::get() / 2).max(1),
    );
    let tags = if cli.tags.is_empty() { file_cfg.tags.unwrap_or_default() } else { cli.tags };
    let engines = if cli.engines.is_empty() { file_cfg.engines.unwrap_or_default() } else { cli.engines };

    if master_url.is_empty() || auth_token.is_empty() {
        log::error!("master-url and auth-token are required");
        std::process::exit(1);
    }

    let hardware = detect_hardware(tags, engines);
    let address = local_address();

    let client = MasterClient::new(master_url, auth_token);
    let config = AgentConfig {
        address,
        hardware,
        poll_interval: Duration::from_secs(5),
        heartbeat_interval: Duration::from_secs(20),
        max_concurrent_jobs,
        heartbeat_failure_limit: 3,
        grace_period: Duration::from_secs(10),
        work_root: std::env::temp_dir().join("railyard-worker"),
    };

    let agent = WorkerAgent::new(client, config);
    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("shutdown requested");
            cancel_for_signal.cancel();
        }
    });

    if let Err(e) = agent.run(cancel).await {
        log::error!("worker agent exited with error: {e}");
        std::process::exit(2);
    }

    Ok(())
}

fn detect_hardware(tags: Vec<String>, engines: Vec<String>) -> HardwareDescriptor {
    let mut sys = sysinfo::System::new_all();
    sys.refresh_all();

    let cpu_model = sys.cpus().first().map(|c| c.brand().to_string()).unwrap_or_else(|| "unknown".into());
    let ram_mb = sys.total_memory() / 1024 / 1024;
    let cpu_threads = num_cpus::get();

    let engines = if engines.is_empty() { detect_engines_on_path() } else { engines };

    HardwareDescriptor {
        cpu_threads,
        cpu_model,
        ram_mb,
        gpu_type: None,
        gpu_count: 0,
        node_class: if std::env::var("SLURM_JOB_ID").is_ok() || std::env::var("PBS_JOBID").is_ok() {
            NodeClass::Hpc
        } else if cpu_threads >= 32 {
            NodeClass::Server
        } else if cpu_threads >= 8 {
            NodeClass::Desktop
        } else {
            NodeClass::Laptop
        },
        tags,
        engines,
    }
}

/// Falls back to scanning `PATH` for the known engine binaries when the
/// operator didn't pin `--engines` explicitly.
fn detect_engines_on_path() -> Vec<String> {
    let candidates = [("ffmpeg", "ffmpeg"), ("gst-launch-1.0", "gstreamer")];
    let path = std::env::var_os("PATH").unwrap_or_default();

    candidates
        .iter()
        .filter(|(bin, _)| std::env::split_paths(&path).any(|dir| dir.join(bin).is_file()))
        .map(|(_, engine)| engine.to_string())
        .collect()
}

fn local_address() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}
