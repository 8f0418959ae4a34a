// src/bin/master.rs
//
// =============================================================================
// RAILYARD-MASTER
// =============================================================================
//
// Boots the job store, the three background loops, and the axum control
// plane; shuts down cleanly on Ctrl-C by cancelling the loops and awaiting
// them before the process exits.

use clap::Parser;
use railyard::api::{build_router, ApiState};
use railyard::scheduler::{spawn_background_loops, SchedulerConfig};
use railyard::store::JobStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "railyard-master", about = "Railyard control plane")]
struct Cli {
    #[arg(long)]
    listen: Option<String>,

    #[arg(long)]
    store: Option<PathBuf>,

    #[arg(long)]
    retention_days: Option<i64>,

    #[arg(long, env = "RAILYARD_TOKEN")]
    auth_token: Option<String>,

    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let file_cfg = railyard::config::load_master_file(cli.config.as_deref())?;

    let listen = railyard::config::layer(cli.listen, file_cfg.listen, "0.0.0.0:8080".to_string());
    let store_path = railyard::config::layer(
        cli.store,
        file_cfg.store.map(PathBuf::from),
        PathBuf::from("railyard.db"),
    );
    let retention_days = railyard::config::layer(cli.retention_days, file_cfg.retention_days, 7);
    let auth_token = railyard::config::layer(cli.auth_token, file_cfg.auth_token, String::new());

    if auth_token.is_empty() {
        log::error!("no auth token configured; refusing to start");
        std::process::exit(1);
    }

    let store = Arc::new(JobStore::open(&store_path).map_err(|e| {
        log::error!("failed to open job store at {}: {e}", store_path.display());
        e
    })?);

    let mut scheduler_config = SchedulerConfig::default();
    scheduler_config.retention = chrono::Duration::days(retention_days);

    let cancel = CancellationToken::new();
    let loops = spawn_background_loops(store.clone(), scheduler_config, cancel.clone());

    let state = ApiState { store, auth_token: Arc::new(auth_token) };
    let app = build_router(state);

    let listener = match tokio::net::TcpListener::bind(&listen).await {
        Ok(l) => l,
        Err(e) => {
            log::error!("failed to bind {listen}: {e}");
            std::process::exit(2);
        }
    };
    log::info!("railyard-master listening on {listen}");

    let serve = axum::serve(listener, app);
    let interrupted = tokio::select! {
        result = serve => {
            if let Err(e) = result {
                log::error!("http server error: {e}");
            }
            false
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutdown requested");
            true
        }
    };

    cancel.cancel();
    for handle in loops {
        let _ = handle.await;
    }

    if interrupted {
        std::process::exit(130);
    }
    Ok(())
}
