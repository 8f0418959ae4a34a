// src/bin/railyardctl.rs
//
// =============================================================================
// RAILYARDCTL
// =============================================================================
//
// Thin management CLI over the master's HTTP API: submit, list, show,
// cancel jobs; list nodes.

use clap::{Parser, Subcommand};
use railyard::client::MasterClient;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "railyardctl", about = "Manage a Railyard cluster")]
struct Cli {
    #[arg(long, env = "RAILYARD_MASTER_URL")]
    master_url: String,

    #[arg(long, env = "RAILYARD_TOKEN")]
    auth_token: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit a job from a JSON file or inline JSON string.
    Submit {
        #[arg(long)]
        json: String,
    },
    /// List known jobs.
    ListJobs,
    /// Show one job's full record.
    ShowJob { id: Uuid },
    /// Cancel a job.
    Cancel { id: Uuid },
    /// List registered nodes.
    ListNodes,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let client = MasterClient::new(cli.master_url, cli.auth_token);

    match cli.command {
        Command::Submit { json } => {
            let body: serde_json::Value = if let Ok(from_file) = std::fs::read_to_string(&json) {
                serde_json::from_str(&from_file)?
            } else {
                serde_json::from_str(&json)?
            };
            let job_id = client.submit_job(body).await?;
            println!("{job_id}");
        }
        Command::ListJobs => {
            let jobs = client.list_jobs().await?;
            for job in jobs {
                println!("{}\t{}\t{}", job.id, job.status.as_str(), job.scenario);
            }
        }
        Command::ShowJob { id } => {
            let job = client.job_status(id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Command::Cancel { id } => {
            let job = client.cancel_job(id).await?;
            println!("{} -> {}", job.id, job.status.as_str());
        }
        Command::ListNodes => {
            let nodes = client.list_nodes().await?;
            for node in nodes {
                println!("{}\t{}\t{:?}", node.id, node.address, node.hardware.node_class);
            }
        }
    }

    Ok(())
}
