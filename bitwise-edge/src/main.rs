use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{info, warn};

use bitwise_edge::{
    cli::{Cli, Command, EdgeArgs, WorkerArgs},
    client,
    edge::{Edge, EdgeConfig},
    worker::{Worker, WorkerConfig},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Edge(args) => run_edge(args).await?,
        Command::Worker(args) => run_worker(args).await?,
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}

async fn run_edge(args: EdgeArgs) -> Result<()> {
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind edge listener on {}", args.listen))?;
    let socket = UdpSocket::bind(args.udp)
        .await
        .with_context(|| format!("failed to bind edge worker socket on {}", args.udp))?;

    let edge = Edge::new(
        listener,
        socket,
        EdgeConfig {
            and_worker: args.and_worker,
            or_worker: args.or_worker,
            reply_timeout: Duration::from_millis(args.reply_timeout_ms),
        },
    );
    info!("edge listening on {}", edge.local_addr()?);
    info!("edge reaching workers from {}", edge.worker_socket_addr()?);

    if let Err(err) = edge.run_until_ctrl_c().await {
        warn!("edge exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<()> {
    let worker = Worker::bind(WorkerConfig {
        operator: args.operator,
        listen: args.listen_addr(),
        cohort_ttl: Duration::from_secs(args.cohort_ttl_secs),
    })
    .await?;
    info!("{} worker listening on {}", worker.operator(), worker.local_addr()?);

    if let Err(err) = worker.run_until_ctrl_c().await {
        warn!("worker exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}
