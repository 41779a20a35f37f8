use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::PathBuf,
};

use clap::{Args, Parser, Subcommand};

use crate::bits::Operator;

pub const DEFAULT_EDGE_ADDR: SocketAddr = localhost(23926);
pub const DEFAULT_EDGE_UDP_ADDR: SocketAddr = localhost(24926);
pub const DEFAULT_AND_WORKER_ADDR: SocketAddr = localhost(22926);
pub const DEFAULT_OR_WORKER_ADDR: SocketAddr = localhost(21926);

const fn localhost(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the edge server, routing client batches to the AND and OR workers.
    Edge(EdgeArgs),
    /// Run a backend worker for one operator.
    Worker(WorkerArgs),
    /// Submit a file of jobs to the edge and print the results.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct EdgeArgs {
    /// TCP address clients connect to. Use port 0 for an ephemeral port.
    #[arg(long, default_value_t = DEFAULT_EDGE_ADDR)]
    pub listen: SocketAddr,

    /// UDP address used to talk to the workers.
    #[arg(long, default_value_t = DEFAULT_EDGE_UDP_ADDR)]
    pub udp: SocketAddr,

    /// Address of the AND worker.
    #[arg(long, default_value_t = DEFAULT_AND_WORKER_ADDR)]
    pub and_worker: SocketAddr,

    /// Address of the OR worker.
    #[arg(long, default_value_t = DEFAULT_OR_WORKER_ADDR)]
    pub or_worker: SocketAddr,

    /// How long a session waits for worker results before failing the missing jobs.
    #[arg(long, default_value_t = 2000)]
    pub reply_timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Operator this worker computes: `and` or `or`.
    #[arg(long)]
    pub operator: Operator,

    /// UDP address to bind. Defaults to the operator's standard port.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Seconds an incomplete cohort is kept before it is dropped.
    #[arg(long, default_value_t = 30)]
    pub cohort_ttl_secs: u64,
}

impl WorkerArgs {
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen.unwrap_or(match self.operator {
            Operator::And => DEFAULT_AND_WORKER_ADDR,
            Operator::Or => DEFAULT_OR_WORKER_ADDR,
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Input file with one `operator,operand1,operand2` job per line.
    pub input: PathBuf,

    /// Address of the edge server.
    #[arg(long, default_value_t = DEFAULT_EDGE_ADDR)]
    pub edge: SocketAddr,
}
