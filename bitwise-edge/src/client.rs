use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    job::{JobOutcome, JobSpec, parse_jobs},
    message::{ClientToEdge, EdgeToClient, read_message, write_message},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let input = tokio::fs::read_to_string(&args.input)
        .await
        .with_context(|| format!("unable to open {}", args.input.display()))?;
    let jobs = parse_jobs(&input)
        .with_context(|| format!("invalid input in {}", args.input.display()))?;

    let outcomes = submit(args.edge, &jobs).await?;
    render_outcomes(&jobs, &outcomes).await?;

    let failed = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, JobOutcome::Failed(_)))
        .count();
    anyhow::ensure!(failed == 0, "{failed} of {} jobs failed", jobs.len());
    Ok(())
}

/// Sends a batch to the edge and waits for one outcome per job, in order.
pub async fn submit(edge: SocketAddr, jobs: &[JobSpec]) -> Result<Vec<JobOutcome>> {
    let stream = TcpStream::connect(edge)
        .await
        .with_context(|| format!("failed to connect to {edge}"))?;
    info!("connected to edge at {edge}");

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    send_jobs(&mut writer, jobs).await?;
    info!(jobs = jobs.len(), "finished sending jobs to the edge");

    let outcomes = receive_outcomes(&mut reader, jobs.len()).await?;
    info!("finished receiving all computation results from the edge");

    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
    Ok(outcomes)
}

async fn send_jobs<W>(writer: &mut W, jobs: &[JobSpec]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    for job in jobs {
        write_message(
            writer,
            &ClientToEdge::Job {
                operator: job.operator,
                operand1: job.operand1.clone(),
                operand2: job.operand2.clone(),
                batch_size: jobs.len(),
            },
        )
        .await
        .context("failed to send job")?;
    }
    Ok(())
}

async fn receive_outcomes<R>(reader: &mut R, expected: usize) -> Result<Vec<JobOutcome>>
where
    R: AsyncBufRead + Unpin,
{
    let mut outcomes = Vec::with_capacity(expected);
    while outcomes.len() < expected {
        let message = read_message::<_, EdgeToClient>(reader)
            .await
            .context("failed to read result")?;

        match message {
            Some(EdgeToClient::Result { result }) => outcomes.push(JobOutcome::Completed(result)),
            Some(EdgeToClient::Failed { reason }) => outcomes.push(JobOutcome::Failed(reason)),
            Some(EdgeToClient::Error { message }) => {
                anyhow::bail!("edge rejected the batch: {message}")
            }
            None => anyhow::bail!(
                "edge closed the connection after {} of {expected} results",
                outcomes.len()
            ),
        }
    }
    Ok(outcomes)
}

async fn render_outcomes(jobs: &[JobSpec], outcomes: &[JobOutcome]) -> io::Result<()> {
    for (job, outcome) in jobs.iter().zip(outcomes) {
        match outcome {
            JobOutcome::Completed(result) => write_stdout(result.as_str()).await?,
            JobOutcome::Failed(reason) => {
                write_stderr(&format!(
                    "!!! {},{},{} failed: {reason}",
                    job.operator, job.operand1, job.operand2
                ))
                .await?
            }
        }
    }
    Ok(())
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
