use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, UdpSocket},
    select,
    sync::{Mutex, mpsc},
    time::{Instant, timeout_at},
};
use tracing::{debug, info, warn};

use crate::{
    bits::Operator,
    error::ProtocolError,
    job::{Batch, JobOutcome, JobSpec},
    message::{
        ClientToEdge, EdgeToClient, SessionId, WorkerReply, decode_datagram, encode_datagram,
        read_message, write_message,
    },
};

pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

const MAX_DATAGRAM_BYTES: usize = 2048;

/// Where the workers live and how long a session waits for them.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub and_worker: SocketAddr,
    pub or_worker: SocketAddr,
    pub reply_timeout: Duration,
}

impl EdgeConfig {
    fn worker_addr(&self, operator: Operator) -> SocketAddr {
        match operator {
            Operator::And => self.and_worker,
            Operator::Or => self.or_worker,
        }
    }
}

pub struct Edge {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
}

impl Edge {
    /// `socket` is the one UDP socket every session uses to reach the workers.
    pub fn new(listener: TcpListener, socket: UdpSocket, config: EdgeConfig) -> Self {
        Self {
            listener,
            dispatcher: Arc::new(Dispatcher::new(socket, config)),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn worker_socket_addr(&self) -> std::io::Result<SocketAddr> {
        self.dispatcher.socket.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Edge {
            listener,
            dispatcher,
        } = self;
        tokio::pin!(shutdown);

        let reply_loop = tokio::spawn(run_reply_loop(Arc::clone(&dispatcher)));

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("edge shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &dispatcher);
                }
            }
        }

        reply_loop.abort();
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    dispatcher: &Arc<Dispatcher>,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, dispatcher),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, dispatcher: &Arc<Dispatcher>) {
    let dispatcher = Arc::clone(dispatcher);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, peer, dispatcher).await {
            warn!(peer = %peer, error = ?err, "client session failed");
        }
    });
}

/// Sends jobs to the workers and routes their replies back to sessions.
struct Dispatcher {
    socket: UdpSocket,
    config: EdgeConfig,
    sessions: Mutex<HashMap<SessionId, mpsc::UnboundedSender<WorkerReply>>>,
    next_session: AtomicU64,
}

impl Dispatcher {
    fn new(socket: UdpSocket, config: EdgeConfig) -> Self {
        Self {
            socket,
            config,
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(initial_session_id()),
        }
    }

    async fn open_session(&self) -> (SessionId, mpsc::UnboundedReceiver<WorkerReply>) {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.lock().await.insert(session, tx);
        (session, rx)
    }

    async fn close_session(&self, session: SessionId) {
        self.sessions.lock().await.remove(&session);
    }

    /// Hands a reply to the session it names; false if that session is gone.
    async fn route(&self, reply: WorkerReply) -> bool {
        let sessions = self.sessions.lock().await;
        match sessions.get(&reply.session) {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Runs one batch through the workers, settling every job.
    async fn execute(&self, batch: &mut Batch) -> Result<()> {
        let (session, mut replies) = self.open_session().await;
        let outcome = self.run_session(session, batch, &mut replies).await;
        self.close_session(session).await;
        outcome
    }

    async fn run_session(
        &self,
        session: SessionId,
        batch: &mut Batch,
        replies: &mut mpsc::UnboundedReceiver<WorkerReply>,
    ) -> Result<()> {
        self.dispatch(session, batch).await?;

        let deadline = Instant::now() + self.config.reply_timeout;
        while !batch.is_settled() {
            match timeout_at(deadline, replies.recv()).await {
                Ok(Some(reply)) => apply_reply(session, batch, reply),
                Ok(None) => anyhow::bail!("reply channel for session {session} closed"),
                Err(_) => {
                    let failed = batch.fail_pending("no result from worker before the deadline");
                    warn!(session, failed, "timed out waiting for worker results");
                }
            }
        }

        info!(session, "finished receiving computation results from the workers");
        Ok(())
    }

    async fn dispatch(&self, session: SessionId, batch: &Batch) -> Result<()> {
        for (operator, request) in batch.worker_requests(session) {
            let addr = self.config.worker_addr(operator);
            let payload = encode_datagram(&request)?;
            self.socket
                .send_to(&payload, addr)
                .await
                .with_context(|| {
                    format!("failed to send job to {operator} worker at {addr}")
                })?;
        }

        for operator in Operator::ALL {
            info!(
                session,
                %operator,
                lines = batch.cohort_size(operator),
                worker = %self.config.worker_addr(operator),
                "sent jobs to worker"
            );
        }
        Ok(())
    }
}

/// Session ids continue from the wall clock so a restarted edge does not
/// reuse ids that workers may still hold incomplete cohorts for.
fn initial_session_id() -> SessionId {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as SessionId)
        .unwrap_or(1)
}

fn apply_reply(session: SessionId, batch: &mut Batch, reply: WorkerReply) {
    let WorkerReply {
        operator,
        cohort_index,
        result,
        ..
    } = reply;

    match batch.record(operator, cohort_index, result) {
        Ok(position) => {
            debug!(session, %operator, cohort_index, position, "recorded worker result")
        }
        Err(err) => warn!(session, error = %err, "ignoring worker reply"),
    }
}

async fn run_reply_loop(dispatcher: Arc<Dispatcher>) {
    let mut buffer = vec![0u8; MAX_DATAGRAM_BYTES];
    loop {
        let (len, peer) = match dispatcher.socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(err) => {
                warn!(error = ?err, "failed to receive worker reply");
                continue;
            }
        };

        let reply = match decode_datagram::<WorkerReply>(&buffer[..len]) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(%peer, error = %err, "dropping malformed worker reply");
                continue;
            }
        };

        let session = reply.session;
        if !dispatcher.route(reply).await {
            warn!(%peer, session, "dropping reply for unknown or finished session");
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = writer;

    let mut batch = match receive_batch(&mut reader).await {
        Ok(batch) => batch,
        Err(err) => {
            reject_session(&mut writer, &err).await;
            return Err(err);
        }
    };
    info!(peer = %peer, jobs = batch.jobs().len(), "received jobs from client");

    if let Err(err) = dispatcher.execute(&mut batch).await {
        reject_session(&mut writer, &err).await;
        return Err(err);
    }
    log_results(&batch);

    send_results(&mut writer, &batch).await?;
    info!(peer = %peer, "finished sending all computation results to client");

    if let Err(err) = writer.shutdown().await {
        debug!(peer = %peer, error = ?err, "failed to shutdown client writer cleanly");
    }
    Ok(())
}

/// Reads a complete batch; nothing is dispatched unless every job is valid.
async fn receive_batch<R>(reader: &mut R) -> Result<Batch>
where
    R: AsyncBufRead + Unpin,
{
    let Some((first, batch_size)) = next_job(reader).await? else {
        anyhow::bail!("connection closed before any job");
    };

    let mut batch = Batch::with_size(batch_size)?;
    batch.push(first)?;

    while !batch.is_full() {
        let Some((spec, restated)) = next_job(reader).await? else {
            anyhow::bail!(
                "connection closed after {} of {} jobs",
                batch.jobs().len(),
                batch.expected_size()
            );
        };
        if restated != batch_size {
            return Err(ProtocolError::BatchSizeMismatch {
                expected: batch_size,
                found: restated,
            }
            .into());
        }
        batch.push(spec)?;
    }

    Ok(batch)
}

async fn next_job<R>(reader: &mut R) -> Result<Option<(JobSpec, usize)>>
where
    R: AsyncBufRead + Unpin,
{
    let message = read_message::<_, ClientToEdge>(reader)
        .await
        .context("failed to read job from client")?;

    Ok(message.map(
        |ClientToEdge::Job {
             operator,
             operand1,
             operand2,
             batch_size,
         }| {
            (
                JobSpec {
                    operator,
                    operand1,
                    operand2,
                },
                batch_size,
            )
        },
    ))
}

async fn reject_session<W>(writer: &mut W, err: &anyhow::Error)
where
    W: AsyncWrite + Unpin,
{
    let message = EdgeToClient::Error {
        message: format!("{err:#}"),
    };
    if let Err(write_err) = write_message(writer, &message).await {
        debug!(error = ?write_err, "failed to notify client about rejected session");
    }
}

async fn send_results<W>(writer: &mut W, batch: &Batch) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    for job in batch.jobs() {
        let message = match &job.outcome {
            Some(JobOutcome::Completed(result)) => EdgeToClient::Result {
                result: result.clone(),
            },
            Some(JobOutcome::Failed(reason)) => EdgeToClient::Failed {
                reason: reason.clone(),
            },
            None => EdgeToClient::Failed {
                reason: "job was never settled".to_string(),
            },
        };
        write_message(writer, &message)
            .await
            .context("failed to send result to client")?;
    }
    Ok(())
}

fn log_results(batch: &Batch) {
    for job in batch.jobs() {
        let spec = &job.spec;
        match &job.outcome {
            Some(JobOutcome::Completed(result)) => info!(
                "{} {} {} = {}",
                spec.operand1, spec.operator, spec.operand2, result
            ),
            Some(JobOutcome::Failed(reason)) => warn!(
                "{} {} {} failed: {}",
                spec.operand1, spec.operator, spec.operand2, reason
            ),
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::BitString;

    fn job(operator: Operator, a: &str, b: &str, batch_size: usize) -> ClientToEdge {
        ClientToEdge::Job {
            operator,
            operand1: BitString::parse(a).expect("valid operand"),
            operand2: BitString::parse(b).expect("valid operand"),
            batch_size,
        }
    }

    async fn receive_from(messages: &[ClientToEdge], trailer: &[u8]) -> Result<Batch> {
        let (mut writer, reader) = tokio::io::duplex(4096);
        for message in messages {
            write_message(&mut writer, message).await?;
        }
        writer.write_all(trailer).await?;
        drop(writer);

        let mut reader = BufReader::new(reader);
        receive_batch(&mut reader).await
    }

    #[tokio::test]
    async fn receives_full_batch_in_order() -> Result<()> {
        let batch = receive_from(
            &[
                job(Operator::And, "1111", "1", 3),
                job(Operator::Or, "0", "0", 3),
                job(Operator::And, "1", "1", 3),
            ],
            b"",
        )
        .await?;

        assert_eq!(batch.jobs().len(), 3);
        assert_eq!(batch.cohort_size(Operator::And), 2);
        assert_eq!(batch.cohort_size(Operator::Or), 1);
        assert_eq!(batch.jobs()[1].spec.operator, Operator::Or);
        Ok(())
    }

    #[tokio::test]
    async fn rejects_mismatched_batch_size() {
        let err = receive_from(
            &[job(Operator::And, "1", "1", 2), job(Operator::Or, "1", "1", 3)],
            b"",
        )
        .await
        .expect_err("mismatch should be rejected");

        assert_eq!(
            err.downcast_ref::<ProtocolError>(),
            Some(&ProtocolError::BatchSizeMismatch {
                expected: 2,
                found: 3
            })
        );
    }

    #[tokio::test]
    async fn rejects_truncated_batch() {
        let err = receive_from(&[job(Operator::And, "1", "1", 3)], b"")
            .await
            .expect_err("truncated batch should be rejected");
        assert!(err.to_string().contains("1 of 3"), "{err}");
    }

    #[tokio::test]
    async fn rejects_malformed_job() {
        let err = receive_from(
            &[job(Operator::And, "1", "1", 2)],
            b"{\"type\":\"job\",\"operator\":\"xor\",\"operand1\":\"1\",\"operand2\":\"1\",\"batch_size\":2}\n",
        )
        .await
        .expect_err("unknown operator should be rejected");
        assert!(format!("{err:#}").contains("failed to read job"), "{err:#}");
    }

    #[tokio::test]
    async fn rejects_oversized_batch() {
        let err = receive_from(&[job(Operator::Or, "1", "1", 101)], b"")
            .await
            .expect_err("oversized batch should be rejected");
        assert_eq!(
            err.downcast_ref::<ProtocolError>(),
            Some(&ProtocolError::BatchSizeOutOfRange(101))
        );
    }

    #[tokio::test]
    async fn replies_for_unknown_sessions_are_not_routed() -> Result<()> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = socket.local_addr()?;
        let dispatcher = Dispatcher::new(
            socket,
            EdgeConfig {
                and_worker: addr,
                or_worker: addr,
                reply_timeout: DEFAULT_REPLY_TIMEOUT,
            },
        );
        let (session, mut rx) = dispatcher.open_session().await;

        let reply = |session| WorkerReply {
            session,
            operator: Operator::And,
            cohort_index: 0,
            result: BitString::parse("1").expect("valid result"),
        };

        assert!(dispatcher.route(reply(session)).await);
        assert!(!dispatcher.route(reply(session + 1)).await);
        assert_eq!(rx.recv().await, Some(reply(session)));

        dispatcher.close_session(session).await;
        assert!(!dispatcher.route(reply(session)).await);
        Ok(())
    }
}
