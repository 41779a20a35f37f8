//! Backend AND/OR worker.
//!
//! A worker owns one UDP socket and serves a single operator. Items arrive
//! grouped in cohorts: every item names its session, its index in the cohort
//! and the cohort size, so the first item of a cohort tells the worker how many
//! more to wait for. Once a cohort is complete the worker computes every
//! result and replies to the address the items came from.
//!
//! Cohorts are keyed by sender and session, so two edge sessions with cohorts
//! of the same size never mix. Bad input only ever costs the cohort it belongs
//! to; the worker keeps serving.

use std::{
    collections::{HashMap, hash_map::Entry},
    future::Future,
    net::SocketAddr,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use tokio::{net::UdpSocket, select};
use tracing::{debug, info, warn};

use crate::{
    bits::{BitString, Operator},
    error::ProtocolError,
    job::MAX_BATCH_SIZE,
    message::{SessionId, WorkerReply, WorkerRequest, decode_datagram, encode_datagram},
};

pub const DEFAULT_COHORT_TTL: Duration = Duration::from_secs(30);

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const MAX_DATAGRAM_BYTES: usize = 2048;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub operator: Operator,
    pub listen: SocketAddr,
    /// How long an incomplete cohort may wait for its remaining items.
    pub cohort_ttl: Duration,
}

pub struct Worker {
    socket: UdpSocket,
    operator: Operator,
    cohort_ttl: Duration,
}

impl Worker {
    pub async fn bind(config: WorkerConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.listen)
            .await
            .with_context(|| {
                format!(
                    "failed to bind {} worker on {}",
                    config.operator, config.listen
                )
            })?;
        Ok(Self {
            socket,
            operator: config.operator,
            cohort_ttl: config.cohort_ttl,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        let mut cohorts = CohortTable::new(self.operator, self.cohort_ttl);
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        let mut buffer = vec![0u8; MAX_DATAGRAM_BYTES];

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(operator = %self.operator, "worker shutting down");
                    break;
                }
                _ = sweep.tick() => {
                    let evicted = cohorts.evict_stale(Instant::now());
                    if evicted > 0 {
                        warn!(
                            operator = %self.operator,
                            evicted,
                            "dropped incomplete cohorts after ttl"
                        );
                    }
                }
                received = self.socket.recv_from(&mut buffer) => {
                    match received {
                        Ok((len, peer)) => {
                            self.handle_datagram(&buffer[..len], peer, &mut cohorts).await
                        }
                        Err(err) => warn!(error = ?err, "failed to receive datagram"),
                    }
                }
            }
        }

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

    async fn handle_datagram(&self, payload: &[u8], peer: SocketAddr, cohorts: &mut CohortTable) {
        let request = match decode_datagram::<WorkerRequest>(payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(%peer, error = %err, "dropping malformed job datagram");
                return;
            }
        };

        let session = request.session;
        match cohorts.accept(peer, request) {
            Ok(Some(results)) => {
                info!(
                    operator = %self.operator,
                    session,
                    jobs = results.len(),
                    "received all jobs of cohort and finished computations"
                );
                self.send_results(peer, session, results).await;
            }
            Ok(None) => {}
            Err(err) => warn!(%peer, session, error = %err, "rejected cohort item"),
        }
    }

    async fn send_results(
        &self,
        peer: SocketAddr,
        session: SessionId,
        results: Vec<(usize, BitString)>,
    ) {
        let total = results.len();
        for (cohort_index, result) in results {
            let reply = WorkerReply {
                session,
                operator: self.operator,
                cohort_index,
                result,
            };
            let sent = match encode_datagram(&reply) {
                Ok(payload) => self.socket.send_to(&payload, peer).await,
                Err(err) => Err(err),
            };
            if let Err(err) = sent {
                warn!(
                    %peer,
                    session,
                    cohort_index,
                    error = ?err,
                    "failed to send result, abandoning cohort"
                );
                return;
            }
        }
        info!(
            operator = %self.operator,
            session,
            results = total,
            "sent all results to the edge"
        );
    }
}

type CohortKey = (SocketAddr, SessionId);

/// Items of one cohort, slotted by cohort index.
#[derive(Debug)]
struct Cohort {
    items: Vec<Option<(BitString, BitString)>>,
    received: usize,
    started: Instant,
}

impl Cohort {
    fn new(size: usize, now: Instant) -> Result<Self, ProtocolError> {
        if !(1..=MAX_BATCH_SIZE).contains(&size) {
            return Err(ProtocolError::CohortSizeOutOfRange(size));
        }
        Ok(Self {
            items: vec![None; size],
            received: 0,
            started: now,
        })
    }

    fn size(&self) -> usize {
        self.items.len()
    }

    fn is_complete(&self) -> bool {
        self.received == self.size()
    }

    fn compute(self, operator: Operator) -> Vec<(usize, BitString)> {
        self.items
            .into_iter()
            .enumerate()
            .filter_map(|(index, item)| {
                item.map(|(a, b)| {
                    let result = operator.apply(&a, &b);
                    info!("{a} {operator} {b} = {result}");
                    (index, result)
                })
            })
            .collect()
    }
}

/// Cohorts currently being collected by one worker.
struct CohortTable {
    operator: Operator,
    ttl: Duration,
    cohorts: HashMap<CohortKey, Cohort>,
}

impl CohortTable {
    fn new(operator: Operator, ttl: Duration) -> Self {
        Self {
            operator,
            ttl,
            cohorts: HashMap::new(),
        }
    }

    /// Adds an item; returns the computed cohort once its last item arrives.
    ///
    /// Errors other than a duplicate item abandon the whole cohort.
    fn accept(
        &mut self,
        peer: SocketAddr,
        request: WorkerRequest,
    ) -> Result<Option<Vec<(usize, BitString)>>, ProtocolError> {
        let key = (peer, request.session);

        let operator = self.operator;

        let cohort = match self.cohorts.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let cohort = Cohort::new(request.cohort_size, Instant::now())?;
                debug!(
                    %peer,
                    session = request.session,
                    size = cohort.size(),
                    "started receiving cohort"
                );
                entry.insert(cohort)
            }
        };

        if let Err(err) = Self::place(operator, cohort, request) {
            if !matches!(err, ProtocolError::DuplicateItem(_)) {
                self.cohorts.remove(&key);
            }
            return Err(err);
        }

        if !cohort.is_complete() {
            return Ok(None);
        }
        Ok(self
            .cohorts
            .remove(&key)
            .map(|cohort| cohort.compute(operator)))
    }

    fn place(
        operator: Operator,
        cohort: &mut Cohort,
        request: WorkerRequest,
    ) -> Result<(), ProtocolError> {
        if request.cohort_size != cohort.size() {
            return Err(ProtocolError::CohortSizeMismatch {
                expected: cohort.size(),
                found: request.cohort_size,
            });
        }
        let size = cohort.size();
        let slot = cohort
            .items
            .get_mut(request.cohort_index)
            .ok_or(ProtocolError::CohortIndexOutOfRange {
                operator,
                index: request.cohort_index,
                size,
            })?;
        if slot.is_some() {
            return Err(ProtocolError::DuplicateItem(request.cohort_index));
        }
        *slot = Some((request.operand1, request.operand2));
        cohort.received += 1;
        Ok(())
    }

    fn evict_stale(&mut self, now: Instant) -> usize {
        let before = self.cohorts.len();
        let ttl = self.ttl;
        self.cohorts
            .retain(|_, cohort| now.saturating_duration_since(cohort.started) < ttl);
        before - self.cohorts.len()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.cohorts.len()
    }
}
