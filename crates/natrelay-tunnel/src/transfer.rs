//! Bidirectional byte pump
//!
//! A tunnel pairs a consumer stream with a reverse stream. Two pumps copy
//! bytes in each direction; the first one to stop ends the tunnel and both
//! streams are shut down and dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::classify::TransferError;

/// Read buffer size for each pump direction
pub const CHUNK_SIZE: usize = 81920;

/// Byte counters for one tunnel, or for a whole process
#[derive(Debug, Default)]
pub struct TrafficCounters {
    /// Consumer to client
    sent: AtomicU64,
    /// Client to consumer
    received: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    fn add(&self, direction: Direction, n: u64) {
        match direction {
            Direction::ToReverse => self.sent.fetch_add(n, Ordering::Relaxed),
            Direction::ToConsumer => self.received.fetch_add(n, Ordering::Relaxed),
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ToReverse,
    ToConsumer,
}

/// Why a tunnel stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    ConsumerClosed,
    ReverseClosed,
    Disconnected,
    Fault,
    Cancelled,
}

/// Summary returned once a tunnel is torn down
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub tunnel_id: Uuid,
    pub sent: u64,
    pub received: u64,
    pub reason: EndReason,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// One consumer/reverse pairing
pub struct TunnelSession {
    id: Uuid,
    started_at: DateTime<Utc>,
    counters: Arc<TrafficCounters>,
    totals: Option<Arc<TrafficCounters>>,
    cancel: CancellationToken,
}

impl TunnelSession {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            counters: Arc::new(TrafficCounters::new()),
            totals: None,
            cancel,
        }
    }

    /// Also account bytes into process-wide counters
    pub fn with_totals(mut self, totals: Arc<TrafficCounters>) -> Self {
        self.totals = Some(totals);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn counters(&self) -> Arc<TrafficCounters> {
        self.counters.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn account(&self, direction: Direction, n: usize) {
        self.counters.add(direction, n as u64);
        if let Some(totals) = &self.totals {
            totals.add(direction, n as u64);
        }
    }

    /// Pump bytes between `consumer` and `reverse` until either side stops
    /// or the session is cancelled. Both streams are dropped on return.
    pub async fn bridge<C, R>(self, consumer: C, reverse: R) -> TransferOutcome
    where
        C: AsyncRead + AsyncWrite + Unpin,
        R: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut consumer_read, mut consumer_write) = tokio::io::split(consumer);
        let (mut reverse_read, mut reverse_write) = tokio::io::split(reverse);

        debug!(tunnel_id = %self.id, "Tunnel started");

        let reason = tokio::select! {
            result = pump(&mut consumer_read, &mut reverse_write, &self, Direction::ToReverse) => {
                self.end_reason(result, EndReason::ConsumerClosed)
            }
            result = pump(&mut reverse_read, &mut consumer_write, &self, Direction::ToConsumer) => {
                self.end_reason(result, EndReason::ReverseClosed)
            }
            _ = self.cancel.cancelled() => EndReason::Cancelled,
        };

        let _ = consumer_write.shutdown().await;
        let _ = reverse_write.shutdown().await;

        let outcome = TransferOutcome {
            tunnel_id: self.id,
            sent: self.counters.sent(),
            received: self.counters.received(),
            reason,
            started_at: self.started_at,
            ended_at: Utc::now(),
        };

        debug!(
            tunnel_id = %outcome.tunnel_id,
            sent = outcome.sent,
            received = outcome.received,
            reason = ?outcome.reason,
            "Tunnel closed"
        );

        outcome
    }

    fn end_reason(&self, result: Result<(), TransferError>, eof: EndReason) -> EndReason {
        match result {
            Ok(()) => eof,
            Err(TransferError::Disconnect(e)) => {
                debug!(tunnel_id = %self.id, error = %e, "Tunnel peer disconnected");
                EndReason::Disconnected
            }
            Err(TransferError::Fault(e)) => {
                warn!(tunnel_id = %self.id, error = %e, "Tunnel transfer failed");
                EndReason::Fault
            }
        }
    }
}

async fn pump<Rd, Wr>(
    reader: &mut Rd,
    writer: &mut Wr,
    session: &TunnelSession,
    direction: Direction,
) -> Result<(), TransferError>
where
    Rd: AsyncRead + Unpin,
    Wr: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buffer[..n]).await?;
        writer.flush().await?;
        session.account(direction, n);
    }
}
