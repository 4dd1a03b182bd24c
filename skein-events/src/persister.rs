//! Event log persistence.
//!
//! [`PgEventStore`] appends commit events to the `firehose_events` table in
//! the management database; the `BIGSERIAL` column assigns the host-global
//! strictly monotone sequence number. [`MemEventStore`] is the in-memory
//! drop-in used by tests.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use sqlx::PgPool;

use crate::error::EventError;
use crate::frames;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends an event and returns its assigned sequence number.
    async fn persist(&self, event_type: &str, did: &str, payload: &[u8])
        -> Result<i64, EventError>;

    /// Streams `(seq, frame)` for every event with `seq > since`, in
    /// ascending order. Frames are fully encoded (header + body with the
    /// stored sequence number spliced in).
    fn replay(&self, since: i64) -> BoxStream<'_, Result<(i64, Bytes), EventError>>;
}

/// Postgres-backed event log.
#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: &PgPool) -> Self {
        Self { pool: pool.clone() }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn persist(
        &self,
        event_type: &str,
        did: &str,
        payload: &[u8],
    ) -> Result<i64, EventError> {
        let (seq,): (i64,) = sqlx::query_as(
            "INSERT INTO firehose_events (event_type, did, payload) \
             VALUES ($1, $2, $3) RETURNING seq",
        )
        .bind(event_type)
        .bind(did)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;
        Ok(seq)
    }

    fn replay(&self, since: i64) -> BoxStream<'_, Result<(i64, Bytes), EventError>> {
        sqlx::query_as::<_, (i64, Vec<u8>)>(
            "SELECT seq, payload FROM firehose_events WHERE seq > $1 ORDER BY seq ASC",
        )
        .bind(since)
        .fetch(&self.pool)
        .map(|row| {
            let (seq, payload) = row?;
            let frame = frames::frame_from_payload(seq, &payload)?;
            Ok((seq, Bytes::from(frame)))
        })
        .boxed()
    }
}

/// In-memory event log, a drop-in replacement for [`PgEventStore`] in
/// tests.
#[derive(Debug, Default, Clone)]
pub struct MemEventStore {
    inner: Arc<Mutex<MemLog>>,
}

#[derive(Debug, Default)]
struct MemLog {
    next_seq: i64,
    events: Vec<(i64, Vec<u8>)>,
}

impl MemEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }
}

#[async_trait]
impl EventStore for MemEventStore {
    async fn persist(
        &self,
        _event_type: &str,
        _did: &str,
        payload: &[u8],
    ) -> Result<i64, EventError> {
        let mut log = self.inner.lock();
        log.next_seq += 1;
        let seq = log.next_seq;
        log.events.push((seq, payload.to_vec()));
        Ok(seq)
    }

    fn replay(&self, since: i64) -> BoxStream<'_, Result<(i64, Bytes), EventError>> {
        let frames: Vec<Result<(i64, Bytes), EventError>> = self
            .inner
            .lock()
            .events
            .iter()
            .filter(|(seq, _)| *seq > since)
            .map(|(seq, payload)| {
                let frame = frames::frame_from_payload(*seq, payload)?;
                Ok((*seq, Bytes::from(frame)))
            })
            .collect();
        stream::iter(frames).boxed()
    }
}
