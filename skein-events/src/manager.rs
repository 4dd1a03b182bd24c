//! Subscriber fan-out.
//!
//! The manager owns the set of live subscribers. Each subscriber has a
//! bounded outbound queue; broadcast never blocks, and a subscriber whose
//! queue is full is disconnected rather than shown a gap — the log is
//! durable and it can reconnect with a cursor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use skein_repo::{CommitHook, CommitResult};

use crate::error::EventError;
use crate::frames::{self, CommitInfo};
use crate::persister::EventStore;

/// Default per-subscriber frame buffer.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

struct SubEntry {
    tx: mpsc::Sender<(i64, Bytes)>,
    token: CancellationToken,
}

/// Sequences, persists, and fans out commit events.
pub struct EventManager<S> {
    store: S,
    capacity: usize,
    subs: RwLock<HashMap<u64, SubEntry>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl<S: EventStore> EventManager<S> {
    pub fn new(store: S, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
            subs: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Persists a commit event and broadcasts its frame. Returns the
    /// assigned sequence number. Only persistence failures are errors;
    /// broadcast is best-effort once the event is durable.
    pub async fn emit(&self, info: &CommitInfo) -> Result<i64, EventError> {
        let payload = frames::encode_commit_payload(info)?;
        let seq = self.store.persist("commit", &info.did, &payload).await?;
        let frame = Bytes::from(frames::frame_from_payload(seq, &payload)?);
        self.broadcast(seq, frame);
        Ok(seq)
    }

    fn broadcast(&self, seq: i64, frame: Bytes) {
        let mut slow = Vec::new();
        {
            let subs = self.subs.read();
            for (id, entry) in subs.iter() {
                if entry.token.is_cancelled() {
                    continue;
                }
                match entry.tx.try_send((seq, frame.clone())) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(subscriber = *id, seq, "disconnecting slow firehose subscriber");
                        slow.push(*id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => slow.push(*id),
                }
            }
        }
        for id in slow {
            if let Some(entry) = self.subs.write().remove(&id) {
                entry.token.cancel();
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.read().len()
    }

    /// Disconnects every subscriber and stops replay tasks.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.subs.write().clear();
    }
}

impl<S: EventStore + 'static> EventManager<S> {
    /// Registers a subscriber. With `since`, events after that cursor are
    /// replayed before live frames; the subscriber is registered for live
    /// delivery *before* replay starts, so nothing emitted in between is
    /// lost. Duplicates around the boundary are suppressed by sequence
    /// number in [`Subscription::next_frame`].
    pub fn subscribe(self: &Arc<Self>, since: Option<i64>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        let (live_tx, live_rx) = mpsc::channel(self.capacity);

        self.subs.write().insert(
            id,
            SubEntry {
                tx: live_tx,
                token: token.clone(),
            },
        );

        // Deregister whenever the subscriber is cancelled, from wherever.
        let weak = Arc::downgrade(self);
        let cleanup_token = token.clone();
        tokio::spawn(async move {
            cleanup_token.cancelled().await;
            if let Some(manager) = weak.upgrade() {
                manager.subs.write().remove(&id);
            }
        });

        let replay_rx = since.map(|since| {
            let (replay_tx, replay_rx) = mpsc::channel(self.capacity);
            let manager = Arc::clone(self);
            let replay_token = token.clone();
            tokio::spawn(async move {
                let mut stream = manager.store.replay(since);
                loop {
                    tokio::select! {
                        _ = replay_token.cancelled() => break,
                        item = stream.next() => match item {
                            Some(Ok(frame)) => {
                                tokio::select! {
                                    _ = replay_token.cancelled() => break,
                                    sent = replay_tx.send(frame) => {
                                        if sent.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                            Some(Err(err)) => {
                                warn!(subscriber = id, "firehose replay failed: {err}");
                                replay_token.cancel();
                                break;
                            }
                            None => break,
                        },
                    }
                }
                debug!(subscriber = id, "firehose replay finished");
            });
            replay_rx
        });

        Subscription {
            replay_rx,
            live_rx,
            last_seq: None,
            token,
        }
    }
}

#[async_trait]
impl<S: EventStore + 'static> CommitHook for EventManager<S> {
    async fn on_commit(&self, did: &str, result: &CommitResult) -> anyhow::Result<()> {
        let info = CommitInfo::from_result(did, result, Utc::now());
        self.emit(&info).await?;
        Ok(())
    }
}

/// One subscriber's receive side: replayed frames first, then live frames,
/// monotone in sequence number with boundary duplicates suppressed.
pub struct Subscription {
    replay_rx: Option<mpsc::Receiver<(i64, Bytes)>>,
    live_rx: mpsc::Receiver<(i64, Bytes)>,
    last_seq: Option<i64>,
    token: CancellationToken,
}

impl Subscription {
    /// The next frame, or `None` once the subscription is closed (by
    /// cancellation, slow-consumer disconnection, or manager shutdown).
    pub async fn next_frame(&mut self) -> Option<Bytes> {
        if let Some(replay_rx) = &mut self.replay_rx {
            match replay_rx.recv().await {
                Some((seq, frame)) => {
                    self.last_seq = Some(seq);
                    return Some(frame);
                }
                None => self.replay_rx = None,
            }
        }
        loop {
            let (seq, frame) = self.live_rx.recv().await?;
            if self.last_seq.is_some_and(|last| seq <= last) {
                continue;
            }
            self.last_seq = Some(seq);
            return Some(frame);
        }
    }

    /// Sequence number of the last delivered frame.
    pub fn last_seq(&self) -> Option<i64> {
        self.last_seq
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use libipld::Ipld;

    use crate::persister::MemEventStore;

    use super::*;

    fn manager(capacity: usize) -> Arc<EventManager<MemEventStore>> {
        Arc::new(EventManager::new(MemEventStore::new(), capacity))
    }

    fn info(tag: &str) -> CommitInfo {
        CommitInfo {
            did: "did:plc:subject".to_string(),
            rev: format!("3l{tag}"),
            prev_rev: None,
            commit_cid: skein_repo::records::cid_for_cbor(tag.as_bytes()),
            prev_data: None,
            diff_car: Bytes::from_static(b"car"),
            ops: Vec::new(),
            time: Utc::now(),
        }
    }

    fn frame_seq(frame: &Bytes) -> i64 {
        let (_, body) = frames::decode_frame(frame).unwrap();
        let Ipld::Map(body) = body else { panic!() };
        let Some(Ipld::Integer(seq)) = body.get("seq") else {
            panic!("frame has no seq")
        };
        *seq as i64
    }

    #[tokio::test]
    async fn emit_assigns_strictly_increasing_seqs() {
        let manager = manager(8);
        let a = manager.emit(&info("a")).await.unwrap();
        let b = manager.emit(&info("b")).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn live_subscriber_receives_frames_in_order() {
        let manager = manager(8);
        let mut sub = manager.subscribe(None);

        for tag in ["a", "b", "c"] {
            manager.emit(&info(tag)).await.unwrap();
        }

        let seqs: Vec<_> = [
            sub.next_frame().await.unwrap(),
            sub.next_frame().await.unwrap(),
            sub.next_frame().await.unwrap(),
        ]
        .iter()
        .map(frame_seq)
        .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn cursor_subscriber_replays_then_goes_live() {
        let manager = manager(8);
        for tag in ["a", "b", "c"] {
            manager.emit(&info(tag)).await.unwrap();
        }

        let mut sub = manager.subscribe(Some(1));
        let first = sub.next_frame().await.unwrap();
        let second = sub.next_frame().await.unwrap();
        assert_eq!(frame_seq(&first), 2);
        assert_eq!(frame_seq(&second), 3);

        manager.emit(&info("d")).await.unwrap();
        let live = sub.next_frame().await.unwrap();
        assert_eq!(frame_seq(&live), 4);
    }

    #[tokio::test]
    async fn no_gaps_or_duplicates_across_the_replay_boundary() {
        let manager = manager(64);
        for tag in ["a", "b"] {
            manager.emit(&info(tag)).await.unwrap();
        }

        // Subscribe with a cursor, then keep emitting while replay runs.
        let mut sub = manager.subscribe(Some(0));
        for i in 0..10 {
            manager.emit(&info(&format!("live{i}"))).await.unwrap();
        }

        let mut seqs = Vec::new();
        for _ in 0..12 {
            seqs.push(frame_seq(&sub.next_frame().await.unwrap()));
        }
        assert_eq!(seqs, (1..=12).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn slow_consumer_is_disconnected_without_blocking_others() {
        let manager = manager(2);
        let mut slow = manager.subscribe(None);
        let mut healthy = manager.subscribe(None);
        assert_eq!(manager.subscriber_count(), 2);

        // The slow subscriber never reads; its 2-slot queue overflows on
        // the third emit. The healthy subscriber drains as it goes and
        // sees everything.
        for i in 0..3i64 {
            manager.emit(&info(&format!("n{i}"))).await.unwrap();
            assert_eq!(frame_seq(&healthy.next_frame().await.unwrap()), i + 1);
        }
        assert_eq!(manager.subscriber_count(), 1);

        // The slow subscriber's channel is closed after its buffered frames.
        assert_eq!(frame_seq(&slow.next_frame().await.unwrap()), 1);
        assert_eq!(frame_seq(&slow.next_frame().await.unwrap()), 2);
        assert!(slow.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn cancel_removes_the_subscriber() {
        let manager = manager(8);
        let sub = manager.subscribe(None);
        assert_eq!(manager.subscriber_count(), 1);

        sub.cancel();
        // The cleanup task deregisters on cancellation.
        for _ in 0..100 {
            if manager.subscriber_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(manager.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close_disconnects_every_subscriber() {
        let manager = manager(8);
        let mut a = manager.subscribe(None);
        let mut b = manager.subscribe(Some(0));

        manager.close();
        assert_eq!(manager.subscriber_count(), 0);
        assert!(a.next_frame().await.is_none());
        assert!(b.next_frame().await.is_none());
    }
}
