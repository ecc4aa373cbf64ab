use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::Notify;

use crate::stats::ConnectionStats;

/// The equality token that lets a newer message replace the bytes of an older message that
///  is still queued. Two messages conflate iff their keys compare equal.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ConflationKey(Bytes);

impl ConflationKey {
    pub fn new(key: impl Into<Bytes>) -> ConflationKey {
        ConflationKey(key.into())
    }
}

/// The buffer slot of a conflatable entry. It sits in the queue *and* in the by-key map,
///  so a replacement can swap the bytes without touching the entry's queue position.
struct ConflatedSlot {
    buf: Mutex<Option<BytesMut>>,
}

enum QueueEntry {
    Raw(BytesMut),
    Conflated { key: ConflationKey, slot: Arc<ConflatedSlot> },
}

pub(crate) enum AddOutcome {
    Queued,
    /// the pusher drained the queue in the meantime; the caller gets the buffer back and
    ///  writes it directly instead
    NotQueued(BytesMut),
    /// accepting this buffer would cross the byte ceiling; nothing was queued
    Overflow { would_be_bytes: u64 },
    /// the slow-receiver disconnect has been requested; the message is dropped
    DisconnectRequested,
}

pub(crate) enum TakeOutcome {
    Buffer(BytesMut),
    Drained,
}

/// The ordered sequence of buffers pending an async flush, with its byte accounting and
///  the by-key view the conflator uses.
///
/// All mutation happens under one lock; the pusher and producers synchronize on
///  `queuing_in_progress` falling, signalled through `drained`.
pub(crate) struct OutgoingQueue {
    stats: Arc<ConnectionStats>,
    state: Mutex<QueueState>,
    drained: Notify,
}

struct QueueState {
    entries: VecDeque<QueueEntry>,
    conflated: FxHashMap<ConflationKey, Arc<ConflatedSlot>>,
    queued_bytes: u64,
    queuing_in_progress: bool,
    disconnect_requested: bool,
}

impl OutgoingQueue {
    pub fn new(stats: Arc<ConnectionStats>) -> OutgoingQueue {
        OutgoingQueue {
            stats,
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                conflated: FxHashMap::default(),
                queued_bytes: 0,
                queuing_in_progress: false,
                disconnect_requested: false,
            }),
            drained: Notify::new(),
        }
    }

    /// Append a buffer, conflating against a still-queued predecessor of the same key.
    ///
    /// `conflatable == false` with a key present defeats the key: a pending conflatable
    ///  entry of that key is frozen as-is so nothing replaces bytes that must now keep
    ///  their relative order to this message.
    pub fn add(
        &self,
        frame: BytesMut,
        key: Option<ConflationKey>,
        conflatable: bool,
        force: bool,
        max_queue_size: u64,
    ) -> AddOutcome {
        let new_bytes = frame.len() as u64;
        let mut state = self.state.lock().unwrap();

        if state.disconnect_requested {
            return AddOutcome::DisconnectRequested;
        }
        if !force && !state.queuing_in_progress {
            return AddOutcome::NotQueued(frame);
        }

        if let Some(key) = key {
            if conflatable {
                if let Some(slot) = state.conflated.get(&key).cloned() {
                    // replace the predecessor's bytes in place: the entry keeps the queue
                    //  position of the earliest enqueue
                    let mut slot_buf = slot.buf.lock().unwrap();
                    let old_bytes = slot_buf
                        .as_ref()
                        .expect("a mapped conflation slot always holds a buffer")
                        .len() as u64;

                    let would_be_bytes = state.queued_bytes - old_bytes + new_bytes;
                    if would_be_bytes > max_queue_size {
                        return AddOutcome::Overflow { would_be_bytes };
                    }

                    let old = slot_buf.take().expect("a mapped conflation slot always holds a buffer");

                    let replacement = if old.capacity() >= frame.len() {
                        let mut reused = old;
                        reused.clear();
                        reused.extend_from_slice(&frame);
                        reused
                    } else {
                        frame
                    };
                    *slot_buf = Some(replacement);

                    state.queued_bytes = state.queued_bytes - old_bytes + new_bytes;
                    self.stats.adjust_async_queue_size(new_bytes as i64 - old_bytes as i64);
                    self.stats.inc_async_conflated_msgs();
                    return AddOutcome::Queued;
                }

                let would_be_bytes = state.queued_bytes + new_bytes;
                if would_be_bytes > max_queue_size {
                    return AddOutcome::Overflow { would_be_bytes };
                }

                let slot = Arc::new(ConflatedSlot { buf: Mutex::new(Some(frame)) });
                state.conflated.insert(key.clone(), slot.clone());
                state.entries.push_back(QueueEntry::Conflated { key, slot });
                state.queued_bytes += new_bytes;
                self.stats.adjust_async_queue_size(new_bytes as i64);
                self.stats.inc_async_queued_msgs();
                return AddOutcome::Queued;
            }

            // defeated key: stop conflating against the pending entry
            state.conflated.remove(&key);
        }

        let would_be_bytes = state.queued_bytes + new_bytes;
        if would_be_bytes > max_queue_size {
            return AddOutcome::Overflow { would_be_bytes };
        }

        state.entries.push_back(QueueEntry::Raw(frame));
        state.queued_bytes += new_bytes;
        self.stats.adjust_async_queue_size(new_bytes as i64);
        self.stats.inc_async_queued_msgs();
        AddOutcome::Queued
    }

    /// FIFO dequeue for the pusher. Yields `Drained` (and lowers `queuing_in_progress`)
    ///  when the queue is empty or a disconnect has been requested.
    pub fn take(&self) -> TakeOutcome {
        let mut state = self.state.lock().unwrap();

        if state.disconnect_requested {
            state.queuing_in_progress = false;
            drop(state);
            self.drained.notify_waiters();
            return TakeOutcome::Drained;
        }

        while let Some(entry) = state.entries.pop_front() {
            let buf = match entry {
                QueueEntry::Raw(buf) => Some(buf),
                QueueEntry::Conflated { key, slot } => {
                    let buf = slot.buf.lock().unwrap().take();
                    if buf.is_some() {
                        state.conflated.remove(&key);
                    }
                    buf
                }
            };
            if let Some(buf) = buf {
                let n = buf.len() as u64;
                state.queued_bytes -= n;
                self.stats.adjust_async_queue_size(-(n as i64));
                self.stats.inc_async_dequeued_msgs();
                return TakeOutcome::Buffer(buf);
            }
        }

        state.queuing_in_progress = false;
        drop(state);
        self.drained.notify_waiters();
        TakeOutcome::Drained
    }

    pub fn begin_queuing(&self) {
        self.state.lock().unwrap().queuing_in_progress = true;
    }

    pub fn queuing_in_progress(&self) -> bool {
        self.state.lock().unwrap().queuing_in_progress
    }

    pub fn queued_bytes(&self) -> u64 {
        self.state.lock().unwrap().queued_bytes
    }

    pub fn disconnect_requested(&self) -> bool {
        self.state.lock().unwrap().disconnect_requested
    }

    /// Returns true on the first call only; the eviction of a slow receiver is asked for
    ///  exactly once.
    pub fn request_disconnect(&self) -> bool {
        let first = {
            let mut state = self.state.lock().unwrap();
            let first = !state.disconnect_requested;
            state.disconnect_requested = true;
            first
        };
        self.drained.notify_waiters();
        first
    }

    /// Drop everything still queued and lower `queuing_in_progress`. Used when the pusher
    ///  exits on an error and at close.
    pub fn shutdown(&self) {
        let residue = {
            let mut state = self.state.lock().unwrap();
            state.entries.clear();
            state.conflated.clear();
            state.queuing_in_progress = false;
            std::mem::take(&mut state.queued_bytes)
        };
        self.stats.adjust_async_queue_size(-(residue as i64));
        self.drained.notify_waiters();
    }

    /// Wait until no pusher is flushing any more (close synchronization for producers).
    pub async fn wait_until_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if !self.queuing_in_progress() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> OutgoingQueue {
        let q = OutgoingQueue::new(Arc::new(ConnectionStats::new()));
        q.begin_queuing();
        q
    }

    fn frame(bytes: &[u8]) -> BytesMut {
        BytesMut::from(bytes)
    }

    fn drain(q: &OutgoingQueue) -> Vec<Vec<u8>> {
        let mut result = Vec::new();
        loop {
            match q.take() {
                TakeOutcome::Buffer(b) => result.push(b.to_vec()),
                TakeOutcome::Drained => return result,
            }
        }
    }

    #[test]
    fn test_fifo_order() {
        let q = queue();
        for payload in [&[1u8][..], &[2, 2], &[3]] {
            assert!(matches!(q.add(frame(payload), None, false, false, 1024), AddOutcome::Queued));
        }

        assert_eq!(drain(&q), vec![vec![1], vec![2, 2], vec![3]]);
        assert!(!q.queuing_in_progress());
        assert_eq!(q.queued_bytes(), 0);
    }

    #[test]
    fn test_not_queued_when_pusher_already_drained() {
        let q = OutgoingQueue::new(Arc::new(ConnectionStats::new()));
        match q.add(frame(&[1]), None, false, false, 1024) {
            AddOutcome::NotQueued(returned) => assert_eq!(returned.as_ref(), &[1]),
            _ => panic!("expected the buffer back"),
        }
        assert!(matches!(q.add(frame(&[1]), None, false, true, 1024), AddOutcome::Queued));
    }

    #[test]
    fn test_conflation_replaces_in_place() {
        let q = queue();
        let key = || Some(ConflationKey::new(&b"k"[..]));

        q.add(frame(&[0x10, 0x20]), key(), true, false, 1024);
        q.add(frame(&[0xFF]), None, false, false, 1024);
        q.add(frame(&[0x11, 0x22, 0x33]), key(), true, false, 1024);

        // the replacement kept the slot of the earliest enqueue
        assert_eq!(drain(&q), vec![vec![0x11, 0x22, 0x33], vec![0xFF]]);
    }

    #[test]
    fn test_conflation_byte_accounting() {
        let stats = Arc::new(ConnectionStats::new());
        let q = OutgoingQueue::new(stats.clone());
        q.begin_queuing();
        let key = || Some(ConflationKey::new(&b"k"[..]));

        q.add(frame(&[0x10, 0x20]), key(), true, false, 1024);
        let before = q.queued_bytes();

        q.add(frame(&[0x11, 0x22, 0x33]), key(), true, false, 1024);
        assert_eq!(q.queued_bytes(), before - 2 + 3);
        assert_eq!(stats.async_queue_size_bytes(), 3);

        q.add(frame(&[0x12]), key(), true, false, 1024);
        assert_eq!(q.queued_bytes(), 1);
        assert_eq!(stats.async_conflated_msgs(), 2);

        // exactly one entry is visible to the pusher
        assert_eq!(drain(&q), vec![vec![0x12]]);
        assert_eq!(q.queued_bytes(), 0);
        assert_eq!(stats.async_queue_size_bytes(), 0);
    }

    #[test]
    fn test_defeated_key_freezes_pending_entry() {
        let q = queue();
        let key = || Some(ConflationKey::new(&b"k"[..]));

        q.add(frame(&[1]), key(), true, false, 1024);
        // same key, but no longer conflatable (e.g. partially written already)
        q.add(frame(&[2]), key(), false, false, 1024);
        // a later conflatable enqueue must not touch the frozen predecessor
        q.add(frame(&[3]), key(), true, false, 1024);

        assert_eq!(drain(&q), vec![vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn test_overflow_is_reported_and_nothing_queued() {
        let q = queue();
        q.add(frame(&[0; 40]), None, false, false, 64);

        match q.add(frame(&[0; 32]), None, false, false, 64) {
            AddOutcome::Overflow { would_be_bytes } => assert_eq!(would_be_bytes, 72),
            _ => panic!("expected overflow"),
        }
        assert_eq!(q.queued_bytes(), 40);
    }

    #[test]
    fn test_disconnect_requested_drops_messages() {
        let q = queue();
        assert!(q.request_disconnect());
        assert!(!q.request_disconnect());
        assert!(matches!(q.add(frame(&[1]), None, false, true, 1024), AddOutcome::DisconnectRequested));
        assert!(matches!(q.take(), TakeOutcome::Drained));
    }

    #[tokio::test]
    async fn test_wait_until_drained() {
        let q = Arc::new(OutgoingQueue::new(Arc::new(ConnectionStats::new())));
        q.begin_queuing();
        q.add(frame(&[1]), None, false, true, 1024);

        let waiter = tokio::spawn({
            let q = q.clone();
            async move { q.wait_until_drained().await }
        });
        assert!(!waiter.is_finished());

        while !matches!(q.take(), TakeOutcome::Drained) {}
        waiter.await.unwrap();
    }
}
