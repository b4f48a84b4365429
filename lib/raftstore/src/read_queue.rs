//! [`ReadIndexQueue`]: a lock-free FIFO of pending linearizable reads plus an
//! atomic "ready count".
//!
//! Read states may arrive from the consensus library before
//! `applied_index_term` has caught up to `current_term`. In that
//! window reads are counted as ready but not popped; they drain once the next
//! apply batch completes (see `PeerReplicate::post_apply`).

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Result handed back to whoever submitted a linearizable read.
#[derive(Debug)]
pub enum ReadCmdResult {
    /// The read was serviced against the data engine; payload is the
    /// requested key's current value.
    Done(Option<Vec<u8>>),
    /// The peer lost leadership, or the command was otherwise superseded,
    /// before the read could be serviced.
    Stale,
}

/// A pending linearizable read. `request_ctx` is the byte string proposed to
/// `raft::RawNode::read_index`, and is echoed back in the matching
/// `ReadState` — it is what the ready-loop's read-state handling compares
/// against the head of this queue.
pub struct ReadCmd {
    pub id: Uuid,
    pub key: Vec<u8>,
    pub request_ctx: Vec<u8>,
    pub replier: oneshot::Sender<ReadCmdResult>,
}

/// Bounded only by memory; backed by `crossbeam_queue::SegQueue`, a
/// genuinely lock-free MPMC queue, so `push` from proposal intake and `pop`
/// from this cell's raft worker never contend on a mutex.
#[derive(Default)]
pub struct ReadIndexQueue {
    queue: SegQueue<ReadCmd>,
    ready_count: AtomicUsize,
}

impl ReadIndexQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, cmd: ReadCmd) {
        self.queue.push(cmd);
    }

    pub fn pop(&self) -> Option<ReadCmd> {
        self.queue.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn incr_ready(&self) {
        self.ready_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decr_ready(&self) {
        self.ready_count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            Some(n.saturating_sub(1))
        }).ok();
    }

    pub fn reset_ready(&self) {
        self.ready_count.store(0, Ordering::Release);
    }

    pub fn get_ready(&self) -> usize {
        self.ready_count.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn make_cmd(id: Uuid) -> (ReadCmd, oneshot::Receiver<ReadCmdResult>) {
        let (tx, rx) = oneshot::channel();
        (
            ReadCmd {
                id,
                key: b"k".to_vec(),
                request_ctx: id.as_bytes().to_vec(),
                replier: tx,
            },
            rx,
        )
    }

    #[test]
    fn fifo_order() {
        let q = ReadIndexQueue::new();
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            let (cmd, _rx) = make_cmd(*id);
            q.push(cmd);
        }
        for id in &ids {
            let popped = q.pop().expect("queue should not be empty yet");
            assert_eq!(popped.id, *id);
        }
        assert!(q.pop().is_none());
    }

    #[test]
    fn concurrent_push_pop_loses_nothing() {
        let q = Arc::new(ReadIndexQueue::new());
        let n = 2000;
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                for _ in 0..n {
                    let (cmd, _rx) = make_cmd(Uuid::new_v4());
                    q.push(cmd);
                }
            })
        };
        producer.join().unwrap();

        let mut popped = 0;
        while popped < n {
            if q.pop().is_some() {
                popped += 1;
            }
        }
        assert_eq!(popped, n);
        assert!(q.is_empty());
    }

    #[test]
    fn ready_count_tracks_incr_decr_reset() {
        let q = ReadIndexQueue::new();
        q.incr_ready();
        q.incr_ready();
        assert_eq!(q.get_ready(), 2);
        q.decr_ready();
        assert_eq!(q.get_ready(), 1);
        q.reset_ready();
        assert_eq!(q.get_ready(), 0);
        // decrementing below zero saturates rather than wrapping
        q.decr_ready();
        assert_eq!(q.get_ready(), 0);
    }
}
