//! The per-connection operation queue.
//!
//! Every externally-initiated event becomes an operation: API calls, receive
//! flushes, timer expirations, TLS completion. A single worker drains the
//! queue, which is what serializes all connection-state mutation. Any thread
//! may enqueue; the critical section is a push onto a deque.

use std::collections::VecDeque;
use std::sync::Mutex;

use bytes::Bytes;

use crate::timer::TimerType;

/// Application-initiated work, enqueued by the handle API so that callback
/// reentrancy can never mutate connection state inline.
#[derive(Debug)]
pub enum ApiCall {
    /// Begin the handshake (client).
    Start { server_name: String },
    /// Close the connection, optionally without notifying the peer.
    Shutdown {
        application: bool,
        error_code: u64,
        reason: Bytes,
        silent: bool,
    },
    /// Elicit an acknowledgement from the peer.
    Ping,
}

#[derive(Debug)]
pub enum Operation {
    Api(ApiCall),
    /// Drain the receive queue through the packet pipeline.
    FlushRecv,
    /// The datapath reported the peer unreachable.
    Unreachable,
    /// A stream's receive buffer was drained by the application; flow
    /// control updates may now be owed.
    FlushStreamRecv { id: crate::StreamId },
    /// Materialize accumulated send flags into packets.
    FlushSend,
    /// The TLS engine finished the handshake off-thread.
    TlsComplete,
    TimerExpired(TimerType),
    /// Emit the connection's state to the trace log.
    TraceRundown,
}

#[derive(Debug, Default)]
pub struct OperQueue {
    queue: Mutex<VecDeque<Operation>>,
}

impl OperQueue {
    pub fn new() -> Self {
        Default::default()
    }

    /// Append an operation. Returns whether the queue was empty, in which
    /// case the caller must hand the connection to a worker.
    pub fn enqueue(&self, op: Operation) -> bool {
        let mut queue = self.queue.lock().unwrap();
        let was_empty = queue.is_empty();
        queue.push_back(op);
        was_empty
    }

    /// Insert at the head, ahead of all queued work. Reserved for
    /// shutdown-critical operations.
    pub fn enqueue_front(&self, op: Operation) -> bool {
        let mut queue = self.queue.lock().unwrap();
        let was_empty = queue.is_empty();
        queue.push_front(op);
        was_empty
    }

    pub fn pop(&self) -> Option<Operation> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Drop all queued work. Used at uninitialize; operations after this
    /// point are meaningless.
    pub fn clear(&self) {
        self.queue.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_reports_transition_from_empty() {
        let queue = OperQueue::new();
        assert!(queue.enqueue(Operation::FlushRecv));
        assert!(!queue.enqueue(Operation::FlushSend));
        queue.pop().unwrap();
        queue.pop().unwrap();
        assert!(queue.enqueue(Operation::FlushSend));
    }

    #[test]
    fn fifo_with_front_insert() {
        let queue = OperQueue::new();
        queue.enqueue(Operation::FlushRecv);
        queue.enqueue(Operation::FlushSend);
        queue.enqueue_front(Operation::TraceRundown);
        assert!(matches!(queue.pop(), Some(Operation::TraceRundown)));
        assert!(matches!(queue.pop(), Some(Operation::FlushRecv)));
        assert!(matches!(queue.pop(), Some(Operation::FlushSend)));
        assert!(queue.pop().is_none());
    }
}
