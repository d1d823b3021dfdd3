//! Time-sorted delivery queue.
//!
//! Holds in-flight datagrams ordered by their target delivery time. Ties are
//! broken by insertion sequence so that two datagrams scheduled for the same
//! instant leave in arrival order.

use std::collections::VecDeque;

use crate::buffer::PooledBuffer;

/// A single in-flight datagram.
///
/// The target delivery time is immutable once the node has been inserted into
/// a delivery queue; the node owns its payload buffer until it is sent,
/// dropped, or drained at shutdown.
#[derive(Debug)]
pub struct QueueNode {
    /// Monotonic microsecond timestamp at which the datagram should be sent.
    pub target_delivery_usec: u64,

    /// Insertion sequence, used as the stable tie-break.
    pub seq: u64,

    /// Owned payload bytes.
    pub payload: PooledBuffer,
}

impl QueueNode {
    pub fn payload_bytes(&self) -> usize {
        self.payload.len()
    }
}

/// A queue of [`QueueNode`]s ordered by non-decreasing target delivery time.
#[derive(Debug, Default)]
pub struct DeliveryQueue {
    nodes: VecDeque<QueueNode>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self {
            nodes: VecDeque::new(),
        }
    }

    /// Insert a node keeping the queue sorted by target time, stable at ties.
    ///
    /// Most insertions land at or near the back (target times are mostly
    /// monotone), so the scan runs back-to-front.
    pub fn insert_sorted(&mut self, node: QueueNode) {
        let mut idx = self.nodes.len();
        while idx > 0 {
            if self.nodes[idx - 1].target_delivery_usec <= node.target_delivery_usec {
                break;
            }
            idx -= 1;
        }
        self.nodes.insert(idx, node);
    }

    /// Target time of the head node, if any.
    pub fn peek_target_usec(&self) -> Option<u64> {
        self.nodes.front().map(|n| n.target_delivery_usec)
    }

    /// Pop the head node if its target time is at or before `deadline_usec`.
    pub fn pop_due(&mut self, deadline_usec: u64) -> Option<QueueNode> {
        if self.peek_target_usec()? <= deadline_usec {
            self.nodes.pop_front()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Remove and return every node, releasing the queue's ownership.
    pub fn drain(&mut self) -> impl Iterator<Item = QueueNode> + '_ {
        self.nodes.drain(..)
    }
}
