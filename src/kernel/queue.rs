//! Prioritized action queue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::types::{ActionStatus, OrchestrationAction};

/// Heap entry (wraps for min-heap behavior on priority rank).
#[derive(Debug)]
struct QueuedAction {
    rank: u8,       // Lower = more urgent
    sequence: u64,  // FIFO within same priority
    action: OrchestrationAction,
}

impl Ord for QueuedAction {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is max-heap, so reverse both keys
        other
            .rank
            .cmp(&self.rank)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueuedAction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedAction {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.sequence == other.sequence
    }
}

impl Eq for QueuedAction {}

/// Most urgent action first; insertion order among equals.
#[derive(Debug, Default)]
pub struct ActionQueue {
    heap: BinaryHeap<QueuedAction>,
    next_sequence: u64,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mut action: OrchestrationAction) {
        action.status = ActionStatus::Queued;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(QueuedAction {
            rank: action.priority.level(),
            sequence,
            action,
        });
    }

    pub fn pop(&mut self) -> Option<OrchestrationAction> {
        self.heap.pop().map(|entry| entry.action)
    }

    pub fn peek(&self) -> Option<&OrchestrationAction> {
        self.heap.peek().map(|entry| &entry.action)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Queued actions in the order they would be served.
    pub fn snapshot(&self) -> Vec<OrchestrationAction> {
        let mut entries: Vec<&QueuedAction> = self.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| e.action.clone()).collect()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.heap.len();
        self.heap.clear();
        dropped
    }
}
