//! Outbound update queues.
//!
//! Every peer owns one [`Queue`], filled by fan-out under the coordinator
//! lock and drained by the peer's send loop. The queue coalesces: at most
//! one update per source peer is ever pending, so a slow consumer costs
//! memory proportional to the number of peers it observes, not to the
//! update rate.
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::id::PeerId;
use crate::node::Node;

/// Upper bound on the number of updates handed out per batch.
pub const BATCH_LIMIT: usize = 512;

/// An update queued for delivery to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// The source peer announced a new node.
    Node { peer: PeerId, node: Node },
    /// The source peer is no longer reachable through the coordinator.
    Gone { peer: PeerId },
}

impl Update {
    /// The peer this update is about.
    pub fn peer(&self) -> PeerId {
        match self {
            Self::Node { peer, .. } => *peer,
            Self::Gone { peer } => *peer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Node(PeerId),
    Gone(PeerId),
}

impl Entry {
    fn peer(&self) -> PeerId {
        match self {
            Self::Node(peer) | Self::Gone(peer) => *peer,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    /// Most recent pending node per source. An entry exists here iff
    /// `order` holds an `Entry::Node` for the same source.
    slots: HashMap<PeerId, Node>,
    /// Delivery order.
    order: VecDeque<Entry>,
    closed: bool,
}

/// A coalescing multi-producer, single-consumer queue.
///
/// A newer node from a source replaces its pending one in place, keeping
/// the source's position in line. A gone notice supersedes any pending
/// node from that source and is itself never dropped.
#[derive(Debug, Default)]
pub struct Queue {
    state: Mutex<State>,
    notify: Notify,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an update, coalescing against whatever is already pending
    /// from the same source.
    pub fn push(&self, update: Update) {
        {
            #[allow(clippy::unwrap_used)]
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            match update {
                Update::Node { peer, node } => {
                    if let Some(slot) = state.slots.get_mut(&peer) {
                        *slot = node;
                    } else {
                        // A pending gone for this source keeps its place;
                        // the node is delivered after it.
                        state.slots.insert(peer, node);
                        state.order.push_back(Entry::Node(peer));
                    }
                }
                Update::Gone { peer } => {
                    // Everything the consumer hasn't seen from this source
                    // is now moot.
                    state.slots.remove(&peer);
                    state.order.retain(|entry| entry.peer() != peer);
                    state.order.push_back(Entry::Gone(peer));
                }
            }
        }
        self.notify.notify_one();
    }

    /// Wait for the next batch of updates.
    ///
    /// Returns `None` exactly when the queue is closed and drained. Must
    /// only be called from the queue's single consumer.
    pub async fn next_batch(&self) -> Option<Vec<Update>> {
        loop {
            {
                #[allow(clippy::unwrap_used)]
                let mut state = self.state.lock().unwrap();
                if !state.order.is_empty() {
                    return Some(pop_batch(&mut state));
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Drop anything pending from the given source, without delivering it.
    /// Used when the consumer retracts its interest in the source.
    pub fn discard(&self, peer: &PeerId) {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        state.slots.remove(peer);
        state.order.retain(|entry| entry.peer() != *peer);
    }

    /// Take whatever is pending, without waiting.
    pub fn drain(&self) -> Vec<Update> {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();

        pop_batch(&mut state)
    }

    /// Close the queue. Pending updates stay drainable; later pushes are
    /// dropped. Idempotent.
    pub fn close(&self) {
        {
            #[allow(clippy::unwrap_used)]
            let mut state = self.state.lock().unwrap();
            state.closed = true;
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();

        state.closed
    }

    pub fn is_empty(&self) -> bool {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();

        state.order.is_empty()
    }
}

fn pop_batch(state: &mut State) -> Vec<Update> {
    let mut batch = Vec::with_capacity(state.order.len().min(BATCH_LIMIT));
    while batch.len() < BATCH_LIMIT {
        let Some(entry) = state.order.pop_front() else {
            break;
        };
        match entry {
            Entry::Node(peer) => {
                if let Some(node) = state.slots.remove(&peer) {
                    batch.push(Update::Node { peer, node });
                }
            }
            Entry::Gone(peer) => batch.push(Update::Gone { peer }),
        }
    }
    batch
}
