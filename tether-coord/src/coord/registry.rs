//! The set of currently connected peers.
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::Error;
use crate::id::PeerId;
use crate::node::Node;
use crate::queue::Queue;

/// What kind of endpoint a peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// A per-workspace process publishing its node.
    Agent,
    /// Anything connecting to agents: CLI, browser, IDE.
    Client,
    /// A regional proxy multiplexing many client subscriptions.
    MultiAgent,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent => write!(f, "agent"),
            Self::Client => write!(f, "client"),
            Self::MultiAgent => write!(f, "multi-agent"),
        }
    }
}

/// A connected peer.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub kind: Kind,
    /// Most recent self-announced node, if any.
    pub node: Option<Node>,
    /// Outbound queue, drained by the peer's send loop.
    pub queue: Arc<Queue>,
    /// Cancels the peer's serve loops.
    pub cancel: CancellationToken,
}

impl Peer {
    pub fn new(id: PeerId, kind: Kind, cancel: CancellationToken) -> Self {
        Self {
            id,
            kind,
            node: None,
            queue: Arc::new(Queue::new()),
            cancel,
        }
    }
}

/// Registry of connected peers, keyed by id. Plain data; all access is
/// serialized by the coordinator lock.
#[derive(Debug, Default)]
pub struct Registry {
    peers: HashMap<PeerId, Peer>,
}

impl Registry {
    /// Insert a peer. Fails if the id is already taken; the existing
    /// connection wins.
    pub fn register(&mut self, peer: Peer) -> Result<(), Error> {
        match self.peers.entry(peer.id) {
            Entry::Occupied(_) => Err(Error::AlreadyRegistered(peer.id)),
            Entry::Vacant(slot) => {
                slot.insert(peer);
                Ok(())
            }
        }
    }

    /// Remove and return a peer for teardown.
    pub fn unregister(&mut self, id: &PeerId) -> Option<Peer> {
        self.peers.remove(id)
    }

    pub fn lookup(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn lookup_mut(&mut self, id: &PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(id)
    }

    /// The node last announced by the peer, if it is connected and has
    /// announced one.
    pub fn node_of(&self, id: &PeerId) -> Option<Node> {
        self.peers.get(id).and_then(|peer| peer.node.clone())
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
