//! Multi-agent aggregation.
//!
//! Regional proxies terminate thousands of client connections at the
//! edge. Instead of one coordinator stream per client, a proxy registers
//! a single *multi-agent* peer and multiplexes all of its subscription
//! state over it: subscriptions are added and removed per agent, and
//! every delivered update carries the agent it pertains to.
use std::sync::Arc;

use tracing::trace;

use crate::coord::registry::Kind;
use crate::coord::{Coordinator, Error};
use crate::id::PeerId;
use crate::node::Node;
use crate::queue::{Queue, Update};

/// A synthetic peer multiplexing many agent subscriptions over one
/// handle. Created with [`Coordinator::multi_agent`]; bound to a wire
/// transport by [`Coordinator::serve_multi_agent`].
///
/// Dropping the handle closes it.
#[derive(Debug)]
pub struct MultiAgent {
    id: PeerId,
    coordinator: Coordinator,
    queue: Arc<Queue>,
}

impl MultiAgent {
    pub(crate) fn register(coordinator: Coordinator, id: PeerId) -> Result<Self, Error> {
        let (queue, _cancel) = coordinator.register(id, Kind::MultiAgent)?;
        trace!(target: "coord", "Registered multi-agent {id}");

        Ok(Self {
            id,
            coordinator,
            queue,
        })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Subscribe to an agent's updates. Idempotent at the graph level;
    /// the agent's current node, if known, is queued again either way.
    pub fn subscribe_agent(&self, agent: PeerId) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.coordinator.core().subscribe(&self.id, agent);

        Ok(())
    }

    /// Retract interest in an agent. Idempotent.
    pub fn unsubscribe_agent(&self, agent: PeerId) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.coordinator.core().unsubscribe(&self.id, &agent);

        Ok(())
    }

    /// Advertise the proxy's own relay node. Agents subscribed to by this
    /// peer learn it, so they can reach clients behind the proxy.
    pub fn update_self(&self, node: Node) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.coordinator.core().self_update(&self.id, node);

        Ok(())
    }

    /// Wait for the next batch of updates, each tagged with the agent it
    /// pertains to. Returns `None` once the handle is closed and the
    /// queue has drained.
    pub async fn next_update(&self) -> Option<Vec<Update>> {
        self.queue.next_batch().await
    }

    /// Whether the agent's announced node pre-dates multi-homing and must
    /// be reached over the legacy per-agent transport. `false` when the
    /// agent is not connected.
    pub fn agent_is_legacy(&self, agent: &PeerId) -> bool {
        self.coordinator
            .node_of(agent)
            .map(|node| node.is_legacy())
            .unwrap_or(false)
    }

    /// Close the handle: unregister the peer, notify agents that observed
    /// it, and end [`Self::next_update`] once drained. Closing an
    /// already-closed handle fails with [`Error::Closed`]; it never
    /// panics.
    pub fn close(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.coordinator.teardown(&self.id, &self.queue);
        trace!(target: "coord", "Closed multi-agent {}", self.id);

        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

impl Drop for MultiAgent {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
