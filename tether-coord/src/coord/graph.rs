//! The client → agent interest graph.
use std::collections::{BTreeMap, BTreeSet};

use crate::id::PeerId;

/// Bidirectional subscription graph.
///
/// Edges are keyed by id rather than by presence: a client may hold an
/// edge to an agent that is not currently connected, so that a returning
/// agent resumes fan-out without the client re-subscribing. Iteration
/// order is the id order, which keeps fan-out deterministic.
#[derive(Debug, Default)]
pub struct Graph {
    /// Agents each client has subscribed to.
    subscriptions: BTreeMap<PeerId, BTreeSet<PeerId>>,
    /// Clients subscribed to each agent.
    subscribers: BTreeMap<PeerId, BTreeSet<PeerId>>,
}

impl Graph {
    /// Insert the edge `client → agent`. Idempotent. Returns whether the
    /// edge is new.
    pub fn subscribe(&mut self, client: PeerId, agent: PeerId) -> bool {
        let inserted = self.subscriptions.entry(client).or_default().insert(agent);
        self.subscribers.entry(agent).or_default().insert(client);

        inserted
    }

    /// Remove the edge `client → agent`. Idempotent. Returns whether the
    /// edge existed.
    pub fn unsubscribe(&mut self, client: &PeerId, agent: &PeerId) -> bool {
        let removed = remove_edge(&mut self.subscriptions, client, agent);
        remove_edge(&mut self.subscribers, agent, client);

        removed
    }

    /// Clients subscribed to the given agent, in id order.
    pub fn subscribers_of<'a>(&'a self, agent: &PeerId) -> impl Iterator<Item = PeerId> + 'a {
        self.subscribers.get(agent).into_iter().flatten().copied()
    }

    /// Agents the given client is subscribed to, in id order.
    pub fn subscriptions_of<'a>(&'a self, client: &PeerId) -> impl Iterator<Item = PeerId> + 'a {
        self.subscriptions
            .get(client)
            .into_iter()
            .flatten()
            .copied()
    }

    pub fn contains(&self, client: &PeerId, agent: &PeerId) -> bool {
        self.subscriptions
            .get(client)
            .is_some_and(|agents| agents.contains(agent))
    }

    /// Remove every edge owned by the client, returning the agents it was
    /// subscribed to.
    pub fn purge(&mut self, client: &PeerId) -> Vec<PeerId> {
        let agents: Vec<PeerId> = self
            .subscriptions
            .remove(client)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();

        for agent in &agents {
            remove_edge(&mut self.subscribers, agent, client);
        }
        agents
    }

    /// Every edge is present in both maps. Checked in tests after each
    /// mutation.
    #[cfg(test)]
    pub fn is_symmetric(&self) -> bool {
        let forward = self.subscriptions.iter().all(|(client, agents)| {
            agents.iter().all(|agent| {
                self.subscribers
                    .get(agent)
                    .is_some_and(|clients| clients.contains(client))
            })
        });
        let backward = self.subscribers.iter().all(|(agent, clients)| {
            clients.iter().all(|client| {
                self.subscriptions
                    .get(client)
                    .is_some_and(|agents| agents.contains(agent))
            })
        });
        forward && backward
    }
}

fn remove_edge(
    map: &mut BTreeMap<PeerId, BTreeSet<PeerId>>,
    key: &PeerId,
    value: &PeerId,
) -> bool {
    let Some(set) = map.get_mut(key) else {
        return false;
    };
    let removed = set.remove(value);
    if set.is_empty() {
        map.remove(key);
    }
    removed
}
