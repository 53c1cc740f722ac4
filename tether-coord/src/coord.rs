//! The coordinator: peer registry, subscription graph and fan-out.
//!
//! One lock serializes all state mutation. Critical sections only ever
//! mutate maps and enqueue onto peer queues; transport I/O happens in the
//! per-peer serve loops, outside the lock.
pub mod graph;
pub mod registry;

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::id::PeerId;
use crate::multi::MultiAgent;
use crate::node::Node;
use crate::queue::{Queue, Update};
use crate::wire::{self, frame, frame::Frame};

use graph::Graph;
use registry::{Kind, Peer, Registry};

/// Errors returned by coordinator operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A peer with this id is already being served. The existing
    /// connection wins; the new one is rejected.
    #[error("peer `{0}` is already registered")]
    AlreadyRegistered(PeerId),
    /// The coordinator, or this multi-agent handle, was shut down.
    #[error("coordinator is closed")]
    Closed,
    /// The peer violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(wire::Error),
    /// The transport failed.
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

impl From<wire::Error> for Error {
    fn from(err: wire::Error) -> Self {
        match err {
            wire::Error::Io(err) => Self::Io(err),
            err => Self::Protocol(err),
        }
    }
}

/// The coordinator. Cheap to clone; all clones share state.
#[derive(Debug, Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    core: Mutex<Core>,
    /// Cancelled on shutdown.
    cancel: CancellationToken,
    /// Every per-peer task: the full serve lifecycle plus its send loop.
    /// Awaited on shutdown, so pending updates get flushed and every
    /// peer is unregistered before shutdown returns.
    tasks: TaskTracker,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                core: Mutex::new(Core::default()),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Serve an agent connection to completion.
    ///
    /// Performs the handshake, then relays the agent's announcements to
    /// its subscribers (and their announcements back) until the transport
    /// closes, the agent violates the protocol, or the coordinator shuts
    /// down.
    pub async fn serve_agent<T>(&self, transport: T, id: PeerId) -> Result<(), Error>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.serve(transport, id, Kind::Agent, None).await
    }

    /// Serve a client connection to completion.
    ///
    /// `agent` subscribes the client to a single agent as part of
    /// connecting, which is the common case for CLIs and IDEs.
    pub async fn serve_client<T>(
        &self,
        transport: T,
        id: PeerId,
        agent: Option<PeerId>,
    ) -> Result<(), Error>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.serve(transport, id, Kind::Client, agent).await
    }

    /// Bind a multi-agent aggregator to a transport and serve it to
    /// completion. Updates are framed as [`Frame::MultiAgentUpdate`] so
    /// the proxy on the other end can demultiplex them.
    pub async fn serve_multi_agent<T>(&self, transport: T, id: PeerId) -> Result<(), Error>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.serve(transport, id, Kind::MultiAgent, None).await
    }

    /// Create an in-process multi-agent aggregator.
    pub fn multi_agent(&self, id: PeerId) -> Result<MultiAgent, Error> {
        MultiAgent::register(self.clone(), id)
    }

    /// The node last announced by the given peer, if it is connected and
    /// has announced one. There is no distinction between "never
    /// connected" and "disconnected".
    pub fn node_of(&self, id: &PeerId) -> Option<Node> {
        self.core().registry.node_of(id)
    }

    pub fn is_closed(&self) -> bool {
        self.core().closed
    }

    /// Shut the coordinator down: close every peer queue so send loops
    /// flush and exit, cancel every serve loop, and wait for every
    /// peer-serving task to terminate. Idempotent.
    pub async fn shutdown(&self) {
        {
            let mut core = self.core();
            core.closed = true;
            for peer in core.registry.peers() {
                peer.queue.close();
            }
        }
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    /// Run a peer's serve lifecycle inside the coordinator's task
    /// tracker, whoever is driving the outer future. Shutdown waits for
    /// the receive loop and the unregistration, not just the writer half.
    async fn serve<T>(
        &self,
        transport: T,
        id: PeerId,
        kind: Kind,
        initial: Option<PeerId>,
    ) -> Result<(), Error>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let this = self.clone();
        match self
            .inner
            .tasks
            .spawn(this.serve_peer(transport, id, kind, initial))
            .await
        {
            Ok(result) => result,
            // The task only ends without a result if it panicked.
            Err(err) => Err(Error::Io(io::Error::other(err))),
        }
    }

    async fn serve_peer<T>(
        self,
        mut transport: T,
        id: PeerId,
        kind: Kind,
        initial: Option<PeerId>,
    ) -> Result<(), Error>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        // A handshake that never completes must not pin shutdown.
        tokio::select! {
            result = frame::accept(&mut transport, id) => result?,
            _ = self.inner.cancel.cancelled() => return Err(Error::Closed),
        };
        let (queue, cancel) = self.register(id, kind)?;
        debug!(target: "coord", "Registered {kind} {id}");

        if let Some(agent) = initial {
            self.core().subscribe(&id, agent);
        }

        let frame_of = match kind {
            Kind::MultiAgent => multi_frame,
            Kind::Agent | Kind::Client => peer_frame,
        };
        let (mut reader, writer) = tokio::io::split(transport);
        let send = self
            .inner
            .tasks
            .spawn(send_loop(queue.clone(), writer, cancel.clone(), frame_of));
        let result = recv_loop(&self, &id, kind, &mut reader, &cancel).await;

        self.teardown(&id, &queue);
        send.await.ok();

        if let Err(err) = &result {
            warn!(target: "coord", "Connection of {kind} {id} failed: {err}");
        } else {
            debug!(target: "coord", "Unregistered {kind} {id}");
        }
        result
    }

    /// Register a peer, handing back its queue and cancellation token.
    pub(crate) fn register(
        &self,
        id: PeerId,
        kind: Kind,
    ) -> Result<(Arc<Queue>, CancellationToken), Error> {
        let mut core = self.core();
        if core.closed {
            return Err(Error::Closed);
        }
        let cancel = self.inner.cancel.child_token();
        let peer = Peer::new(id, kind, cancel.clone());
        let queue = peer.queue.clone();
        core.registry.register(peer)?;

        Ok((queue, cancel))
    }

    /// Remove a peer and notify its observers. Idempotent, and a no-op
    /// when the id has already been taken over by a newer registration:
    /// the queue identifies which registration the caller owns.
    pub(crate) fn teardown(&self, id: &PeerId, queue: &Arc<Queue>) -> bool {
        let mut core = self.core();
        let owned = core
            .registry
            .lookup(id)
            .is_some_and(|peer| Arc::ptr_eq(&peer.queue, queue));

        owned && core.unregister(id).is_some()
    }

    #[allow(clippy::unwrap_used)]
    pub(crate) fn core(&self) -> MutexGuard<'_, Core> {
        self.inner.core.lock().unwrap()
    }
}

/// Coordinator state: everything the lock protects. The registry and the
/// graph are mutated together, so edge symmetry holds whenever the lock
/// is released.
#[derive(Debug, Default)]
pub(crate) struct Core {
    pub(crate) registry: Registry,
    pub(crate) graph: Graph,
    pub(crate) closed: bool,
}

impl Core {
    /// Store a peer's announcement and fan it out to everyone observing
    /// the peer. Stale announcements (sequence number not above the
    /// stored one) are dropped.
    pub(crate) fn self_update(&mut self, id: &PeerId, node: Node) {
        let Some(peer) = self.registry.lookup_mut(id) else {
            return;
        };
        if let Some(current) = &peer.node {
            if node.seq <= current.seq {
                trace!(
                    target: "coord",
                    "Dropping stale node from {id}: seq {} <= {}", node.seq, current.seq
                );
                return;
            }
        }
        peer.node = Some(node.clone());
        let kind = peer.kind;
        trace!(target: "coord", "New node from {kind} {id} (seq {})", node.seq);

        self.fanout(id, kind, Update::Node { peer: *id, node });
    }

    /// Insert the subscription edge. If the agent has announced a node,
    /// that node is queued to the client right away, also when the edge
    /// already existed.
    pub(crate) fn subscribe(&mut self, client: &PeerId, agent: PeerId) {
        self.graph.subscribe(*client, agent);
        trace!(target: "coord", "{client} subscribed to {agent}");

        let Some(node) = self.agent_node(&agent) else {
            return;
        };
        if let Some(peer) = self.registry.lookup(client) {
            peer.queue.push(Update::Node { peer: agent, node });
        }
    }

    pub(crate) fn unsubscribe(&mut self, client: &PeerId, agent: &PeerId) {
        self.graph.unsubscribe(client, agent);
        // An update the client hasn't read yet is retracted with the edge.
        if let Some(peer) = self.registry.lookup(client) {
            peer.queue.discard(agent);
        }
        trace!(target: "coord", "{client} unsubscribed from {agent}");
    }

    /// Remove a peer, tell its observers it is gone, and close its queue.
    ///
    /// This is one critical section: once the lock is released, no
    /// fan-out can mention the peer again until it re-registers.
    pub(crate) fn unregister(&mut self, id: &PeerId) -> Option<Peer> {
        let peer = self.registry.unregister(id)?;
        match peer.kind {
            Kind::Agent => {
                // Subscribers keep their interest edges: a returning agent
                // resumes fan-out without anyone re-subscribing.
                for client in self.graph.subscribers_of(id) {
                    if let Some(subscriber) = self.registry.lookup(&client) {
                        subscriber.queue.push(Update::Gone { peer: *id });
                    }
                }
            }
            Kind::Client | Kind::MultiAgent => {
                for agent in self.graph.purge(id) {
                    if let Some(subscribed) = self.registry.lookup(&agent) {
                        if subscribed.kind == Kind::Agent {
                            subscribed.queue.push(Update::Gone { peer: *id });
                        }
                    }
                }
            }
        }
        peer.queue.close();
        peer.cancel.cancel();

        Some(peer)
    }

    /// Enqueue an update from `source` onto every peer observing it.
    /// Non-blocking; the send loops take over from here.
    fn fanout(&self, source: &PeerId, kind: Kind, update: Update) {
        match kind {
            Kind::Agent => {
                for client in self.graph.subscribers_of(source) {
                    if let Some(peer) = self.registry.lookup(&client) {
                        peer.queue.push(update.clone());
                    }
                }
            }
            // Agents need client nodes to reach clients, symmetrically.
            Kind::Client | Kind::MultiAgent => {
                for agent in self.graph.subscriptions_of(source) {
                    if let Some(peer) = self.registry.lookup(&agent) {
                        if peer.kind == Kind::Agent {
                            peer.queue.push(update.clone());
                        }
                    }
                }
            }
        }
    }

    /// The current node of `id`, provided `id` is a connected agent.
    fn agent_node(&self, id: &PeerId) -> Option<Node> {
        self.registry
            .lookup(id)
            .filter(|peer| peer.kind == Kind::Agent)
            .and_then(|peer| peer.node.clone())
    }
}

fn peer_frame(update: Update) -> Frame {
    match update {
        Update::Node { peer, node } => Frame::NodeUpdate { peer, node },
        Update::Gone { peer } => Frame::PeerGone { peer },
    }
}

fn multi_frame(update: Update) -> Frame {
    match update {
        Update::Node { peer, node } => Frame::MultiAgentUpdate {
            agent: peer,
            node: Some(node),
        },
        Update::Gone { peer } => Frame::MultiAgentUpdate {
            agent: peer,
            node: None,
        },
    }
}

/// Drain the peer's queue into its transport until the queue closes or
/// the transport gives up. Backpressure lives here: a blocked write keeps
/// new updates coalescing in the queue.
async fn send_loop<W>(
    queue: Arc<Queue>,
    mut writer: W,
    cancel: CancellationToken,
    frame_of: fn(Update) -> Frame,
) where
    W: AsyncWrite + Send + Unpin,
{
    'drain: while let Some(updates) = queue.next_batch().await {
        let mut buf = Vec::new();
        for update in updates {
            match frame_of(update).to_bytes() {
                Ok(bytes) => buf.extend_from_slice(&bytes),
                Err(err) => {
                    // Updates only carry values we serialized before.
                    warn!(target: "coord", "Failed to encode update: {err}");
                }
            }
        }
        tokio::select! {
            biased;
            result = async {
                writer.write_all(&buf).await?;
                writer.flush().await
            } => {
                if let Err(err) = result {
                    debug!(target: "coord", "Transport write failed: {err}");
                    break 'drain;
                }
            }
            // Cancellation frees us from a transport that stopped reading.
            _ = cancel.cancelled() => break 'drain,
        }
    }
    writer.shutdown().await.ok();
}

/// Read and dispatch the peer's frames until the transport closes, the
/// peer misbehaves, or the serve is cancelled.
async fn recv_loop<R>(
    coordinator: &Coordinator,
    id: &PeerId,
    kind: Kind,
    reader: &mut R,
    cancel: &CancellationToken,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = frame::read(reader) => match frame {
                Ok(frame) => frame,
                Err(err) if err.is_eof() => return Ok(()),
                Err(err) => return Err(err.into()),
            },
        };
        match frame {
            Frame::SelfUpdate(node) => coordinator.core().self_update(id, node),
            Frame::Subscribe(agent) if kind != Kind::Agent => {
                coordinator.core().subscribe(id, agent);
            }
            Frame::Unsubscribe(agent) if kind != Kind::Agent => {
                coordinator.core().unsubscribe(id, &agent);
            }
            frame => {
                return Err(Error::Protocol(wire::Error::WrongDirection(
                    frame.frame_type() as u8,
                )));
            }
        }
    }
}
