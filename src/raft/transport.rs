use super::message::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
use super::{Node, NodeID};
use crate::error::{Error, Result};

use async_trait::async_trait;
use rand::Rng as _;
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time;

/// The default probability that a simulated request is dropped.
const LOSS_PROBABILITY: f64 = 0.1;

/// The default range of injected delivery latency for simulated requests.
const LATENCY: Range<Duration> = Duration::from_millis(20)..Duration::from_millis(520);

/// A transport for RPCs from a node to its peers.
///
/// The transport's only contract is reliable at-most-once remote invocation:
/// a call either returns the peer's reply for this exact request, or fails
/// with a transient [`Error::Network`]. Calls may take arbitrarily long, may
/// be dropped, and replies may arrive in any order; the protocol tolerates
/// all of this and retries via the next heartbeat or election round.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Invokes RequestVote on the given peer.
    async fn request_vote(&self, to: NodeID, args: RequestVoteArgs) -> Result<RequestVoteReply>;

    /// Invokes AppendEntries on the given peer.
    async fn append_entries(
        &self,
        to: NodeID,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply>;
}

/// An in-memory cluster network. Requests are dispatched directly to the
/// registered recipient's handlers, after sampling a drop probability and an
/// injected latency, mimicking a flaky LAN. Nodes can be partitioned away
/// from the cluster and reconnected at any time.
///
/// The handle is cheap to clone; all clones address the same network.
#[derive(Clone)]
pub struct Memory {
    shared: Arc<Shared>,
}

struct Shared {
    /// The registered nodes, keyed by ID.
    nodes: Mutex<HashMap<NodeID, Node>>,
    /// Nodes currently partitioned away from the rest of the cluster.
    disconnected: Mutex<HashSet<NodeID>>,
    /// The probability in [0, 1] that any request is dropped.
    loss: f64,
    /// Injected delivery latency, sampled uniformly per request.
    latency: Range<Duration>,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new(LOSS_PROBABILITY, LATENCY)
    }
}

impl Memory {
    /// Creates a network with the given loss probability and latency range.
    pub fn new(loss: f64, latency: Range<Duration>) -> Self {
        assert!((0.0..=1.0).contains(&loss), "loss probability {loss} out of range");
        Self {
            shared: Arc::new(Shared {
                nodes: Mutex::new(HashMap::new()),
                disconnected: Mutex::new(HashSet::new()),
                loss,
                latency,
            }),
        }
    }

    /// Returns a node's endpoint into the network, for use as its transport.
    pub fn endpoint(&self, id: NodeID) -> Arc<dyn Transport> {
        Arc::new(Endpoint { from: id, net: self.clone() })
    }

    /// Registers a node to receive requests addressed to its ID.
    pub fn register(&self, id: NodeID, node: Node) {
        self.shared.nodes.lock().expect("network mutex poisoned").insert(id, node);
    }

    /// Partitions a node away from the cluster: requests from and to it fail
    /// until it is reconnected, including requests already in flight.
    pub fn disconnect(&self, id: NodeID) {
        self.shared.disconnected.lock().expect("network mutex poisoned").insert(id);
    }

    /// Heals a node's partition.
    pub fn reconnect(&self, id: NodeID) {
        self.shared.disconnected.lock().expect("network mutex poisoned").remove(&id);
    }

    /// Fails unless both endpoints of a link are connected.
    fn check_link(&self, from: NodeID, to: NodeID) -> Result<()> {
        let disconnected = self.shared.disconnected.lock().expect("network mutex poisoned");
        if disconnected.contains(&from) || disconnected.contains(&to) {
            return Err(Error::Network(format!("link {from} → {to} is down")));
        }
        Ok(())
    }

    /// Samples the injected latency for one request.
    fn delay(&self) -> Duration {
        if self.shared.latency.is_empty() {
            return self.shared.latency.start;
        }
        rand::thread_rng().gen_range(self.shared.latency.clone())
    }

    /// Routes one request to the recipient's handler, applying loss, latency,
    /// and partitions.
    async fn call<T>(
        &self,
        from: NodeID,
        to: NodeID,
        dispatch: impl FnOnce(&Node) -> Result<T> + Send,
    ) -> Result<T> {
        self.check_link(from, to)?;
        if self.shared.loss > 0.0 && rand::thread_rng().gen_bool(self.shared.loss) {
            return Err(Error::Network(format!("request {from} → {to} dropped")));
        }
        time::sleep(self.delay()).await;
        // The partition may have happened while the request was in flight.
        self.check_link(from, to)?;
        let node = self
            .shared
            .nodes
            .lock()
            .expect("network mutex poisoned")
            .get(&to)
            .cloned()
            .ok_or_else(|| Error::Network(format!("unknown peer {to}")))?;
        dispatch(&node)
    }
}

/// A single node's view of a [`Memory`] network.
struct Endpoint {
    from: NodeID,
    net: Memory,
}

#[async_trait]
impl Transport for Endpoint {
    async fn request_vote(&self, to: NodeID, args: RequestVoteArgs) -> Result<RequestVoteReply> {
        self.net.call(self.from, to, |node| node.request_vote(args)).await
    }

    async fn append_entries(
        &self,
        to: NodeID,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply> {
        self.net.call(self.from, to, |node| node.append_entries(args)).await
    }
}
