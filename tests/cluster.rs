//! End-to-end scenarios against a simulated five-node cluster. The nodes run
//! on an in-memory network with 10% message loss and 20-520 ms injected
//! latency, and the tests use the default production timings: the paused
//! tokio clock auto-advances through the multi-second election timeouts, so
//! the scenarios complete in milliseconds of wall time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, Instant};

use toyraft::raft::{Entry, Index, Memory, Node, NodeID, Options, Sink, Term};

/// How long to wait for an election to conclude.
const ELECTION_WAIT: Duration = Duration::from_secs(30);

/// How long to wait for applied logs to converge.
const CONVERGE_WAIT: Duration = Duration::from_secs(60);

/// A sink recording every applied entry. Verifies on the spot that entries
/// arrive in strictly ascending index order without gaps or duplicates.
#[derive(Clone, Default)]
struct Recorder {
    entries: Arc<Mutex<Vec<Entry>>>,
}

impl Recorder {
    fn entries(&self) -> Vec<Entry> {
        self.entries.lock().expect("poisoned").clone()
    }

    fn commands(&self) -> Vec<String> {
        self.entries()
            .iter()
            .map(|entry| String::from_utf8_lossy(&entry.command).into_owned())
            .collect()
    }
}

impl Sink for Recorder {
    fn apply(&mut self, entry: Entry) {
        let mut entries = self.entries.lock().expect("poisoned");
        let expected = entries.last().map(|last| last.index + 1).unwrap_or(1);
        assert_eq!(entry.index, expected, "out-of-order apply of {entry:?}");
        entries.push(entry);
    }
}

/// A simulated cluster: one node per ID on a shared in-memory network, with
/// partition control and applied-log inspection.
struct Cluster {
    net: Memory,
    nodes: BTreeMap<NodeID, Node>,
    sinks: BTreeMap<NodeID, Recorder>,
    disconnected: HashSet<NodeID>,
    /// Leaders observed per term, across the cluster's whole lifetime, to
    /// check election safety.
    leaders: HashMap<Term, NodeID>,
}

impl Cluster {
    /// Starts a cluster on the default lossy network.
    fn start(nodes: u8) -> Self {
        Self::start_with(nodes, Memory::default())
    }

    /// Starts a cluster on the given network.
    fn start_with(count: u8, net: Memory) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        let ids: Vec<NodeID> = (0..count).collect();
        let mut nodes = BTreeMap::new();
        let mut sinks = BTreeMap::new();
        for id in ids.iter().copied() {
            let peers = ids.iter().copied().filter(|peer| *peer != id).collect();
            let sink = Recorder::default();
            let node = Node::new(
                id,
                peers,
                net.endpoint(id),
                Box::new(sink.clone()),
                Options::default(),
                ready_rx.clone(),
            );
            net.register(id, node.clone());
            sinks.insert(id, sink);
            nodes.insert(id, node);
        }
        // All nodes are registered and listening: release them.
        drop(ready_rx);
        ready_tx.send(true).expect("nodes dropped ready signal");
        Self { net, nodes, sinks, disconnected: HashSet::new(), leaders: HashMap::new() }
    }

    /// Partitions a node away from the rest of the cluster.
    fn disconnect(&mut self, id: NodeID) {
        self.net.disconnect(id);
        self.disconnected.insert(id);
    }

    /// Heals a node's partition.
    fn reconnect(&mut self, id: NodeID) {
        self.net.reconnect(id);
        self.disconnected.remove(&id);
    }

    /// Iterates over the connected nodes.
    fn connected(&self) -> impl Iterator<Item = &Node> + '_ {
        self.nodes
            .iter()
            .filter(|(id, _)| !self.disconnected.contains(id))
            .map(|(_, node)| node)
    }

    /// Waits until exactly one connected node leads in a term at or above
    /// min_term, returning its ID and term. Stale claims from lower terms
    /// (e.g. a just-reconnected deposed leader that hasn't heard the news)
    /// are ignored, but every claim is checked against election safety: no
    /// term may ever see two different leaders.
    async fn wait_leader(&mut self, min_term: Term) -> (NodeID, Term) {
        let deadline = Instant::now() + ELECTION_WAIT;
        loop {
            let claims: Vec<(NodeID, Term)> = self
                .connected()
                .map(|node| node.status())
                .filter(|status| status.leader)
                .map(|status| (status.id, status.term))
                .collect();
            for (id, term) in claims.iter().copied() {
                let previous = self.leaders.insert(term, id);
                assert!(
                    previous.is_none() || previous == Some(id),
                    "two leaders in term {term}: {} and {id}",
                    previous.unwrap(),
                );
            }
            let current: Vec<_> =
                claims.into_iter().filter(|(_, term)| *term >= min_term).collect();
            if let [(id, term)] = current[..] {
                return (id, term);
            }
            assert!(
                Instant::now() < deadline,
                "no leader with term >= {min_term} elected in time"
            );
            time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Submits a command to the given node, panicking unless accepted.
    fn submit(&self, id: NodeID, command: &str) -> Index {
        self.nodes[&id].submit(command.as_bytes().to_vec()).expect("command rejected")
    }

    /// Waits until every connected node's applied command sequence equals
    /// the expectation.
    async fn wait_applied(&self, expect: &[&str]) {
        let deadline = Instant::now() + CONVERGE_WAIT;
        loop {
            let done = self
                .nodes
                .keys()
                .filter(|id| !self.disconnected.contains(id))
                .all(|id| self.sinks[id].commands() == expect);
            if done {
                return;
            }
            if Instant::now() >= deadline {
                let state: Vec<_> =
                    self.sinks.iter().map(|(id, sink)| (*id, sink.commands())).collect();
                panic!("applied logs did not converge to {expect:?}: {state:?}");
            }
            time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Asserts that the applied logs of all nodes, including disconnected
    /// ones, are prefixes of one another (state machine safety).
    fn assert_applied_prefixes(&self) {
        let logs: Vec<(NodeID, Vec<Entry>)> =
            self.sinks.iter().map(|(id, sink)| (*id, sink.entries())).collect();
        for (a_id, a) in &logs {
            for (b_id, b) in &logs {
                let len = a.len().min(b.len());
                assert_eq!(a[..len], b[..len], "applied logs of {a_id} and {b_id} diverge");
            }
        }
    }

    /// Kills all nodes.
    fn shutdown(&self) {
        for node in self.nodes.values() {
            node.kill();
        }
    }
}

/// Starting a cluster elects exactly one leader. Disconnecting the leader
/// elects a replacement with a higher term, twice over; once only two
/// connected nodes remain, no majority can form and no leader emerges.
#[tokio::test(start_paused = true)]
async fn elections_replace_lost_leaders_until_quorum_lost() {
    let mut cluster = Cluster::start(5);

    let (leader1, term1) = cluster.wait_leader(1).await;
    assert!(term1 >= 1);

    cluster.disconnect(leader1);
    let (leader2, term2) = cluster.wait_leader(term1 + 1).await;
    assert_ne!(leader2, leader1);

    cluster.disconnect(leader2);
    let (leader3, _) = cluster.wait_leader(term2 + 1).await;
    assert_ne!(leader3, leader2);

    cluster.disconnect(leader3);

    // Two connected nodes can't assemble a majority of three: they keep
    // campaigning, but nobody wins.
    time::sleep(Duration::from_secs(6)).await;
    for node in cluster.connected() {
        assert!(!node.status().leader, "leader elected without a quorum");
    }
    cluster.shutdown();
}

/// Reconnecting two deposed leaders restores a majority, and a new leader
/// emerges among the four connected nodes.
#[tokio::test(start_paused = true)]
async fn reconnection_restores_majority() {
    let mut cluster = Cluster::start(5);

    let (leader1, term1) = cluster.wait_leader(1).await;
    cluster.disconnect(leader1);
    let (leader2, term2) = cluster.wait_leader(term1 + 1).await;
    cluster.disconnect(leader2);
    let (leader3, term3) = cluster.wait_leader(term2 + 1).await;
    cluster.disconnect(leader3);
    time::sleep(Duration::from_secs(3)).await;

    cluster.reconnect(leader1);
    cluster.reconnect(leader2);
    let (_, term4) = cluster.wait_leader(term3 + 1).await;
    assert!(term4 > term3);
    cluster.shutdown();
}

/// Committed entries survive leader failover, and commands accepted by a
/// partitioned stale leader are never committed anywhere.
#[tokio::test(start_paused = true)]
async fn committed_entries_survive_failover() {
    let mut cluster = Cluster::start(5);
    let (leader1, term1) = cluster.wait_leader(1).await;

    cluster.submit(leader1, "c1");
    cluster.submit(leader1, "c2");
    cluster.wait_applied(&["c1", "c2"]).await;

    cluster.disconnect(leader1);

    // The stale leader doesn't know it was deposed: it accepts the command,
    // but can never commit it.
    cluster.submit(leader1, "c3");

    let (leader2, _) = cluster.wait_leader(term1 + 1).await;
    for command in ["c4", "c5", "c6", "c7", "c8", "c9", "c10"] {
        cluster.submit(leader2, command);
    }
    let expect = ["c1", "c2", "c4", "c5", "c6", "c7", "c8", "c9", "c10"];
    cluster.wait_applied(&expect).await;

    // The old leader reconnects, discovers the new term, truncates its
    // uncommitted c3, and catches up.
    cluster.reconnect(leader1);
    cluster.wait_applied(&expect).await;
    for (id, sink) in &cluster.sinks {
        assert!(!sink.commands().iter().any(|c| c == "c3"), "node {id} applied c3");
    }
    cluster.assert_applied_prefixes();
    cluster.shutdown();
}

/// Entries accepted by a leader but not replicated before it was partitioned
/// away are discarded on failover and never applied anywhere.
#[tokio::test(start_paused = true)]
async fn uncommitted_entries_discarded_on_failover() {
    let mut cluster = Cluster::start(5);
    let (leader1, term1) = cluster.wait_leader(1).await;

    // Submit and partition in the same instant: with no time passing in
    // between, no heartbeat round can replicate the entries.
    for command in ["c1", "c2", "c3", "c4", "c5"] {
        cluster.submit(leader1, command);
    }
    cluster.disconnect(leader1);

    let (leader2, _) = cluster.wait_leader(term1 + 1).await;
    for command in ["d1", "d2", "d3", "d4", "d5"] {
        cluster.submit(leader2, command);
    }
    cluster.wait_applied(&["d1", "d2", "d3", "d4", "d5"]).await;

    // The old leader rejoins, discards its unreplicated entries, and adopts
    // the new leader's log. No c entry may ever reach any sink.
    cluster.reconnect(leader1);
    cluster.wait_applied(&["d1", "d2", "d3", "d4", "d5"]).await;
    for (id, sink) in &cluster.sinks {
        let commands = sink.commands();
        assert!(
            commands.iter().all(|command| command.starts_with('d')),
            "node {id} applied {commands:?}"
        );
    }
    cluster.assert_applied_prefixes();
    cluster.shutdown();
}

/// A follower that missed committed entries can't win an election against
/// peers holding the longer log.
#[tokio::test(start_paused = true)]
async fn lagging_follower_cannot_win_election() {
    let mut cluster = Cluster::start(5);
    let (leader1, term1) = cluster.wait_leader(1).await;

    cluster.submit(leader1, "c1");
    cluster.submit(leader1, "c2");
    cluster.submit(leader1, "c3");
    cluster.wait_applied(&["c1", "c2", "c3"]).await;

    // Partition a follower, then commit more entries without it.
    let follower = (0..5).find(|id| *id != leader1).unwrap();
    cluster.disconnect(follower);
    cluster.submit(leader1, "c4");
    cluster.submit(leader1, "c5");
    cluster.wait_applied(&["c1", "c2", "c3", "c4", "c5"]).await;

    // Swap the partitions: the lagging follower rejoins as the leader
    // leaves. The follower's log is behind, so it can't win the ensuing
    // election; a node holding c4 and c5 must.
    cluster.disconnect(leader1);
    cluster.reconnect(follower);
    let (leader2, _) = cluster.wait_leader(term1 + 1).await;
    assert_ne!(leader2, follower);
    cluster.wait_applied(&["c1", "c2", "c3", "c4", "c5"]).await;

    cluster.reconnect(leader1);
    cluster.wait_applied(&["c1", "c2", "c3", "c4", "c5"]).await;
    cluster.assert_applied_prefixes();
    cluster.shutdown();
}

/// A stream of commits in quick succession reaches every sink exactly once,
/// in order, even when apply signals coalesce in the bounded notifier.
#[tokio::test(start_paused = true)]
async fn rapid_commits_apply_exactly_once() {
    let latency = Duration::from_millis(10)..Duration::from_millis(50);
    let mut cluster = Cluster::start_with(5, Memory::new(0.0, latency));
    let (leader, _) = cluster.wait_leader(1).await;

    let commands: Vec<String> = (1..=20).map(|i| format!("cmd-{i:02}")).collect();
    for command in &commands {
        cluster.submit(leader, command);
        time::sleep(Duration::from_millis(300)).await;
    }

    let expect: Vec<&str> = commands.iter().map(|command| command.as_str()).collect();
    cluster.wait_applied(&expect).await;
    // The recorders assert contiguous ascending indexes on every apply, so
    // a duplicate or out-of-order emission would already have failed the
    // convergence wait.
    cluster.assert_applied_prefixes();
    cluster.shutdown();
}
