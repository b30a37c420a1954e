use super::message::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
use super::sink::Sink;
use super::transport::Transport;
use super::{Index, Log};
use crate::error::{Error, Result};

use itertools::Itertools as _;
use log::{debug, error, info};
use rand::Rng as _;
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};

/// A node ID.
pub type NodeID = u8;

/// A leader term.
pub type Term = u64;

/// Raft node options. The defaults suit simulated networks with up to 500 ms
/// of injected RPC latency; scaled-down timings work as well, as long as the
/// heartbeat interval stays well below the election timeout range and the
/// range's upper bound is at least twice its lower bound.
#[derive(Clone)]
pub struct Options {
    /// The range of randomized election timeouts.
    pub election_timeout: Range<Duration>,
    /// How often election timers check whether the timeout has expired.
    pub election_poll_interval: Duration,
    /// The interval between leader heartbeats.
    pub heartbeat_interval: Duration,
    /// The capacity of the apply notifier channel.
    pub apply_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            election_timeout: super::ELECTION_TIMEOUT,
            election_poll_interval: super::ELECTION_POLL_INTERVAL,
            heartbeat_interval: super::HEARTBEAT_INTERVAL,
            apply_capacity: super::APPLY_CAPACITY,
        }
    }
}

/// A point-in-time view of a node's identity, term, and leadership.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Status {
    /// The node ID.
    pub id: NodeID,
    /// The node's current term.
    pub term: Term,
    /// Whether the node currently considers itself the leader.
    pub leader: bool,
}

/// A Raft node, as seen by the hosting process and by inbound RPC dispatch.
///
/// The handle is cheap to clone; all clones address the same node. The node
/// runs as a set of cooperating tasks on the tokio runtime: an election timer
/// (spawned afresh on every role change, with stale timers exiting on their
/// next poll), a heartbeat loop while leader, one task per outbound RPC, and
/// the apply pipeline draining committed entries to the sink. All shared
/// state lives behind a single mutex; the lock is only held across
/// straight-line state transitions, never across an RPC or sink write.
#[derive(Clone)]
pub struct Node {
    shared: Arc<Shared>,
}

impl Node {
    /// Creates a node and spawns its background tasks onto the current tokio
    /// runtime. The node idles until the ready signal turns true, so that the
    /// hosting process can register every peer with the transport before any
    /// RPCs fly.
    pub fn new(
        id: NodeID,
        peers: Vec<NodeID>,
        transport: Arc<dyn Transport>,
        sink: Box<dyn Sink>,
        opts: Options,
        ready: watch::Receiver<bool>,
    ) -> Self {
        let (apply_tx, apply_rx) = mpsc::channel(opts.apply_capacity.max(1));
        let node = Node {
            shared: Arc::new(Shared {
                id,
                peers,
                transport,
                opts,
                raw: Mutex::new(RawNode {
                    term: 0,
                    vote: None,
                    log: Log::new(),
                    last_applied: 0,
                    role: Role::Follower,
                    election_reset: Instant::now(),
                    apply_tx: Some(apply_tx),
                }),
            }),
        };
        node.spawn_apply(apply_rx, sink);
        node.start_when_ready(ready);
        node
    }

    /// Returns the node ID.
    pub fn id(&self) -> NodeID {
        self.shared.id
    }

    /// Returns the node's current status.
    pub fn status(&self) -> Status {
        let raw = self.shared.lock();
        Status {
            id: self.shared.id,
            term: raw.term,
            leader: matches!(raw.role, Role::Leader(_)),
        }
    }

    /// Submits a client command for replication, returning the log index it
    /// was accepted at. Only the leader accepts commands; followers and
    /// candidates reject them without any state change, and the caller must
    /// retry against the leader. Submission does not wait for the command to
    /// commit: completion is observed through the apply sink.
    pub fn submit(&self, command: Vec<u8>) -> Result<Index> {
        let mut guard = self.shared.lock();
        let raw = &mut *guard;
        match raw.role {
            Role::Leader(_) => {}
            Role::Dead => return Err(Error::Abort),
            Role::Follower | Role::Candidate(_) => return Err(Error::NotLeader),
        }
        let index = raw.log.append(raw.term, command);
        debug!("[{}] Accepted command at index {index} in term {}", self.shared.id, raw.term);
        // A lone node commits immediately; with peers, replication rides the
        // next heartbeat round.
        if self.shared.peers.is_empty() {
            raw.maybe_commit(self.shared.id, self.shared.quorum_size());
        }
        Ok(index)
    }

    /// Shuts the node down: the role becomes Dead (terminal) and the apply
    /// notifier is closed, which drains and stops the apply pipeline. All
    /// other tasks observe the role change at their next checkpoint and exit;
    /// there are no forcible aborts. Idempotent.
    pub fn kill(&self) {
        let mut raw = self.shared.lock();
        if matches!(raw.role, Role::Dead) {
            return;
        }
        info!("[{}] Shutting down", self.shared.id);
        raw.role = Role::Dead;
        raw.apply_tx = None;
    }

    /// Answers a RequestVote RPC from a campaigning candidate.
    pub fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply> {
        let mut guard = self.shared.lock();
        let raw = &mut *guard;
        if matches!(raw.role, Role::Dead) {
            return Err(Error::Abort);
        }
        debug!("[{}] Received vote request {args:?}", self.shared.id);

        if args.term > raw.term {
            self.become_follower(raw, args.term);
        }

        // Grant the vote if the candidate's term is current, we haven't voted
        // for anyone else in it, and the candidate's log is at least as
        // up-to-date as ours (section 5.4.1 in the Raft paper). Granting a
        // vote defers our own election timeout.
        let (last_log_index, last_log_term) = raw.log.get_last_index();
        let up_to_date = args.last_log_term > last_log_term
            || (args.last_log_term == last_log_term && args.last_log_index >= last_log_index);
        let mut vote_granted = false;
        if args.term == raw.term
            && up_to_date
            && raw.vote.map(|vote| vote == args.candidate_id).unwrap_or(true)
        {
            info!("[{}] Voting for {} in term {}", self.shared.id, args.candidate_id, args.term);
            raw.vote = Some(args.candidate_id);
            raw.election_reset = Instant::now();
            vote_granted = true;
        }
        Ok(RequestVoteReply { term: raw.term, vote_granted })
    }

    /// Answers an AppendEntries RPC from a leader. An empty entry set is a
    /// pure heartbeat; the semantics are otherwise identical.
    pub fn append_entries(&self, args: AppendEntriesArgs) -> Result<AppendEntriesReply> {
        let mut guard = self.shared.lock();
        let raw = &mut *guard;
        if matches!(raw.role, Role::Dead) {
            return Err(Error::Abort);
        }
        if !args.entries.is_empty() {
            debug!(
                "[{}] Received {} entries from {} with base {}@{}",
                self.shared.id,
                args.entries.len(),
                args.leader_id,
                args.prev_log_index,
                args.prev_log_term
            );
        }

        if args.term > raw.term {
            self.become_follower(raw, args.term);
        }

        let mut success = false;
        if args.term == raw.term {
            // There is a live leader for our term: a candidate concedes the
            // election (keeping its vote, since the term didn't change), and
            // a second leader would violate election safety. Any valid-term
            // message from the leader defers our election timeout.
            match raw.role {
                Role::Follower => {}
                Role::Candidate(_) => self.become_follower(raw, args.term),
                Role::Leader(_) => {
                    panic!("saw other leader {} in term {}", args.leader_id, args.term)
                }
                Role::Dead => unreachable!("dead node stepped a message"),
            }
            raw.election_reset = Instant::now();

            // Append the entries if our log contains the base entry,
            // replacing any conflicting suffix. On a mismatch the leader
            // walks its base back one entry and retries on the next
            // heartbeat.
            if args.prev_log_index == 0 || raw.log.has(args.prev_log_index, args.prev_log_term) {
                success = true;
                let last_new = args.prev_log_index + args.entries.len() as Index;
                raw.log.splice(args.entries);

                // Advance our commit index to the leader's, bounded by the
                // last entry known to match the leader's log, and wake the
                // apply pipeline.
                if args.leader_commit > raw.log.get_commit_index() {
                    let commit_index = std::cmp::min(args.leader_commit, last_new);
                    if commit_index > raw.log.get_commit_index() {
                        raw.log.commit(commit_index);
                        debug!("[{}] Commit index advanced to {commit_index}", self.shared.id);
                        raw.notify_apply();
                    }
                }
            }
        }
        Ok(AppendEntriesReply { term: raw.term, success })
    }

    /// Waits for the ready signal, then arms the first election timer.
    fn start_when_ready(&self, mut ready: watch::Receiver<bool>) {
        let node = self.clone();
        tokio::spawn(async move {
            if ready.wait_for(|ready| *ready).await.is_err() {
                error!("[{}] Ready signal dropped, node never starts", node.shared.id);
                return;
            }
            info!("[{}] Starting as follower", node.shared.id);
            {
                let mut raw = node.shared.lock();
                if matches!(raw.role, Role::Dead) {
                    return;
                }
                raw.election_reset = Instant::now();
            }
            node.spawn_election_timer();
        });
    }

    /// Spawns an election timer for the current term, with a randomized
    /// timeout. The timer polls periodically and starts an election if
    /// nothing deferred the timeout: granting a vote, hearing from a valid
    /// leader, or starting a candidacy all reset it. Role transitions spawn
    /// fresh timers; a stale timer notices the term change (or a leader or
    /// dead role) at its next poll and exits.
    fn spawn_election_timer(&self) {
        let node = self.clone();
        tokio::spawn(async move {
            let timeout = node.shared.gen_election_timeout();
            let term = node.shared.lock().term;
            debug!(
                "[{}] Election timer started with timeout {timeout:?} in term {term}",
                node.shared.id
            );
            let mut ticker = time::interval(node.shared.opts.election_poll_interval);
            loop {
                ticker.tick().await;
                let mut guard = node.shared.lock();
                let raw = &mut *guard;
                match raw.role {
                    Role::Follower | Role::Candidate(_) => {}
                    Role::Leader(_) | Role::Dead => return,
                }
                if raw.term != term {
                    return;
                }
                if raw.election_reset.elapsed() >= timeout {
                    node.campaign(raw);
                    return;
                }
            }
        });
    }

    /// Starts a new election: become a candidate in the next term, vote for
    /// ourself, and solicit votes from all peers.
    fn campaign(&self, raw: &mut RawNode) {
        raw.term += 1;
        raw.vote = Some(self.shared.id);
        raw.role = Role::Candidate(Candidate::new(self.shared.id));
        raw.election_reset = Instant::now();
        info!("[{}] Starting election for term {}", self.shared.id, raw.term);

        // A lone node wins immediately with its own vote.
        if self.shared.peers.is_empty() {
            self.become_leader(raw);
            return;
        }

        let (last_log_index, last_log_term) = raw.log.get_last_index();
        for peer in self.shared.peers.iter().copied().sorted() {
            let args = RequestVoteArgs {
                term: raw.term,
                candidate_id: self.shared.id,
                last_log_index,
                last_log_term,
            };
            self.solicit_vote(peer, args);
        }

        // Run another election timer, in case this election doesn't succeed.
        self.spawn_election_timer();
    }

    /// Requests a vote from a peer and tallies the reply. On a quorum of
    /// votes the candidacy converts to leadership.
    fn solicit_vote(&self, peer: NodeID, args: RequestVoteArgs) {
        let node = self.clone();
        tokio::spawn(async move {
            let term = args.term;
            debug!("[{}] Requesting vote from {peer} in term {term}", node.shared.id);
            let reply = match node.shared.transport.request_vote(peer, args).await {
                Ok(reply) => reply,
                Err(err) => {
                    debug!("[{}] Vote request to {peer} failed: {err}", node.shared.id);
                    return;
                }
            };

            // Process the reply under the lock, re-checking that we're still
            // campaigning in the term the request was sent for.
            let mut guard = node.shared.lock();
            let raw = &mut *guard;
            if reply.term > raw.term {
                node.become_follower(raw, reply.term);
                return;
            }
            if raw.term != term || reply.term != term || !reply.vote_granted {
                return;
            }
            let Role::Candidate(candidate) = &mut raw.role else { return };
            candidate.votes.insert(peer);
            let votes = candidate.votes.len();
            debug!("[{}] Received vote from {peer} in term {term} ({votes} total)", node.shared.id);
            if votes >= node.shared.quorum_size() {
                node.become_leader(raw);
            }
        });
    }

    /// Transitions the node to follower in the given term, resetting the
    /// election timer. When the term advances the vote is cleared; an
    /// equal-term transition (a candidate conceding to the election winner)
    /// keeps it, since votes are per-term.
    fn become_follower(&self, raw: &mut RawNode, term: Term) {
        assert!(term >= raw.term, "term regression {} → {}", raw.term, term);
        assert!(!matches!(raw.role, Role::Dead), "dead node can't become follower");
        if term > raw.term {
            info!("[{}] Becoming follower in term {term}", self.shared.id);
            raw.term = term;
            raw.vote = None;
        } else {
            info!("[{}] Stepping down to follower in term {term}", self.shared.id);
        }
        raw.role = Role::Follower;
        raw.election_reset = Instant::now();
        self.spawn_election_timer();
    }

    /// Transitions a candidate to leader, initializing replication progress
    /// for every peer and starting the heartbeat loop.
    fn become_leader(&self, raw: &mut RawNode) {
        assert!(matches!(raw.role, Role::Candidate(_)), "non-candidate can't become leader");
        let (last_index, _) = raw.log.get_last_index();
        raw.role = Role::Leader(Leader::new(&self.shared.peers, last_index));
        info!("[{}] Won election, becoming leader in term {}", self.shared.id, raw.term);
        self.spawn_heartbeat_loop(raw.term);
    }

    /// Runs the leader's heartbeat loop: one AppendEntries round to every
    /// peer per interval, carrying any pending entries. Exits when the node
    /// is no longer the leader of the term it was started for.
    fn spawn_heartbeat_loop(&self, term: Term) {
        let node = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(node.shared.opts.heartbeat_interval);
            loop {
                ticker.tick().await; // first tick fires immediately
                {
                    let raw = node.shared.lock();
                    if !matches!(raw.role, Role::Leader(_)) || raw.term != term {
                        return;
                    }
                }
                for peer in node.shared.peers.iter().copied().sorted() {
                    node.send_append(peer, term);
                }
            }
        });
    }

    /// Sends one AppendEntries to a peer, built from the peer's next_index,
    /// and processes the reply. Transport failures abandon the round; the
    /// next heartbeat retries.
    fn send_append(&self, peer: NodeID, term: Term) {
        let node = self.clone();
        tokio::spawn(async move {
            // Build the request under the lock.
            let (args, next_index) = {
                let guard = node.shared.lock();
                let Role::Leader(leader) = &guard.role else { return };
                if guard.term != term {
                    return;
                }
                let (last_index, _) = guard.log.get_last_index();
                let next_index = leader.progress.get(&peer).expect("unknown peer").next_index;
                assert!(
                    next_index >= 1 && next_index <= last_index + 1,
                    "invalid next_index {next_index} for peer {peer}"
                );
                let prev_log_index = next_index - 1;
                let prev_log_term =
                    guard.log.get(prev_log_index).map(|entry| entry.term).unwrap_or(0);
                let args = AppendEntriesArgs {
                    term,
                    leader_id: node.shared.id,
                    prev_log_index,
                    prev_log_term,
                    entries: guard.log.scan_from(next_index).to_vec(),
                    leader_commit: guard.log.get_commit_index(),
                };
                (args, next_index)
            };
            let sent = args.entries.len() as Index;
            if sent > 0 {
                debug!(
                    "[{}] Replicating {sent} entries from {next_index} to {peer}",
                    node.shared.id
                );
            }

            let reply = match node.shared.transport.append_entries(peer, args).await {
                Ok(reply) => reply,
                Err(err) => {
                    debug!("[{}] Append to {peer} failed: {err}", node.shared.id);
                    return;
                }
            };

            // Process the reply under the lock, re-checking that we're still
            // the leader of the term the request was sent for. Stale-term
            // replies are discarded.
            let mut guard = node.shared.lock();
            let raw = &mut *guard;
            if reply.term > raw.term {
                node.become_follower(raw, reply.term);
                return;
            }
            if raw.term != term || reply.term != term {
                return;
            }
            let Role::Leader(leader) = &mut raw.role else { return };
            let (last_index, _) = raw.log.get_last_index();
            let progress = leader.progress.get_mut(&peer).expect("unknown peer");
            let advanced = if reply.success {
                let match_index = next_index + sent - 1;
                assert!(match_index <= last_index, "peer {peer} matched unknown index");
                progress.advance(match_index)
            } else {
                // The peer's log diverges at or before prev_log_index. Walk
                // the base back one entry; the next heartbeat retries.
                if progress.regress() {
                    debug!(
                        "[{}] Append rejected by {peer}, probing from {}",
                        node.shared.id, progress.next_index
                    );
                }
                false
            };
            if advanced {
                raw.maybe_commit(node.shared.id, node.shared.quorum_size());
            }
        });
    }

    /// Runs the apply pipeline: a single consumer that drains newly committed
    /// entries to the sink whenever the notifier is signalled. Exits when the
    /// notifier is closed on kill.
    fn spawn_apply(&self, mut apply_rx: mpsc::Receiver<()>, mut sink: Box<dyn Sink>) {
        let node = self.clone();
        tokio::spawn(async move {
            // Each signal means the commit index may have advanced. Snapshot
            // the newly committed entries under the lock, then emit them with
            // the lock released. Spurious and coalesced signals are no-ops.
            while apply_rx.recv().await.is_some() {
                let entries = {
                    let mut raw = node.shared.lock();
                    let entries = raw.log.scan_apply(raw.last_applied).to_vec();
                    raw.last_applied = raw.log.get_commit_index();
                    entries
                };
                for entry in entries {
                    debug!("[{}] Applying {}@{}", node.shared.id, entry.index, entry.term);
                    sink.apply(entry);
                }
            }
            debug!("[{}] Apply pipeline stopped", node.shared.id);
        });
    }
}

/// Node state shared between the handle clones and the background tasks.
struct Shared {
    /// The node ID.
    id: NodeID,
    /// The IDs of the other cluster nodes.
    peers: Vec<NodeID>,
    /// The RPC transport towards the peers.
    transport: Arc<dyn Transport>,
    /// Timing and capacity options.
    opts: Options,
    /// All mutable node state, behind the node's single mutex.
    raw: Mutex<RawNode>,
}

impl Shared {
    /// Acquires the state mutex.
    fn lock(&self) -> MutexGuard<'_, RawNode> {
        self.raw.lock().expect("raft state mutex poisoned")
    }

    /// Returns the cluster size as number of nodes.
    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Returns the cluster quorum size (strict majority, counting self).
    fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Generates a randomized election timeout.
    fn gen_election_timeout(&self) -> Duration {
        let timeout = self.opts.election_timeout.clone();
        assert!(!timeout.is_empty(), "empty election timeout range");
        rand::thread_rng().gen_range(timeout)
    }
}

/// A node role. Candidates and leaders carry their role-specific state, which
/// is discarded on transition.
enum Role {
    /// Replicates entries from a leader and votes in elections.
    Follower,
    /// Campaigns for leadership in the current term.
    Candidate(Candidate),
    /// Replicates its log to the peers and accepts client commands.
    Leader(Leader),
    /// Shut down. Terminal: a dead node rejects all operations.
    Dead,
}

/// A candidate campaigning for leadership.
struct Candidate {
    /// Votes received, including our own.
    votes: HashSet<NodeID>,
}

impl Candidate {
    /// Creates a new candidate role with our own vote recorded.
    fn new(id: NodeID) -> Self {
        Self { votes: HashSet::from([id]) }
    }
}

/// A leader replicating its log to the peers.
struct Leader {
    /// Follower replication progress.
    progress: HashMap<NodeID, Progress>,
}

impl Leader {
    /// Creates a new leader role. next_index starts optimistically just past
    /// the leader's log; match_index starts at 0 and is only advanced by
    /// confirmed replication.
    fn new(peers: &[NodeID], last_index: Index) -> Self {
        let progress = peers
            .iter()
            .copied()
            .map(|peer| (peer, Progress { next_index: last_index + 1, match_index: 0 }))
            .collect();
        Self { progress }
    }
}

/// Follower replication progress.
struct Progress {
    /// The next log index to send to the follower. Optimistic: it may
    /// overshoot and get walked back by rejections.
    next_index: Index,
    /// The last index known to be replicated to the follower. Conservative:
    /// only advanced by successful append replies.
    match_index: Index,
}

impl Progress {
    /// Attempts to advance the follower's match index, returning true if it
    /// did. Replies may arrive out of order, so the match index never
    /// regresses; next_index is pulled along with it.
    fn advance(&mut self, match_index: Index) -> bool {
        if match_index <= self.match_index {
            return false;
        }
        self.match_index = match_index;
        self.next_index = std::cmp::max(self.next_index, match_index + 1);
        true
    }

    /// Walks next_index back one entry after a rejected append, to retry with
    /// an earlier base. Won't regress below a confirmed match (nor below 1).
    /// Returns true if next_index changed.
    fn regress(&mut self) -> bool {
        if self.next_index <= self.match_index + 1 {
            return false;
        }
        self.next_index -= 1;
        true
    }
}

/// All mutable node state, guarded by the node's single mutex.
struct RawNode {
    /// The current term. Never decreases.
    term: Term,
    /// Who we voted for in the current term, if anyone.
    vote: Option<NodeID>,
    /// The replicated command log.
    log: Log,
    /// The highest index surfaced to the apply sink. Never exceeds the
    /// commit index.
    last_applied: Index,
    /// The current role.
    role: Role,
    /// When the election timeout was last deferred: by granting a vote, by a
    /// valid-term AppendEntries, or by starting a candidacy.
    election_reset: Instant,
    /// The apply notifier. Taken (None) on kill, which closes the channel and
    /// stops the apply pipeline once drained.
    apply_tx: Option<mpsc::Sender<()>>,
}

impl RawNode {
    /// Signals the apply pipeline that the commit index may have advanced.
    /// The notifier is a level-triggered signal, not a queue: a full channel
    /// means an apply is already pending, and the signal can be dropped.
    fn notify_apply(&self) {
        if let Some(apply_tx) = &self.apply_tx {
            _ = apply_tx.try_send(());
        }
    }

    /// Recomputes the leader's commit index from the peers' match indexes,
    /// returning true if it advanced. Only an entry from the current term can
    /// commit by majority count; earlier entries then commit implicitly via
    /// the log matching property (see figure 8 in the Raft paper for why
    /// counting replicas of an old-term entry is unsafe).
    fn maybe_commit(&mut self, id: NodeID, quorum: usize) -> bool {
        let Role::Leader(leader) = &self.role else { return false };
        let (last_index, _) = self.log.get_last_index();
        let old_commit = self.log.get_commit_index();
        let mut commit_index = old_commit;
        for index in old_commit + 1..=last_index {
            if self.log.get(index).map(|entry| entry.term) != Some(self.term) {
                continue;
            }
            let replicas = 1 + leader.progress.values().filter(|p| p.match_index >= index).count();
            if replicas >= quorum {
                commit_index = index;
            }
        }
        if commit_index == old_commit {
            return false;
        }
        self.log.commit(commit_index);
        debug!("[{id}] Commit index advanced to {commit_index}");
        self.notify_apply();
        true
    }
}
