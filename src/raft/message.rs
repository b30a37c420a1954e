use super::{Entry, Index, NodeID, Term};

use serde_derive::{Deserialize, Serialize};

/// A request for a vote, broadcast by candidates when campaigning for
/// leadership.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    /// The candidate's current term.
    pub term: Term,
    /// The campaigning candidate.
    pub candidate_id: NodeID,
    /// The index of the candidate's last stored log entry.
    pub last_log_index: Index,
    /// The term of the candidate's last stored log entry.
    pub last_log_term: Term,
}

/// A vote reply. Nodes may grant a single vote per term, on a first-come
/// basis, and only to candidates whose log is at least as up-to-date as
/// their own.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    /// The voter's current term. A candidate that sees a higher term than its
    /// own steps down.
    pub term: Term,
    /// Whether the vote was granted.
    pub vote_granted: bool,
}

/// A request to append log entries, sent periodically by leaders to each
/// peer. With an empty entry set this is a pure heartbeat; the semantics are
/// otherwise identical.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    /// The leader's current term.
    pub term: Term,
    /// The sending leader.
    pub leader_id: NodeID,
    /// The index of the log entry immediately preceding the sent entries, or
    /// 0 if the entries start at the head of the log.
    pub prev_log_index: Index,
    /// The term of the entry at prev_log_index, or 0 if none.
    pub prev_log_term: Term,
    /// Entries to replicate.
    pub entries: Vec<Entry>,
    /// The leader's commit index. Followers advance their own commit index to
    /// this, bounded by the last entry they know matches the leader's log.
    pub leader_commit: Index,
}

/// An append reply. Rejections signal that the follower's log diverges at or
/// before prev_log_index, and make the leader probe further back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    /// The recipient's current term. A leader that sees a higher term than
    /// its own steps down.
    pub term: Term,
    /// Whether the entries were accepted, i.e. the recipient's log contained
    /// the (prev_log_index, prev_log_term) entry.
    pub success: bool,
}
