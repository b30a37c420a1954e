mod log;
mod message;
mod node;
mod sink;
mod transport;

pub use self::log::{Entry, Index, Log};
pub use message::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
pub use node::{Node, NodeID, Options, Status, Term};
pub use sink::{FileSink, Sink};
pub use transport::{Memory, Transport};

use std::ops::Range;
use std::time::Duration;

/// The default range of randomized election timeouts. The lower bound must
/// comfortably exceed the heartbeat interval plus the worst-case RPC latency,
/// and the upper bound must be at least twice the lower bound so that
/// candidates spread out enough to avoid repeated split votes.
pub const ELECTION_TIMEOUT: Range<Duration> =
    Duration::from_millis(3000)..Duration::from_millis(6000);

/// The default interval at which election timers check whether the timeout
/// has expired.
pub const ELECTION_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// The default interval between leader heartbeats. Each heartbeat round sends
/// one AppendEntries per peer, carrying any pending entries.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

/// The default capacity of the apply notifier channel. The notifier is a
/// level-triggered signal, not a queue: a full channel means an apply is
/// already pending, and further signals can be dropped.
pub const APPLY_CAPACITY: usize = 16;
