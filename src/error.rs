/// A toyRaft error.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The operation was aborted, typically because the node has shut down.
    /// Callers should give up; there is no point retrying against this node.
    Abort,
    /// A command was submitted to a node that isn't the current leader. The
    /// node's state is unchanged; the caller should retry against the leader.
    NotLeader,
    /// A transport-level failure. These are transient: the protocol absorbs
    /// them locally and relies on periodic retry.
    Network(String),
    /// An IO error, e.g. from a file-backed apply sink.
    IO(String),
    /// An invalid configuration value.
    Config(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "operation aborted"),
            Error::NotLeader => write!(f, "not the leader"),
            Error::Network(message) => write!(f, "network error: {message}"),
            Error::IO(message) => write!(f, "io error: {message}"),
            Error::Config(message) => write!(f, "invalid configuration: {message}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::Config(err.to_string())
    }
}

/// A toyRaft result returning the crate-wide Error.
pub type Result<T> = std::result::Result<T, Error>;
