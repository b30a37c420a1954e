use super::Entry;
use crate::error::Result;

use std::io::Write as _;
use std::path::Path;

/// A downstream consumer of committed log entries.
///
/// The node's apply pipeline feeds each committed entry to the sink exactly
/// once per node lifetime, in strictly ascending index order without gaps.
/// Commands are opaque to the node; any interpretation happens here.
pub trait Sink: Send + 'static {
    /// Applies a committed entry.
    fn apply(&mut self, entry: Entry);
}

/// A sink that appends applied entries to a file, one line per entry as
/// `index@term command`. Useful for observing a node's applied sequence.
pub struct FileSink {
    file: std::fs::File,
}

impl FileSink {
    /// Creates a sink writing to the given path, truncating any existing
    /// file.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self { file })
    }
}

impl Sink for FileSink {
    fn apply(&mut self, entry: Entry) {
        let command = String::from_utf8_lossy(&entry.command);
        // An apply failure can't be reported back through the pipeline, and
        // silently skipping an entry would corrupt the applied sequence.
        writeln!(self.file, "{}@{} {command}", entry.index, entry.term)
            .expect("apply sink write failed");
    }
}
