//! Interface required from an in-memory file-tree library.
//!
//! A server may hang a synthetic file tree off its connection. When it does,
//! the dispatcher resolves walks, permission checks, directory reads and
//! removals against the tree itself, without involving the `Filesystem`
//! callbacks. The tree implementation lives outside this crate; these traits
//! describe exactly what the dispatcher needs from it.

use crate::fcall::{Qid, Stat};
use crate::utils::Result;
use std::sync::Arc;

/// Shared handle to a node of the file tree.
pub type FileRef = Arc<dyn TreeFile>;

/// One file or directory in the tree.
pub trait TreeFile: Send + Sync {
    /// The node's identity.
    fn qid(&self) -> Qid;

    /// A snapshot of the node's metadata.
    fn stat(&self) -> Stat;

    /// The containing directory, None for the root.
    fn parent(&self) -> Option<FileRef>;

    /// Step to the named child, None when it does not exist.
    fn walk(&self, name: &str) -> Option<FileRef>;

    /// Whether `uid` has the access described by `mask` (see [`crate::aperm`]).
    fn has_perm(&self, uid: &str, mask: u32) -> bool;

    /// Snapshot the directory for reading.
    fn open_dir(&self) -> Result<Box<dyn DirReader>>;

    /// Unlink the node from the tree.
    fn remove(&self) -> Result<()>;

    /// Record a modification by incrementing the node's qid version.
    fn bump_version(&self);
}

/// Cursor over a directory snapshot.
///
/// The dispatcher guarantees that `offset` is either 0 (start over) or the
/// position reached by the previous read on the same handle.
pub trait DirReader: Send {
    /// Produce at most `count` bytes of consecutive encoded stat entries.
    /// Entries are never split across reads; an empty result means the
    /// directory is exhausted.
    fn read(&mut self, count: u32, offset: u64) -> Vec<u8>;
}
