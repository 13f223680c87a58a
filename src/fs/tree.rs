use super::entry::{DirEntry, DirRef, EntryDates};
use crate::error::Result;

/// Directory traversal used by the consistency checker.
pub trait DirectoryTree {
    /// The root directory entry.
    fn root(&mut self) -> Result<DirEntry>;

    /// Every live entry of `dir` in on-disk order, "." and ".." included.
    /// Volume labels and long-name slots are not entries.
    fn read_dir(&mut self, dir: &DirRef) -> Result<Vec<DirEntry>>;

    /// Remove `entry` from its directory. Its clusters are left alone.
    fn delete_entry(&mut self, entry: &DirEntry) -> Result<()>;

    /// Overwrite the timestamps selected in `dates`.
    fn set_dates(&mut self, entry: &DirEntry, dates: EntryDates) -> Result<()>;
}
