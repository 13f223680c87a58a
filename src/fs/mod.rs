pub mod entry;
pub mod fat_dir;
pub mod tree;

pub use entry::{DirEntry, DirRef, EntryDates, EntryType, FatTimestamp};
pub use fat_dir::FatDirectoryTree;
pub use tree::DirectoryTree;
