use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Serialize, Serializer};

use crate::fat::codec::ClusterId;

/// A FAT date/time pair packed as `date << 16 | time`, so that ordering
/// the packed value orders the timestamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FatTimestamp(pub u32);

impl FatTimestamp {
    pub fn new(date: u16, time: u16) -> Self {
        Self((date as u32) << 16 | time as u32)
    }

    pub fn date(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn time(&self) -> u16 {
        self.0 as u16
    }

    /// A zero date means the field was never set.
    pub fn is_unset(&self) -> bool {
        self.date() == 0
    }

    pub fn to_datetime(&self) -> Option<NaiveDateTime> {
        if self.is_unset() {
            return None;
        }
        let date = self.date();
        let time = self.time();
        NaiveDate::from_ymd_opt(
            ((date >> 9) & 0x7F) as i32 + 1980,
            ((date >> 5) & 0x0F) as u32,
            (date & 0x1F) as u32,
        )?
        .and_hms_opt(
            ((time >> 11) & 0x1F) as u32,
            ((time >> 5) & 0x3F) as u32,
            (time & 0x1F) as u32 * 2,
        )
    }

    /// Encode a calendar time, truncating seconds to the 2-second FAT
    /// resolution. Years outside 1980..=2107 cannot be stored.
    pub fn from_datetime(dt: &NaiveDateTime) -> Option<Self> {
        use chrono::{Datelike, Timelike};
        let year = dt.year();
        if !(1980..=2107).contains(&year) {
            return None;
        }
        let date = ((year - 1980) as u16) << 9 | (dt.month() as u16) << 5 | dt.day() as u16;
        let time = (dt.hour() as u16) << 11 | (dt.minute() as u16) << 5 | (dt.second() / 2) as u16;
        Some(Self::new(date, time))
    }
}

/// Formats as "YYYY-MM-DD HH:MM:SS"; unset stamps print as nothing.
impl fmt::Display for FatTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unset() {
            return Ok(());
        }
        let date = self.date();
        let time = self.time();
        let day = date & 0x1F;
        let month = (date >> 5) & 0x0F;
        let year = ((date >> 9) & 0x7F) + 1980;
        let second = (time & 0x1F) * 2;
        let minute = (time >> 5) & 0x3F;
        let hour = (time >> 11) & 0x1F;
        write!(f, "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}")
    }
}

impl Serialize for FatTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.is_unset() {
            serializer.serialize_none()
        } else {
            serializer.collect_str(self)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryType {
    File,
    Directory,
}

/// Where an entry's on-disk slots live, for deletion and date updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryLocation {
    /// Absolute sector and byte offset of the short (8.3) entry.
    pub sector: u64,
    pub offset: usize,
    /// Long-name slots preceding the short entry.
    pub lfn_slots: Vec<(u64, usize)>,
}

/// A directory entry handed out by a [`DirectoryTree`](super::tree::DirectoryTree).
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub path: String,
    pub entry_type: EntryType,
    pub attributes: u8,
    pub start_cluster: ClusterId,
    pub size: u64,
    pub created: FatTimestamp,
    pub modified: FatTimestamp,
    /// Access date; FAT keeps no access time.
    pub accessed: FatTimestamp,
    /// Start cluster of the directory holding this entry (0 for the fixed root).
    pub parent_cluster: ClusterId,
    /// `None` for the root, which has no entry of its own.
    pub location: Option<EntryLocation>,
}

impl DirEntry {
    /// The root directory. `start_cluster` is 0 for a fixed FAT12/16 root.
    pub fn root(start_cluster: ClusterId) -> Self {
        Self {
            name: "/".into(),
            path: "/".into(),
            entry_type: EntryType::Directory,
            attributes: 0x10,
            start_cluster,
            size: 0,
            created: FatTimestamp::default(),
            modified: FatTimestamp::default(),
            accessed: FatTimestamp::default(),
            parent_cluster: 0,
            location: None,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.entry_type == EntryType::Directory
    }

    pub fn is_root(&self) -> bool {
        self.location.is_none()
    }

    /// "." or "..".
    pub fn is_dot(&self) -> bool {
        self.name == "." || self.name == ".."
    }

    pub fn as_dir(&self) -> DirRef {
        DirRef {
            path: self.path.clone(),
            start_cluster: self.start_cluster,
        }
    }

    pub fn size_string(&self) -> String {
        if self.is_directory() {
            return String::new();
        }
        crate::check::report::format_size(self.size)
    }
}

/// A directory to list: its path and start cluster (0 = fixed root region).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRef {
    pub path: String,
    pub start_cluster: ClusterId,
}

impl DirRef {
    /// Path of a child named `name`.
    pub fn child_path(&self, name: &str) -> String {
        if self.path == "/" {
            format!("/{name}")
        } else {
            format!("{}/{name}", self.path)
        }
    }
}

/// Timestamps to overwrite; `None` leaves a field unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryDates {
    pub created: Option<FatTimestamp>,
    pub modified: Option<FatTimestamp>,
    /// Only the date half is stored.
    pub accessed: Option<FatTimestamp>,
}
