use log::debug;

use super::entry::{DirEntry, DirRef, EntryDates, EntryLocation, EntryType, FatTimestamp};
use super::tree::DirectoryTree;
use crate::error::{FatError, Result};
use crate::fat::codec::{Classification, ClusterId};
use crate::fat::table::ClusterTable;
use crate::fat::volume::FatType;

pub(crate) const DIR_ENTRY_SIZE: usize = 32;
const ATTR_READ_ONLY: u8 = 0x01;
const ATTR_HIDDEN: u8 = 0x02;
const ATTR_SYSTEM: u8 = 0x04;
const ATTR_VOLUME_ID: u8 = 0x08;
pub(crate) const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LONG_NAME: u8 = ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_VOLUME_ID;
const DELETED_MARK: u8 = 0xE5;
/// A directory never holds more than 65536 entries.
const MAX_DIR_BYTES: u64 = 65536 * DIR_ENTRY_SIZE as u64;

/// [`DirectoryTree`] over the on-disk FAT directory structures of the
/// volume `table` was mounted from.
pub struct FatDirectoryTree<'a> {
    table: &'a ClusterTable,
}

/// Raw directory contents with the device position of every byte.
struct DirData {
    bytes: Vec<u8>,
    /// First sector of each `sectors_per_chunk`-sector chunk of `bytes`.
    chunk_sectors: Vec<u64>,
    chunk_len: usize,
}

impl DirData {
    fn slot_position(&self, offset: usize, bytes_per_sector: usize) -> (u64, usize) {
        let chunk = offset / self.chunk_len;
        let within = offset % self.chunk_len;
        (
            self.chunk_sectors[chunk] + (within / bytes_per_sector) as u64,
            within % bytes_per_sector,
        )
    }
}

impl<'a> FatDirectoryTree<'a> {
    pub fn new(table: &'a ClusterTable) -> Self {
        Self { table }
    }

    fn read_fixed_root(&self) -> Result<DirData> {
        let g = self.table.geometry();
        if g.fat_type == FatType::Fat32 {
            return Err(FatError::InvalidArgument(
                "FAT32 has no fixed root directory".into(),
            ));
        }
        let len = g.root_dir_sectors() as usize * g.bytes_per_sector as usize;
        let mut bytes = vec![0u8; len];
        self.table
            .device()
            .read_at(g.root_dir_start(), 0, &mut bytes)?;
        Ok(DirData {
            bytes,
            chunk_sectors: vec![g.root_dir_start()],
            chunk_len: len.max(1),
        })
    }

    /// Read a directory chain, stopping at the first cluster that does not
    /// continue it and never reading more than a directory can hold.
    fn read_chain_dir(&self, start: ClusterId) -> Result<DirData> {
        let g = self.table.geometry();
        let cluster_size = g.cluster_size() as usize;
        let max_clusters = (MAX_DIR_BYTES / g.cluster_size()).max(1) as usize;

        let mut data = DirData {
            bytes: Vec::new(),
            chunk_sectors: Vec::new(),
            chunk_len: cluster_size,
        };
        let mut cluster = start;
        while self.table.codec().in_range(cluster) && data.chunk_sectors.len() < max_clusters {
            let sector = g.cluster_sector(cluster);
            let at = data.bytes.len();
            data.bytes.resize(at + cluster_size, 0);
            self.table
                .device()
                .read_at(sector, 0, &mut data.bytes[at..])?;
            data.chunk_sectors.push(sector);
            match self.table.entry(cluster)? {
                Classification::Allocated(next) => cluster = next,
                _ => break,
            }
        }
        Ok(data)
    }

    /// Parse directory entries from raw data bytes.
    fn parse_directory(&self, data: &DirData, dir: &DirRef) -> Vec<DirEntry> {
        let g = self.table.geometry();
        let bps = g.bytes_per_sector as usize;
        let mut entries = Vec::new();
        let mut lfn_parts: Vec<(u8, String)> = Vec::new();
        let mut lfn_slots: Vec<(u64, usize)> = Vec::new();
        let num_entries = data.bytes.len() / DIR_ENTRY_SIZE;

        for i in 0..num_entries {
            let off = i * DIR_ENTRY_SIZE;
            let entry_bytes = &data.bytes[off..off + DIR_ENTRY_SIZE];

            // End of directory marker
            if entry_bytes[0] == 0x00 {
                break;
            }

            if entry_bytes[0] == DELETED_MARK {
                lfn_parts.clear();
                lfn_slots.clear();
                continue;
            }

            let attr = entry_bytes[11];

            if attr & 0x3F == ATTR_LONG_NAME {
                let seq = entry_bytes[0] & 0x3F;
                // LFN entry layout (13 UTF-16LE characters per entry):
                //   Bytes 1-10:  characters 1-5
                //   Bytes 14-25: characters 6-11
                //   Bytes 26-27: first cluster low (always 0, NOT character data)
                //   Bytes 28-31: characters 12-13
                let units = (1..11)
                    .step_by(2)
                    .chain((14..26).step_by(2))
                    .chain((28..32).step_by(2))
                    .map(|at| u16::from_le_bytes([entry_bytes[at], entry_bytes[at + 1]]))
                    .take_while(|&c| c != 0x0000 && c != 0xFFFF);
                let part: String = char::decode_utf16(units)
                    .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
                    .collect();

                if entry_bytes[0] & 0x40 != 0 {
                    // First (last physical) LFN entry
                    lfn_parts.clear();
                    lfn_slots.clear();
                }
                lfn_parts.push((seq, part));
                lfn_slots.push(data.slot_position(off, bps));
                continue;
            }

            if attr & ATTR_VOLUME_ID != 0 {
                lfn_parts.clear();
                lfn_slots.clear();
                continue;
            }

            let mut raw_name = [0u8; 11];
            raw_name.copy_from_slice(&entry_bytes[0..11]);
            let short_name = short_name(&raw_name, entry_bytes[12]);

            let long_name = if !lfn_parts.is_empty() && short_name != "." && short_name != ".." {
                lfn_parts.sort_by_key(|&(seq, _)| seq);
                lfn_parts.iter().map(|(_, s)| s.as_str()).collect()
            } else {
                String::new()
            };
            lfn_parts.clear();
            let slots = std::mem::take(&mut lfn_slots);

            let display_name = if !long_name.is_empty() {
                long_name
            } else {
                short_name
            };

            let word = |at: usize| u16::from_le_bytes([entry_bytes[at], entry_bytes[at + 1]]);
            let cluster_hi = if g.fat_type == FatType::Fat32 {
                word(20) as u32
            } else {
                0
            };
            let start_cluster = (cluster_hi << 16) | word(26) as u32;
            let size = u32::from_le_bytes([
                entry_bytes[28],
                entry_bytes[29],
                entry_bytes[30],
                entry_bytes[31],
            ]) as u64;

            let (sector, offset) = data.slot_position(off, bps);
            entries.push(DirEntry {
                path: dir.child_path(&display_name),
                name: display_name,
                entry_type: if attr & ATTR_DIRECTORY != 0 {
                    EntryType::Directory
                } else {
                    EntryType::File
                },
                attributes: attr,
                start_cluster,
                size,
                created: FatTimestamp::new(word(16), word(14)),
                modified: FatTimestamp::new(word(24), word(22)),
                accessed: FatTimestamp::new(word(18), 0),
                parent_cluster: dir.start_cluster,
                location: Some(EntryLocation {
                    sector,
                    offset,
                    lfn_slots: slots,
                }),
            });
        }

        entries
    }

    fn require_location<'e>(&self, entry: &'e DirEntry) -> Result<&'e EntryLocation> {
        if !self.table.device().is_writable() {
            return Err(FatError::ReadOnly);
        }
        entry.location.as_ref().ok_or_else(|| {
            FatError::InvalidArgument("the root directory has no entry to modify".into())
        })
    }
}

impl DirectoryTree for FatDirectoryTree<'_> {
    fn root(&mut self) -> Result<DirEntry> {
        let g = self.table.geometry();
        Ok(DirEntry::root(if g.fat_type == FatType::Fat32 {
            g.root_cluster
        } else {
            0
        }))
    }

    fn read_dir(&mut self, dir: &DirRef) -> Result<Vec<DirEntry>> {
        let data = if dir.start_cluster == 0 {
            self.read_fixed_root()?
        } else {
            self.read_chain_dir(dir.start_cluster)?
        };
        Ok(self.parse_directory(&data, dir))
    }

    fn delete_entry(&mut self, entry: &DirEntry) -> Result<()> {
        let location = self.require_location(entry)?;
        let device = self.table.device();
        for &(sector, offset) in &location.lfn_slots {
            device.write_at(sector, offset, &[DELETED_MARK])?;
        }
        device.write_at(location.sector, location.offset, &[DELETED_MARK])?;
        debug!("deleted directory entry {}", entry.path);
        Ok(())
    }

    fn set_dates(&mut self, entry: &DirEntry, dates: EntryDates) -> Result<()> {
        let location = self.require_location(entry)?;
        let device = self.table.device();
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        device.read_at(location.sector, location.offset, &mut raw)?;
        let mut put = |at: usize, value: u16| raw[at..at + 2].copy_from_slice(&value.to_le_bytes());
        if let Some(ts) = dates.created {
            put(14, ts.time());
            put(16, ts.date());
        }
        if let Some(ts) = dates.accessed {
            put(18, ts.date());
        }
        if let Some(ts) = dates.modified {
            put(22, ts.time());
            put(24, ts.date());
        }
        device.write_at(location.sector, location.offset, &raw)?;
        Ok(())
    }
}

/// Base name was stored in lower case by NT-family systems.
const CASE_LOWER_BASE: u8 = 0x08;
/// Extension was stored in lower case by NT-family systems.
const CASE_LOWER_EXT: u8 = 0x10;

/// Display form of an 8.3 name field. Bytes above 0x7F are OEM code page 437.
fn short_name(raw: &[u8; 11], case_flags: u8) -> String {
    let field = |bytes: &[u8], lower: bool| -> String {
        let end = bytes.iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
        bytes[..end]
            .iter()
            .map(|&b| {
                let c = oem_char(b);
                if lower {
                    c.to_ascii_lowercase()
                } else {
                    c
                }
            })
            .collect()
    };

    let mut base = [0u8; 8];
    base.copy_from_slice(&raw[..8]);
    // 0x05 stands in for a leading 0xE5 character.
    if base[0] == 0x05 {
        base[0] = DELETED_MARK;
    }
    let stem = field(&base, case_flags & CASE_LOWER_BASE != 0);
    let ext = field(&raw[8..], case_flags & CASE_LOWER_EXT != 0);
    if ext.is_empty() {
        stem
    } else {
        format!("{stem}.{ext}")
    }
}

fn oem_char(b: u8) -> char {
    match b {
        0x00..=0x7F => char::from(b),
        _ => CP437_UPPER.chars().nth(usize::from(b - 0x80)).unwrap_or('?'),
    }
}

/// Code page 437 glyphs for 0x80..=0xFF, sixteen per line.
const CP437_UPPER: &str = concat!(
    "ÇüéâäàåçêëèïîìÄÅ",
    "ÉæÆôöòûùÿÖÜ¢£¥₧ƒ",
    "áíóúñÑªº¿⌐¬½¼¡«»",
    "░▒▓│┤╡╢╖╕╣║╗╝╜╛┐",
    "└┴┬├─┼╞╟╚╔╩╦╠═╬╧",
    "╨╤╥╙╘╒╓╫╪┘┌█▄▌▐▀",
    "αßΓπΣσµτΦΘΩδ∞φε∩",
    "≡±≥≤⌠⌡÷≈°∙·√ⁿ²■\u{A0}",
);
