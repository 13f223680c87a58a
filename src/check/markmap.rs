//! Per-cluster ownership marks for one check pass.
//!
//! Marks live in memory when the budget allows. Otherwise a FAT32 volume
//! with a spare table copy lends that copy as scratch space, one 32-bit
//! word per cluster, with an in-memory bitmap recording which words hold
//! a mark so the copy never has to be zeroed up front.

use std::sync::Arc;

use log::debug;

use crate::device::BlockDevice;
use crate::error::{FatError, Result};
use crate::fat::codec::{ClusterId, EntryCodec, MIN_CLUSTER};
use crate::fat::table::ClusterTable;
use crate::fat::volume::FatType;

const LOST_WORD: u32 = 0xFFFF_FFFF;

/// Owner id of the root directory's own chain.
pub const VOLUME_OWNER: u32 = 0;
/// Owner id of entries held in the fixed FAT12/16 root region.
pub const FIXED_ROOT_OWNER: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    Untouched,
    /// Reached from the tree. `owner` is the containing directory's start
    /// cluster for a chain head, the chain's start cluster otherwise.
    Owned { owner: u32, start: bool },
    /// Part of a chain no entry refers to.
    Lost,
}

impl Mark {
    fn to_word(self) -> u32 {
        match self {
            Mark::Untouched => 0,
            Mark::Owned { owner, start } => owner << 1 | start as u32,
            Mark::Lost => LOST_WORD,
        }
    }

    fn from_word(word: u32) -> Self {
        match word {
            0 => Mark::Untouched,
            LOST_WORD => Mark::Lost,
            w => Mark::Owned {
                owner: w >> 1,
                start: w & 1 == 1,
            },
        }
    }
}

/// Tracks which words of the scratch copy hold a mark.
/// Bit 0 of each byte is the lowest index.
struct BusyBitmap {
    data: Vec<u8>,
    bit_count: u64,
}

impl BusyBitmap {
    fn new(bit_count: u64) -> Self {
        Self {
            data: vec![0u8; bit_count.div_ceil(8) as usize],
            bit_count,
        }
    }

    #[inline]
    fn is_bit_set(&self, index: u64) -> bool {
        if index >= self.bit_count {
            return false;
        }
        self.data[(index / 8) as usize] & (1u8 << (index % 8)) != 0
    }

    #[inline]
    fn set_bit(&mut self, index: u64, value: bool) {
        if index >= self.bit_count {
            return;
        }
        let byte = &mut self.data[(index / 8) as usize];
        if value {
            *byte |= 1u8 << (index % 8);
        } else {
            *byte &= !(1u8 << (index % 8));
        }
    }

    fn count_set_bits(&self) -> u64 {
        self.data.iter().map(|b| b.count_ones() as u64).sum()
    }
}

enum Storage {
    Memory(Vec<u32>),
    Scratch {
        device: Arc<dyn BlockDevice>,
        codec: EntryCodec,
        copy: u8,
        busy: BusyBitmap,
    },
}

/// Marks indexed by cluster id, shadowing the table without aliasing it.
pub struct MarkMap {
    storage: Storage,
    max_cluster: ClusterId,
}

impl MarkMap {
    /// Pick a representation for `table`: memory if `4 * n_entries` fits
    /// the budget or no scratch copy can be lent, scratch otherwise.
    pub fn for_table(table: &ClusterTable, memory_budget: usize) -> Self {
        let needed = table.n_entries() as usize * 4;
        if needed > memory_budget {
            if let Some(copy) = scratch_copy(table) {
                debug!(
                    "mark map: {needed} bytes over budget {memory_budget}, using table copy {copy}"
                );
                return Self::scratch(table, copy);
            }
            debug!("mark map: over budget but no spare table copy, keeping it in memory");
        }
        Self::in_memory(table)
    }

    pub fn in_memory(table: &ClusterTable) -> Self {
        Self {
            storage: Storage::Memory(vec![0u32; table.n_entries() as usize]),
            max_cluster: table.max_cluster(),
        }
    }

    fn scratch(table: &ClusterTable, copy: u8) -> Self {
        Self {
            storage: Storage::Scratch {
                device: Arc::clone(table.device()),
                codec: table.codec().clone(),
                copy,
                busy: BusyBitmap::new(table.n_entries() as u64),
            },
            max_cluster: table.max_cluster(),
        }
    }

    pub fn is_scratch(&self) -> bool {
        matches!(self.storage, Storage::Scratch { .. })
    }

    fn index(&self, cluster: ClusterId) -> Result<usize> {
        if !(MIN_CLUSTER..=self.max_cluster).contains(&cluster) {
            return Err(FatError::OutOfRange { cluster });
        }
        Ok((cluster - MIN_CLUSTER) as usize)
    }

    pub fn get(&self, cluster: ClusterId) -> Result<Mark> {
        let index = self.index(cluster)?;
        match &self.storage {
            Storage::Memory(words) => Ok(Mark::from_word(words[index])),
            Storage::Scratch {
                device,
                codec,
                copy,
                busy,
            } => {
                if !busy.is_bit_set(index as u64) {
                    return Ok(Mark::Untouched);
                }
                Ok(Mark::from_word(codec.read_word(
                    device.as_ref(),
                    *copy,
                    cluster,
                )?))
            }
        }
    }

    pub fn set(&mut self, cluster: ClusterId, mark: Mark) -> Result<()> {
        let index = self.index(cluster)?;
        match &mut self.storage {
            Storage::Memory(words) => words[index] = mark.to_word(),
            Storage::Scratch {
                device,
                codec,
                copy,
                busy,
            } => {
                if mark == Mark::Untouched {
                    busy.set_bit(index as u64, false);
                } else {
                    codec.write_word(device.as_ref(), *copy, cluster, mark.to_word())?;
                    busy.set_bit(index as u64, true);
                }
            }
        }
        Ok(())
    }

    /// Number of clusters carrying any mark.
    pub fn marked(&self) -> u64 {
        match &self.storage {
            Storage::Memory(words) => words.iter().filter(|&&w| w != 0).count() as u64,
            Storage::Scratch { busy, .. } => busy.count_set_bits(),
        }
    }
}

/// The copy that can hold marks: FAT32, mirrored, writable.
fn scratch_copy(table: &ClusterTable) -> Option<u8> {
    let geometry = table.geometry();
    if geometry.fat_type != FatType::Fat32
        || !geometry.mirrors()
        || !table.device().is_writable()
    {
        return None;
    }
    Some((geometry.active_copy() + 1) % geometry.num_fats)
}
