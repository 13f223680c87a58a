//! Cluster entry codec.
//!
//! Translates between packed on-disk FAT entries (12, 16 or 32 bits, little
//! endian) and [`Classification`]. Every access touches only the bytes of
//! the addressed entry; a FAT12 entry whose byte pair straddles a sector
//! boundary is read and written as two single-byte transfers.

use byteorder::{ByteOrder, LittleEndian};

use super::volume::{FatType, VolumeGeometry};
use crate::device::BlockDevice;
use crate::error::{FatError, Result};

/// Cluster number. Valid data clusters are `2..=max_cluster`.
pub type ClusterId = u32;

/// Lowest allocatable cluster number.
pub const MIN_CLUSTER: ClusterId = 2;

/// Decoded meaning of one table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Available,
    Allocated(ClusterId),
    EndOfChain,
    Bad,
    /// Reserved value band, or a cluster id the table does not cover.
    Reserved,
    /// Stored value fails range checks.
    Invalid,
}

impl Classification {
    /// True for entries that are part of a chain.
    pub fn is_in_chain(&self) -> bool {
        matches!(self, Classification::Allocated(_) | Classification::EndOfChain)
    }
}

/// Width-specific special values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub mask: u32,
    pub reserved_min: u32,
    pub bad: u32,
    pub eoc_min: u32,
    /// Value written for end-of-chain.
    pub eoc_mark: u32,
}

impl Thresholds {
    pub const fn for_type(fat_type: FatType) -> Self {
        match fat_type {
            FatType::Fat12 => Thresholds {
                mask: 0x0FFF,
                reserved_min: 0x0FF0,
                bad: 0x0FF7,
                eoc_min: 0x0FF8,
                eoc_mark: 0x0FFF,
            },
            FatType::Fat16 => Thresholds {
                mask: 0xFFFF,
                reserved_min: 0xFFF0,
                bad: 0xFFF7,
                eoc_min: 0xFFF8,
                eoc_mark: 0xFFFF,
            },
            FatType::Fat32 => Thresholds {
                mask: 0x0FFF_FFFF,
                reserved_min: 0x0FFF_FFF0,
                bad: 0x0FFF_FFF7,
                eoc_min: 0x0FFF_FFF8,
                eoc_mark: 0x0FFF_FFFF,
            },
        }
    }
}

/// Sector(s) of one table copy touched by an entry write, relative to the
/// start of that copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySpan {
    pub sector: u32,
    /// The entry continues into `sector + 1` (FAT12 only).
    pub straddles: bool,
}

impl EntrySpan {
    pub fn sectors(&self) -> impl Iterator<Item = u32> {
        let last = if self.straddles { self.sector + 1 } else { self.sector };
        self.sector..=last
    }
}

/// Entry codec bound to one volume's layout.
#[derive(Debug, Clone)]
pub struct EntryCodec {
    fat_type: FatType,
    thresholds: Thresholds,
    max_cluster: ClusterId,
    bytes_per_sector: u32,
    reserved_sectors: u32,
    sectors_per_fat: u32,
}

impl EntryCodec {
    pub fn new(geometry: &VolumeGeometry) -> Self {
        Self {
            fat_type: geometry.fat_type,
            thresholds: Thresholds::for_type(geometry.fat_type),
            max_cluster: geometry.max_cluster(),
            bytes_per_sector: geometry.bytes_per_sector,
            reserved_sectors: geometry.reserved_sectors,
            sectors_per_fat: geometry.sectors_per_fat,
        }
    }

    pub fn fat_type(&self) -> FatType {
        self.fat_type
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn max_cluster(&self) -> ClusterId {
        self.max_cluster
    }

    pub fn in_range(&self, cluster: ClusterId) -> bool {
        (MIN_CLUSTER..=self.max_cluster).contains(&cluster)
    }

    /// Classify a width-masked entry value.
    pub fn classify(&self, raw: u32) -> Classification {
        let t = &self.thresholds;
        let raw = raw & t.mask;
        if raw == 0 {
            Classification::Available
        } else if raw >= t.eoc_min {
            Classification::EndOfChain
        } else if raw == t.bad {
            Classification::Bad
        } else if raw >= t.reserved_min {
            Classification::Reserved
        } else if self.in_range(raw) {
            Classification::Allocated(raw)
        } else {
            Classification::Invalid
        }
    }

    /// Value to store for `class`. Reserved and invalid slots cannot be encoded.
    pub fn to_raw(&self, class: Classification) -> Result<u32> {
        match class {
            Classification::Available => Ok(0),
            Classification::Allocated(next) if self.in_range(next) => Ok(next),
            Classification::Allocated(next) => Err(FatError::OutOfRange { cluster: next }),
            Classification::EndOfChain => Ok(self.thresholds.eoc_mark),
            Classification::Bad => Ok(self.thresholds.bad),
            Classification::Reserved | Classification::Invalid => Err(
                FatError::InvalidArgument(format!("{class:?} cannot be stored in a FAT entry")),
            ),
        }
    }

    /// Byte offset of `cluster`'s entry within one table copy.
    fn entry_offset(&self, cluster: ClusterId) -> u64 {
        let c = cluster as u64;
        match self.fat_type {
            FatType::Fat12 => c + c / 2,
            FatType::Fat16 => c * 2,
            FatType::Fat32 => c * 4,
        }
    }

    /// Sector span of `cluster`'s entry within a copy.
    pub fn span(&self, cluster: ClusterId) -> EntrySpan {
        let off = self.entry_offset(cluster);
        let bps = self.bytes_per_sector as u64;
        let in_sector = off % bps;
        EntrySpan {
            sector: (off / bps) as u32,
            straddles: self.fat_type == FatType::Fat12 && in_sector == bps - 1,
        }
    }

    fn copy_start(&self, copy: u8) -> u64 {
        self.reserved_sectors as u64 + copy as u64 * self.sectors_per_fat as u64
    }

    /// Bytes of `copy` holding the entries `first..=last`, as
    /// `(sector, offset, len, base)` where `base` is the copy-relative byte
    /// offset of the first byte.
    pub fn region(&self, copy: u8, first: ClusterId, last: ClusterId) -> (u64, usize, usize, u64) {
        let base = self.entry_offset(first);
        let tail = match self.fat_type {
            FatType::Fat12 | FatType::Fat16 => 2,
            FatType::Fat32 => 4,
        };
        let end = self.entry_offset(last) + tail;
        let bps = self.bytes_per_sector as u64;
        (
            self.copy_start(copy) + base / bps,
            (base % bps) as usize,
            (end - base) as usize,
            base,
        )
    }

    /// Width-masked value of `cluster` from a buffer read with [`Self::region`].
    pub fn value_from(&self, buf: &[u8], base: u64, cluster: ClusterId) -> u32 {
        let off = (self.entry_offset(cluster) - base) as usize;
        match self.fat_type {
            FatType::Fat12 => {
                let val = LittleEndian::read_u16(&buf[off..off + 2]);
                if cluster & 1 == 1 {
                    (val >> 4) as u32
                } else {
                    (val & 0x0FFF) as u32
                }
            }
            FatType::Fat16 => LittleEndian::read_u16(&buf[off..off + 2]) as u32,
            FatType::Fat32 => LittleEndian::read_u32(&buf[off..off + 4]) & self.thresholds.mask,
        }
    }

    fn check_cluster(&self, cluster: ClusterId) -> Result<()> {
        // Entries 0 and 1 exist on disk but hold media/flag values.
        if cluster > self.max_cluster {
            return Err(FatError::OutOfRange { cluster });
        }
        Ok(())
    }

    fn read_fat12_pair(&self, dev: &dyn BlockDevice, copy: u8, cluster: ClusterId) -> Result<[u8; 2]> {
        let off = self.entry_offset(cluster);
        let bps = self.bytes_per_sector as u64;
        let sector = self.copy_start(copy) + off / bps;
        let in_sector = (off % bps) as usize;
        let mut pair = [0u8; 2];
        if self.span(cluster).straddles {
            dev.read_at(sector, in_sector, &mut pair[..1])?;
            dev.read_at(sector + 1, 0, &mut pair[1..])?;
        } else {
            dev.read_at(sector, in_sector, &mut pair)?;
        }
        Ok(pair)
    }

    fn write_fat12_pair(
        &self,
        dev: &dyn BlockDevice,
        copy: u8,
        cluster: ClusterId,
        pair: [u8; 2],
    ) -> Result<()> {
        let off = self.entry_offset(cluster);
        let bps = self.bytes_per_sector as u64;
        let sector = self.copy_start(copy) + off / bps;
        let in_sector = (off % bps) as usize;
        if self.span(cluster).straddles {
            dev.write_at(sector, in_sector, &pair[..1])?;
            dev.write_at(sector + 1, 0, &pair[1..])?;
        } else {
            dev.write_at(sector, in_sector, &pair)?;
        }
        Ok(())
    }

    fn sector_and_offset(&self, copy: u8, cluster: ClusterId) -> (u64, usize) {
        let off = self.entry_offset(cluster);
        let bps = self.bytes_per_sector as u64;
        (self.copy_start(copy) + off / bps, (off % bps) as usize)
    }

    /// Read the width-masked entry value for `cluster` from table `copy`.
    pub fn read_value(&self, dev: &dyn BlockDevice, copy: u8, cluster: ClusterId) -> Result<u32> {
        self.check_cluster(cluster)?;
        match self.fat_type {
            FatType::Fat12 => {
                let val = LittleEndian::read_u16(&self.read_fat12_pair(dev, copy, cluster)?);
                Ok(if cluster & 1 == 1 {
                    (val >> 4) as u32
                } else {
                    (val & 0x0FFF) as u32
                })
            }
            FatType::Fat16 => {
                let (sector, off) = self.sector_and_offset(copy, cluster);
                let mut buf = [0u8; 2];
                dev.read_at(sector, off, &mut buf)?;
                Ok(LittleEndian::read_u16(&buf) as u32)
            }
            FatType::Fat32 => Ok(self.read_word(dev, copy, cluster)? & self.thresholds.mask),
        }
    }

    /// Store a width-masked value. FAT32 keeps the top nibble already on disk.
    pub fn write_value(
        &self,
        dev: &dyn BlockDevice,
        copy: u8,
        cluster: ClusterId,
        value: u32,
    ) -> Result<EntrySpan> {
        self.check_cluster(cluster)?;
        let value = value & self.thresholds.mask;
        match self.fat_type {
            FatType::Fat12 => {
                let [b0, b1] = self.read_fat12_pair(dev, copy, cluster)?;
                let pair = if cluster & 1 == 1 {
                    [(b0 & 0x0F) | ((value as u8 & 0x0F) << 4), (value >> 4) as u8]
                } else {
                    [value as u8, (b1 & 0xF0) | ((value >> 8) as u8 & 0x0F)]
                };
                self.write_fat12_pair(dev, copy, cluster, pair)?;
            }
            FatType::Fat16 => {
                let (sector, off) = self.sector_and_offset(copy, cluster);
                let mut buf = [0u8; 2];
                LittleEndian::write_u16(&mut buf, value as u16);
                dev.write_at(sector, off, &buf)?;
            }
            FatType::Fat32 => {
                let existing = self.read_word(dev, copy, cluster)?;
                self.write_word(dev, copy, cluster, (existing & 0xF000_0000) | value)?;
            }
        }
        Ok(self.span(cluster))
    }

    /// Raw 32-bit FAT32 slot, top nibble included. Used for scratch storage.
    pub fn read_word(&self, dev: &dyn BlockDevice, copy: u8, cluster: ClusterId) -> Result<u32> {
        self.require_fat32()?;
        self.check_cluster(cluster)?;
        let (sector, off) = self.sector_and_offset(copy, cluster);
        let mut buf = [0u8; 4];
        dev.read_at(sector, off, &mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    /// Overwrite a whole FAT32 slot, passenger bits included.
    pub fn write_word(
        &self,
        dev: &dyn BlockDevice,
        copy: u8,
        cluster: ClusterId,
        word: u32,
    ) -> Result<EntrySpan> {
        self.require_fat32()?;
        self.check_cluster(cluster)?;
        let (sector, off) = self.sector_and_offset(copy, cluster);
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, word);
        dev.write_at(sector, off, &buf)?;
        Ok(self.span(cluster))
    }

    fn require_fat32(&self) -> Result<()> {
        if self.fat_type != FatType::Fat32 {
            return Err(FatError::InvalidArgument(format!(
                "raw 32-bit slots need FAT32, volume is {}",
                self.fat_type.name()
            )));
        }
        Ok(())
    }

    /// Decode `cluster`'s slot. Ids outside the table decode as `Reserved`
    /// without touching the device.
    pub fn decode(&self, dev: &dyn BlockDevice, copy: u8, cluster: ClusterId) -> Result<Classification> {
        if !self.in_range(cluster) {
            return Ok(Classification::Reserved);
        }
        Ok(self.classify(self.read_value(dev, copy, cluster)?))
    }

    /// Encode `class` into `cluster`'s slot.
    pub fn encode(
        &self,
        dev: &dyn BlockDevice,
        copy: u8,
        cluster: ClusterId,
        class: Classification,
    ) -> Result<EntrySpan> {
        if !self.in_range(cluster) {
            return Err(FatError::OutOfRange { cluster });
        }
        let raw = self.to_raw(class)?;
        self.write_value(dev, copy, cluster, raw)
    }
}
