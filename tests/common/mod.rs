//! Builds small FAT12/16/32 images in memory.
//!
//! Table entries are encoded here independently of the crate's codec so the
//! images double as a format oracle.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use rusty_fat::config::EngineConfig;
use rusty_fat::device::ImageDevice;
use rusty_fat::fat::{ClusterTable, FatType};

pub type MemDevice = ImageDevice<Cursor<Vec<u8>>>;

pub const SECTOR: usize = 512;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_DIRECTORY: u8 = 0x10;

/// Packed FAT date for 2024-01-`day`.
pub fn date(day: u16) -> u16 {
    (44 << 9) | (1 << 5) | day
}

pub struct TestVolume {
    pub bytes: Vec<u8>,
    pub fat_type: FatType,
    pub clusters: u32,
    reserved: usize,
    sectors_per_fat: usize,
    root_entries: usize,
    next_slot: HashMap<u32, usize>,
}

impl TestVolume {
    /// A freshly formatted volume with `clusters` one-sector clusters and
    /// two table copies. FAT12 needs fewer than 4085 clusters and FAT16 at
    /// least that many; FAT32 uses its own boot sector layout at any size.
    pub fn new(fat_type: FatType, clusters: u32) -> Self {
        let bits = match fat_type {
            FatType::Fat12 => 12,
            FatType::Fat16 => 16,
            FatType::Fat32 => 32,
        };
        let (reserved, root_entries) = match fat_type {
            FatType::Fat32 => (8, 0),
            _ => (1, 64),
        };
        let sectors_per_fat = ((clusters as usize + 2) * bits).div_ceil(8).div_ceil(SECTOR);
        let root_sectors = root_entries * 32 / SECTOR;
        let total = reserved + 2 * sectors_per_fat + root_sectors + clusters as usize;

        let mut vol = Self {
            bytes: vec![0u8; total * SECTOR],
            fat_type,
            clusters,
            reserved,
            sectors_per_fat,
            root_entries,
            next_slot: HashMap::new(),
        };
        vol.write_boot_sector(total);
        let media = match fat_type {
            FatType::Fat12 => 0xFF8,
            FatType::Fat16 => 0xFFF8,
            FatType::Fat32 => 0x0FFF_FFF8,
        };
        vol.set_raw(0, media);
        vol.set_raw(1, vol.eoc());
        if fat_type == FatType::Fat32 {
            vol.write_fsinfo();
            vol.set_raw(2, vol.eoc());
        }
        vol
    }

    fn write_boot_sector(&mut self, total: usize) {
        let b = &mut self.bytes[..SECTOR];
        b[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
        b[3..11].copy_from_slice(b"MSWIN4.1");
        b[11..13].copy_from_slice(&(SECTOR as u16).to_le_bytes());
        b[13] = 1;
        b[14..16].copy_from_slice(&(self.reserved as u16).to_le_bytes());
        b[16] = 2;
        b[17..19].copy_from_slice(&(self.root_entries as u16).to_le_bytes());
        b[21] = 0xF8;
        if total < 0x10000 && self.fat_type != FatType::Fat32 {
            b[19..21].copy_from_slice(&(total as u16).to_le_bytes());
        } else {
            b[32..36].copy_from_slice(&(total as u32).to_le_bytes());
        }
        if self.fat_type == FatType::Fat32 {
            b[36..40].copy_from_slice(&(self.sectors_per_fat as u32).to_le_bytes());
            b[44..48].copy_from_slice(&2u32.to_le_bytes());
            b[48..50].copy_from_slice(&1u16.to_le_bytes());
            b[71..82].copy_from_slice(b"TESTVOL    ");
        } else {
            b[22..24].copy_from_slice(&(self.sectors_per_fat as u16).to_le_bytes());
            b[43..54].copy_from_slice(b"TESTVOL    ");
        }
        b[510] = 0x55;
        b[511] = 0xAA;
    }

    fn write_fsinfo(&mut self) {
        let s = &mut self.bytes[SECTOR..2 * SECTOR];
        s[0..4].copy_from_slice(&0x4161_5252u32.to_le_bytes());
        s[484..488].copy_from_slice(&0x6141_7272u32.to_le_bytes());
        s[488..496].copy_from_slice(&[0xFF; 8]);
        s[508..512].copy_from_slice(&0xAA55_0000u32.to_le_bytes());
    }

    pub fn eoc(&self) -> u32 {
        match self.fat_type {
            FatType::Fat12 => 0xFFF,
            FatType::Fat16 => 0xFFFF,
            FatType::Fat32 => 0x0FFF_FFFF,
        }
    }

    pub fn bad(&self) -> u32 {
        match self.fat_type {
            FatType::Fat12 => 0xFF7,
            FatType::Fat16 => 0xFFF7,
            FatType::Fat32 => 0x0FFF_FFF7,
        }
    }

    /// Start cluster of the root directory as entries refer to it.
    pub fn root(&self) -> u32 {
        if self.fat_type == FatType::Fat32 {
            2
        } else {
            0
        }
    }

    pub fn fat_offset(&self, copy: usize) -> usize {
        (self.reserved + copy * self.sectors_per_fat) * SECTOR
    }

    /// Write a raw table value into both copies.
    pub fn set_raw(&mut self, cluster: u32, value: u32) {
        for copy in 0..2 {
            let base = self.fat_offset(copy);
            let c = cluster as usize;
            match self.fat_type {
                FatType::Fat12 => {
                    let at = base + c + c / 2;
                    if c & 1 == 1 {
                        self.bytes[at] = (self.bytes[at] & 0x0F) | ((value as u8 & 0x0F) << 4);
                        self.bytes[at + 1] = (value >> 4) as u8;
                    } else {
                        self.bytes[at] = value as u8;
                        self.bytes[at + 1] =
                            (self.bytes[at + 1] & 0xF0) | ((value >> 8) as u8 & 0x0F);
                    }
                }
                FatType::Fat16 => {
                    let at = base + c * 2;
                    self.bytes[at..at + 2].copy_from_slice(&(value as u16).to_le_bytes());
                }
                FatType::Fat32 => {
                    let at = base + c * 4;
                    self.bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
                }
            }
        }
    }

    pub fn get_raw(&self, copy: usize, cluster: u32) -> u32 {
        let base = self.fat_offset(copy);
        let c = cluster as usize;
        match self.fat_type {
            FatType::Fat12 => {
                let at = base + c + c / 2;
                let pair = u16::from_le_bytes([self.bytes[at], self.bytes[at + 1]]) as u32;
                if c & 1 == 1 {
                    pair >> 4
                } else {
                    pair & 0x0FFF
                }
            }
            FatType::Fat16 => {
                let at = base + c * 2;
                u16::from_le_bytes([self.bytes[at], self.bytes[at + 1]]) as u32
            }
            FatType::Fat32 => {
                let at = base + c * 4;
                u32::from_le_bytes(self.bytes[at..at + 4].try_into().unwrap()) & 0x0FFF_FFFF
            }
        }
    }

    /// Link `clusters` in order and terminate the last.
    pub fn chain(&mut self, clusters: &[u32]) {
        for pair in clusters.windows(2) {
            self.set_raw(pair[0], pair[1]);
        }
        if let Some(&last) = clusters.last() {
            self.set_raw(last, self.eoc());
        }
    }

    fn data_start(&self) -> usize {
        self.reserved + 2 * self.sectors_per_fat + self.root_entries * 32 / SECTOR
    }

    pub fn cluster_offset(&self, cluster: u32) -> usize {
        (self.data_start() + cluster as usize - 2) * SECTOR
    }

    fn slot_offset(&mut self, dir: u32) -> usize {
        let slot = self.next_slot.entry(dir).or_insert(0);
        let index = *slot;
        *slot += 1;
        if dir == 0 {
            assert!(index < self.root_entries, "fixed root is full");
            (self.reserved + 2 * self.sectors_per_fat) * SECTOR + index * 32
        } else {
            assert!(index < SECTOR / 32, "test directories hold one cluster");
            self.cluster_offset(dir) + index * 32
        }
    }

    /// Append a short entry to directory `dir` (0 = fixed root).
    pub fn add_entry(
        &mut self,
        dir: u32,
        name: &[u8; 11],
        attr: u8,
        start: u32,
        size: u32,
        created: u16,
    ) {
        let at = self.slot_offset(dir);
        let e = &mut self.bytes[at..at + 32];
        e[0..11].copy_from_slice(name);
        e[11] = attr;
        e[14..16].copy_from_slice(&0x6000u16.to_le_bytes());
        e[16..18].copy_from_slice(&created.to_le_bytes());
        e[18..20].copy_from_slice(&created.to_le_bytes());
        e[20..22].copy_from_slice(&((start >> 16) as u16).to_le_bytes());
        e[22..24].copy_from_slice(&0x6000u16.to_le_bytes());
        e[24..26].copy_from_slice(&created.to_le_bytes());
        e[26..28].copy_from_slice(&(start as u16).to_le_bytes());
        e[28..32].copy_from_slice(&size.to_le_bytes());
    }

    /// A file whose chain is `clusters` (empty for a zero-length file).
    pub fn add_file(&mut self, dir: u32, name: &[u8; 11], clusters: &[u32], size: u32, created: u16) {
        self.chain(clusters);
        let start = clusters.first().copied().unwrap_or(0);
        self.add_entry(dir, name, ATTR_ARCHIVE, start, size, created);
    }

    /// A one-cluster subdirectory with its "." and ".." entries.
    pub fn add_dir(&mut self, parent: u32, name: &[u8; 11], cluster: u32, created: u16) {
        self.chain(&[cluster]);
        self.add_entry(parent, name, ATTR_DIRECTORY, cluster, 0, created);
        let dotdot = if parent == self.root() { 0 } else { parent };
        self.add_entry(cluster, b".          ", ATTR_DIRECTORY, cluster, 0, created);
        self.add_entry(cluster, b"..         ", ATTR_DIRECTORY, dotdot, 0, created);
    }

    pub fn into_device(self) -> Arc<MemDevice> {
        Arc::new(ImageDevice::new(Cursor::new(self.bytes), 0))
    }

    pub fn mount(self) -> (Arc<MemDevice>, ClusterTable) {
        let dev = self.into_device();
        let table = ClusterTable::mount(dev.clone(), &EngineConfig::default()).unwrap();
        (dev, table)
    }
}

/// Whole image contents behind a mounted device.
pub fn image_bytes(dev: &MemDevice) -> Vec<u8> {
    use rusty_fat::device::BlockDevice;
    let mut boot = [0u8; SECTOR];
    dev.read_at(0, 0, &mut boot).unwrap();
    let total = u16::from_le_bytes([boot[19], boot[20]]) as u64;
    let total = if total != 0 {
        total
    } else {
        u32::from_le_bytes(boot[32..36].try_into().unwrap()) as u64
    };
    let mut bytes = vec![0u8; total as usize * SECTOR];
    dev.read_at(0, 0, &mut bytes).unwrap();
    bytes
}
