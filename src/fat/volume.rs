use log::warn;
use serde::Serialize;

use crate::device::BlockDevice;
use crate::error::{FatError, Result};

/// FAT entry width, fixed for the lifetime of a mounted table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    pub fn name(&self) -> &'static str {
        match self {
            FatType::Fat12 => "FAT12",
            FatType::Fat16 => "FAT16",
            FatType::Fat32 => "FAT32",
        }
    }

    pub fn bits(&self) -> u32 {
        match self {
            FatType::Fat12 => 12,
            FatType::Fat16 => 16,
            FatType::Fat32 => 32,
        }
    }
}

/// Volume parameters decoded from the boot sector.
#[derive(Debug, Clone, Serialize)]
pub struct VolumeGeometry {
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    /// Sectors before the first FAT copy.
    pub reserved_sectors: u32,
    pub num_fats: u8,
    /// Sectors per FAT copy.
    pub sectors_per_fat: u32,
    /// Fixed root directory entry count (FAT12/16 only; 0 for FAT32).
    pub root_entry_count: u16,
    /// Root directory start cluster (FAT32 only).
    pub root_cluster: u32,
    pub total_sectors: u64,
    pub fat_type: FatType,
    /// Number of allocatable data clusters.
    pub total_clusters: u32,
    /// FSInfo sector (FAT32 only).
    pub fsinfo_sector: Option<u32>,
    /// Set when FAT32 extended flags disable mirroring; names the only live copy.
    pub active_fat: Option<u8>,
    pub media: u8,
    pub label: Option<String>,
}

impl VolumeGeometry {
    /// Read and parse the boot sector at sector 0 of `device`.
    pub fn read_from(device: &dyn BlockDevice) -> Result<Self> {
        let mut bpb = [0u8; 512];
        device
            .read_at(0, 0, &mut bpb)
            .map_err(|e| FatError::InvalidVolume(format!("cannot read boot sector: {e}")))?;
        Self::parse(&bpb)
    }

    /// Parse a 512-byte boot sector.
    pub fn parse(bpb: &[u8; 512]) -> Result<Self> {
        // Validate jump instruction (EB xx 90 or E9 xx xx)
        if bpb[0] != 0xEB && bpb[0] != 0xE9 {
            return Err(FatError::InvalidVolume(
                "bad jump instruction in boot sector".into(),
            ));
        }

        let bytes_per_sector = u16::from_le_bytes([bpb[11], bpb[12]]) as u32;
        if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return Err(FatError::InvalidVolume(format!(
                "invalid bytes per sector: {bytes_per_sector}"
            )));
        }

        let sectors_per_cluster = bpb[13] as u32;
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(FatError::InvalidVolume(format!(
                "invalid sectors per cluster: {sectors_per_cluster}"
            )));
        }

        let reserved_sectors = u16::from_le_bytes([bpb[14], bpb[15]]) as u32;
        let num_fats = bpb[16];
        if reserved_sectors == 0 || num_fats == 0 {
            return Err(FatError::InvalidVolume(format!(
                "reserved sectors {reserved_sectors}, FAT copies {num_fats}"
            )));
        }
        let root_entry_count = u16::from_le_bytes([bpb[17], bpb[18]]);
        let media = bpb[21];

        let total_sectors_16 = u16::from_le_bytes([bpb[19], bpb[20]]) as u64;
        let total_sectors_32 = u32::from_le_bytes([bpb[32], bpb[33], bpb[34], bpb[35]]) as u64;
        let total_sectors = if total_sectors_16 != 0 {
            total_sectors_16
        } else {
            total_sectors_32
        };

        let sectors_per_fat_16 = u16::from_le_bytes([bpb[22], bpb[23]]) as u32;
        let sectors_per_fat_32 = u32::from_le_bytes([bpb[36], bpb[37], bpb[38], bpb[39]]);
        let sectors_per_fat = if sectors_per_fat_16 != 0 {
            sectors_per_fat_16
        } else {
            sectors_per_fat_32
        };
        if sectors_per_fat == 0 {
            return Err(FatError::InvalidVolume("sectors per FAT is 0".into()));
        }

        let root_dir_sectors =
            (root_entry_count as u32 * 32).div_ceil(bytes_per_sector);
        let data_start_sector =
            reserved_sectors as u64 + num_fats as u64 * sectors_per_fat as u64 + root_dir_sectors as u64;
        if data_start_sector >= total_sectors {
            return Err(FatError::InvalidVolume(format!(
                "data region starts at sector {data_start_sector} beyond volume end {total_sectors}"
            )));
        }
        let data_sectors = total_sectors - data_start_sector;
        let mut total_clusters = (data_sectors / sectors_per_cluster as u64).min(0x0FFF_FFF5) as u32;

        // A 16-bit sectors-per-FAT of zero with no fixed root is the FAT32
        // BPB layout regardless of cluster count.
        let fat_type = if sectors_per_fat_16 == 0 && root_entry_count == 0 {
            FatType::Fat32
        } else if total_clusters < 4085 {
            FatType::Fat12
        } else if total_clusters < 65525 {
            FatType::Fat16
        } else {
            FatType::Fat32
        };

        // Never address entries beyond the end of one FAT copy.
        let capacity =
            (sectors_per_fat as u64 * bytes_per_sector as u64 * 8 / fat_type.bits() as u64) as u32;
        if total_clusters + 2 > capacity {
            warn!(
                "{}: FAT holds {} entries but volume has {} clusters, clamping",
                fat_type.name(),
                capacity,
                total_clusters
            );
            total_clusters = capacity.saturating_sub(2);
        }
        if total_clusters == 0 {
            return Err(FatError::InvalidVolume("volume has no data clusters".into()));
        }

        let (root_cluster, fsinfo_sector, active_fat) = if fat_type == FatType::Fat32 {
            let root = u32::from_le_bytes([bpb[44], bpb[45], bpb[46], bpb[47]]);
            let ext_flags = u16::from_le_bytes([bpb[40], bpb[41]]);
            let fsinfo = u16::from_le_bytes([bpb[48], bpb[49]]) as u32;
            let fsinfo = (fsinfo > 0 && fsinfo < reserved_sectors).then_some(fsinfo);
            let active = if ext_flags & 0x0080 != 0 {
                Some((ext_flags & 0x000F) as u8)
            } else {
                None
            };
            (root, fsinfo, active)
        } else {
            (0, None, None)
        };

        if let Some(active) = active_fat {
            if active >= num_fats {
                return Err(FatError::InvalidVolume(format!(
                    "active FAT {active} but only {num_fats} copies"
                )));
            }
        }

        let label_offset = if fat_type == FatType::Fat32 { 71 } else { 43 };
        let label_str = std::str::from_utf8(&bpb[label_offset..label_offset + 11])
            .unwrap_or("")
            .trim()
            .to_string();
        let label = if label_str.is_empty() || label_str == "NO NAME" {
            None
        } else {
            Some(label_str)
        };

        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            sectors_per_fat,
            root_entry_count,
            root_cluster,
            total_sectors,
            fat_type,
            total_clusters,
            fsinfo_sector,
            active_fat,
            media,
            label,
        })
    }

    /// Highest valid cluster number.
    pub fn max_cluster(&self) -> u32 {
        self.total_clusters + 1
    }

    /// First sector of FAT copy `copy`.
    pub fn fat_start(&self, copy: u8) -> u64 {
        self.reserved_sectors as u64 + copy as u64 * self.sectors_per_fat as u64
    }

    /// Copy that receives every table write.
    pub fn active_copy(&self) -> u8 {
        self.active_fat.unwrap_or(0)
    }

    /// Whether writes to the active copy are replicated to the others.
    pub fn mirrors(&self) -> bool {
        self.active_fat.is_none() && self.num_fats > 1
    }

    pub fn root_dir_sectors(&self) -> u32 {
        (self.root_entry_count as u32 * 32).div_ceil(self.bytes_per_sector)
    }

    /// First sector of the fixed FAT12/16 root directory.
    pub fn root_dir_start(&self) -> u64 {
        self.fat_start(self.num_fats)
    }

    pub fn data_start_sector(&self) -> u64 {
        self.root_dir_start() + self.root_dir_sectors() as u64
    }

    /// First sector of a data cluster.
    pub fn cluster_sector(&self, cluster: u32) -> u64 {
        self.data_start_sector() + (cluster as u64 - 2) * self.sectors_per_cluster as u64
    }

    /// Bytes per cluster.
    pub fn cluster_size(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    /// Total filesystem size in bytes.
    pub fn total_size(&self) -> u64 {
        self.total_sectors * self.bytes_per_sector as u64
    }
}
