//! Blank in-memory volumes for unit tests.

use std::io::{self, Cursor};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::device::{BlockDevice, ImageDevice};
use crate::fat::codec::{Classification, ClusterId};
use crate::fat::table::{ClusterTable, TableGuard};
use crate::fat::volume::{FatType, VolumeGeometry};

pub(crate) type MemDevice = ImageDevice<Cursor<Vec<u8>>>;

/// Layout with 512-byte sectors, one sector per cluster and two FAT copies.
/// The FAT type is forced, so tiny FAT16/FAT32 tables are possible.
pub(crate) fn geometry(fat_type: FatType, clusters: u32) -> VolumeGeometry {
    let table_bytes = ((clusters as u64 + 2) * fat_type.bits() as u64).div_ceil(8);
    let sectors_per_fat = table_bytes.div_ceil(512) as u32;
    let (reserved_sectors, root_entry_count, root_cluster, fsinfo_sector) = match fat_type {
        FatType::Fat32 => (8, 0, 2, Some(1)),
        FatType::Fat12 | FatType::Fat16 => (1, 16, 0, None),
    };
    let root_sectors = root_entry_count as u64 * 32 / 512;
    let total_sectors =
        reserved_sectors as u64 + 2 * sectors_per_fat as u64 + root_sectors + clusters as u64;
    VolumeGeometry {
        bytes_per_sector: 512,
        sectors_per_cluster: 1,
        reserved_sectors,
        num_fats: 2,
        sectors_per_fat,
        root_entry_count,
        root_cluster,
        total_sectors,
        fat_type,
        total_clusters: clusters,
        fsinfo_sector,
        active_fat: None,
        media: 0xF8,
        label: None,
    }
}

/// Zeroed device sized for `geometry`, with a blank FSInfo sector on FAT32.
pub(crate) fn device_for(geometry: &VolumeGeometry) -> Arc<MemDevice> {
    let bytes = vec![0u8; (geometry.total_sectors * 512) as usize];
    let dev = Arc::new(MemDevice::new(Cursor::new(bytes), 0));
    if let Some(sector) = geometry.fsinfo_sector {
        let mut fsinfo = [0u8; 512];
        fsinfo[0..4].copy_from_slice(&0x4161_5252u32.to_le_bytes());
        fsinfo[484..488].copy_from_slice(&0x6141_7272u32.to_le_bytes());
        fsinfo[488..496].copy_from_slice(&[0xFF; 8]);
        fsinfo[508..512].copy_from_slice(&0xAA55_0000u32.to_le_bytes());
        dev.write_at(sector as u64, 0, &fsinfo).unwrap();
    }
    dev
}

pub(crate) fn mounted(fat_type: FatType, clusters: u32) -> (Arc<MemDevice>, ClusterTable) {
    let geometry = geometry(fat_type, clusters);
    let dev = device_for(&geometry);
    let table = ClusterTable::with_geometry(dev.clone(), geometry, &EngineConfig::default())
        .unwrap();
    (dev, table)
}

/// Link `clusters` in order and terminate the last one.
pub(crate) fn set_chain(guard: &mut TableGuard<'_>, clusters: &[ClusterId]) {
    for pair in clusters.windows(2) {
        guard
            .set_entry(pair[0], Classification::Allocated(pair[1]))
            .unwrap();
    }
    if let Some(&last) = clusters.last() {
        guard.set_entry(last, Classification::EndOfChain).unwrap();
    }
}

/// Raw bytes of FAT copy `copy`.
pub(crate) fn fat_copy(dev: &MemDevice, geometry: &VolumeGeometry, copy: u8) -> Vec<u8> {
    let mut buf = vec![0u8; geometry.sectors_per_fat as usize * 512];
    dev.read_at(geometry.fat_start(copy), 0, &mut buf).unwrap();
    buf
}

/// Fails exactly one write once armed.
pub(crate) struct FlakyDevice {
    inner: Arc<MemDevice>,
    writes: AtomicUsize,
    fail_at: AtomicUsize,
}

impl FlakyDevice {
    pub(crate) fn new(inner: Arc<MemDevice>) -> Self {
        Self {
            inner,
            writes: AtomicUsize::new(0),
            fail_at: AtomicUsize::new(usize::MAX),
        }
    }

    /// Let `n` more writes through, then fail the next one.
    pub(crate) fn fail_after(&self, n: usize) {
        let done = self.writes.load(Ordering::SeqCst);
        self.fail_at.store(done + n + 1, Ordering::SeqCst);
    }
}

impl BlockDevice for FlakyDevice {
    fn sector_size(&self) -> usize {
        self.inner.sector_size()
    }

    fn read_at(&self, sector: u64, offset: usize, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_at(sector, offset, buf)
    }

    fn write_at(&self, sector: u64, offset: usize, buf: &[u8]) -> io::Result<()> {
        let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_at.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected write failure"));
        }
        self.inner.write_at(sector, offset, buf)
    }

    fn is_writable(&self) -> bool {
        true
    }
}
