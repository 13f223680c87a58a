use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};
use serde::Serialize;

use super::codec::{Classification, ClusterId, EntryCodec, MIN_CLUSTER};
use super::mirror::{FsInfo, MirrorState};
use super::volume::VolumeGeometry;
use crate::config::EngineConfig;
use crate::device::BlockDevice;
use crate::error::{FatError, Result};

/// Entries decoded per device read when scanning the whole table.
const SCAN_CHUNK_ENTRIES: u32 = 16384;

/// Rolling allocation hints and the lazily maintained free-cluster count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocationCursor {
    /// Where the next grouped allocation starts searching; 0 = unknown.
    pub group_alloc_start: ClusterId,
    /// Where the next single-cluster allocation starts searching; 0 = lowest cluster.
    pub clust_alloc_start: ClusterId,
    /// Cached free-cluster count; `None` forces a full recount.
    pub free_count: Option<u32>,
    /// Clusters claimed by one grouped allocation.
    pub group_size: u32,
}

/// State guarded by the table lock.
pub(crate) struct TableState {
    pub(crate) cursor: AllocationCursor,
    pub(crate) mirror: MirrorState,
}

/// The mounted allocation table of one volume.
///
/// Shared between sessions through `Arc`. Lookups used for traversal read
/// the active copy directly; every mutation goes through [`TableGuard`].
pub struct ClusterTable {
    geometry: VolumeGeometry,
    codec: EntryCodec,
    device: Arc<dyn BlockDevice>,
    group_size: u32,
    state: Mutex<TableState>,
}

impl ClusterTable {
    /// Mount the table of the volume on `device`.
    pub fn mount(device: Arc<dyn BlockDevice>, config: &EngineConfig) -> Result<Self> {
        let geometry = VolumeGeometry::read_from(device.as_ref())?;
        Self::with_geometry(device, geometry, config)
    }

    /// Mount with already parsed volume parameters.
    pub fn with_geometry(
        device: Arc<dyn BlockDevice>,
        geometry: VolumeGeometry,
        config: &EngineConfig,
    ) -> Result<Self> {
        if device.sector_size() != geometry.bytes_per_sector as usize {
            return Err(FatError::InvalidVolume(format!(
                "device sector size {} does not match volume sector size {}",
                device.sector_size(),
                geometry.bytes_per_sector
            )));
        }

        let codec = EntryCodec::new(&geometry);
        let group_size = config
            .group_size
            .unwrap_or_else(|| (65536 / geometry.cluster_size()) as u32)
            .min(geometry.total_clusters)
            .max(1);

        let mut cursor = AllocationCursor {
            group_alloc_start: 0,
            clust_alloc_start: 0,
            free_count: None,
            group_size,
        };

        if let Some(sector) = geometry.fsinfo_sector {
            match FsInfo::read(device.as_ref(), sector as u64)? {
                Some(info) => {
                    cursor.free_count = info
                        .free_count
                        .filter(|&n| n <= geometry.total_clusters);
                    cursor.clust_alloc_start = info
                        .next_free
                        .filter(|&c| codec.in_range(c))
                        .unwrap_or(0);
                }
                None => warn!("FSInfo sector {sector}: bad signature, free count unknown"),
            }
        }

        debug!(
            "mounted {} table: {} clusters, {} copies, group size {}",
            geometry.fat_type.name(),
            geometry.total_clusters,
            geometry.num_fats,
            group_size
        );

        let mirror = MirrorState::new(geometry.mirrors());
        Ok(Self {
            geometry,
            codec,
            device,
            group_size,
            state: Mutex::new(TableState { cursor, mirror }),
        })
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    pub fn codec(&self) -> &EntryCodec {
        &self.codec
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Number of table slots (allocatable clusters).
    pub fn n_entries(&self) -> u32 {
        self.geometry.total_clusters
    }

    pub fn max_cluster(&self) -> ClusterId {
        self.codec.max_cluster()
    }

    /// Upper bound for contiguous-run detection.
    pub fn group_size(&self) -> u32 {
        self.group_size
    }

    /// Decode `cluster`'s slot in the active copy without taking the table lock.
    pub fn entry(&self, cluster: ClusterId) -> Result<Classification> {
        self.codec
            .decode(self.device.as_ref(), self.geometry.active_copy(), cluster)
    }

    /// Take the table lock.
    pub fn lock(&self) -> Result<TableGuard<'_>> {
        let state = self
            .state
            .lock()
            .map_err(|_| FatError::Io(std::io::Error::other("cluster table lock poisoned")))?;
        Ok(TableGuard { table: self, state })
    }

    /// Snapshot of the allocation cursor.
    pub fn cursor(&self) -> Result<AllocationCursor> {
        Ok(self.lock()?.state.cursor)
    }

    /// Free clusters, recounting the table if the cached count is unknown.
    pub fn free_space(&self) -> Result<u32> {
        self.lock()?.free_count()
    }

    /// Count free clusters by full scan, ignoring and not touching the cache.
    pub fn recount_free(&self) -> Result<u32> {
        let mut free = 0u32;
        self.scan(MIN_CLUSTER, self.max_cluster(), |_, class| {
            if class == Classification::Available {
                free += 1;
            }
            ControlFlow::Continue(())
        })?;
        Ok(free)
    }

    /// Commit the pending mirror sector and the FSInfo hints.
    pub fn flush(&self) -> Result<()> {
        self.lock()?.flush()
    }

    /// Flush and reset the allocation cursor.
    pub fn unmount(&self) -> Result<()> {
        let mut guard = self.lock()?;
        guard.flush()?;
        let group_size = guard.state.cursor.group_size;
        guard.state.cursor = AllocationCursor {
            group_alloc_start: 0,
            clust_alloc_start: 0,
            free_count: None,
            group_size,
        };
        Ok(())
    }

    /// Decode entries `first..=last` of the active copy in chunks, calling
    /// `visit` for each until it breaks.
    pub(crate) fn scan(
        &self,
        first: ClusterId,
        last: ClusterId,
        mut visit: impl FnMut(ClusterId, Classification) -> ControlFlow<()>,
    ) -> Result<()> {
        let last = last.min(self.max_cluster());
        let mut chunk_start = first.max(MIN_CLUSTER);
        let mut buf = Vec::new();
        while chunk_start <= last {
            let chunk_end = chunk_start
                .saturating_add(SCAN_CHUNK_ENTRIES - 1)
                .min(last);
            let (sector, offset, len, base) =
                self.codec
                    .region(self.geometry.active_copy(), chunk_start, chunk_end);
            buf.resize(len, 0);
            self.device.read_at(sector, offset, &mut buf)?;
            for cluster in chunk_start..=chunk_end {
                let class = self.codec.classify(self.codec.value_from(&buf, base, cluster));
                if visit(cluster, class).is_break() {
                    return Ok(());
                }
            }
            chunk_start = chunk_end + 1;
        }
        Ok(())
    }
}

/// Exclusive access to a table. Holding one proves the table lock is held.
pub struct TableGuard<'a> {
    table: &'a ClusterTable,
    pub(crate) state: MutexGuard<'a, TableState>,
}

impl<'a> TableGuard<'a> {
    pub fn table(&self) -> &'a ClusterTable {
        self.table
    }

    pub fn entry(&self, cluster: ClusterId) -> Result<Classification> {
        self.table.entry(cluster)
    }

    pub fn cursor(&self) -> AllocationCursor {
        self.state.cursor
    }

    /// Encode `class` into the active copy and schedule it for mirroring.
    pub fn set_entry(&mut self, cluster: ClusterId, class: Classification) -> Result<()> {
        if !self.table.device.is_writable() {
            return Err(FatError::ReadOnly);
        }
        let span = self.table.codec.encode(
            self.table.device.as_ref(),
            self.table.geometry.active_copy(),
            cluster,
            class,
        )?;
        self.note_write(span)
    }

    /// Cached free count, recounted by full scan when unknown.
    pub fn free_count(&mut self) -> Result<u32> {
        if let Some(n) = self.state.cursor.free_count {
            return Ok(n);
        }
        let n = self.table.recount_free()?;
        debug!("recounted free clusters: {n}");
        self.state.cursor.free_count = Some(n);
        Ok(n)
    }

    /// Forget the cached free count.
    pub fn invalidate_free_count(&mut self) {
        self.state.cursor.free_count = None;
        self.state.mirror.fsinfo_dirty = true;
    }

    /// Replace the cached free count with a verified one.
    pub(crate) fn set_free_count(&mut self, free: u32) {
        self.state.cursor.free_count = Some(free);
        self.state.mirror.fsinfo_dirty = true;
    }

    pub(crate) fn add_free(&mut self, freed: u32) {
        if let Some(n) = self.state.cursor.free_count.as_mut() {
            *n = n.saturating_add(freed);
        }
        self.state.mirror.fsinfo_dirty = true;
    }

    pub(crate) fn take_free(&mut self, used: u32) {
        if let Some(n) = self.state.cursor.free_count.as_mut() {
            *n = n.saturating_sub(used);
        }
        self.state.mirror.fsinfo_dirty = true;
    }

    /// Pull the allocation cursors back to `cluster` if it precedes them.
    /// A zero single-cluster cursor already means the lowest cluster.
    pub(crate) fn retract_cursors(&mut self, cluster: ClusterId) {
        let cursor = &mut self.state.cursor;
        if cursor.clust_alloc_start != 0 && cluster < cursor.clust_alloc_start {
            cursor.clust_alloc_start = cluster;
        }
        if cursor.group_alloc_start == 0 || cluster < cursor.group_alloc_start {
            cursor.group_alloc_start = cluster;
        }
        self.state.mirror.fsinfo_dirty = true;
    }

    /// Follow a chain from `start`, returning every cluster whose slot
    /// is part of it. Stops at the first non-allocated slot; fails on an
    /// invalid link or a cycle.
    pub fn collect_chain(&self, start: ClusterId) -> Result<Vec<ClusterId>> {
        collect_chain(self.table, start)
    }

    /// Return `clusters` to the free pool. Slots that are not part of a
    /// chain (bad, free, reserved) are left alone. Returns the count freed.
    pub fn release(&mut self, clusters: &[ClusterId]) -> Result<u32> {
        let mut freed = 0u32;
        let mut lowest = ClusterId::MAX;
        for &cluster in clusters {
            if !self.entry(cluster)?.is_in_chain() {
                continue;
            }
            self.set_entry(cluster, Classification::Available)?;
            freed += 1;
            lowest = lowest.min(cluster);
        }
        if freed > 0 {
            self.add_free(freed);
            self.retract_cursors(lowest);
            debug!("released {freed} clusters from {lowest}");
        }
        Ok(freed)
    }

    /// Find the cluster in the chain from `start` whose slot links to `target`.
    pub(crate) fn find_predecessor(
        &self,
        start: ClusterId,
        target: ClusterId,
    ) -> Result<Option<ClusterId>> {
        let mut cluster = start;
        for _ in 0..self.table.n_entries() {
            match self.entry(cluster)? {
                Classification::Allocated(next) if next == target => return Ok(Some(cluster)),
                Classification::Allocated(next) => cluster = next,
                _ => return Ok(None),
            }
        }
        Err(FatError::corrupt(start, "chain loops back on itself"))
    }
}

/// See [`TableGuard::collect_chain`].
pub(crate) fn collect_chain(table: &ClusterTable, start: ClusterId) -> Result<Vec<ClusterId>> {
    if !table.codec().in_range(start) {
        return Err(FatError::OutOfRange { cluster: start });
    }
    let mut chain = Vec::new();
    let mut cluster = start;
    loop {
        if chain.len() as u32 > table.n_entries() {
            return Err(FatError::corrupt(start, "chain loops back on itself"));
        }
        match table.entry(cluster)? {
            Classification::Allocated(next) => {
                chain.push(cluster);
                cluster = next;
            }
            Classification::EndOfChain => {
                chain.push(cluster);
                return Ok(chain);
            }
            Classification::Invalid => {
                return Err(FatError::corrupt(cluster, "invalid value inside chain"));
            }
            Classification::Available | Classification::Bad | Classification::Reserved => {
                return Ok(chain);
            }
        }
    }
}
