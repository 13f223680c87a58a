//! Mirror manager and FAT32 FSInfo persistence.
//!
//! Writes land in the active table copy only. The sector most recently
//! written is remembered as pending and copied to every other copy when a
//! write moves to another sector, on flush, or when mirroring is switched
//! back on (which resynchronises the whole table).

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use super::codec::EntrySpan;
use super::table::TableGuard;
use crate::device::BlockDevice;
use crate::error::{FatError, Result};

const FSINFO_LEAD_SIG: u32 = 0x4161_5252;
const FSINFO_STRUCT_SIG: u32 = 0x6141_7272;
const FSINFO_TRAIL_SIG: u32 = 0xAA55_0000;
const FSINFO_FREE_OFFSET: usize = 488;
const FSINFO_NEXT_OFFSET: usize = 492;
const FSINFO_UNKNOWN: u32 = 0xFFFF_FFFF;

/// Hints stored in the FAT32 FSInfo sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsInfo {
    pub free_count: Option<u32>,
    pub next_free: Option<u32>,
}

impl FsInfo {
    fn signatures_ok(sector: &[u8]) -> bool {
        LittleEndian::read_u32(&sector[0..4]) == FSINFO_LEAD_SIG
            && LittleEndian::read_u32(&sector[484..488]) == FSINFO_STRUCT_SIG
            && LittleEndian::read_u32(&sector[508..512]) == FSINFO_TRAIL_SIG
    }

    /// Read the FSInfo sector. `None` when its signatures do not match.
    pub fn read(device: &dyn BlockDevice, sector: u64) -> Result<Option<Self>> {
        let mut buf = [0u8; 512];
        device.read_at(sector, 0, &mut buf)?;
        if !Self::signatures_ok(&buf) {
            return Ok(None);
        }
        let field = |off: usize| {
            let v = LittleEndian::read_u32(&buf[off..off + 4]);
            (v != FSINFO_UNKNOWN).then_some(v)
        };
        Ok(Some(Self {
            free_count: field(FSINFO_FREE_OFFSET),
            next_free: field(FSINFO_NEXT_OFFSET),
        }))
    }

    /// Store both hints. Returns false, writing nothing, if the sector does
    /// not carry valid signatures.
    pub fn write(&self, device: &dyn BlockDevice, sector: u64) -> Result<bool> {
        let mut buf = [0u8; 512];
        device.read_at(sector, 0, &mut buf)?;
        if !Self::signatures_ok(&buf) {
            return Ok(false);
        }
        let mut fields = [0u8; 8];
        LittleEndian::write_u32(&mut fields[0..4], self.free_count.unwrap_or(FSINFO_UNKNOWN));
        LittleEndian::write_u32(&mut fields[4..8], self.next_free.unwrap_or(FSINFO_UNKNOWN));
        device.write_at(sector, FSINFO_FREE_OFFSET, &fields)?;
        Ok(true)
    }
}

/// Mirroring bookkeeping kept under the table lock.
#[derive(Debug)]
pub(crate) struct MirrorState {
    /// The volume has copies to keep in step at all.
    capable: bool,
    enabled: bool,
    /// Copy-relative sector written last and not yet mirrored.
    pending: Option<u32>,
    /// Active copy changed while mirroring was off.
    stale: bool,
    pub(crate) fsinfo_dirty: bool,
}

impl MirrorState {
    pub(crate) fn new(capable: bool) -> Self {
        Self {
            capable,
            enabled: capable,
            pending: None,
            stale: false,
            fsinfo_dirty: false,
        }
    }
}

impl TableGuard<'_> {
    /// Whether writes are currently mirrored.
    pub fn mirroring_enabled(&self) -> bool {
        self.state.mirror.enabled
    }

    /// Record a write to the active copy.
    pub(crate) fn note_write(&mut self, span: EntrySpan) -> Result<()> {
        if !self.state.mirror.enabled {
            if self.state.mirror.capable {
                self.state.mirror.stale = true;
            }
            return Ok(());
        }
        for sector in span.sectors() {
            if self.state.mirror.pending != Some(sector) {
                self.mirror_pending()?;
                self.state.mirror.pending = Some(sector);
            }
        }
        Ok(())
    }

    /// Copy the pending sector to every non-active copy.
    fn mirror_pending(&mut self) -> Result<()> {
        let Some(sector) = self.state.mirror.pending.take() else {
            return Ok(());
        };
        let table = self.table();
        let geometry = table.geometry();
        let active = geometry.active_copy();
        let from = geometry.fat_start(active) + sector as u64;
        for copy in (0..geometry.num_fats).filter(|&c| c != active) {
            table
                .device()
                .copy_sectors(from, geometry.fat_start(copy) + sector as u64, 1)?;
        }
        Ok(())
    }

    /// Mirror the pending sector and persist the FSInfo hints.
    pub fn flush(&mut self) -> Result<()> {
        let table = self.table();
        if !table.device().is_writable() {
            return Ok(());
        }
        if self.state.mirror.enabled {
            self.mirror_pending()?;
        }
        if let Some(sector) = table.geometry().fsinfo_sector {
            if self.state.mirror.fsinfo_dirty {
                let cursor = self.state.cursor;
                let info = FsInfo {
                    free_count: cursor.free_count,
                    next_free: (cursor.clust_alloc_start != 0).then_some(cursor.clust_alloc_start),
                };
                if info.write(table.device().as_ref(), sector as u64)? {
                    debug!("FSInfo updated: {info:?}");
                } else {
                    warn!("FSInfo sector {sector}: bad signature, hints not saved");
                }
                self.state.mirror.fsinfo_dirty = false;
            }
        }
        table.device().flush()?;
        Ok(())
    }

    /// Suspend or resume mirroring. Resuming copies the whole active table
    /// to every other copy when `resync` is set or when the active copy was
    /// written while suspended.
    pub fn set_mirroring(&mut self, enable: bool, resync: bool) -> Result<()> {
        if !self.state.mirror.capable {
            return Ok(());
        }
        if !enable {
            if self.state.mirror.enabled {
                if self.table().device().is_writable() {
                    self.mirror_pending()?;
                }
                self.state.mirror.pending = None;
                self.state.mirror.enabled = false;
                debug!("table mirroring suspended");
            }
            return Ok(());
        }
        if self.state.mirror.enabled {
            return Ok(());
        }
        self.state.mirror.enabled = true;
        if resync || self.state.mirror.stale {
            self.resync()?;
        }
        self.state.mirror.stale = false;
        Ok(())
    }

    /// Copy the active table over every other copy.
    fn resync(&mut self) -> Result<()> {
        let table = self.table();
        if !table.device().is_writable() {
            return Err(FatError::ReadOnly);
        }
        let geometry = table.geometry();
        let active = geometry.active_copy();
        for copy in (0..geometry.num_fats).filter(|&c| c != active) {
            table.device().copy_sectors(
                geometry.fat_start(active),
                geometry.fat_start(copy),
                geometry.sectors_per_fat as u64,
            )?;
        }
        debug!(
            "resynchronised {} table copies ({} sectors each)",
            geometry.num_fats - 1,
            geometry.sectors_per_fat
        );
        Ok(())
    }
}
