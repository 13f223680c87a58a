use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Sector-addressed I/O used by the cluster table and the directory walker.
///
/// Implementations do their own locking so a device can be shared between
/// sessions. A single `write_at` call must be atomic with respect to other
/// calls on the same device.
pub trait BlockDevice: Send + Sync {
    /// Bytes per sector.
    fn sector_size(&self) -> usize;

    /// Read `buf.len()` bytes starting `offset` bytes into `sector`.
    ///
    /// The range may run past the end of `sector` into the following ones.
    fn read_at(&self, sector: u64, offset: usize, buf: &mut [u8]) -> io::Result<()>;

    /// Write `buf` starting `offset` bytes into `sector`.
    fn write_at(&self, sector: u64, offset: usize, buf: &[u8]) -> io::Result<()>;

    /// Copy `count` whole sectors from `from` to `to`.
    fn copy_sectors(&self, from: u64, to: u64, count: u64) -> io::Result<()> {
        let mut buf = vec![0u8; self.sector_size()];
        for i in 0..count {
            self.read_at(from + i, 0, &mut buf)?;
            self.write_at(to + i, 0, &buf)?;
        }
        Ok(())
    }

    /// Whether writes are accepted.
    fn is_writable(&self) -> bool;

    /// Whether the underlying medium was swapped or rewritten behind our back.
    fn has_changed(&self) -> bool {
        false
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

/// A volume image (file, block device node or in-memory buffer) starting at
/// `partition_offset` bytes into `inner`.
pub struct ImageDevice<F> {
    inner: Mutex<F>,
    partition_offset: u64,
    sector_size: usize,
    writable: bool,
    changed: AtomicBool,
}

impl ImageDevice<File> {
    /// Open an image file. Read-only images refuse every write.
    pub fn open(path: &Path, partition_offset: u64, writable: bool) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let dev = Self::new(file, partition_offset);
        Ok(if writable { dev } else { dev.read_only() })
    }
}

impl<F: Read + Write + Seek + Send> ImageDevice<F> {
    pub fn new(inner: F, partition_offset: u64) -> Self {
        Self {
            inner: Mutex::new(inner),
            partition_offset,
            sector_size: 512,
            writable: true,
            changed: AtomicBool::new(false),
        }
    }

    pub fn with_sector_size(mut self, sector_size: usize) -> Self {
        self.sector_size = sector_size;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    /// Flag the medium as changed; every later `has_changed` returns true
    /// until `clear_changed` is called.
    pub fn mark_changed(&self) {
        self.changed.store(true, Ordering::SeqCst);
    }

    pub fn clear_changed(&self) {
        self.changed.store(false, Ordering::SeqCst);
    }

    pub fn into_inner(self) -> F {
        match self.inner.into_inner() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn byte_offset(&self, sector: u64, offset: usize) -> u64 {
        self.partition_offset + sector * self.sector_size as u64 + offset as u64
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, F>> {
        self.inner
            .lock()
            .map_err(|_| io::Error::other("device lock poisoned"))
    }
}

impl<F: Read + Write + Seek + Send> BlockDevice for ImageDevice<F> {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn read_at(&self, sector: u64, offset: usize, buf: &mut [u8]) -> io::Result<()> {
        let pos = self.byte_offset(sector, offset);
        let mut inner = self.lock()?;
        inner.seek(SeekFrom::Start(pos))?;
        inner.read_exact(buf)
    }

    fn write_at(&self, sector: u64, offset: usize, buf: &[u8]) -> io::Result<()> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "image opened read-only",
            ));
        }
        let pos = self.byte_offset(sector, offset);
        let mut inner = self.lock()?;
        inner.seek(SeekFrom::Start(pos))?;
        inner.write_all(buf)
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn has_changed(&self) -> bool {
        self.changed.load(Ordering::SeqCst)
    }

    fn flush(&self) -> io::Result<()> {
        self.lock()?.flush()
    }
}
