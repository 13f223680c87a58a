//! Per-file chain traversal: stepping, seeking, truncation and contiguous
//! preallocation.
//!
//! Every session of a file holds a [`ChainHandle`]; the handles of one file
//! share a [`ChainAnchor`] carrying the start cluster and a generation
//! counter. Operations that rewrite the chain under other sessions' feet
//! bump the generation, and a handle seeing a new generation re-seeks from
//! the file start before doing anything else.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;

use super::alloc::{AllocMode, ClusterRun};
use super::codec::{Classification, ClusterId};
use super::table::ClusterTable;
use crate::error::{FatError, Result};

/// Start cluster and generation shared by all sessions of one file.
#[derive(Debug, Default)]
pub struct ChainAnchor {
    start: AtomicU32,
    generation: AtomicU64,
}

impl ChainAnchor {
    /// `start` is 0 for a file without clusters.
    pub fn new(start: ClusterId) -> Arc<Self> {
        Arc::new(Self {
            start: AtomicU32::new(start),
            generation: AtomicU64::new(0),
        })
    }

    pub fn start(&self) -> ClusterId {
        self.start.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn set_start(&self, start: ClusterId) {
        self.start.store(start, Ordering::Release);
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

/// Where a seek or truncation begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPoint {
    FileStart,
    Cluster(ClusterId),
}

/// Size of a contiguous preallocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContigRequest {
    Count(u32),
    /// The longest free run on the volume.
    Max,
}

/// One session's position in a chain.
#[derive(Debug)]
pub struct ChainHandle {
    anchor: Arc<ChainAnchor>,
    generation: u64,
    prev: ClusterId,
    /// 0 while positioned before the first cluster.
    current: ClusterId,
    /// Last cluster of the known contiguous run holding `current`.
    run_end: ClusterId,
    /// Clusters stepped from the file start, when known.
    position: Option<u32>,
    failed: bool,
}

impl ChainHandle {
    pub fn new(anchor: Arc<ChainAnchor>) -> Self {
        let generation = anchor.generation();
        Self {
            anchor,
            generation,
            prev: 0,
            current: 0,
            run_end: 0,
            position: Some(0),
            failed: false,
        }
    }

    pub fn anchor(&self) -> &Arc<ChainAnchor> {
        &self.anchor
    }

    pub fn current(&self) -> Option<ClusterId> {
        (self.current != 0).then_some(self.current)
    }

    pub fn prev(&self) -> Option<ClusterId> {
        (self.prev != 0).then_some(self.prev)
    }

    /// Remaining window of the known contiguous run, starting at the current cluster.
    pub fn run(&self) -> Option<ClusterRun> {
        (self.current != 0).then(|| ClusterRun {
            first: self.current,
            len: self.run_end - self.current + 1,
        })
    }

    /// Set after a traversal hit a damaged entry; cleared by a seek.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Move back before the first cluster.
    pub fn rewind(&mut self) {
        self.prev = 0;
        self.current = 0;
        self.run_end = 0;
        self.position = Some(0);
        self.failed = false;
        self.generation = self.anchor.generation();
    }

    fn land(&mut self, prev: ClusterId, current: ClusterId, run_end: ClusterId) {
        self.prev = prev;
        self.current = current;
        self.run_end = run_end;
        self.position = self.position.map(|p| p + 1);
    }

    fn fail(&mut self, cluster: ClusterId, detail: impl Into<String>) -> FatError {
        self.failed = true;
        FatError::corrupt(cluster, detail)
    }
}

impl ClusterTable {
    /// Last cluster of the contiguous run starting at `first`, bounded by
    /// the group size. Only clusters that are themselves part of a chain
    /// extend the run.
    fn detect_run(&self, first: ClusterId) -> Result<ClusterId> {
        let mut last = first;
        let mut class = self.entry(first)?;
        for _ in 1..self.group_size() {
            match class {
                Classification::Allocated(next) if next == last + 1 => {
                    let next_class = self.entry(next)?;
                    if !next_class.is_in_chain() {
                        break;
                    }
                    last = next;
                    class = next_class;
                }
                _ => break,
            }
        }
        if last > first {
            debug!("contiguous run {first}..={last}");
        }
        Ok(last)
    }

    /// Re-seek a handle whose anchor moved on since it last looked.
    fn sync_handle(&self, handle: &mut ChainHandle) -> Result<()> {
        if handle.generation == handle.anchor.generation() {
            return Ok(());
        }
        let position = handle.position;
        handle.rewind();
        if let Some(steps @ 1..) = position {
            if handle.anchor.start() != 0 {
                match self.seek(handle, ChainPoint::FileStart, steps - 1) {
                    Ok(()) | Err(FatError::OutOfRange { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        // A chain that got shorter leaves the handle at its end or rewound.
        if handle.current == 0 {
            handle.rewind();
        }
        Ok(())
    }

    /// Advance `handle` to the next cluster of its chain, allocating per
    /// `mode` at the end of the chain. Returns the contiguous window that
    /// starts at the new current cluster, or `None` at the end of the chain
    /// when no allocation was requested.
    pub fn get_next(&self, handle: &mut ChainHandle, mode: AllocMode) -> Result<Option<ClusterRun>> {
        self.sync_handle(handle)?;
        if handle.failed {
            return Err(FatError::corrupt(handle.current, "chain handle is in error"));
        }

        if handle.current == 0 {
            let start = handle.anchor.start();
            if start != 0 {
                return self.step_into(handle, 0, start).map(Some);
            }
            if mode == AllocMode::NoAlloc {
                return Ok(None);
            }
            let mut guard = self.lock()?;
            // Another session may have started the chain meanwhile.
            let start = handle.anchor.start();
            if start != 0 {
                drop(guard);
                return self.step_into(handle, 0, start).map(Some);
            }
            let run = guard.allocate(mode, None)?;
            handle.anchor.set_start(run.first);
            handle.land(0, run.first, run.last());
            return Ok(handle.run());
        }

        if handle.current < handle.run_end {
            let from = handle.current;
            handle.land(from, from + 1, handle.run_end);
            return Ok(handle.run());
        }

        let current = handle.current;
        match self.entry(current)? {
            Classification::Allocated(next) => self.step_into(handle, current, next).map(Some),
            Classification::EndOfChain => {
                if mode == AllocMode::NoAlloc {
                    return Ok(None);
                }
                let mut guard = self.lock()?;
                match guard.entry(current)? {
                    Classification::EndOfChain => {
                        let run = guard.allocate(mode, Some(current))?;
                        handle.land(current, run.first, run.last());
                        Ok(handle.run())
                    }
                    Classification::Allocated(next) => {
                        drop(guard);
                        self.step_into(handle, current, next).map(Some)
                    }
                    other => Err(handle.fail(current, format!("chain broken by {other:?}"))),
                }
            }
            other => Err(handle.fail(current, format!("chain broken by {other:?}"))),
        }
    }

    fn step_into(
        &self,
        handle: &mut ChainHandle,
        from: ClusterId,
        next: ClusterId,
    ) -> Result<ClusterRun> {
        match self.entry(next)? {
            class if class.is_in_chain() => {
                let run_end = self.detect_run(next)?;
                handle.land(from, next, run_end);
                Ok(ClusterRun {
                    first: next,
                    len: run_end - next + 1,
                })
            }
            other => Err(handle.fail(next, format!("link into {other:?} cluster"))),
        }
    }

    /// Position `handle` `count` clusters past `from`.
    pub fn seek(&self, handle: &mut ChainHandle, from: ChainPoint, count: u32) -> Result<()> {
        handle.generation = handle.anchor.generation();
        let (start, position) = match from {
            ChainPoint::FileStart => match handle.anchor.start() {
                0 => return Err(FatError::OutOfRange { cluster: 0 }),
                start => (start, Some(0)),
            },
            ChainPoint::Cluster(cluster) => {
                if !self.codec().in_range(cluster) {
                    return Err(FatError::OutOfRange { cluster });
                }
                (cluster, None)
            }
        };

        handle.failed = false;
        handle.position = position;
        handle.prev = 0;
        handle.current = 0;
        self.step_into(handle, 0, start)?;

        let mut remaining = count;
        while remaining > 0 {
            let in_run = handle.run_end - handle.current;
            if in_run > 0 {
                let hop = in_run.min(remaining);
                let target = handle.current + hop;
                handle.prev = target - 1;
                handle.current = target;
                handle.position = handle.position.map(|p| p + hop);
                remaining -= hop;
                continue;
            }
            let current = handle.current;
            match self.entry(current)? {
                Classification::Allocated(next) => self.step_into(handle, current, next).map(|_| ())?,
                Classification::EndOfChain => return Err(FatError::OutOfRange { cluster: current }),
                other => return Err(handle.fail(current, format!("chain broken by {other:?}"))),
            }
            remaining -= 1;
        }
        Ok(())
    }

    /// Free the chain from `from` onwards. With `include_from` false the
    /// cluster at `from` becomes the new end of the chain. `from` must lie on
    /// the file's chain and the chain is validated before anything is freed.
    /// Returns the number of clusters freed.
    pub fn truncate(
        &self,
        handle: &mut ChainHandle,
        from: ChainPoint,
        include_from: bool,
    ) -> Result<u32> {
        let anchor = Arc::clone(&handle.anchor);
        let mut guard = self.lock()?;
        let point = match from {
            ChainPoint::FileStart => match anchor.start() {
                0 => return Ok(0),
                start => start,
            },
            ChainPoint::Cluster(cluster) => cluster,
        };
        if !self.device().is_writable() {
            return Err(FatError::ReadOnly);
        }

        let chain = guard.collect_chain(point)?;
        let Some((&head, tail)) = chain.split_first() else {
            return Ok(0);
        };
        let at_start = point == anchor.start();
        let predecessor = match anchor.start() {
            start if start != 0 && !at_start => guard.find_predecessor(start, point)?,
            _ => None,
        };
        if !at_start && predecessor.is_none() {
            return Err(FatError::OutOfRange { cluster: point });
        }

        let to_free: &[ClusterId] = if include_from { &chain } else { tail };
        if include_from {
            if let Some(prev) = predecessor {
                guard.set_entry(prev, Classification::EndOfChain)?;
            }
        } else if guard.entry(head)? != Classification::EndOfChain {
            guard.set_entry(head, Classification::EndOfChain)?;
        }
        let freed = guard.release(to_free)?;
        if include_from && at_start {
            anchor.set_start(0);
        }
        drop(guard);

        if freed == 0 && !(include_from && at_start) {
            return Ok(0);
        }
        anchor.bump();

        let cut = to_free.first().copied();
        if handle.current != 0 && to_free.contains(&handle.current) {
            handle.rewind();
        } else {
            if let Some(cut) = cut {
                if handle.current < cut && cut <= handle.run_end {
                    handle.run_end = cut - 1;
                }
            }
            handle.generation = anchor.generation();
        }
        debug!("truncated chain at {point} (include {include_from}): {freed} clusters freed");
        Ok(freed)
    }

    /// Replace the file's chain with a freshly allocated contiguous run.
    /// The old chain is freed and every session of the file re-seeks.
    pub fn contig_alloc(&self, handle: &mut ChainHandle, request: ContigRequest) -> Result<ClusterRun> {
        let anchor = Arc::clone(&handle.anchor);
        let mut guard = self.lock()?;
        if !self.device().is_writable() {
            return Err(FatError::ReadOnly);
        }
        let old = match anchor.start() {
            0 => Vec::new(),
            start => guard.collect_chain(start)?,
        };

        let run = match request {
            ContigRequest::Count(0) => {
                return Err(FatError::InvalidArgument(
                    "contiguous allocation of zero clusters".into(),
                ))
            }
            ContigRequest::Count(len) => {
                let first = guard.first_fit(len)?.ok_or(FatError::NoSpace)?;
                ClusterRun { first, len }
            }
            ContigRequest::Max => guard.longest_free_run()?.ok_or(FatError::NoSpace)?,
        };
        guard.commit_run(run.first, run.len, None)?;
        guard.release(&old)?;
        anchor.set_start(run.first);
        anchor.bump();
        drop(guard);

        handle.rewind();
        debug!(
            "contiguous allocation {}..={} replaced {} clusters",
            run.first,
            run.last(),
            old.len()
        );
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::fat::volume::FatType;
    use crate::test_support::{device_for, geometry, mounted, set_chain, FlakyDevice};

    #[test]
    fn test_get_next_walks_chain_and_stops() {
        let (_dev, table) = mounted(FatType::Fat16, 20);
        set_chain(&mut table.lock().unwrap(), &[2, 3, 4, 9]);
        let mut handle = ChainHandle::new(ChainAnchor::new(2));

        assert_eq!(
            table.get_next(&mut handle, AllocMode::NoAlloc).unwrap(),
            Some(ClusterRun { first: 2, len: 3 })
        );
        // Inside the known run: virtual steps.
        assert_eq!(
            table.get_next(&mut handle, AllocMode::NoAlloc).unwrap(),
            Some(ClusterRun { first: 3, len: 2 })
        );
        assert_eq!(
            table.get_next(&mut handle, AllocMode::NoAlloc).unwrap(),
            Some(ClusterRun { first: 4, len: 1 })
        );
        assert_eq!(
            table.get_next(&mut handle, AllocMode::NoAlloc).unwrap(),
            Some(ClusterRun { first: 9, len: 1 })
        );
        assert_eq!(handle.prev(), Some(4));
        assert_eq!(table.get_next(&mut handle, AllocMode::NoAlloc).unwrap(), None);
        assert_eq!(handle.current(), Some(9));
    }

    #[test]
    fn test_get_next_allocates_at_end() {
        let (_dev, table) = mounted(FatType::Fat32, 20);
        let mut handle = ChainHandle::new(ChainAnchor::new(0));
        assert_eq!(table.get_next(&mut handle, AllocMode::NoAlloc).unwrap(), None);

        let first = table.get_next(&mut handle, AllocMode::AllocOne).unwrap().unwrap();
        assert_eq!(first.first, 2);
        assert_eq!(handle.anchor().start(), 2);
        let second = table.get_next(&mut handle, AllocMode::AllocOne).unwrap().unwrap();
        assert_eq!(second.first, 3);
        let chain = table.lock().unwrap().collect_chain(2).unwrap();
        assert_eq!(chain, vec![2, 3]);
    }

    #[test]
    fn test_get_next_fails_on_broken_chain() {
        let (_dev, table) = mounted(FatType::Fat16, 20);
        {
            let mut guard = table.lock().unwrap();
            guard.set_entry(2, Classification::Allocated(3)).unwrap();
            guard.set_entry(3, Classification::Bad).unwrap();
        }
        let mut handle = ChainHandle::new(ChainAnchor::new(2));
        table.get_next(&mut handle, AllocMode::NoAlloc).unwrap();
        let err = table.get_next(&mut handle, AllocMode::AllocOne).unwrap_err();
        assert!(matches!(err, FatError::Corrupt { cluster: 3, .. }));
        assert!(handle.is_failed());
        assert!(table.get_next(&mut handle, AllocMode::NoAlloc).is_err());
    }

    #[test]
    fn test_seek_through_runs_and_fragments() {
        let (_dev, table) = mounted(FatType::Fat12, 30);
        set_chain(&mut table.lock().unwrap(), &[2, 3, 4, 10, 11, 20]);
        let mut handle = ChainHandle::new(ChainAnchor::new(2));

        table.seek(&mut handle, ChainPoint::FileStart, 4).unwrap();
        assert_eq!(handle.current(), Some(11));
        assert_eq!(handle.prev(), Some(10));
        table.seek(&mut handle, ChainPoint::Cluster(3), 1).unwrap();
        assert_eq!(handle.current(), Some(4));
        assert!(matches!(
            table.seek(&mut handle, ChainPoint::FileStart, 6),
            Err(FatError::OutOfRange { cluster: 20 })
        ));
    }

    #[test]
    fn test_truncate_keeps_from_cluster() {
        let (_dev, table) = mounted(FatType::Fat16, 20);
        set_chain(&mut table.lock().unwrap(), &[2, 3, 4, 5]);
        table.free_space().unwrap();
        let mut handle = ChainHandle::new(ChainAnchor::new(2));

        let freed = table
            .truncate(&mut handle, ChainPoint::Cluster(3), false)
            .unwrap();
        assert_eq!(freed, 2);
        let guard = table.lock().unwrap();
        assert_eq!(guard.collect_chain(2).unwrap(), vec![2, 3]);
        assert_eq!(guard.entry(4).unwrap(), Classification::Available);
    }

    #[test]
    fn test_truncate_rejects_cluster_of_another_chain() {
        let (_dev, table) = mounted(FatType::Fat16, 20);
        {
            let mut guard = table.lock().unwrap();
            set_chain(&mut guard, &[2, 3, 4]);
            set_chain(&mut guard, &[9, 10]);
        }
        let mut handle = ChainHandle::new(ChainAnchor::new(2));

        for include_from in [false, true] {
            assert!(matches!(
                table.truncate(&mut handle, ChainPoint::Cluster(9), include_from),
                Err(FatError::OutOfRange { cluster: 9 })
            ));
        }
        let guard = table.lock().unwrap();
        assert_eq!(guard.collect_chain(2).unwrap(), vec![2, 3, 4]);
        assert_eq!(guard.collect_chain(9).unwrap(), vec![9, 10]);
        assert_eq!(handle.anchor.start(), 2);
    }

    #[test]
    fn test_failed_truncate_keeps_file_start() {
        let geometry = geometry(FatType::Fat16, 20);
        let flaky = Arc::new(FlakyDevice::new(device_for(&geometry)));
        let table =
            ClusterTable::with_geometry(flaky.clone(), geometry, &EngineConfig::default()).unwrap();
        set_chain(&mut table.lock().unwrap(), &[2, 3, 4]);
        let anchor = ChainAnchor::new(2);
        let mut handle = ChainHandle::new(Arc::clone(&anchor));
        let generation = anchor.generation();

        // Cluster 2 is freed, the write for 3 fails.
        flaky.fail_after(1);
        assert!(matches!(
            table.truncate(&mut handle, ChainPoint::FileStart, true),
            Err(FatError::Io(_))
        ));
        assert_eq!(anchor.start(), 2);
        assert_eq!(anchor.generation(), generation);
    }

    #[test]
    fn test_truncate_mid_chain_reterminates_predecessor() {
        let (_dev, table) = mounted(FatType::Fat16, 20);
        set_chain(&mut table.lock().unwrap(), &[2, 7, 4, 5]);
        let mut handle = ChainHandle::new(ChainAnchor::new(2));
        let freed = table
            .truncate(&mut handle, ChainPoint::Cluster(4), true)
            .unwrap();
        assert_eq!(freed, 2);
        assert_eq!(table.lock().unwrap().collect_chain(2).unwrap(), vec![2, 7]);
    }

    #[test]
    fn test_truncate_whole_file_twice() {
        let (_dev, table) = mounted(FatType::Fat32, 20);
        set_chain(&mut table.lock().unwrap(), &[5, 6, 7]);
        let before = table.free_space().unwrap();
        let mut handle = ChainHandle::new(ChainAnchor::new(5));
        table.get_next(&mut handle, AllocMode::NoAlloc).unwrap();

        assert_eq!(table.truncate(&mut handle, ChainPoint::FileStart, true).unwrap(), 3);
        let after = table.free_space().unwrap();
        assert_eq!(after, before + 3);
        assert_eq!(handle.anchor().start(), 0);
        assert_eq!(handle.current(), None);

        assert_eq!(table.truncate(&mut handle, ChainPoint::FileStart, true).unwrap(), 0);
        assert_eq!(table.free_space().unwrap(), after);
    }

    #[test]
    fn test_truncate_validates_before_freeing() {
        let (_dev, table) = mounted(FatType::Fat16, 20);
        {
            let mut guard = table.lock().unwrap();
            guard.set_entry(2, Classification::Allocated(3)).unwrap();
            guard.set_entry(3, Classification::Allocated(4)).unwrap();
            guard.set_entry(4, Classification::Allocated(3)).unwrap();
        }
        let mut handle = ChainHandle::new(ChainAnchor::new(2));
        assert!(matches!(
            table.truncate(&mut handle, ChainPoint::FileStart, true),
            Err(FatError::Corrupt { .. })
        ));
        assert_eq!(table.entry(2).unwrap(), Classification::Allocated(3));
        assert_eq!(handle.anchor().start(), 2);
    }

    #[test]
    fn test_other_session_reseeks_after_truncate() {
        let (_dev, table) = mounted(FatType::Fat16, 20);
        set_chain(&mut table.lock().unwrap(), &[2, 3, 4, 5]);
        let anchor = ChainAnchor::new(2);
        let mut writer = ChainHandle::new(Arc::clone(&anchor));
        let mut reader = ChainHandle::new(Arc::clone(&anchor));
        table.seek(&mut reader, ChainPoint::FileStart, 3).unwrap();
        assert_eq!(reader.current(), Some(5));

        table.truncate(&mut writer, ChainPoint::Cluster(3), false).unwrap();
        // The reader's cluster was freed; it lands on the new tail.
        assert_eq!(table.get_next(&mut reader, AllocMode::NoAlloc).unwrap(), None);
        assert_eq!(reader.current(), Some(3));
    }

    #[test]
    fn test_contig_alloc_replaces_chain() {
        let (_dev, table) = mounted(FatType::Fat16, 20);
        {
            let mut guard = table.lock().unwrap();
            set_chain(&mut guard, &[2, 4]);
            set_chain(&mut guard, &[6]);
        }
        let before = table.free_space().unwrap();
        let anchor = ChainAnchor::new(2);
        let mut handle = ChainHandle::new(Arc::clone(&anchor));
        let generation = anchor.generation();

        let run = table.contig_alloc(&mut handle, ContigRequest::Count(5)).unwrap();
        assert_eq!(run, ClusterRun { first: 7, len: 5 });
        assert_eq!(anchor.start(), 7);
        assert!(anchor.generation() > generation);
        let guard = table.lock().unwrap();
        assert_eq!(guard.collect_chain(7).unwrap(), vec![7, 8, 9, 10, 11]);
        assert_eq!(guard.entry(2).unwrap(), Classification::Available);
        assert_eq!(guard.entry(4).unwrap(), Classification::Available);
        drop(guard);
        assert_eq!(table.free_space().unwrap(), before - 5 + 2);
        assert_eq!(table.recount_free().unwrap(), before - 3);
    }

    #[test]
    fn test_contig_alloc_max_and_no_space() {
        let (_dev, table) = mounted(FatType::Fat16, 10);
        set_chain(&mut table.lock().unwrap(), &[5]);
        let mut handle = ChainHandle::new(ChainAnchor::new(0));
        let run = table.contig_alloc(&mut handle, ContigRequest::Max).unwrap();
        assert_eq!(run, ClusterRun { first: 6, len: 6 });

        let mut other = ChainHandle::new(ChainAnchor::new(0));
        assert!(matches!(
            table.contig_alloc(&mut other, ContigRequest::Count(4)),
            Err(FatError::NoSpace)
        ));
        assert_eq!(other.anchor().start(), 0);
    }
}
