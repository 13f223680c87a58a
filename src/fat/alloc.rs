use std::ops::ControlFlow;

use log::{debug, warn};
use serde::Serialize;

use super::codec::{Classification, ClusterId, MIN_CLUSTER};
use super::table::{ClusterTable, TableGuard};
use crate::error::{FatError, Result};

/// Whether `get_next` may grow the chain, and by how much.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocMode {
    NoAlloc,
    AllocOne,
    AllocGroup,
}

/// Consecutive clusters `first..first + len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClusterRun {
    pub first: ClusterId,
    pub len: u32,
}

impl ClusterRun {
    pub fn last(&self) -> ClusterId {
        self.first + self.len - 1
    }

    pub fn contains(&self, cluster: ClusterId) -> bool {
        (self.first..=self.last()).contains(&cluster)
    }
}

impl ClusterTable {
    /// Longest run of free clusters, earliest first on ties.
    pub fn max_contiguous_run(&self) -> Result<Option<ClusterRun>> {
        self.lock()?.longest_free_run()
    }
}

impl TableGuard<'_> {
    /// First run of `len` free clusters beginning at or after `start`, then
    /// from the lowest cluster for runs beginning before `start`.
    pub(crate) fn find_free_run(&self, start: ClusterId, len: u32) -> Result<Option<ClusterId>> {
        let table = self.table();
        let max = table.max_cluster();
        if len == 0 || len > table.n_entries() {
            return Ok(None);
        }
        let start = if table.codec().in_range(start) { start } else { MIN_CLUSTER };

        if let Some(first) = first_run_in(table, start, max, len)? {
            return Ok(Some(first));
        }
        if start > MIN_CLUSTER {
            // Runs beginning before `start` may end past it.
            let last = start.saturating_add(len - 2).min(max);
            return first_run_in(table, MIN_CLUSTER, last, len);
        }
        Ok(None)
    }

    /// First run of `len` free clusters anywhere, ignoring the cursors.
    pub fn first_fit(&self, len: u32) -> Result<Option<ClusterId>> {
        self.find_free_run(MIN_CLUSTER, len)
    }

    /// Longest run of free clusters; the earliest wins a tie.
    pub fn longest_free_run(&self) -> Result<Option<ClusterRun>> {
        let mut best: Option<ClusterRun> = None;
        let mut run = ClusterRun { first: 0, len: 0 };
        let table = self.table();
        table.scan(MIN_CLUSTER, table.max_cluster(), |cluster, class| {
            if class == Classification::Available {
                if run.len == 0 {
                    run.first = cluster;
                }
                run.len += 1;
            } else {
                keep_longer(run, &mut best);
                run.len = 0;
            }
            ControlFlow::Continue(())
        })?;
        keep_longer(run, &mut best);
        Ok(best)
    }

    /// Turn the free run `first..first + len` into a chain and, when given,
    /// link `link_from` to its head. The tail is terminated before anything
    /// points into the run. If a write fails the clusters already linked are
    /// returned to the free pool.
    pub(crate) fn commit_run(
        &mut self,
        first: ClusterId,
        len: u32,
        link_from: Option<ClusterId>,
    ) -> Result<ClusterRun> {
        let run = ClusterRun { first, len };
        let mut written = Vec::with_capacity(len as usize);
        if let Err(err) = self.link_run(run, link_from, &mut written) {
            self.unwind(&written);
            return Err(err);
        }
        self.take_free(len);
        debug!("allocated clusters {}..={}", first, run.last());
        Ok(run)
    }

    fn link_run(
        &mut self,
        run: ClusterRun,
        link_from: Option<ClusterId>,
        written: &mut Vec<ClusterId>,
    ) -> Result<()> {
        written.push(run.last());
        self.set_entry(run.last(), Classification::EndOfChain)?;
        for cluster in (run.first..run.last()).rev() {
            written.push(cluster);
            self.set_entry(cluster, Classification::Allocated(cluster + 1))?;
        }
        if let Some(prev) = link_from {
            self.set_entry(prev, Classification::Allocated(run.first))?;
        }
        Ok(())
    }

    /// Best-effort reset of a partly linked run to free.
    fn unwind(&mut self, written: &[ClusterId]) {
        for &cluster in written {
            if let Err(err) = self.set_entry(cluster, Classification::Available) {
                warn!("cluster {cluster} left allocated after a failed allocation: {err}");
            }
        }
    }

    /// Allocate clusters per `mode`, linking them after `link_from`.
    pub fn allocate(&mut self, mode: AllocMode, link_from: Option<ClusterId>) -> Result<ClusterRun> {
        if !self.table().device().is_writable() {
            return Err(FatError::ReadOnly);
        }
        if self.state.cursor.free_count == Some(0) {
            return Err(FatError::NoSpace);
        }
        match mode {
            AllocMode::NoAlloc => Err(FatError::InvalidArgument(
                "allocation requested with NoAlloc".into(),
            )),
            AllocMode::AllocOne => self.allocate_single(link_from),
            AllocMode::AllocGroup => {
                let cursor = self.state.cursor;
                let len = cursor.group_size;
                let start = if cursor.group_alloc_start != 0 {
                    cursor.group_alloc_start
                } else {
                    cursor.clust_alloc_start
                };
                let enough = cursor.free_count.map_or(true, |free| free >= len);
                if len > 1 && enough {
                    if let Some(first) = self.find_free_run(start, len)? {
                        let run = self.commit_run(first, len, link_from)?;
                        self.state.cursor.group_alloc_start = self.next_cursor(run);
                        return Ok(run);
                    }
                    debug!("no free run of {len} clusters, allocating one");
                }
                self.allocate_single(link_from)
            }
        }
    }

    fn allocate_single(&mut self, link_from: Option<ClusterId>) -> Result<ClusterRun> {
        let start = self.state.cursor.clust_alloc_start;
        let first = self.find_free_run(start, 1)?.ok_or(FatError::NoSpace)?;
        let run = self.commit_run(first, 1, link_from)?;
        self.state.cursor.clust_alloc_start = self.next_cursor(run);
        Ok(run)
    }

    /// Cursor value just past `run`, or 0 past the end of the table.
    fn next_cursor(&self, run: ClusterRun) -> ClusterId {
        let next = run.last() + 1;
        if next > self.table().max_cluster() {
            0
        } else {
            next
        }
    }
}

fn keep_longer(run: ClusterRun, best: &mut Option<ClusterRun>) {
    if run.len > 0 && best.map_or(true, |b| run.len > b.len) {
        *best = Some(run);
    }
}

fn first_run_in(
    table: &ClusterTable,
    first: ClusterId,
    last: ClusterId,
    len: u32,
) -> Result<Option<ClusterId>> {
    let mut found = None;
    let mut run_start = 0;
    let mut run_len = 0u32;
    table.scan(first, last, |cluster, class| {
        if class != Classification::Available {
            run_len = 0;
            return ControlFlow::Continue(());
        }
        if run_len == 0 {
            run_start = cluster;
        }
        run_len += 1;
        if run_len == len {
            found = Some(run_start);
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    })?;
    Ok(found)
}
