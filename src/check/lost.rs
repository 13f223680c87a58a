//! Lost-chain sweep over the whole table.

use std::collections::BTreeMap;
use std::ops::ControlFlow;

use super::markmap::Mark;
use super::report::format_size;
use super::{CheckSession, FindingKind};
use crate::error::Result;
use crate::fat::codec::{Classification, ClusterId, MIN_CLUSTER};

/// Clusters swept between media-change checks.
const MEDIA_CHECK_INTERVAL: u32 = 4096;

impl CheckSession<'_, '_> {
    /// Find allocated clusters no entry reached, tallying free, bad and
    /// invalid slots on the way. Returns lost chain heads with their lengths.
    pub(super) fn find_lost(&mut self) -> Result<BTreeMap<ClusterId, u32>> {
        let table = self.table;
        let mut heads = BTreeMap::new();
        let mut failure = None;
        table.scan(MIN_CLUSTER, table.max_cluster(), |cluster, class| {
            match self.sweep(cluster, class, &mut heads) {
                Ok(()) => ControlFlow::Continue(()),
                Err(e) => {
                    failure = Some(e);
                    ControlFlow::Break(())
                }
            }
        })?;
        if let Some(e) = failure {
            return Err(e);
        }

        let repair = self.repair();
        let cluster_size = self.report.cluster_size;
        for (&head, &len) in &heads {
            let bytes = len as u64 * cluster_size;
            self.report.lost_chains += 1;
            self.report.lost_clusters += len;
            self.report.lost_bytes += bytes;
            self.record(
                FindingKind::LostChain,
                None,
                head,
                format!("{len} clusters ({})", format_size(bytes)),
                repair,
            );
        }
        Ok(heads)
    }

    fn sweep(
        &mut self,
        cluster: ClusterId,
        class: Classification,
        heads: &mut BTreeMap<ClusterId, u32>,
    ) -> Result<()> {
        if cluster % MEDIA_CHECK_INTERVAL == 0 {
            self.check_media()?;
        }
        if self.marks.get(cluster)? != Mark::Untouched {
            return Ok(());
        }
        match class {
            Classification::Available => self.report.free_clusters += 1,
            Classification::Bad => self.report.bad_clusters += 1,
            Classification::Reserved | Classification::Invalid => {
                self.report.invalid_clusters += 1
            }
            Classification::Allocated(_) | Classification::EndOfChain => {
                let len = self.trace_lost(cluster, heads)?;
                heads.insert(cluster, len);
            }
        }
        Ok(())
    }

    /// Mark the chain from `head` as lost. A chain running into the head
    /// of one found earlier absorbs it.
    fn trace_lost(&mut self, head: ClusterId, heads: &mut BTreeMap<ClusterId, u32>) -> Result<u32> {
        self.marks.set(head, Mark::Lost)?;
        let mut len = 1u32;
        let mut cluster = head;
        while let Classification::Allocated(next) = self.table.entry(cluster)? {
            match self.marks.get(next)? {
                Mark::Untouched if self.table.entry(next)?.is_in_chain() => {
                    self.marks.set(next, Mark::Lost)?;
                    len += 1;
                    cluster = next;
                }
                Mark::Lost => {
                    if let Some(tail) = heads.remove(&next) {
                        len += tail;
                    }
                    break;
                }
                _ => break,
            }
        }
        Ok(len)
    }

    /// Return every lost chain to the free pool.
    pub(super) fn free_lost(&mut self, heads: &BTreeMap<ClusterId, u32>) -> Result<u32> {
        let mut freed = 0u32;
        for &head in heads.keys() {
            let mut chain = Vec::new();
            let mut cluster = head;
            while self.marks.get(cluster)? == Mark::Lost {
                self.marks.set(cluster, Mark::Untouched)?;
                chain.push(cluster);
                match self.table.entry(cluster)? {
                    Classification::Allocated(next) => cluster = next,
                    _ => break,
                }
            }
            freed += self.guard.release(&chain)?;
        }
        self.report.free_clusters += freed;
        log::debug!("check: freed {freed} lost clusters");
        Ok(freed)
    }
}
