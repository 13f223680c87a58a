//! Directory tree walk: structure, start clusters, ownership and chain bodies.

use log::info;

use super::markmap::{Mark, FIXED_ROOT_OWNER, VOLUME_OWNER};
use super::{CheckSession, FindingKind};
use crate::config::Verbosity;
use crate::error::{FatError, Result};
use crate::fat::codec::{Classification, ClusterId};
use crate::fs::entry::{DirEntry, EntryDates, FatTimestamp};
use crate::fs::tree::DirectoryTree;

/// Result of claiming an entry's start cluster.
enum Claim {
    Claimed,
    /// The entry lost a cross-link or starts inside another chain.
    Rejected,
}

pub(super) fn describe(class: Classification) -> String {
    match class {
        Classification::Available => "a free cluster".into(),
        Classification::Allocated(next) => format!("a link to cluster {next}"),
        Classification::EndOfChain => "an end-of-chain mark".into(),
        Classification::Bad => "a bad cluster".into(),
        Classification::Reserved => "a reserved value".into(),
        Classification::Invalid => "an invalid value".into(),
    }
}

impl CheckSession<'_, '_> {
    pub(super) fn scan_tree<T: DirectoryTree + ?Sized>(&mut self, tree: &mut T) -> Result<()> {
        let root = tree.root()?;
        self.root_start = root.start_cluster;
        if root.start_cluster != 0 {
            let start = root.start_cluster;
            let class = self.table.entry(start)?;
            if !class.is_in_chain() {
                // Freeing "lost" clusters below an unreadable root would
                // empty the volume.
                return Err(FatError::corrupt(
                    start,
                    format!("root directory starts at {}", describe(class)),
                ));
            }
            self.marks.set(
                start,
                Mark::Owned {
                    owner: VOLUME_OWNER,
                    start: true,
                },
            )?;
            self.claims.insert(start, root.clone());
            self.walk_chain(&root)?;
        }
        self.scan_dir(tree, &root, 0)?;
        Ok(())
    }

    /// Scan the entries of `dir`. Returns false if `dir` was found broken
    /// and skipped.
    fn scan_dir<T: DirectoryTree + ?Sized>(
        &mut self,
        tree: &mut T,
        dir: &DirEntry,
        depth: u32,
    ) -> Result<bool> {
        self.check_media()?;
        if self.options.verbosity == Verbosity::Verbose {
            info!("check: {}", dir.path);
        }
        let entries = tree.read_dir(&dir.as_dir())?;

        if !dir.is_root() {
            if let Some(detail) = self.dot_mismatch(dir, &entries) {
                let repaired = self.delete(tree, dir)?;
                if repaired {
                    self.release_marks(dir.start_cluster)?;
                }
                self.record(
                    FindingKind::BadStructure,
                    Some(&dir.path),
                    dir.start_cluster,
                    detail,
                    repaired,
                );
                return Ok(false);
            }
        }

        let owner = if dir.start_cluster == 0 {
            FIXED_ROOT_OWNER
        } else {
            dir.start_cluster
        };
        for entry in entries.iter().filter(|e| !e.is_dot()) {
            self.check_entry(tree, entry, owner, depth)?;
        }
        Ok(true)
    }

    /// Why `dir`'s "." and ".." entries are wrong, if they are.
    fn dot_mismatch(&self, dir: &DirEntry, entries: &[DirEntry]) -> Option<String> {
        let [dot, dotdot, ..] = entries else {
            return Some("missing \".\" and \"..\" entries".into());
        };
        if dot.name != "." || dotdot.name != ".." {
            return Some("first entries are not \".\" and \"..\"".into());
        }
        if dot.start_cluster != dir.start_cluster {
            return Some(format!(
                "\".\" points to cluster {} instead of {}",
                dot.start_cluster, dir.start_cluster
            ));
        }
        // ".." of a root child holds 0; some formatters store the FAT32
        // root cluster instead.
        let parent = dir.parent_cluster;
        let parent_ok = if parent == self.root_start {
            dotdot.start_cluster == 0 || dotdot.start_cluster == parent
        } else {
            dotdot.start_cluster == parent
        };
        if !parent_ok {
            return Some(format!(
                "\"..\" points to cluster {} instead of {}",
                dotdot.start_cluster,
                if parent == self.root_start { 0 } else { parent }
            ));
        }
        None
    }

    fn check_entry<T: DirectoryTree + ?Sized>(
        &mut self,
        tree: &mut T,
        entry: &DirEntry,
        owner: u32,
        depth: u32,
    ) -> Result<()> {
        let start = entry.start_cluster;
        if start == 0 && !entry.is_directory() && entry.size == 0 {
            self.check_dates(tree, entry)?;
            self.tally(entry);
            return Ok(());
        }

        let class = self.table.entry(start)?;
        if !class.is_in_chain() {
            let repaired = self.delete(tree, entry)?;
            self.record(
                FindingKind::BadStart,
                Some(&entry.path),
                start,
                format!("start cluster holds {}", describe(class)),
                repaired,
            );
            return Ok(());
        }

        if let Claim::Rejected = self.claim_start(tree, entry, owner)? {
            return Ok(());
        }

        if entry.is_directory() {
            if depth + 1 > self.options.max_nesting {
                let repaired = self.delete(tree, entry)?;
                if repaired {
                    self.release_marks(start)?;
                }
                self.record(
                    FindingKind::NestingTooDeep,
                    Some(&entry.path),
                    start,
                    format!("deeper than {} levels", self.options.max_nesting),
                    repaired,
                );
                return Ok(());
            }
            if !self.scan_dir(tree, entry, depth + 1)? {
                return Ok(());
            }
        }
        self.check_dates(tree, entry)?;
        self.tally(entry);
        Ok(())
    }

    /// Report timestamp fields that do not decode; repair clears them.
    fn check_dates<T: DirectoryTree + ?Sized>(
        &mut self,
        tree: &mut T,
        entry: &DirEntry,
    ) -> Result<()> {
        let broken =
            |ts: FatTimestamp| (!ts.is_unset() && ts.to_datetime().is_none()).then(FatTimestamp::default);
        let dates = EntryDates {
            created: broken(entry.created),
            modified: broken(entry.modified),
            accessed: broken(entry.accessed),
        };
        if dates == EntryDates::default() {
            return Ok(());
        }

        let fields: Vec<&str> = [
            ("created", dates.created),
            ("modified", dates.modified),
            ("accessed", dates.accessed),
        ]
        .into_iter()
        .filter_map(|(name, fix)| fix.map(|_| name))
        .collect();
        let repaired = self.repair();
        if repaired {
            tree.set_dates(entry, dates)?;
        }
        self.record(
            FindingKind::BadDate,
            Some(&entry.path),
            entry.start_cluster,
            format!("invalid {} time", fields.join(" and ")),
            repaired,
        );
        Ok(())
    }

    /// Mark `entry`'s start cluster as its own and walk its chain.
    fn claim_start<T: DirectoryTree + ?Sized>(
        &mut self,
        tree: &mut T,
        entry: &DirEntry,
        owner: u32,
    ) -> Result<Claim> {
        let start = entry.start_cluster;
        match self.marks.get(start)? {
            Mark::Untouched | Mark::Lost => {}
            Mark::Owned { start: true, .. } => return self.resolve_cross_link(tree, entry, owner),
            Mark::Owned {
                owner: chain,
                start: false,
            } => {
                let repaired = self.delete(tree, entry)?;
                let other = self
                    .claims
                    .get(&chain)
                    .map(|c| c.path.clone())
                    .unwrap_or_else(|| format!("cluster {chain}"));
                self.record(
                    FindingKind::CrossLinkStart,
                    Some(&entry.path),
                    start,
                    format!("starts inside the chain of {other}"),
                    repaired,
                );
                return Ok(Claim::Rejected);
            }
        }
        self.take_start(entry, owner)?;
        Ok(Claim::Claimed)
    }

    fn take_start(&mut self, entry: &DirEntry, owner: u32) -> Result<()> {
        let start = entry.start_cluster;
        self.marks.set(start, Mark::Owned { owner, start: true })?;
        self.claims.insert(start, entry.clone());
        self.children.entry(owner).or_default().push(start);
        self.walk_chain(entry)
    }

    /// Two entries start at the same cluster. The earlier-created one keeps
    /// it; on a tie the one scanned first does. The root and directories
    /// enclosing the entry always keep it. A losing directory takes its
    /// scanned subtree with it, and a winning directory is scanned afresh.
    fn resolve_cross_link<T: DirectoryTree + ?Sized>(
        &mut self,
        tree: &mut T,
        entry: &DirEntry,
        owner: u32,
    ) -> Result<Claim> {
        let start = entry.start_cluster;
        let holder = match self.claims.get(&start) {
            Some(holder) => holder.clone(),
            None => return Err(FatError::corrupt(start, "start mark without a claimant")),
        };

        let encloses = entry.path.starts_with(&format!("{}/", holder.path));
        let entry_wins = !holder.is_root() && !encloses && entry.created < holder.created;
        if !entry_wins {
            let repaired = self.delete(tree, entry)?;
            self.record(
                FindingKind::CrossLinkStart,
                Some(&entry.path),
                start,
                format!("shares its start cluster with {}", holder.path),
                repaired,
            );
            return Ok(Claim::Rejected);
        }

        if !self.repair() {
            self.record(
                FindingKind::CrossLinkStart,
                Some(&holder.path),
                start,
                format!("shares its start cluster with {}", entry.path),
                false,
            );
            return Ok(Claim::Rejected);
        }

        tree.delete_entry(&holder)?;
        self.record(
            FindingKind::CrossLinkStart,
            Some(&holder.path),
            start,
            format!("shares its start cluster with {}", entry.path),
            true,
        );
        self.untally(&holder);
        if holder.is_directory() {
            self.release_subtree(start)?;
        }
        self.release_marks(start)?;
        self.take_start(entry, owner)?;
        Ok(Claim::Claimed)
    }

    /// Forget every claim made below the directory starting at `dir`, so
    /// the chains of its deleted contents are swept up as lost.
    fn release_subtree(&mut self, dir: ClusterId) -> Result<()> {
        let mut pending = vec![dir];
        while let Some(parent) = pending.pop() {
            for child in self.children.remove(&parent).unwrap_or_default() {
                // The head may have changed hands since it was claimed here.
                let entry = match self.claims.get(&child) {
                    Some(entry) if entry.parent_cluster == parent => entry.clone(),
                    _ => continue,
                };
                if entry.is_directory() {
                    pending.push(child);
                }
                self.untally(&entry);
                self.release_marks(child)?;
            }
        }
        Ok(())
    }

    /// Mark the clusters after `entry`'s start cluster as its chain,
    /// stopping at the first cluster that cannot belong to it.
    fn walk_chain(&mut self, entry: &DirEntry) -> Result<()> {
        let start = entry.start_cluster;
        let body = Mark::Owned {
            owner: start,
            start: false,
        };
        let mut limit = if entry.is_directory() {
            None
        } else {
            Some(entry.size.div_ceil(self.report.cluster_size).max(1))
        };
        let mut last = start;
        let mut count = 1u64;

        while let Classification::Allocated(next) = self.table.entry(last)? {
            if let Some(max) = limit {
                if count >= max {
                    let repaired = self.terminate(last)?;
                    self.record(
                        FindingKind::OversizeChain,
                        Some(&entry.path),
                        next,
                        format!("chain longer than {max} clusters for {} bytes", entry.size),
                        repaired,
                    );
                    if repaired {
                        return Ok(());
                    }
                    limit = None;
                }
            }

            let class = self.table.entry(next)?;
            if !class.is_in_chain() {
                let repaired = self.terminate(last)?;
                self.record(
                    FindingKind::BadChain,
                    Some(&entry.path),
                    next,
                    format!("chain runs into {}", describe(class)),
                    repaired,
                );
                return Ok(());
            }

            if self.marks.get(next)? != Mark::Untouched {
                let repaired = self.terminate(last)?;
                self.record(
                    FindingKind::CrossLinkBody,
                    Some(&entry.path),
                    next,
                    format!("cluster {next} already belongs to another chain"),
                    repaired,
                );
                return Ok(());
            }

            self.marks.set(next, body)?;
            last = next;
            count += 1;
        }
        Ok(())
    }

    /// Clear the marks of the chain headed by `start`.
    fn release_marks(&mut self, start: ClusterId) -> Result<()> {
        let body = Mark::Owned {
            owner: start,
            start: false,
        };
        self.marks.set(start, Mark::Untouched)?;
        self.claims.remove(&start);
        let mut cluster = start;
        while let Classification::Allocated(next) = self.table.entry(cluster)? {
            if self.marks.get(next)? != body {
                break;
            }
            self.marks.set(next, Mark::Untouched)?;
            cluster = next;
        }
        Ok(())
    }

    /// Make `cluster` the end of its chain, in repair mode.
    fn terminate(&mut self, cluster: ClusterId) -> Result<bool> {
        if !self.repair() {
            return Ok(false);
        }
        self.guard.set_entry(cluster, Classification::EndOfChain)?;
        Ok(true)
    }

    /// Delete `entry`, in repair mode.
    fn delete<T: DirectoryTree + ?Sized>(&mut self, tree: &mut T, entry: &DirEntry) -> Result<bool> {
        if !self.repair() {
            return Ok(false);
        }
        tree.delete_entry(entry)?;
        Ok(true)
    }

    fn tally(&mut self, entry: &DirEntry) {
        let report = &mut self.report;
        if entry.is_directory() {
            report.directories += 1;
        } else {
            report.files += 1;
            report.bytes_in_files += entry.size;
        }
        let valid = |ts: FatTimestamp| {
            if ts.to_datetime().is_some() {
                ts
            } else {
                FatTimestamp::default()
            }
        };
        report.max_created = report.max_created.max(valid(entry.created));
        report.max_modified = report.max_modified.max(valid(entry.modified));
        report.max_accessed = report.max_accessed.max(valid(entry.accessed));
    }

    fn untally(&mut self, entry: &DirEntry) {
        let report = &mut self.report;
        if entry.is_directory() {
            report.directories = report.directories.saturating_sub(1);
        } else {
            report.files = report.files.saturating_sub(1);
            report.bytes_in_files = report.bytes_in_files.saturating_sub(entry.size);
        }
    }
}
