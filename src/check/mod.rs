//! Volume consistency checker.
//!
//! One pass walks the directory tree marking every cluster reached from an
//! entry, then sweeps the table for allocated clusters nobody reached. With
//! repair enabled the damage found is fixed in place: bad entries are
//! deleted, chains are re-terminated and lost chains are freed.

mod lost;
pub mod markmap;
pub mod report;
mod scan;

use std::collections::HashMap;

use log::{info, warn};
use serde::Serialize;

use crate::config::{CheckConfig, Verbosity};
use crate::error::{FatError, Result};
use crate::fat::codec::ClusterId;
use crate::fat::table::{ClusterTable, TableGuard};
use crate::fs::entry::DirEntry;
use crate::fs::tree::DirectoryTree;
use markmap::MarkMap;
pub use report::{CheckReport, Finding, FindingKind};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum CheckLevel {
    #[default]
    ReportOnly,
    ReportAndRepair,
}

#[derive(Debug, Clone)]
pub struct CheckOptions {
    pub level: CheckLevel,
    pub verbosity: Verbosity,
    /// Deepest directory level scanned; the root is level 0.
    pub max_nesting: u32,
    /// Bytes the mark map may occupy in memory.
    pub memory_budget: usize,
}

impl CheckOptions {
    pub fn new(level: CheckLevel, config: &CheckConfig) -> Self {
        Self {
            level,
            verbosity: config.verbosity,
            max_nesting: config.max_nesting,
            memory_budget: config.memory_budget,
        }
    }
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self::new(CheckLevel::ReportOnly, &CheckConfig::default())
    }
}

/// Check the volume behind `table`, reading directories through `tree`.
///
/// Holds the table lock for the whole run; callers must have closed every
/// other session on the volume. Mirroring is suspended while the check
/// runs and resumed exactly once afterwards, on failure too.
pub fn run_check<T: DirectoryTree + ?Sized>(
    table: &ClusterTable,
    tree: &mut T,
    options: &CheckOptions,
) -> Result<CheckReport> {
    let writable = table.device().is_writable();
    let repair = options.level == CheckLevel::ReportAndRepair;
    if repair && !writable {
        return Err(FatError::ReadOnly);
    }

    let mut guard = table.lock()?;
    guard.flush()?;
    let marks = MarkMap::for_table(table, options.memory_budget);
    let used_scratch = marks.is_scratch();
    guard.set_mirroring(false, false)?;
    if options.verbosity > Verbosity::Quiet {
        info!(
            "check: {} volume, {} clusters, {:?}",
            table.geometry().fat_type.name(),
            table.n_entries(),
            options.level
        );
    }

    let outcome = CheckSession::new(table, &mut guard, marks, options).run(tree);

    let resumed = guard.set_mirroring(true, writable && (repair || used_scratch));
    let report = outcome?;
    resumed?;
    guard.flush()?;
    Ok(report)
}

/// State of one check pass.
pub(crate) struct CheckSession<'t, 'g> {
    table: &'t ClusterTable,
    guard: &'g mut TableGuard<'t>,
    marks: MarkMap,
    options: CheckOptions,
    report: CheckReport,
    /// Entry that claimed each chain head, by start cluster.
    claims: HashMap<ClusterId, DirEntry>,
    /// Chain heads claimed by each directory's entries, by owner.
    children: HashMap<u32, Vec<ClusterId>>,
    root_start: ClusterId,
}

impl<'t, 'g> CheckSession<'t, 'g> {
    fn new(
        table: &'t ClusterTable,
        guard: &'g mut TableGuard<'t>,
        marks: MarkMap,
        options: &CheckOptions,
    ) -> Self {
        let mut report = CheckReport::new(
            options.level,
            table.geometry().cluster_size(),
            options.verbosity,
        );
        report.used_scratch = marks.is_scratch();
        Self {
            table,
            guard,
            marks,
            options: options.clone(),
            report,
            claims: HashMap::new(),
            children: HashMap::new(),
            root_start: 0,
        }
    }

    fn run<T: DirectoryTree + ?Sized>(mut self, tree: &mut T) -> Result<CheckReport> {
        self.phase("scanning directory tree");
        self.scan_tree(tree)?;

        self.phase("looking for lost chains");
        let heads = self.find_lost()?;

        if self.repair() {
            if !heads.is_empty() {
                self.phase("freeing lost chains");
                self.free_lost(&heads)?;
            }
            self.guard.set_free_count(self.report.free_clusters);
        }

        if self.options.verbosity > Verbosity::Quiet {
            for line in self.report.summary_lines() {
                info!("{line}");
            }
            info!(
                "check: {} findings, {} clusters marked",
                self.report.findings.len(),
                self.marks.marked()
            );
        }
        Ok(self.report)
    }

    fn repair(&self) -> bool {
        self.options.level == CheckLevel::ReportAndRepair
    }

    fn phase(&self, name: &str) {
        if self.options.verbosity > Verbosity::Quiet {
            info!("check: {name}");
        }
    }

    fn check_media(&self) -> Result<()> {
        if self.table.device().has_changed() {
            warn!("check: medium changed, aborting");
            return Err(FatError::MediaChanged);
        }
        Ok(())
    }

    fn record(
        &mut self,
        kind: FindingKind,
        path: Option<&str>,
        cluster: ClusterId,
        detail: String,
        repaired: bool,
    ) {
        self.report.record(Finding {
            kind,
            path: path.map(str::to_string),
            cluster,
            detail,
            repaired,
        });
    }
}
