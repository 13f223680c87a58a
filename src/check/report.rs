use std::fmt;

use log::warn;
use serde::Serialize;

use super::CheckLevel;
use crate::config::Verbosity;
use crate::fat::codec::ClusterId;
use crate::fs::entry::FatTimestamp;

/// What the checker found wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FindingKind {
    /// Two entries claim the same start cluster.
    CrossLinkStart,
    /// A chain runs into a cluster already owned by another chain.
    CrossLinkBody,
    /// A chain holds more clusters than the file size needs.
    OversizeChain,
    /// A chain ends in a bad, free or invalid cluster.
    BadChain,
    /// An entry's start cluster is not the head of a chain.
    BadStart,
    /// A directory lacks valid "." and ".." entries.
    BadStructure,
    NestingTooDeep,
    /// A timestamp field holds no valid calendar date or time.
    BadDate,
    /// Allocated clusters no entry refers to.
    LostChain,
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FindingKind::CrossLinkStart => "cross-linked start",
            FindingKind::CrossLinkBody => "cross-linked chain",
            FindingKind::OversizeChain => "oversized chain",
            FindingKind::BadChain => "bad chain",
            FindingKind::BadStart => "bad start cluster",
            FindingKind::BadStructure => "bad directory structure",
            FindingKind::NestingTooDeep => "directory nesting too deep",
            FindingKind::BadDate => "bad timestamp",
            FindingKind::LostChain => "lost chain",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub kind: FindingKind,
    /// Entry path; `None` for lost chains.
    pub path: Option<String>,
    pub cluster: ClusterId,
    pub detail: String,
    /// The table or directory was changed to fix it.
    pub repaired: bool,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at cluster {}", self.kind, self.cluster)?;
        if let Some(path) = &self.path {
            write!(f, " ({path})")?;
        }
        write!(f, ": {}", self.detail)?;
        if self.repaired {
            f.write_str(" [repaired]")?;
        }
        Ok(())
    }
}

/// Totals and findings of one check pass.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub level: CheckLevel,
    pub cluster_size: u64,
    pub files: u64,
    pub directories: u64,
    pub bytes_in_files: u64,
    /// Free clusters after any repair.
    pub free_clusters: u32,
    pub bad_clusters: u32,
    /// Unowned slots holding reserved or out-of-range values.
    pub invalid_clusters: u32,
    pub lost_chains: u32,
    pub lost_clusters: u32,
    pub lost_bytes: u64,
    pub max_created: FatTimestamp,
    pub max_modified: FatTimestamp,
    pub max_accessed: FatTimestamp,
    /// The mark map lived in a spare table copy.
    pub used_scratch: bool,
    pub findings: Vec<Finding>,
    #[serde(skip)]
    verbosity: Verbosity,
}

impl CheckReport {
    pub(crate) fn new(level: CheckLevel, cluster_size: u64, verbosity: Verbosity) -> Self {
        Self {
            level,
            cluster_size,
            files: 0,
            directories: 0,
            bytes_in_files: 0,
            free_clusters: 0,
            bad_clusters: 0,
            invalid_clusters: 0,
            lost_chains: 0,
            lost_clusters: 0,
            lost_bytes: 0,
            max_created: FatTimestamp::default(),
            max_modified: FatTimestamp::default(),
            max_accessed: FatTimestamp::default(),
            used_scratch: false,
            findings: Vec::new(),
            verbosity,
        }
    }

    pub(crate) fn record(&mut self, finding: Finding) {
        if self.verbosity > Verbosity::Quiet {
            warn!("{finding}");
        }
        self.findings.push(finding);
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn count(&self, kind: FindingKind) -> usize {
        self.findings.iter().filter(|f| f.kind == kind).count()
    }

    /// Human-readable totals, one line each.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("{} files, {}", self.files, format_size(self.bytes_in_files)),
            format!("{} directories", self.directories),
            format!(
                "{} free clusters ({})",
                self.free_clusters,
                format_size(self.free_clusters as u64 * self.cluster_size)
            ),
        ];
        if self.bad_clusters > 0 {
            lines.push(format!("{} bad clusters", self.bad_clusters));
        }
        if self.invalid_clusters > 0 {
            lines.push(format!("{} clusters with invalid values", self.invalid_clusters));
        }
        if self.lost_chains > 0 {
            lines.push(format!(
                "{} lost chains, {} clusters ({})",
                self.lost_chains,
                self.lost_clusters,
                format_size(self.lost_bytes)
            ));
        }
        for (label, ts) in [
            ("created", self.max_created),
            ("modified", self.max_modified),
            ("accessed", self.max_accessed),
        ] {
            if !ts.is_unset() {
                lines.push(format!("latest {label}: {ts}"));
            }
        }
        lines
    }
}

pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;
    const TIB: u64 = 1024 * GIB;

    if bytes >= TIB {
        format!("{:.1} TiB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}
