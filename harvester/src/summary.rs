use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::executor::ExecutionReport;
use crate::master_data::MasterDataKind;
use crate::models::{EntityKind, PermId};
use crate::planner::{Plan, DELETION_ORDER};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeCounts {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

impl ChangeCounts {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.updated == 0 && self.removed == 0
    }
}

impl fmt::Display for ChangeCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} added, {} updated, {} removed",
            self.added, self.updated, self.removed
        )
    }
}

/// Human-readable account of one run.
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub dry_run: bool,
    pub master_data: BTreeMap<MasterDataKind, ChangeCounts>,
    pub entities: BTreeMap<EntityKind, ChangeCounts>,
    pub attachments: ChangeCounts,
    pub not_registered: BTreeSet<PermId>,
    /// Attachment holders left for the next run.
    pub attachments_not_synced: BTreeSet<PermId>,
    pub deleted: BTreeMap<EntityKind, usize>,
    /// Deleted permIds per kind; only filled for verbose runs.
    pub deleted_ids: BTreeMap<EntityKind, Vec<PermId>>,
    /// Rendered operations of a dry run.
    pub changes: Vec<String>,
}

impl SyncSummary {
    pub fn new(
        dry_run: bool,
        master_data: BTreeMap<MasterDataKind, ChangeCounts>,
        plan: &Plan,
        report: &ExecutionReport,
    ) -> Self {
        let mut entities = BTreeMap::new();
        for (kind, decisions) in &plan.decisions {
            let mut added = decisions.create.len();
            if *kind == EntityKind::DataSet {
                added -= decisions
                    .create
                    .iter()
                    .filter(|id| report.not_registered.contains(*id))
                    .count();
            }
            let counts = ChangeCounts {
                added,
                updated: decisions.update.len(),
                removed: decisions.delete.len(),
            };
            if !counts.is_empty() {
                entities.insert(*kind, counts);
            }
        }
        Self {
            dry_run,
            master_data,
            entities,
            attachments: report.attachments,
            not_registered: report.not_registered.clone(),
            attachments_not_synced: report.attachments_not_synced.keys().cloned().collect(),
            deleted: report.deleted.clone(),
            deleted_ids: BTreeMap::new(),
            changes: Vec::new(),
        }
    }

    pub fn with_changes(mut self, changes: Vec<String>) -> Self {
        self.changes = changes;
        self
    }

    pub fn with_deleted_ids(mut self, deleted_ids: BTreeMap<EntityKind, Vec<PermId>>) -> Self {
        self.deleted_ids = deleted_ids;
        self
    }

    pub fn deletion_line(&self) -> String {
        if self.deleted.values().all(|n| *n == 0) {
            return "Nothing has been deleted".to_string();
        }
        let parts: Vec<String> = [
            EntityKind::Project,
            EntityKind::Collection,
            EntityKind::Object,
            EntityKind::DataSet,
            EntityKind::Material,
        ]
        .iter()
        .map(|kind| {
            format!(
                "{} {}",
                self.deleted.get(kind).copied().unwrap_or(0),
                kind.plural()
            )
        })
        .collect();
        format!("{} have been deleted", parts.join(", "))
    }

    pub fn has_changes(&self) -> bool {
        !self.master_data.is_empty() || !self.entities.is_empty() || !self.attachments.is_empty()
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dry_run {
            writeln!(f, "Synchronization summary (dry run, nothing was written)")?;
        } else {
            writeln!(f, "Synchronization summary")?;
        }
        if self.master_data.is_empty() {
            writeln!(f, "Master data: no changes")?;
        } else {
            writeln!(f, "Master data:")?;
            for (kind, counts) in &self.master_data {
                writeln!(f, "  {kind}: {counts}")?;
            }
        }
        if self.entities.is_empty() {
            writeln!(f, "Entities: no changes")?;
        } else {
            writeln!(f, "Entities:")?;
            for kind in DELETION_ORDER.iter().rev() {
                if let Some(counts) = self.entities.get(kind) {
                    writeln!(f, "  {}: {counts}", kind.plural())?;
                }
            }
        }
        if !self.attachments.is_empty() {
            writeln!(f, "Attachments: {}", self.attachments)?;
        }
        if !self.not_registered.is_empty() {
            let ids: Vec<&str> = self.not_registered.iter().map(PermId::as_str).collect();
            writeln!(f, "Not registered: {}", ids.join(", "))?;
        }
        if !self.attachments_not_synced.is_empty() {
            let ids: Vec<&str> = self
                .attachments_not_synced
                .iter()
                .map(PermId::as_str)
                .collect();
            writeln!(f, "Attachments not synchronized: {}", ids.join(", "))?;
        }
        write!(f, "{}", self.deletion_line())?;
        for kind in DELETION_ORDER {
            if let Some(ids) = self.deleted_ids.get(&kind).filter(|ids| !ids.is_empty()) {
                let ids: Vec<&str> = ids.iter().map(PermId::as_str).collect();
                write!(f, "\n  {}: {}", kind.plural(), ids.join(", "))?;
            }
        }
        if !self.changes.is_empty() {
            write!(f, "\nChanges:")?;
            for change in &self.changes {
                for line in change.lines() {
                    write!(f, "\n  {line}")?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deletion_line_lists_every_kind() {
        let mut summary = SyncSummary::default();
        assert_eq!(summary.deletion_line(), "Nothing has been deleted");
        summary.deleted.insert(EntityKind::Object, 2);
        summary.deleted.insert(EntityKind::DataSet, 1);
        assert_eq!(
            summary.deletion_line(),
            "0 projects, 0 collections, 2 objects, 1 data sets, 0 materials have been deleted"
        );
    }

    #[test]
    fn verbose_summary_lists_deleted_ids() {
        let mut summary = SyncSummary::default();
        summary.deleted.insert(EntityKind::Object, 2);
        let text = summary.to_string();
        assert!(!text.contains("O1"));

        let summary = summary.with_deleted_ids(BTreeMap::from([(
            EntityKind::Object,
            vec![PermId::from("O1"), PermId::from("O2")],
        )]));
        assert!(summary.to_string().ends_with("have been deleted\n  objects: O1, O2"));
    }

    #[test]
    fn report_shows_counts_and_changes() {
        let mut summary = SyncSummary {
            dry_run: true,
            ..Default::default()
        };
        summary.entities.insert(
            EntityKind::Project,
            ChangeCounts {
                added: 0,
                updated: 1,
                removed: 0,
            },
        );
        summary.changes = vec!["would update PROJECT /S/P: description: 'a' -> 'b'".into()];
        summary.attachments.added = 2;
        let text = summary.to_string();
        assert!(text.contains("Attachments: 2 added, 0 updated, 0 removed"));
        assert!(text.starts_with("Synchronization summary (dry run"));
        assert!(text.contains("  projects: 0 added, 1 updated, 0 removed"));
        assert!(text.contains("would update PROJECT /S/P: description: 'a' -> 'b'"));
    }
}
