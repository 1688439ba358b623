use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::apply::{Applier, Operation, Outcome};
use crate::attachments::AttachmentHolder;
use crate::errors::{Result, SyncError};
use crate::models::{EntityKind, PermId};
use crate::planner::{DeletionGroup, Plan, Registration};
use crate::store::{DeletionId, RelationshipUpdate};
use crate::summary::ChangeCounts;

/// What a plan execution actually achieved.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub created_spaces: usize,
    pub metadata_records: usize,
    pub registered: BTreeSet<PermId>,
    pub not_registered: BTreeSet<PermId>,
    pub relationships: usize,
    pub attachments: ChangeCounts,
    /// Holders whose attachments could not be written, retried on the next run.
    pub attachments_not_synced: BTreeMap<PermId, EntityKind>,
    /// Confirmed tombstone deletions per kind.
    pub deleted: BTreeMap<EntityKind, usize>,
    pub deleted_ids: BTreeMap<EntityKind, Vec<PermId>>,
    /// Proposals left for an operator to confirm.
    pub unconfirmed: Vec<(DeletionGroup, DeletionId)>,
    pub failed_deletions: Vec<DeletionGroup>,
}

/// Runs a [`Plan`] against an applier in dependency order.
pub struct BatchExecutor {
    applier: Arc<dyn Applier>,
    pool_size: usize,
    confirm_deletions: bool,
    verbose: bool,
}

impl BatchExecutor {
    pub fn new(applier: Arc<dyn Applier>, pool_size: usize, confirm_deletions: bool) -> Self {
        Self {
            applier,
            pool_size: pool_size.max(1),
            confirm_deletions,
            verbose: false,
        }
    }

    /// Logs every deleted permId instead of per-kind counts.
    pub fn with_verbose_deletions(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub async fn execute(&self, plan: &Plan) -> Result<ExecutionReport> {
        let mut report = ExecutionReport::default();

        if !plan.missing_spaces.is_empty() {
            log::info!("Creating {} missing spaces", plan.missing_spaces.len());
            self.applier
                .apply(Operation::CreateSpaces(plan.missing_spaces.clone()))
                .await?;
            report.created_spaces = plan.missing_spaces.len();
        }

        // replacements must be gone for good before their successors are created
        for group in &plan.replacements {
            let id = self.propose(group).await?;
            self.applier.apply(Operation::ConfirmDeletion(id)).await?;
        }

        if !plan.metadata.is_empty() {
            log::info!(
                "Applying metadata batch with {} creations and {} updates",
                plan.metadata.creations.len(),
                plan.metadata.updates.len()
            );
            self.applier
                .apply(Operation::Metadata(plan.metadata.clone()))
                .await?;
            report.metadata_records = plan.metadata.len();
        }

        let (counts, not_synced) = self.sync_attachments(&plan.attachments).await;
        report.attachments = counts;
        report.attachments_not_synced = not_synced;

        let (registered, not_registered) = self.register(&plan.registrations).await?;
        report.registered = registered;
        report.not_registered = not_registered;

        let relationships = usable_relationships(&plan.relationships, &report.not_registered);
        if !relationships.is_empty() {
            log::info!("Applying relationships of {} entities", relationships.len());
            report.relationships = relationships.len();
            self.applier
                .apply(Operation::Relationships(relationships))
                .await?;
        }

        for group in &plan.deletions {
            self.delete(group, &mut report).await;
        }
        Ok(report)
    }

    async fn propose(&self, group: &DeletionGroup) -> Result<DeletionId> {
        let outcome = self
            .applier
            .apply(Operation::ProposeDeletion {
                kind: group.kind,
                perm_ids: group.perm_ids.clone(),
                reason: group.reason.clone(),
            })
            .await?;
        outcome.deletion_id().cloned().ok_or_else(|| SyncError::Deletion {
            perm_ids: group.perm_ids.iter().map(PermId::to_string).collect(),
            reason: "the store returned no deletion id".to_string(),
        })
    }

    /// Applies operations on a bounded pool. One failure never stops the others.
    async fn run_pooled(
        &self,
        operations: Vec<(PermId, Operation)>,
    ) -> Vec<(PermId, Result<Outcome>)> {
        let semaphore = Arc::new(Semaphore::new(self.pool_size));
        let mut join_set: JoinSet<(PermId, Result<Outcome>)> = JoinSet::new();
        for (perm_id, op) in operations {
            let sem = semaphore.clone();
            let applier = self.applier.clone();
            join_set.spawn(async move {
                let result = match sem.acquire().await {
                    Ok(_permit) => applier.apply(op).await,
                    Err(_) => Err(SyncError::store("worker pool closed")),
                };
                (perm_id, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => log::error!("Worker task panicked: {err}"),
            }
        }
        results
    }

    /// Registers physical data sets on the pool.
    async fn register(
        &self,
        registrations: &[Registration],
    ) -> Result<(BTreeSet<PermId>, BTreeSet<PermId>)> {
        if registrations.is_empty() {
            return Ok(Default::default());
        }
        log::info!(
            "Registering {} physical data sets with {} workers",
            registrations.len(),
            self.pool_size
        );

        let operations = registrations
            .iter()
            .cloned()
            .map(|Registration { node, manifest }| {
                (node.perm_id.clone(), Operation::RegisterPhysical { node, manifest })
            })
            .collect();
        let mut registered = BTreeSet::new();
        for (perm_id, result) in self.run_pooled(operations).await {
            match result {
                Ok(_) => {
                    registered.insert(perm_id);
                }
                Err(err) => log::error!("Data set {perm_id} was not registered: {err}"),
            }
        }

        let not_registered: BTreeSet<PermId> = registrations
            .iter()
            .map(|r| r.node.perm_id.clone())
            .filter(|id| !registered.contains(id))
            .collect();
        if !not_registered.is_empty() {
            log::warn!(
                "{} of {} data sets were not registered",
                not_registered.len(),
                registrations.len()
            );
        }
        Ok((registered, not_registered))
    }

    /// Brings attachment lists in line on the pool. Failed holders are returned for a retry.
    async fn sync_attachments(
        &self,
        holders: &[AttachmentHolder],
    ) -> (ChangeCounts, BTreeMap<PermId, EntityKind>) {
        let mut counts = ChangeCounts::default();
        if holders.is_empty() {
            return (counts, BTreeMap::new());
        }
        log::info!("Processing attachments of {} entities", holders.len());

        let operations = holders
            .iter()
            .map(|holder| (holder.perm_id.clone(), Operation::Attachments(holder.clone())))
            .collect();
        let mut synced = BTreeSet::new();
        for (perm_id, result) in self.run_pooled(operations).await {
            match result {
                Ok(outcome) => {
                    if let Outcome::Attachments(changes) = outcome {
                        counts.added += changes.added;
                        counts.updated += changes.updated;
                        counts.removed += changes.removed;
                    }
                    synced.insert(perm_id);
                }
                Err(err) => log::error!("Attachments of {perm_id} were not synchronized: {err}"),
            }
        }

        let not_synced: BTreeMap<PermId, EntityKind> = holders
            .iter()
            .filter(|holder| !synced.contains(&holder.perm_id))
            .map(|holder| (holder.perm_id.clone(), holder.kind))
            .collect();
        log::info!("Attachments: {counts}");
        if !not_synced.is_empty() {
            log::warn!(
                "Attachments of {} of {} entities were not synchronized",
                not_synced.len(),
                holders.len()
            );
        }
        (counts, not_synced)
    }

    /// Proposes and, when allowed, confirms one tombstone group. Failures are logged, not raised.
    async fn delete(&self, group: &DeletionGroup, report: &mut ExecutionReport) {
        let ids: Vec<&str> = group.perm_ids.iter().map(PermId::as_str).collect();
        let id = match self.propose(group).await {
            Ok(id) => id,
            Err(err) if group.kind == EntityKind::Material => {
                log::warn!("Materials [{}] could not be deleted: {err}", ids.join(", "));
                report.failed_deletions.push(group.clone());
                return;
            }
            Err(err) => {
                log::error!(
                    "Deletion of {} [{}] failed: {err}",
                    group.kind.plural(),
                    ids.join(", ")
                );
                report.failed_deletions.push(group.clone());
                return;
            }
        };

        if !self.confirm_deletions {
            log::info!(
                "Deletion {id} of {} [{}] awaits confirmation",
                group.kind.plural(),
                ids.join(", ")
            );
            report.unconfirmed.push((group.clone(), id));
            return;
        }
        match self.applier.apply(Operation::ConfirmDeletion(id.clone())).await {
            Ok(_) => {
                if self.verbose {
                    log::info!("Deleted {} [{}]", group.kind.plural(), ids.join(", "));
                } else {
                    log::info!("Deleted {} {}", ids.len(), group.kind.plural());
                }
                *report.deleted.entry(group.kind).or_default() += group.perm_ids.len();
                report
                    .deleted_ids
                    .entry(group.kind)
                    .or_default()
                    .extend(group.perm_ids.iter().cloned());
            }
            Err(err) => {
                log::error!(
                    "Confirmation of deletion {id} of {} [{}] failed and needs manual attention: {err}",
                    group.kind.plural(),
                    ids.join(", ")
                );
                report.failed_deletions.push(group.clone());
            }
        }
    }
}

/// Drops relationship updates of unregistered data sets and references to them.
fn usable_relationships(
    updates: &[RelationshipUpdate],
    not_registered: &BTreeSet<PermId>,
) -> Vec<RelationshipUpdate> {
    updates
        .iter()
        .filter(|update| !not_registered.contains(&update.perm_id))
        .map(|update| {
            let mut update = update.clone();
            update.parents.retain(|id| !not_registered.contains(id));
            update.contained.retain(|id| !not_registered.contains(id));
            update
        })
        .collect()
}
