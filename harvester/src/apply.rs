//! Every write of a run goes through an [`Applier`]; live and preview runs differ only here.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::attachments::{attachment_update, AttachmentHolder};
use crate::errors::{Result, SyncError};
use crate::master_data::MasterDataOp;
use crate::models::{EntityKind, EntityNode, FileManifest, PermId};
use crate::store::{
    CatalogStore, ContentStore, DeletionId, MetadataBatch, RelationshipUpdate,
};
use crate::summary::ChangeCounts;

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    MasterData(MasterDataOp),
    CreateSpaces(Vec<EntityNode>),
    Metadata(MetadataBatch),
    RegisterPhysical {
        node: EntityNode,
        manifest: FileManifest,
    },
    Relationships(Vec<RelationshipUpdate>),
    Attachments(AttachmentHolder),
    ProposeDeletion {
        kind: EntityKind,
        perm_ids: Vec<PermId>,
        reason: String,
    },
    ConfirmDeletion(DeletionId),
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::MasterData(op) => write!(f, "{op}"),
            Operation::CreateSpaces(spaces) => {
                let codes: Vec<_> = spaces.iter().map(|s| s.code.as_str()).collect();
                write!(f, "create spaces [{}]", codes.join(", "))
            }
            Operation::Metadata(batch) => {
                write!(
                    f,
                    "apply metadata batch: {} creations, {} updates",
                    batch.creations.len(),
                    batch.updates.len()
                )?;
                for node in &batch.creations {
                    write!(f, "\n  create {} {}", node.kind(), node.identifier)?;
                }
                for update in &batch.updates {
                    write!(f, "\n  update {} {}", update.node.kind(), update.diff)?;
                }
                Ok(())
            }
            Operation::RegisterPhysical { node, manifest } => write!(
                f,
                "register physical data set {} ({} files, {} bytes)",
                node.perm_id,
                manifest.files.len(),
                manifest.total_length()
            ),
            Operation::Relationships(updates) => {
                write!(f, "apply relationship batch: {} entities", updates.len())?;
                for update in updates {
                    let parents: Vec<_> = update.parents.iter().map(PermId::as_str).collect();
                    let contained: Vec<_> = update.contained.iter().map(PermId::as_str).collect();
                    write!(
                        f,
                        "\n  {} {}: parents [{}], contained [{}]",
                        update.kind,
                        update.perm_id,
                        parents.join(", "),
                        contained.join(", ")
                    )?;
                }
                Ok(())
            }
            Operation::Attachments(holder) => {
                write!(
                    f,
                    "synchronize attachments of {} {} ({} published)",
                    holder.kind,
                    holder.perm_id,
                    holder.attachments.len()
                )?;
                for attachment in &holder.attachments {
                    write!(f, "\n  {} v{}", attachment.file_name, attachment.version)?;
                }
                Ok(())
            }
            Operation::ProposeDeletion {
                kind,
                perm_ids,
                reason,
            } => {
                let ids: Vec<_> = perm_ids.iter().map(PermId::as_str).collect();
                write!(f, "delete {} [{}] ({reason})", kind.plural(), ids.join(", "))
            }
            Operation::ConfirmDeletion(id) => write!(f, "confirm deletion {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Proposed(DeletionId),
    /// Attachment changes written for one holder.
    Attachments(ChangeCounts),
    Recorded(String),
}

impl Outcome {
    pub fn deletion_id(&self) -> Option<&DeletionId> {
        match self {
            Outcome::Proposed(id) => Some(id),
            _ => None,
        }
    }
}

#[async_trait]
pub trait Applier: Send + Sync {
    async fn apply(&self, op: Operation) -> Result<Outcome>;
}

/// Sends operations to the local catalog and content stores.
pub struct LiveApplier {
    catalog: Arc<dyn CatalogStore>,
    content: Arc<dyn ContentStore>,
}

impl LiveApplier {
    pub fn new(catalog: Arc<dyn CatalogStore>, content: Arc<dyn ContentStore>) -> Self {
        Self { catalog, content }
    }
}

#[async_trait]
impl Applier for LiveApplier {
    async fn apply(&self, op: Operation) -> Result<Outcome> {
        match op {
            Operation::MasterData(op) => {
                log::info!("{op}");
                self.catalog.apply_master_data(&op).await?;
            }
            Operation::CreateSpaces(spaces) => self.catalog.create_spaces(&spaces).await?,
            Operation::Metadata(batch) => self.catalog.apply_batch(&batch).await?,
            Operation::RegisterPhysical { node, manifest } => {
                self.content
                    .register_physical_data(&node, &manifest)
                    .await
                    .map_err(|err| SyncError::Registration {
                        perm_id: node.perm_id.to_string(),
                        reason: err.to_string(),
                    })?;
                let batch = MetadataBatch {
                    creations: vec![node.clone()],
                    updates: Vec::new(),
                };
                self.catalog
                    .apply_batch(&batch)
                    .await
                    .map_err(|err| SyncError::Registration {
                        perm_id: node.perm_id.to_string(),
                        reason: err.to_string(),
                    })?;
            }
            Operation::Relationships(updates) => self.catalog.apply_relationships(&updates).await?,
            Operation::Attachments(holder) => {
                let existing = self.catalog.attachments(&holder.perm_id).await?;
                let update = attachment_update(&holder, &existing);
                if !update.is_empty() {
                    self.catalog.update_attachments(&update).await?;
                }
                return Ok(Outcome::Attachments(update.counts));
            }
            Operation::ProposeDeletion {
                kind,
                perm_ids,
                reason,
            } => {
                let id = self
                    .catalog
                    .propose_deletion(kind, &perm_ids, &reason)
                    .await?;
                return Ok(Outcome::Proposed(id));
            }
            Operation::ConfirmDeletion(id) => self.catalog.confirm_deletion(&id).await?,
        }
        Ok(Outcome::Applied)
    }
}

/// Records what a run would do without writing anything.
#[derive(Default)]
pub struct DryRunApplier {
    records: Mutex<Vec<String>>,
    deletions: AtomicUsize,
}

impl DryRunApplier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<String> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Applier for DryRunApplier {
    async fn apply(&self, op: Operation) -> Result<Outcome> {
        let description = format!("would {op}");
        log::info!("{description}");
        self.records
            .lock()
            .map_err(|_| SyncError::store("dry run record lock poisoned"))?
            .push(description.clone());
        match op {
            Operation::ProposeDeletion { .. } => {
                let n = self.deletions.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Outcome::Proposed(DeletionId(format!("dry-run-{n}"))))
            }
            _ => Ok(Outcome::Recorded(description)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityDetails;
    use chrono::Utc;

    #[tokio::test]
    async fn dry_run_records_and_fabricates_deletion_ids() {
        let applier = DryRunApplier::new();
        let outcome = applier
            .apply(Operation::ProposeDeletion {
                kind: EntityKind::Object,
                perm_ids: vec![PermId::from("203")],
                reason: "absent from source".into(),
            })
            .await
            .unwrap();
        let id = outcome.deletion_id().cloned().unwrap();
        applier.apply(Operation::ConfirmDeletion(id)).await.unwrap();

        let records = applier.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], "would delete objects [203] (absent from source)");
        assert_eq!(records[1], "would confirm deletion dry-run-1");
    }

    #[tokio::test]
    async fn dry_run_describes_batches() {
        let applier = DryRunApplier::new();
        let node = EntityNode::new(
            "200",
            "PRJ1",
            "/LAB/PRJ1",
            EntityDetails::Project {
                space: "LAB".into(),
            },
            Utc::now(),
        );
        let outcome = applier
            .apply(Operation::Metadata(MetadataBatch {
                creations: vec![node],
                updates: Vec::new(),
            }))
            .await
            .unwrap();
        match outcome {
            Outcome::Recorded(text) => assert!(text.contains("create PROJECT /LAB/PRJ1")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
