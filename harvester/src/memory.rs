use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::attachments::AttachmentUpdate;
use crate::errors::{Result, SyncError};
use crate::master_data::{MasterData, MasterDataOp};
use crate::models::{Attachment, EntityDetails, EntityKind, EntityNode, FileManifest, PermId};
use crate::store::{
    CatalogStore, ContentStore, DeletionId, FetchOptions, MetadataBatch, RelationshipUpdate,
    SearchCriteria,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionRecord {
    pub id: DeletionId,
    pub kind: EntityKind,
    pub perm_ids: Vec<PermId>,
    pub reason: String,
    pub confirmed: bool,
}

#[derive(Default)]
struct State {
    entities: BTreeMap<PermId, EntityNode>,
    parents: BTreeMap<PermId, BTreeSet<PermId>>,
    contained: BTreeMap<PermId, BTreeSet<PermId>>,
    trash: HashMap<(DeletionId, PermId), EntityNode>,
    master_data: MasterData,
    files: HashMap<PermId, FileManifest>,
    attachments: HashMap<PermId, BTreeMap<String, Attachment>>,
    deletions: Vec<DeletionRecord>,
    failing: HashSet<PermId>,
    failing_attachments: HashSet<PermId>,
    broken_listings: HashSet<PermId>,
}

impl State {
    fn identifiers(&self) -> HashSet<&str> {
        self.entities
            .values()
            .map(|node| node.identifier.as_str())
            .collect()
    }
}

/// Catalog and content store kept entirely in memory.
#[derive(Default)]
pub struct MemoryCatalog {
    state: Mutex<State>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| SyncError::store("memory catalog lock poisoned"))
    }

    /// Seeds an entity without any checks.
    pub fn insert(&self, node: EntityNode) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(manifest) = node.manifest() {
            state.files.insert(node.perm_id.clone(), manifest);
        }
        state.entities.insert(node.perm_id.clone(), node);
        Ok(())
    }

    pub fn set_master_data(&self, master_data: MasterData) -> Result<()> {
        self.lock()?.master_data = master_data;
        Ok(())
    }

    pub fn set_manifest(&self, perm_id: &PermId, manifest: FileManifest) -> Result<()> {
        self.lock()?.files.insert(perm_id.clone(), manifest);
        Ok(())
    }

    pub fn set_parents(&self, perm_id: &PermId, parents: &[&str]) -> Result<()> {
        self.lock()?.parents.insert(
            perm_id.clone(),
            parents.iter().map(|p| PermId::from(*p)).collect(),
        );
        Ok(())
    }

    pub fn set_components(&self, container: &PermId, components: &[&str]) -> Result<()> {
        self.lock()?.contained.insert(
            container.clone(),
            components.iter().map(|c| PermId::from(*c)).collect(),
        );
        Ok(())
    }

    /// Makes every registration of `perm_id` fail until cleared.
    pub fn fail_registration_of(&self, perm_id: &PermId, failing: bool) -> Result<()> {
        let mut state = self.lock()?;
        if failing {
            state.failing.insert(perm_id.clone());
        } else {
            state.failing.remove(perm_id);
        }
        Ok(())
    }

    /// Makes every attachment update of `perm_id` fail until cleared.
    pub fn fail_attachments_of(&self, perm_id: &PermId, failing: bool) -> Result<()> {
        let mut state = self.lock()?;
        if failing {
            state.failing_attachments.insert(perm_id.clone());
        } else {
            state.failing_attachments.remove(perm_id);
        }
        Ok(())
    }

    /// Makes file listings of `perm_id` fail.
    pub fn break_listing_of(&self, perm_id: &PermId) -> Result<()> {
        self.lock()?.broken_listings.insert(perm_id.clone());
        Ok(())
    }

    pub fn entity(&self, perm_id: &PermId) -> Result<Option<EntityNode>> {
        Ok(self.lock()?.entities.get(perm_id).cloned())
    }

    pub fn entities(&self, kind: EntityKind) -> Result<Vec<EntityNode>> {
        Ok(self
            .lock()?
            .entities
            .values()
            .filter(|node| node.kind() == kind)
            .cloned()
            .collect())
    }

    pub fn parents_of(&self, perm_id: &PermId) -> Result<BTreeSet<PermId>> {
        Ok(self.lock()?.parents.get(perm_id).cloned().unwrap_or_default())
    }

    pub fn contained_in(&self, perm_id: &PermId) -> Result<BTreeSet<PermId>> {
        Ok(self
            .lock()?
            .contained
            .get(perm_id)
            .cloned()
            .unwrap_or_default())
    }

    pub fn deletions(&self) -> Result<Vec<DeletionRecord>> {
        Ok(self.lock()?.deletions.clone())
    }

    pub fn has_files(&self, perm_id: &PermId) -> Result<bool> {
        Ok(self.lock()?.files.contains_key(perm_id))
    }

    /// Entities waiting in the trash for a confirmation.
    pub fn trashed(&self) -> Result<Vec<PermId>> {
        let mut ids: Vec<PermId> = self
            .lock()?
            .trash
            .keys()
            .map(|(_, perm_id)| perm_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// The identifier an entity must find among existing records before it can be stored.
pub(crate) fn owner_identifier(node: &EntityNode) -> Option<String> {
    match &node.details {
        EntityDetails::Space | EntityDetails::Material => None,
        EntityDetails::Project { space } => Some(format!("/{space}")),
        EntityDetails::Collection { project, .. } => Some(project.clone()),
        EntityDetails::Object {
            space,
            project,
            collection,
        } => collection
            .clone()
            .or_else(|| project.clone())
            .or_else(|| space.as_ref().map(|s| format!("/{s}"))),
        EntityDetails::DataSet(ds) => ds.object.clone().or_else(|| ds.collection.clone()),
    }
}

/// Drops blank property values, which clear a property on update.
pub(crate) fn without_blank_properties(mut node: EntityNode) -> EntityNode {
    node.properties.retain(|_, value| !value.is_empty());
    node
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn search(
        &self,
        criteria: &SearchCriteria,
        options: FetchOptions,
    ) -> Result<Vec<EntityNode>> {
        let state = self.lock()?;
        let found: Vec<EntityNode> = match criteria {
            SearchCriteria::ChildrenOf(_, parent) => state
                .parents
                .iter()
                .filter(|(_, parents)| parents.contains(parent))
                .filter_map(|(child, _)| state.entities.get(child))
                .cloned()
                .collect(),
            SearchCriteria::ComponentsOf(_, container) => state
                .contained
                .get(container)
                .into_iter()
                .flatten()
                .filter_map(|id| state.entities.get(id))
                .cloned()
                .collect(),
            criteria => state
                .entities
                .values()
                .filter(|node| criteria.matches_owner(node))
                .cloned()
                .collect(),
        };
        Ok(found.into_iter().map(|node| options.shape(node)).collect())
    }

    async fn get(
        &self,
        kind: EntityKind,
        perm_ids: &[PermId],
        options: FetchOptions,
    ) -> Result<Vec<EntityNode>> {
        let state = self.lock()?;
        Ok(perm_ids
            .iter()
            .filter_map(|id| state.entities.get(id))
            .filter(|node| node.kind() == kind)
            .map(|node| options.shape(node.clone()))
            .collect())
    }

    async fn master_data(&self) -> Result<MasterData> {
        Ok(self.lock()?.master_data.clone())
    }

    async fn apply_master_data(&self, op: &MasterDataOp) -> Result<()> {
        self.lock()?.master_data.apply(op)
    }

    async fn create_spaces(&self, spaces: &[EntityNode]) -> Result<()> {
        let mut state = self.lock()?;
        for space in spaces {
            state
                .entities
                .entry(space.perm_id.clone())
                .or_insert_with(|| space.clone());
        }
        Ok(())
    }

    async fn apply_batch(&self, batch: &MetadataBatch) -> Result<()> {
        let mut state = self.lock()?;

        let mut known = state.identifiers();
        for node in &batch.creations {
            if state.entities.contains_key(&node.perm_id) {
                return Err(SyncError::store(format!(
                    "{} {} already exists",
                    node.kind(),
                    node.perm_id
                )));
            }
            known.insert(node.identifier.as_str());
        }
        for update in &batch.updates {
            match state.entities.get(&update.node.perm_id) {
                Some(current) if current.kind() == update.node.kind() => {}
                _ => {
                    return Err(SyncError::NotFound(format!(
                        "{} {}",
                        update.node.kind(),
                        update.node.perm_id
                    )))
                }
            }
        }
        for node in batch.creations.iter().chain(batch.updates.iter().map(|u| &u.node)) {
            if let Some(owner) = owner_identifier(node) {
                if !known.contains(owner.as_str()) {
                    return Err(SyncError::store(format!(
                        "{} {} refers to missing owner {owner}",
                        node.kind(),
                        node.perm_id
                    )));
                }
            }
        }

        for node in batch
            .creations
            .iter()
            .chain(batch.updates.iter().map(|u| &u.node))
        {
            state
                .entities
                .insert(node.perm_id.clone(), without_blank_properties(node.clone()));
        }
        Ok(())
    }

    async fn apply_relationships(&self, updates: &[RelationshipUpdate]) -> Result<()> {
        let mut state = self.lock()?;
        for update in updates {
            let referenced = std::iter::once(&update.perm_id)
                .chain(&update.parents)
                .chain(&update.contained);
            for id in referenced {
                if !state.entities.contains_key(id) {
                    return Err(SyncError::NotFound(format!(
                        "relationship endpoint {id}"
                    )));
                }
            }
        }
        for update in updates {
            state
                .parents
                .insert(update.perm_id.clone(), update.parents.clone());
            state
                .contained
                .insert(update.perm_id.clone(), update.contained.clone());
        }
        Ok(())
    }

    async fn attachments(&self, perm_id: &PermId) -> Result<Vec<Attachment>> {
        Ok(self
            .lock()?
            .attachments
            .get(perm_id)
            .map(|files| files.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn update_attachments(&self, update: &AttachmentUpdate) -> Result<()> {
        let mut state = self.lock()?;
        if state.entities.get(&update.perm_id).map(EntityNode::kind) != Some(update.kind) {
            return Err(SyncError::NotFound(format!(
                "attachment holder {} {}",
                update.kind, update.perm_id
            )));
        }
        if state.failing_attachments.contains(&update.perm_id) {
            return Err(SyncError::store(format!(
                "attachment transfer for {} failed",
                update.perm_id
            )));
        }
        let files = state.attachments.entry(update.perm_id.clone()).or_default();
        for file_name in &update.removals {
            files.remove(file_name);
        }
        for attachment in &update.upserts {
            files.insert(attachment.file_name.clone(), attachment.clone());
        }
        Ok(())
    }

    async fn propose_deletion(
        &self,
        kind: EntityKind,
        perm_ids: &[PermId],
        reason: &str,
    ) -> Result<DeletionId> {
        let mut state = self.lock()?;
        let missing: Vec<String> = perm_ids
            .iter()
            .filter(|id| state.entities.get(*id).map(EntityNode::kind) != Some(kind))
            .map(PermId::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(SyncError::Deletion {
                perm_ids: missing,
                reason: format!("no such {}", kind.plural()),
            });
        }
        let id = DeletionId(format!("deletion-{}", state.deletions.len() + 1));
        for perm_id in perm_ids {
            if let Some(node) = state.entities.remove(perm_id) {
                state.trash.insert((id.clone(), perm_id.clone()), node);
            }
        }
        state.deletions.push(DeletionRecord {
            id: id.clone(),
            kind,
            perm_ids: perm_ids.to_vec(),
            reason: reason.to_string(),
            confirmed: false,
        });
        Ok(id)
    }

    async fn confirm_deletion(&self, id: &DeletionId) -> Result<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let record = state
            .deletions
            .iter_mut()
            .find(|record| &record.id == id)
            .ok_or_else(|| SyncError::NotFound(format!("deletion {id}")))?;
        if record.confirmed {
            return Err(SyncError::Deletion {
                perm_ids: record.perm_ids.iter().map(PermId::to_string).collect(),
                reason: format!("deletion {id} is already confirmed"),
            });
        }
        record.confirmed = true;
        let mut removed = record.perm_ids.clone();
        for perm_id in &removed {
            state.trash.remove(&(id.clone(), perm_id.clone()));
        }
        // a recreated entity under the same permId keeps its files, attachments and relations
        removed.retain(|perm_id| !state.entities.contains_key(perm_id));
        for perm_id in &removed {
            state.files.remove(perm_id);
            state.attachments.remove(perm_id);
            state.parents.remove(perm_id);
            state.contained.remove(perm_id);
        }
        for set in state.parents.values_mut().chain(state.contained.values_mut()) {
            set.retain(|id| !removed.contains(id));
        }
        Ok(())
    }
}

#[async_trait]
impl ContentStore for MemoryCatalog {
    async fn list_files(&self, perm_id: &PermId) -> Result<FileManifest> {
        let state = self.lock()?;
        if state.broken_listings.contains(perm_id) {
            return Err(SyncError::store(format!("listing files of {perm_id} timed out")));
        }
        state
            .files
            .get(perm_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("no files registered for {perm_id}")))
    }

    async fn register_physical_data(
        &self,
        node: &EntityNode,
        manifest: &FileManifest,
    ) -> Result<()> {
        let mut state = self.lock()?;
        if state.failing.contains(&node.perm_id) {
            return Err(SyncError::store(format!(
                "content transfer for {} failed",
                node.perm_id
            )));
        }
        state.files.insert(node.perm_id.clone(), manifest.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::{attachment_update, AttachmentHolder};
    use chrono::Utc;

    fn project(id: &str, code: &str) -> EntityNode {
        EntityNode::new(
            id,
            code,
            format!("/LAB/{code}"),
            EntityDetails::Project {
                space: "LAB".into(),
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let catalog = MemoryCatalog::new();
        catalog.insert(EntityNode::space("LAB", Utc::now())).unwrap();
        let orphan = EntityNode::new(
            "C1",
            "EXP",
            "/LAB/NOPE/EXP",
            EntityDetails::Collection {
                space: "LAB".into(),
                project: "/LAB/NOPE".into(),
            },
            Utc::now(),
        );
        let batch = MetadataBatch {
            creations: vec![project("P1", "PRJ1"), orphan],
            updates: Vec::new(),
        };
        assert!(catalog.apply_batch(&batch).await.is_err());
        assert!(catalog.entity(&PermId::from("P1")).unwrap().is_none());
    }

    #[tokio::test]
    async fn attachments_go_with_their_holder() {
        let catalog = MemoryCatalog::new();
        catalog.insert(project("P1", "PRJ1")).unwrap();
        let id = PermId::from("P1");
        let holder = AttachmentHolder {
            kind: EntityKind::Project,
            perm_id: id.clone(),
            attachments: vec![Attachment {
                file_name: "plan.pdf".into(),
                version: 1,
                title: None,
                description: None,
                permlink: None,
            }],
        };
        let update = attachment_update(&holder, &[]);
        catalog.update_attachments(&update).await.unwrap();
        assert_eq!(catalog.attachments(&id).await.unwrap().len(), 1);

        let mut stray = update.clone();
        stray.perm_id = PermId::from("P9");
        assert!(matches!(
            catalog.update_attachments(&stray).await,
            Err(SyncError::NotFound(_))
        ));

        let deletion = catalog
            .propose_deletion(EntityKind::Project, &[id.clone()], "gone")
            .await
            .unwrap();
        catalog.confirm_deletion(&deletion).await.unwrap();
        assert!(catalog.attachments(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deletion_is_proposed_then_confirmed_once() {
        let catalog = MemoryCatalog::new();
        catalog.insert(project("P1", "PRJ1")).unwrap();
        let ids = vec![PermId::from("P1")];

        let id = catalog
            .propose_deletion(EntityKind::Project, &ids, "gone")
            .await
            .unwrap();
        assert!(catalog.entity(&ids[0]).unwrap().is_none());
        catalog.confirm_deletion(&id).await.unwrap();
        assert!(matches!(
            catalog.confirm_deletion(&id).await,
            Err(SyncError::Deletion { .. })
        ));
        assert!(catalog
            .propose_deletion(EntityKind::Project, &ids, "again")
            .await
            .is_err());
    }
}
