//! Interfaces of the catalog and content stores the harvester reads from and writes to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::attachments::AttachmentUpdate;
use crate::diff::Diff;
use crate::errors::Result;
use crate::master_data::{MasterData, MasterDataOp};
use crate::models::{Attachment, EntityDetails, EntityKind, EntityNode, FileManifest, PermId};

/// Query shapes the traversal needs from a catalog store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SearchCriteria {
    ProjectsInSpace(String),
    /// By project identifier.
    CollectionsInProject(String),
    /// By collection identifier.
    ObjectsInCollection(String),
    /// Objects of a space that belong to no collection.
    ObjectsInSpace(String),
    /// Data sets of a collection that belong to no object.
    DataSetsInCollection(String),
    /// By object identifier.
    DataSetsOfObject(String),
    /// Objects without a space.
    SharedObjects,
    ChildrenOf(EntityKind, PermId),
    ComponentsOf(EntityKind, PermId),
    AllOfKind(EntityKind),
}

impl SearchCriteria {
    /// Whether an entity satisfies an ownership criterion.
    ///
    /// Lineage criteria depend on stored relations, not on the node, and never match here.
    pub fn matches_owner(&self, node: &EntityNode) -> bool {
        match (self, &node.details) {
            (SearchCriteria::ProjectsInSpace(code), EntityDetails::Project { space }) => {
                space == code
            }
            (SearchCriteria::CollectionsInProject(id), EntityDetails::Collection { project, .. }) => {
                project == id
            }
            (SearchCriteria::ObjectsInCollection(id), EntityDetails::Object { collection, .. }) => {
                collection.as_deref() == Some(id.as_str())
            }
            (
                SearchCriteria::ObjectsInSpace(code),
                EntityDetails::Object {
                    space, collection, ..
                },
            ) => space.as_deref() == Some(code.as_str()) && collection.is_none(),
            (SearchCriteria::DataSetsInCollection(id), EntityDetails::DataSet(ds)) => {
                ds.collection.as_deref() == Some(id.as_str()) && ds.object.is_none()
            }
            (SearchCriteria::DataSetsOfObject(id), EntityDetails::DataSet(ds)) => {
                ds.object.as_deref() == Some(id.as_str())
            }
            (SearchCriteria::SharedObjects, EntityDetails::Object { space, .. }) => space.is_none(),
            (SearchCriteria::AllOfKind(kind), _) => node.kind() == *kind,
            _ => false,
        }
    }
}

/// Which parts of a record a query hydrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    pub properties: bool,
    pub files: bool,
}

impl FetchOptions {
    pub fn all() -> Self {
        Self {
            properties: true,
            files: true,
        }
    }

    pub fn metadata() -> Self {
        Self {
            properties: true,
            files: false,
        }
    }

    pub fn minimal() -> Self {
        Self {
            properties: false,
            files: false,
        }
    }

    /// Drops what was not asked for.
    pub fn shape(&self, mut node: EntityNode) -> EntityNode {
        if !self.properties {
            node.properties.clear();
        }
        if !self.files {
            if let EntityDetails::DataSet(ds) = &mut node.details {
                ds.files.clear();
            }
        }
        node
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityUpdate {
    pub node: EntityNode,
    pub diff: Diff,
}

/// Core records written in one transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataBatch {
    pub creations: Vec<EntityNode>,
    pub updates: Vec<EntityUpdate>,
}

impl MetadataBatch {
    pub fn is_empty(&self) -> bool {
        self.creations.is_empty() && self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.creations.len() + self.updates.len()
    }
}

/// Full parent and contained sets of one entity, by permId.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipUpdate {
    pub kind: EntityKind,
    pub perm_id: PermId,
    pub parents: BTreeSet<PermId>,
    pub contained: BTreeSet<PermId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeletionId(pub String);

impl fmt::Display for DeletionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn search(&self, criteria: &SearchCriteria, options: FetchOptions)
        -> Result<Vec<EntityNode>>;

    /// Entities of `kind` among `perm_ids`; unknown ids are skipped.
    async fn get(
        &self,
        kind: EntityKind,
        perm_ids: &[PermId],
        options: FetchOptions,
    ) -> Result<Vec<EntityNode>>;

    async fn master_data(&self) -> Result<MasterData>;

    async fn apply_master_data(&self, op: &MasterDataOp) -> Result<()>;

    async fn create_spaces(&self, spaces: &[EntityNode]) -> Result<()>;

    /// Writes every record or none.
    async fn apply_batch(&self, batch: &MetadataBatch) -> Result<()>;

    async fn apply_relationships(&self, updates: &[RelationshipUpdate]) -> Result<()>;

    /// Current attachments of a project, collection or object, by file name.
    async fn attachments(&self, perm_id: &PermId) -> Result<Vec<Attachment>>;

    /// Fails with `NotFound` when the holder is not in the catalog.
    async fn update_attachments(&self, update: &AttachmentUpdate) -> Result<()>;

    async fn propose_deletion(
        &self,
        kind: EntityKind,
        perm_ids: &[PermId],
        reason: &str,
    ) -> Result<DeletionId>;

    async fn confirm_deletion(&self, id: &DeletionId) -> Result<()>;
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn list_files(&self, perm_id: &PermId) -> Result<FileManifest>;

    async fn register_physical_data(&self, node: &EntityNode, manifest: &FileManifest)
        -> Result<()>;
}

/// Where the resource list document comes from.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch_resource_list(&self) -> Result<String>;
}

/// Reads a resource list from a local file.
pub struct FileDocumentSource {
    path: std::path::PathBuf,
}

impl FileDocumentSource {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DocumentSource for FileDocumentSource {
    async fn fetch_resource_list(&self) -> Result<String> {
        Ok(tokio::fs::read_to_string(&self.path).await?)
    }
}
