use async_trait::async_trait;
use std::collections::HashMap;

use crate::document::ResourceList;
use crate::errors::{Result, SyncError};
use crate::models::{EntityNode, FileManifest, PermId};
use crate::store::ContentStore;

/// Read-only view of the file manifests a resource list publishes for its physical data sets.
pub struct DocumentContentStore {
    manifests: HashMap<PermId, FileManifest>,
}

impl DocumentContentStore {
    pub fn new(list: &ResourceList) -> Self {
        let manifests = list
            .entities
            .values()
            .flat_map(|records| records.values())
            .filter_map(|record| {
                record
                    .node
                    .manifest()
                    .map(|manifest| (record.node.perm_id.clone(), manifest))
            })
            .collect();
        Self { manifests }
    }
}

#[async_trait]
impl ContentStore for DocumentContentStore {
    async fn list_files(&self, perm_id: &PermId) -> Result<FileManifest> {
        self.manifests
            .get(perm_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("no file manifest for data set {perm_id}")))
    }

    async fn register_physical_data(&self, node: &EntityNode, _: &FileManifest) -> Result<()> {
        Err(SyncError::store(format!(
            "cannot register {} on the data source side",
            node.perm_id
        )))
    }
}
