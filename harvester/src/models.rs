use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::SyncError;

/// The closed set of catalog entity kinds the harvester reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKind {
    Space,
    Project,
    Collection,
    Object,
    DataSet,
    Material,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Space,
        EntityKind::Project,
        EntityKind::Collection,
        EntityKind::Object,
        EntityKind::DataSet,
        EntityKind::Material,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Space => "SPACE",
            EntityKind::Project => "PROJECT",
            EntityKind::Collection => "COLLECTION",
            EntityKind::Object => "OBJECT",
            EntityKind::DataSet => "DATA_SET",
            EntityKind::Material => "MATERIAL",
        }
    }

    /// Plural label used in run summaries.
    pub fn plural(&self) -> &'static str {
        match self {
            EntityKind::Space => "spaces",
            EntityKind::Project => "projects",
            EntityKind::Collection => "collections",
            EntityKind::Object => "objects",
            EntityKind::DataSet => "data sets",
            EntityKind::Material => "materials",
        }
    }

    /// Kinds that can carry attachments.
    pub fn holds_attachments(&self) -> bool {
        matches!(
            self,
            EntityKind::Project | EntityKind::Collection | EntityKind::Object
        )
    }

    /// Kinds that take part in parent/child and container/component traversal.
    pub fn has_lineage(&self) -> bool {
        matches!(self, EntityKind::Object | EntityKind::DataSet)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SPACE" => Ok(EntityKind::Space),
            "PROJECT" => Ok(EntityKind::Project),
            "COLLECTION" | "EXPERIMENT" => Ok(EntityKind::Collection),
            "OBJECT" | "SAMPLE" => Ok(EntityKind::Object),
            "DATA_SET" => Ok(EntityKind::DataSet),
            "MATERIAL" => Ok(EntityKind::Material),
            other => Err(SyncError::parse(format!("unknown entity kind '{other}'"))),
        }
    }
}

/// Remote permanent identifier, the identity of a graph node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermId(String);

impl PermId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PermId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PermId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PermId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EdgeKind {
    Child,
    Component,
    Connection,
}

impl FromStr for EdgeKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Child" => Ok(EdgeKind::Child),
            "Component" => Ok(EdgeKind::Component),
            "Connection" => Ok(EdgeKind::Connection),
            other => Err(SyncError::parse(format!("unknown connection type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSetKind {
    Physical,
    Container,
    Link,
}

impl FromStr for DataSetKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PHYSICAL" => Ok(DataSetKind::Physical),
            "CONTAINER" => Ok(DataSetKind::Container),
            "LINK" => Ok(DataSetKind::Link),
            other => Err(SyncError::parse(format!("unknown data set kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub length: u64,
    pub crc32: u32,
    #[serde(default)]
    pub checksum: Option<String>,
}

/// The content-identifying file list of a physical data set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    pub files: Vec<FileEntry>,
}

impl FileManifest {
    pub fn new(files: Vec<FileEntry>) -> Self {
        Self { files }
    }

    /// SHA-256 over the path-sorted (path, crc32, length) triples.
    pub fn digest(&self) -> String {
        let mut files: Vec<&FileEntry> = self.files.iter().collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        let mut hasher = Sha256::new();
        for file in files {
            hasher.update(file.path.as_bytes());
            hasher.update(b"\t");
            hasher.update(file.crc32.to_string().as_bytes());
            hasher.update(b"\t");
            hasher.update(file.length.to_string().as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentCopy {
    pub external_dms: String,
    #[serde(default)]
    pub external_code: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub git_commit_hash: Option<String>,
    #[serde(default)]
    pub git_repository_id: Option<String>,
}

/// A file attached to a project, collection or object, at its latest version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    pub version: u32,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub permlink: Option<String>,
}

/// Relationship classes an entity refuses to extend further.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrozenFlags {
    pub frozen: bool,
    pub for_children: bool,
    pub for_parents: bool,
    pub for_components: bool,
    pub for_containers: bool,
    pub for_data_sets: bool,
    pub for_objects: bool,
}

impl FrozenFlags {
    pub fn is_empty(&self) -> bool {
        *self == FrozenFlags::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSetDetails {
    pub kind: DataSetKind,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub content_copies: Vec<ContentCopy>,
}

/// Kind-specific payload of an [`EntityNode`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityDetails {
    Space,
    Project {
        space: String,
    },
    Collection {
        space: String,
        project: String,
    },
    Object {
        space: Option<String>,
        project: Option<String>,
        collection: Option<String>,
    },
    DataSet(DataSetDetails),
    Material,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityNode {
    pub perm_id: PermId,
    pub code: String,
    pub identifier: String,
    #[serde(default)]
    pub type_code: Option<String>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub registration_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub registrator: Option<String>,
    #[serde(default)]
    pub modifier: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub frozen: FrozenFlags,
    #[serde(default)]
    pub has_attachments: bool,
    pub details: EntityDetails,
}

impl EntityNode {
    pub fn new(
        perm_id: impl Into<PermId>,
        code: impl Into<String>,
        identifier: impl Into<String>,
        details: EntityDetails,
        last_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            perm_id: perm_id.into(),
            code: code.into(),
            identifier: identifier.into(),
            type_code: None,
            last_modified,
            registration_date: None,
            registrator: None,
            modifier: None,
            description: None,
            properties: BTreeMap::new(),
            frozen: FrozenFlags::default(),
            has_attachments: false,
            details,
        }
    }

    /// Spaces are keyed by code; they have no remote permId of their own.
    pub fn space(code: impl Into<String>, last_modified: DateTime<Utc>) -> Self {
        let code = code.into();
        Self::new(
            code.clone(),
            code.clone(),
            format!("/{code}"),
            EntityDetails::Space,
            last_modified,
        )
    }

    pub fn with_type(mut self, type_code: impl Into<String>) -> Self {
        self.type_code = Some(type_code.into());
        self
    }

    pub fn with_property(mut self, code: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(code.into(), value.into());
        self
    }

    pub fn kind(&self) -> EntityKind {
        match &self.details {
            EntityDetails::Space => EntityKind::Space,
            EntityDetails::Project { .. } => EntityKind::Project,
            EntityDetails::Collection { .. } => EntityKind::Collection,
            EntityDetails::Object { .. } => EntityKind::Object,
            EntityDetails::DataSet(_) => EntityKind::DataSet,
            EntityDetails::Material => EntityKind::Material,
        }
    }

    /// Code of the owning space, if the entity lives in one.
    pub fn space_code(&self) -> Option<&str> {
        match &self.details {
            EntityDetails::Space => Some(self.code.as_str()),
            EntityDetails::Project { space } | EntityDetails::Collection { space, .. } => {
                Some(space.as_str())
            }
            EntityDetails::Object { space, .. } => space.as_deref(),
            EntityDetails::DataSet(_) | EntityDetails::Material => None,
        }
    }

    pub fn data_set(&self) -> Option<&DataSetDetails> {
        match &self.details {
            EntityDetails::DataSet(details) => Some(details),
            _ => None,
        }
    }

    pub fn is_physical_data_set(&self) -> bool {
        matches!(self.data_set(), Some(ds) if ds.kind == DataSetKind::Physical)
    }

    pub fn manifest(&self) -> Option<FileManifest> {
        self.data_set()
            .filter(|ds| ds.kind == DataSetKind::Physical)
            .map(|ds| FileManifest::new(ds.files.clone()))
    }
}
