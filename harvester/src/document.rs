//! Reader for the resource list document published by a data source.
//!
//! The document is a sitemap: one `url` per changed entity, each with a `loc`, a `lastmod`
//! and an embedded `xd` payload. One reserved `url` carries the master data instead.

use chrono::{DateTime, Utc};
use roxmltree::{Document, Node};
use std::collections::{BTreeMap, BTreeSet};

use crate::errors::{Result, SyncError};
use crate::master_data::{DataType, MasterData, MasterDataParser};
use crate::models::{
    Attachment, ContentCopy, DataSetDetails, DataSetKind, EdgeKind, EntityDetails, EntityKind,
    EntityNode, FileEntry, FrozenFlags, PermId,
};
use crate::translate::{material_perm_id, NameTranslator};
use crate::xml::{attr, bool_attr, child, children, parse_timestamp, required_attr, text, timestamp_attr};

const MASTER_DATA_SUFFIX: &str = "MASTER_DATA/MASTER_DATA/M";
const MIN_PERM_ID_LENGTH: usize = 17;

/// A relationship declared by an incoming record, by target permId.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub to: PermId,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IncomingEntity {
    pub node: EntityNode,
    pub connections: Vec<Connection>,
    /// Attachments published for a project, collection or object.
    pub attachments: Vec<Attachment>,
}

/// Everything one resource list declares.
#[derive(Debug, Clone, Default)]
pub struct ResourceList {
    /// The `rs:md at` timestamp of the list, if published.
    pub timestamp: Option<DateTime<Utc>>,
    pub master_data: MasterData,
    pub entities: BTreeMap<EntityKind, BTreeMap<PermId, IncomingEntity>>,
    /// Translated codes of every space the list mentions.
    pub spaces: BTreeSet<String>,
}

impl ResourceList {
    pub fn of_kind(&self, kind: EntityKind) -> impl Iterator<Item = &IncomingEntity> {
        self.entities.get(&kind).into_iter().flat_map(|m| m.values())
    }

    pub fn count(&self, kind: EntityKind) -> usize {
        self.entities.get(&kind).map_or(0, BTreeMap::len)
    }

    pub fn get(&self, perm_id: &PermId) -> Option<&IncomingEntity> {
        self.entities.values().find_map(|m| m.get(perm_id))
    }

    pub fn contains(&self, kind: EntityKind, perm_id: &PermId) -> bool {
        self.entities
            .get(&kind)
            .is_some_and(|m| m.contains_key(perm_id))
    }

    fn insert(&mut self, entity: IncomingEntity) {
        if let Some(space) = entity.node.space_code() {
            self.spaces.insert(space.to_string());
        }
        self.entities
            .entry(entity.node.kind())
            .or_default()
            .insert(entity.node.perm_id.clone(), entity);
    }
}

pub struct ResourceListReader {
    translator: NameTranslator,
}

impl ResourceListReader {
    pub fn new(translator: NameTranslator) -> Self {
        Self { translator }
    }

    /// Parses a whole document. Any structural problem aborts the read.
    pub fn read(&self, xml: &str) -> Result<ResourceList> {
        let doc = Document::parse(xml)?;
        let root = doc.root_element();
        if root.tag_name().name() != "urlset" {
            return Err(SyncError::parse(format!(
                "expected <urlset> root, found <{}>",
                root.tag_name().name()
            )));
        }

        let mut list = ResourceList {
            timestamp: child(root, "md").and_then(|md| timestamp_attr(md, "at")),
            ..ResourceList::default()
        };

        let (master_urls, entity_urls): (Vec<_>, Vec<_>) = children(root, "url")
            .partition(|url| location(*url).is_ok_and(|loc| loc.ends_with(MASTER_DATA_SUFFIX)));

        let master_url = match master_urls.as_slice() {
            [url] => *url,
            [] => return Err(SyncError::parse("the resource list has no master data entry")),
            more => {
                return Err(SyncError::parse(format!(
                    "the resource list has {} master data entries",
                    more.len()
                )))
            }
        };
        let element = child(master_url, "masterData")
            .ok_or_else(|| SyncError::parse("the master data entry has no <masterData> element"))?;
        list.master_data = MasterDataParser::new(&self.translator).parse(element)?;
        log::debug!("Parsed master data of the resource list");

        let reader = EntityReader {
            translator: &self.translator,
            master_data: &list.master_data,
        };
        let mut entities = Vec::with_capacity(entity_urls.len());
        for url in entity_urls {
            entities.push(reader.read_url(url)?);
        }
        for entity in entities {
            list.insert(entity);
        }
        log::info!(
            "Read resource list: {}",
            EntityKind::ALL
                .iter()
                .filter(|kind| **kind != EntityKind::Space)
                .map(|kind| format!("{} {}", list.count(*kind), kind.plural()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(list)
    }
}

fn location(url: Node) -> Result<String> {
    let loc = child(url, "loc").ok_or_else(|| SyncError::parse("<url> without <loc>"))?;
    let value = text(loc);
    if value.is_empty() {
        return Err(SyncError::parse("<loc> is empty"));
    }
    Ok(value)
}

/// `<server>/<KIND>/<id>/M` split into its trailing segments.
fn uri_segments(loc: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = loc.trim_end_matches('/').split('/').collect();
    match segments.last() {
        Some(&"M") if segments.len() >= 3 => Ok(segments),
        _ => Err(SyncError::Identifier(format!(
            "'{loc}' is not of the form <server>/<KIND>/<id>/M"
        ))),
    }
}

fn perm_id_from_uri(loc: &str) -> Result<PermId> {
    let segments = uri_segments(loc)?;
    let candidate = segments[segments.len() - 2];
    let valid = candidate.len() >= MIN_PERM_ID_LENGTH
        && candidate.chars().all(|c| c.is_ascii_digit() || c == '-');
    if !valid {
        return Err(SyncError::Identifier(format!(
            "'{loc}' does not end with a permId"
        )));
    }
    Ok(PermId::new(candidate))
}

fn data_set_code_from_uri(loc: &str) -> Result<String> {
    let (_, rest) = loc.split_once("DATA_SET/").ok_or_else(|| {
        SyncError::Identifier(format!("'{loc}' is not a data set location"))
    })?;
    match rest.split('/').next() {
        Some(code) if !code.is_empty() && code != "M" => Ok(code.to_string()),
        _ => Err(SyncError::Identifier(format!(
            "'{loc}' has no data set code"
        ))),
    }
}

struct EntityReader<'a> {
    translator: &'a NameTranslator,
    master_data: &'a MasterData,
}

impl<'a> EntityReader<'a> {
    fn read_url(&self, url: Node) -> Result<IncomingEntity> {
        let loc = location(url)?;
        let lastmod = child(url, "lastmod")
            .map(text)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| SyncError::parse(format!("{loc}: missing <lastmod>")))?;
        let last_modified = parse_timestamp(&lastmod)?;
        let xd = child(url, "xd").ok_or_else(|| SyncError::parse(format!("{loc}: missing <xd>")))?;
        let kind: EntityKind = required_attr(xd, "kind")?.parse()?;

        let mut node = match kind {
            EntityKind::Project => self.project(&loc, xd, last_modified)?,
            EntityKind::Collection => self.collection(&loc, xd, last_modified)?,
            EntityKind::Object => self.object(&loc, xd, last_modified)?,
            EntityKind::DataSet => self.data_set(&loc, xd, last_modified)?,
            EntityKind::Material => self.material(&loc, xd, last_modified)?,
            EntityKind::Space => {
                return Err(SyncError::parse(format!(
                    "{loc}: spaces are not published as entries"
                )))
            }
        };
        if kind != EntityKind::Material {
            node.type_code = Some(self.translator.translate(&required_attr(xd, "type")?));
        }
        node.description = attr(xd, "desc");
        node.registration_date = timestamp_attr(xd, "registration-timestamp");
        node.registrator = attr(xd, "registrator");
        node.modifier = attr(xd, "modifier");
        node.frozen = frozen_flags(xd);
        node.properties = self.properties(xd)?;
        let attachments = match child(xd, "binaryData") {
            Some(binary) if kind.holds_attachments() => children(binary, "attachment")
                .map(|entry| attachment(&loc, entry))
                .collect::<Result<Vec<_>>>()?,
            _ => Vec::new(),
        };
        node.has_attachments = !attachments.is_empty();

        let mut connections = Vec::new();
        if let Some(group) = child(xd, "connections") {
            for connection in children(group, "connection") {
                connections.push(Connection {
                    to: PermId::new(required_attr(connection, "to")?),
                    kind: required_attr(connection, "type")?.parse()?,
                });
            }
        }
        Ok(IncomingEntity {
            node,
            connections,
            attachments,
        })
    }

    fn space(&self, xd: Node) -> Result<String> {
        Ok(self.translator.translate(&required_attr(xd, "space")?))
    }

    fn project(&self, loc: &str, xd: Node, ts: DateTime<Utc>) -> Result<EntityNode> {
        let space = self.space(xd)?;
        let code = required_attr(xd, "code")?;
        Ok(EntityNode::new(
            perm_id_from_uri(loc)?,
            code.clone(),
            format!("/{space}/{code}"),
            EntityDetails::Project { space },
            ts,
        ))
    }

    fn collection(&self, loc: &str, xd: Node, ts: DateTime<Utc>) -> Result<EntityNode> {
        let space = self.space(xd)?;
        let project = format!("/{space}/{}", required_attr(xd, "project")?);
        let code = required_attr(xd, "code")?;
        Ok(EntityNode::new(
            perm_id_from_uri(loc)?,
            code.clone(),
            format!("{project}/{code}"),
            EntityDetails::Collection { space, project },
            ts,
        ))
    }

    fn object(&self, loc: &str, xd: Node, ts: DateTime<Utc>) -> Result<EntityNode> {
        let code = required_attr(xd, "code")?;
        let space = attr(xd, "space").map(|s| self.translator.translate(&s));
        let project = match (&space, attr(xd, "project")) {
            (Some(space), Some(project)) => Some(format!("/{space}/{project}")),
            _ => None,
        };
        let identifier = match (&space, &project) {
            (_, Some(project)) => format!("{project}/{code}"),
            (Some(space), None) => format!("/{space}/{code}"),
            (None, None) => format!("/{code}"),
        };
        let collection = attr(xd, "experiment")
            .map(|id| self.translator.translate_identifier(&id))
            .transpose()?;
        Ok(EntityNode::new(
            perm_id_from_uri(loc)?,
            code,
            identifier,
            EntityDetails::Object {
                space,
                project,
                collection,
            },
            ts,
        ))
    }

    fn data_set(&self, loc: &str, xd: Node, ts: DateTime<Utc>) -> Result<EntityNode> {
        let code = required_attr(xd, "code")?;
        let uri_code = data_set_code_from_uri(loc)?;
        if uri_code != code {
            return Err(SyncError::Identifier(format!(
                "'{loc}' does not match data set code {code}"
            )));
        }
        let kind = match attr(xd, "dsKind") {
            Some(raw) => raw.parse::<DataSetKind>()?,
            None => DataSetKind::Physical,
        };
        let collection = attr(xd, "experiment")
            .map(|id| self.translator.translate_identifier(&id))
            .transpose()?;
        let object = attr(xd, "sample")
            .map(|id| self.translator.translate_identifier(&id))
            .transpose()?;

        let mut files = Vec::new();
        let mut content_copies = Vec::new();
        if let Some(binary) = child(xd, "binaryData") {
            for file in children(binary, "fileNode") {
                files.push(file_entry(file)?);
            }
            for copy in children(binary, "contentCopy") {
                content_copies.push(ContentCopy {
                    external_dms: self
                        .translator
                        .translate(&required_attr(copy, "externalDMS")?),
                    external_code: attr(copy, "externalCode"),
                    path: attr(copy, "path"),
                    git_commit_hash: attr(copy, "gitCommitHash"),
                    git_repository_id: attr(copy, "gitRepositoryId"),
                });
            }
        }

        Ok(EntityNode::new(
            uri_code,
            code.clone(),
            code,
            EntityDetails::DataSet(DataSetDetails {
                kind,
                collection,
                object,
                files,
                content_copies,
            }),
            ts,
        ))
    }

    fn material(&self, loc: &str, xd: Node, ts: DateTime<Utc>) -> Result<EntityNode> {
        let segments = uri_segments(loc)?;
        let uri_code = segments[segments.len() - 2];
        let code = required_attr(xd, "code")?;
        if uri_code != code {
            return Err(SyncError::Identifier(format!(
                "'{loc}' does not match material code {code}"
            )));
        }
        let type_code = self.translator.translate(&required_attr(xd, "type")?);
        let code = self.translator.translate(&code);
        let perm_id = material_perm_id(&code, &type_code);
        Ok(EntityNode::new(
            perm_id.clone(),
            code,
            perm_id,
            EntityDetails::Material,
            ts,
        )
        .with_type(type_code))
    }

    fn properties(&self, xd: Node) -> Result<BTreeMap<String, String>> {
        let mut properties = BTreeMap::new();
        let Some(group) = child(xd, "properties") else {
            return Ok(properties);
        };
        for property in children(group, "property") {
            let raw_code = child(property, "code")
                .map(text)
                .filter(|code| !code.is_empty())
                .ok_or_else(|| SyncError::parse("<property> without <code>"))?;
            let value = child(property, "value").map(text).unwrap_or_default();
            let (code, value) = self.local_property(&raw_code, value)?;
            properties.insert(code, value);
        }
        Ok(properties)
    }

    /// Local property code and value, translating references to other master data or materials.
    fn local_property(&self, raw_code: &str, value: String) -> Result<(String, String)> {
        let internal = self
            .master_data
            .property_types
            .get(raw_code)
            .filter(|pt| pt.managed_internally);
        let code = match internal {
            Some(_) => raw_code.to_string(),
            None => self.translator.translate(raw_code),
        };
        let Some(property_type) = self.master_data.property_types.get(&code) else {
            return Ok((code, value));
        };
        if value.is_empty() {
            return Ok((code, value));
        }
        let value = match property_type.data_type {
            DataType::Controlledvocabulary => {
                let internal_vocabulary = property_type
                    .vocabulary
                    .as_ref()
                    .and_then(|v| self.master_data.vocabularies.get(v))
                    .is_some_and(|v| v.managed_internally);
                if internal_vocabulary {
                    value
                } else {
                    self.translator.translate(&value)
                }
            }
            DataType::Material => self.translator.translate_material(&value)?,
            _ => value,
        };
        Ok((code, value))
    }
}

fn file_entry(node: Node) -> Result<FileEntry> {
    let path = required_attr(node, "path")?;
    let length = match attr(node, "length") {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|_| SyncError::parse(format!("file {path}: bad length '{raw}'")))?,
        None => 0,
    };
    // checksums are published as signed 32-bit integers
    let crc32 = match attr(node, "crc32checksum") {
        Some(raw) => raw
            .parse::<i64>()
            .map(|value| value as u32)
            .map_err(|_| SyncError::parse(format!("file {path}: bad crc32 '{raw}'")))?,
        None => 0,
    };
    Ok(FileEntry {
        path,
        length,
        crc32,
        checksum: attr(node, "checksum"),
    })
}

fn attachment(loc: &str, node: Node) -> Result<Attachment> {
    let file_name = required_attr(node, "fileName")?;
    let version = match attr(node, "latestVersion") {
        Some(raw) => raw.parse::<u32>().map_err(|_| {
            SyncError::parse(format!("{loc}: attachment {file_name} has bad version '{raw}'"))
        })?,
        None => 1,
    };
    Ok(Attachment {
        file_name,
        version,
        title: attr(node, "title"),
        description: attr(node, "description"),
        // older data sources spell it "permink"
        permlink: attr(node, "permlink").or_else(|| attr(node, "permink")),
    })
}

fn frozen_flags(xd: Node) -> FrozenFlags {
    FrozenFlags {
        frozen: bool_attr(xd, "frozen"),
        for_children: bool_attr(xd, "frozenForChildren"),
        for_parents: bool_attr(xd, "frozenForParents"),
        for_components: bool_attr(xd, "frozenForComponents"),
        for_containers: bool_attr(xd, "frozenForContainers"),
        for_data_sets: bool_attr(xd, "frozenForDataSets"),
        for_objects: bool_attr(xd, "frozenForSamples"),
    }
}
