//! Shared type-system catalog: vocabularies, property types, entity types and scripts.

pub mod merger;
pub mod parser;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::diff::Diff;
use crate::errors::{Result, SyncError};
use crate::models::EntityKind;

pub use merger::{MasterDataMerger, MergeOptions};
pub use parser::MasterDataParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScriptType {
    EntityValidation,
    DynamicProperty,
    ManagedProperty,
}

impl FromStr for ScriptType {
    type Err = SyncError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ENTITY_VALIDATION" => Ok(ScriptType::EntityValidation),
            "DYNAMIC_PROPERTY" => Ok(ScriptType::DynamicProperty),
            "MANAGED_PROPERTY" => Ok(ScriptType::ManagedProperty),
            other => Err(SyncError::parse(format!("unknown script type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationPlugin {
    pub name: String,
    pub description: Option<String>,
    /// Empty means the plugin applies to every kind.
    pub entity_kinds: Vec<EntityKind>,
    pub script_type: ScriptType,
    pub script: String,
    pub registration_date: Option<DateTime<Utc>>,
    pub modification_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFormatType {
    pub code: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabularyTerm {
    pub code: String,
    pub label: Option<String>,
    pub description: Option<String>,
    pub ordinal: i64,
    pub url: Option<String>,
    pub registration_date: Option<DateTime<Utc>>,
    pub modification_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary {
    pub code: String,
    pub description: Option<String>,
    pub url_template: Option<String>,
    pub managed_internally: bool,
    pub chosen_from_list: bool,
    pub registrator: Option<String>,
    pub registration_date: Option<DateTime<Utc>>,
    pub modification_date: Option<DateTime<Utc>>,
    pub terms: Vec<VocabularyTerm>,
}

impl Vocabulary {
    pub fn term(&self, code: &str) -> Option<&VocabularyTerm> {
        self.terms.iter().find(|t| t.code == code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    Integer,
    Real,
    Varchar,
    MultilineVarchar,
    Hyperlink,
    Boolean,
    Controlledvocabulary,
    Material,
    Xml,
    Timestamp,
    Date,
    Sample,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Integer => "INTEGER",
            DataType::Real => "REAL",
            DataType::Varchar => "VARCHAR",
            DataType::MultilineVarchar => "MULTILINE_VARCHAR",
            DataType::Hyperlink => "HYPERLINK",
            DataType::Boolean => "BOOLEAN",
            DataType::Controlledvocabulary => "CONTROLLEDVOCABULARY",
            DataType::Material => "MATERIAL",
            DataType::Xml => "XML",
            DataType::Timestamp => "TIMESTAMP",
            DataType::Date => "DATE",
            DataType::Sample => "SAMPLE",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = SyncError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let data_type = match s {
            "INTEGER" => DataType::Integer,
            "REAL" => DataType::Real,
            "VARCHAR" => DataType::Varchar,
            "MULTILINE_VARCHAR" => DataType::MultilineVarchar,
            "HYPERLINK" => DataType::Hyperlink,
            "BOOLEAN" => DataType::Boolean,
            "CONTROLLEDVOCABULARY" => DataType::Controlledvocabulary,
            "MATERIAL" => DataType::Material,
            "XML" => DataType::Xml,
            "TIMESTAMP" => DataType::Timestamp,
            "DATE" => DataType::Date,
            "SAMPLE" => DataType::Sample,
            other => return Err(SyncError::parse(format!("unknown data type '{other}'"))),
        };
        Ok(data_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyType {
    pub code: String,
    pub label: Option<String>,
    pub data_type: DataType,
    pub description: Option<String>,
    pub managed_internally: bool,
    pub vocabulary: Option<String>,
    /// `None` on a MATERIAL property means "material of any type".
    pub material_type: Option<String>,
    pub registrator: Option<String>,
    pub modification_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginKind {
    DynamicProperty,
    ManagedProperty,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PluginKind::DynamicProperty => "DYNAMIC_PROPERTY",
            PluginKind::ManagedProperty => "MANAGED_PROPERTY",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyAssignment {
    pub property_type: String,
    pub mandatory: bool,
    pub section: Option<String>,
    pub ordinal: i64,
    pub show_in_edit: bool,
    pub plugin: Option<String>,
    pub plugin_kind: Option<PluginKind>,
    pub modification_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityTypeDetails {
    Material,
    Collection,
    Object {
        listable: bool,
        show_container: bool,
        show_parents: bool,
        show_parent_metadata: bool,
        subcode_unique: bool,
        auto_generated_code: bool,
        generated_code_prefix: Option<String>,
    },
    DataSet {
        main_data_set_pattern: Option<String>,
        main_data_set_path: Option<String>,
        deletion_disallowed: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityType {
    pub code: String,
    pub description: Option<String>,
    pub validation_plugin: Option<String>,
    pub modification_date: Option<DateTime<Utc>>,
    pub details: EntityTypeDetails,
    /// Sorted by ordinal.
    pub assignments: Vec<PropertyAssignment>,
}

impl EntityType {
    pub fn kind(&self) -> EntityKind {
        match self.details {
            EntityTypeDetails::Material => EntityKind::Material,
            EntityTypeDetails::Collection => EntityKind::Collection,
            EntityTypeDetails::Object { .. } => EntityKind::Object,
            EntityTypeDetails::DataSet { .. } => EntityKind::DataSet,
        }
    }

    pub fn assignment(&self, property_type: &str) -> Option<&PropertyAssignment> {
        self.assignments
            .iter()
            .find(|a| a.property_type == property_type)
    }

    /// Same type without its assignments, as registered before assignments are applied.
    pub fn without_assignments(&self) -> EntityType {
        EntityType {
            assignments: Vec::new(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalDms {
    pub code: String,
    pub label: Option<String>,
    pub address_type: String,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterData {
    #[serde(default)]
    pub file_format_types: BTreeMap<String, FileFormatType>,
    #[serde(default)]
    pub validation_plugins: BTreeMap<String, ValidationPlugin>,
    #[serde(default)]
    pub vocabularies: BTreeMap<String, Vocabulary>,
    #[serde(default)]
    pub property_types: BTreeMap<String, PropertyType>,
    #[serde(default)]
    pub material_types: BTreeMap<String, EntityType>,
    #[serde(default)]
    pub collection_types: BTreeMap<String, EntityType>,
    #[serde(default)]
    pub object_types: BTreeMap<String, EntityType>,
    #[serde(default)]
    pub data_set_types: BTreeMap<String, EntityType>,
    #[serde(default)]
    pub external_dms: BTreeMap<String, ExternalDms>,
}

/// Label of a master data category, used as summary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum MasterDataKind {
    FileFormatType,
    ValidationPlugin,
    Vocabulary,
    VocabularyTerm,
    PropertyType,
    EntityType(EntityKind),
    PropertyAssignment,
    ExternalDms,
}

impl fmt::Display for MasterDataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MasterDataKind::FileFormatType => f.write_str("file format types"),
            MasterDataKind::ValidationPlugin => f.write_str("validation plugins"),
            MasterDataKind::Vocabulary => f.write_str("vocabularies"),
            MasterDataKind::VocabularyTerm => f.write_str("vocabulary terms"),
            MasterDataKind::PropertyType => f.write_str("property types"),
            MasterDataKind::EntityType(EntityKind::Material) => f.write_str("material types"),
            MasterDataKind::EntityType(EntityKind::Collection) => f.write_str("collection types"),
            MasterDataKind::EntityType(EntityKind::Object) => f.write_str("object types"),
            MasterDataKind::EntityType(EntityKind::DataSet) => f.write_str("data set types"),
            MasterDataKind::EntityType(other) => write!(f, "{} types", other.as_str()),
            MasterDataKind::PropertyAssignment => f.write_str("property assignments"),
            MasterDataKind::ExternalDms => f.write_str("external data management systems"),
        }
    }
}

/// A single master data write, applied in merge order.
#[derive(Debug, Clone, PartialEq)]
pub enum MasterDataOp {
    RegisterFileFormatType(FileFormatType),
    UpdateFileFormatType(FileFormatType, Diff),
    RegisterPlugin(ValidationPlugin),
    UpdatePlugin(ValidationPlugin, Diff),
    RegisterVocabulary(Vocabulary),
    UpdateVocabulary(Vocabulary, Diff),
    AddTerm {
        vocabulary: String,
        term: VocabularyTerm,
    },
    UpdateTerm {
        vocabulary: String,
        term: VocabularyTerm,
        diff: Diff,
    },
    RegisterPropertyType(PropertyType),
    UpdatePropertyType(PropertyType, Diff),
    RegisterEntityType(EntityType),
    UpdateEntityType(EntityType, Diff),
    AssignProperty {
        kind: EntityKind,
        entity_type: String,
        assignment: PropertyAssignment,
    },
    UpdateAssignment {
        kind: EntityKind,
        entity_type: String,
        assignment: PropertyAssignment,
        diff: Diff,
    },
    UnassignProperty {
        kind: EntityKind,
        entity_type: String,
        property_type: String,
    },
    RegisterExternalDms(ExternalDms),
    UpdateExternalDms(ExternalDms, Diff),
}

impl MasterDataOp {
    pub fn category(&self) -> MasterDataKind {
        match self {
            MasterDataOp::RegisterFileFormatType(_) | MasterDataOp::UpdateFileFormatType(..) => {
                MasterDataKind::FileFormatType
            }
            MasterDataOp::RegisterPlugin(_) | MasterDataOp::UpdatePlugin(..) => {
                MasterDataKind::ValidationPlugin
            }
            MasterDataOp::RegisterVocabulary(_) | MasterDataOp::UpdateVocabulary(..) => {
                MasterDataKind::Vocabulary
            }
            MasterDataOp::AddTerm { .. } | MasterDataOp::UpdateTerm { .. } => {
                MasterDataKind::VocabularyTerm
            }
            MasterDataOp::RegisterPropertyType(_) | MasterDataOp::UpdatePropertyType(..) => {
                MasterDataKind::PropertyType
            }
            MasterDataOp::RegisterEntityType(t) | MasterDataOp::UpdateEntityType(t, _) => {
                MasterDataKind::EntityType(t.kind())
            }
            MasterDataOp::AssignProperty { .. }
            | MasterDataOp::UpdateAssignment { .. }
            | MasterDataOp::UnassignProperty { .. } => MasterDataKind::PropertyAssignment,
            MasterDataOp::RegisterExternalDms(_) | MasterDataOp::UpdateExternalDms(..) => {
                MasterDataKind::ExternalDms
            }
        }
    }
}

impl fmt::Display for MasterDataOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MasterDataOp::RegisterFileFormatType(t) => write!(f, "register file format type {}", t.code),
            MasterDataOp::RegisterPlugin(p) => write!(f, "register validation plugin {}", p.name),
            MasterDataOp::RegisterVocabulary(v) => {
                write!(f, "register vocabulary {} with {} terms", v.code, v.terms.len())
            }
            MasterDataOp::AddTerm { vocabulary, term } => {
                write!(f, "add term {} to vocabulary {vocabulary}", term.code)
            }
            MasterDataOp::RegisterPropertyType(p) => {
                write!(f, "register property type {} ({})", p.code, p.data_type)
            }
            MasterDataOp::RegisterEntityType(t) => {
                write!(f, "register {} type {}", t.kind().as_str(), t.code)
            }
            MasterDataOp::AssignProperty {
                kind,
                entity_type,
                assignment,
            } => write!(
                f,
                "assign property type {} to {} type {entity_type}",
                assignment.property_type,
                kind.as_str()
            ),
            MasterDataOp::UnassignProperty {
                kind,
                entity_type,
                property_type,
            } => write!(
                f,
                "unassign property type {property_type} from {} type {entity_type}",
                kind.as_str()
            ),
            MasterDataOp::RegisterExternalDms(d) => {
                write!(f, "register external data management system {}", d.code)
            }
            MasterDataOp::UpdateFileFormatType(_, diff)
            | MasterDataOp::UpdatePlugin(_, diff)
            | MasterDataOp::UpdateVocabulary(_, diff)
            | MasterDataOp::UpdateTerm { diff, .. }
            | MasterDataOp::UpdatePropertyType(_, diff)
            | MasterDataOp::UpdateEntityType(_, diff)
            | MasterDataOp::UpdateAssignment { diff, .. }
            | MasterDataOp::UpdateExternalDms(_, diff) => {
                write!(f, "update {} {diff}", self.category())
            }
        }
    }
}

impl MasterData {
    pub fn entity_types(&self, kind: EntityKind) -> Option<&BTreeMap<String, EntityType>> {
        match kind {
            EntityKind::Material => Some(&self.material_types),
            EntityKind::Collection => Some(&self.collection_types),
            EntityKind::Object => Some(&self.object_types),
            EntityKind::DataSet => Some(&self.data_set_types),
            EntityKind::Space | EntityKind::Project => None,
        }
    }

    fn entity_types_mut(&mut self, kind: EntityKind) -> Result<&mut BTreeMap<String, EntityType>> {
        match kind {
            EntityKind::Material => Ok(&mut self.material_types),
            EntityKind::Collection => Ok(&mut self.collection_types),
            EntityKind::Object => Ok(&mut self.object_types),
            EntityKind::DataSet => Ok(&mut self.data_set_types),
            other => Err(SyncError::store(format!("{other} has no entity types"))),
        }
    }

    pub fn entity_type(&self, kind: EntityKind, code: &str) -> Option<&EntityType> {
        self.entity_types(kind).and_then(|types| types.get(code))
    }

    pub fn is_empty(&self) -> bool {
        self == &MasterData::default()
    }

    /// Applies one write to this catalog; used by the store implementations.
    pub fn apply(&mut self, op: &MasterDataOp) -> Result<()> {
        match op {
            MasterDataOp::RegisterFileFormatType(t) => {
                insert_new(&mut self.file_format_types, &t.code, t.clone(), "file format type")
            }
            MasterDataOp::UpdateFileFormatType(t, _) => {
                replace(&mut self.file_format_types, &t.code, t.clone(), "file format type")
            }
            MasterDataOp::RegisterPlugin(p) => {
                insert_new(&mut self.validation_plugins, &p.name, p.clone(), "plugin")
            }
            MasterDataOp::UpdatePlugin(p, _) => {
                replace(&mut self.validation_plugins, &p.name, p.clone(), "plugin")
            }
            MasterDataOp::RegisterVocabulary(v) => {
                insert_new(&mut self.vocabularies, &v.code, v.clone(), "vocabulary")
            }
            MasterDataOp::UpdateVocabulary(v, _) => {
                let existing = self
                    .vocabularies
                    .get_mut(&v.code)
                    .ok_or_else(|| SyncError::NotFound(format!("vocabulary {}", v.code)))?;
                let terms = std::mem::take(&mut existing.terms);
                *existing = Vocabulary { terms, ..v.clone() };
                Ok(())
            }
            MasterDataOp::AddTerm { vocabulary, term } => {
                let vocab = self
                    .vocabularies
                    .get_mut(vocabulary)
                    .ok_or_else(|| SyncError::NotFound(format!("vocabulary {vocabulary}")))?;
                if vocab.term(&term.code).is_some() {
                    return Err(SyncError::store(format!(
                        "term {} already exists in {vocabulary}",
                        term.code
                    )));
                }
                vocab.terms.push(term.clone());
                vocab.terms.sort_by_key(|t| t.ordinal);
                Ok(())
            }
            MasterDataOp::UpdateTerm {
                vocabulary, term, ..
            } => {
                let vocab = self
                    .vocabularies
                    .get_mut(vocabulary)
                    .ok_or_else(|| SyncError::NotFound(format!("vocabulary {vocabulary}")))?;
                let slot = vocab
                    .terms
                    .iter_mut()
                    .find(|t| t.code == term.code)
                    .ok_or_else(|| SyncError::NotFound(format!("term {}", term.code)))?;
                *slot = term.clone();
                Ok(())
            }
            MasterDataOp::RegisterPropertyType(p) => {
                insert_new(&mut self.property_types, &p.code, p.clone(), "property type")
            }
            MasterDataOp::UpdatePropertyType(p, _) => {
                replace(&mut self.property_types, &p.code, p.clone(), "property type")
            }
            MasterDataOp::RegisterEntityType(t) => {
                let types = self.entity_types_mut(t.kind())?;
                insert_new(types, &t.code, t.clone(), "entity type")
            }
            MasterDataOp::UpdateEntityType(t, _) => {
                let types = self.entity_types_mut(t.kind())?;
                let existing = types
                    .get_mut(&t.code)
                    .ok_or_else(|| SyncError::NotFound(format!("entity type {}", t.code)))?;
                let assignments = std::mem::take(&mut existing.assignments);
                *existing = EntityType {
                    assignments,
                    ..t.clone()
                };
                Ok(())
            }
            MasterDataOp::AssignProperty {
                kind,
                entity_type,
                assignment,
            } => {
                if !self.property_types.contains_key(&assignment.property_type) {
                    return Err(SyncError::NotFound(format!(
                        "property type {}",
                        assignment.property_type
                    )));
                }
                let target = self.entity_type_mut(*kind, entity_type)?;
                if target.assignment(&assignment.property_type).is_some() {
                    return Err(SyncError::store(format!(
                        "{} is already assigned to {entity_type}",
                        assignment.property_type
                    )));
                }
                target.assignments.push(assignment.clone());
                target.assignments.sort_by_key(|a| a.ordinal);
                Ok(())
            }
            MasterDataOp::UpdateAssignment {
                kind,
                entity_type,
                assignment,
                ..
            } => {
                let target = self.entity_type_mut(*kind, entity_type)?;
                let slot = target
                    .assignments
                    .iter_mut()
                    .find(|a| a.property_type == assignment.property_type)
                    .ok_or_else(|| {
                        SyncError::NotFound(format!("assignment {}", assignment.property_type))
                    })?;
                *slot = assignment.clone();
                target.assignments.sort_by_key(|a| a.ordinal);
                Ok(())
            }
            MasterDataOp::UnassignProperty {
                kind,
                entity_type,
                property_type,
            } => {
                let target = self.entity_type_mut(*kind, entity_type)?;
                target.assignments.retain(|a| &a.property_type != property_type);
                Ok(())
            }
            MasterDataOp::RegisterExternalDms(d) => {
                insert_new(&mut self.external_dms, &d.code, d.clone(), "external DMS")
            }
            MasterDataOp::UpdateExternalDms(d, _) => {
                replace(&mut self.external_dms, &d.code, d.clone(), "external DMS")
            }
        }
    }

    fn entity_type_mut(&mut self, kind: EntityKind, code: &str) -> Result<&mut EntityType> {
        self.entity_types_mut(kind)?
            .get_mut(code)
            .ok_or_else(|| SyncError::NotFound(format!("{} type {code}", kind.as_str())))
    }
}

fn insert_new<T>(map: &mut BTreeMap<String, T>, code: &str, value: T, what: &str) -> Result<()> {
    if map.contains_key(code) {
        return Err(SyncError::store(format!("{what} {code} already exists")));
    }
    map.insert(code.to_string(), value);
    Ok(())
}

fn replace<T>(map: &mut BTreeMap<String, T>, code: &str, value: T, what: &str) -> Result<()> {
    match map.get_mut(code) {
        Some(slot) => {
            *slot = value;
            Ok(())
        }
        None => Err(SyncError::NotFound(format!("{what} {code}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_type(code: &str) -> EntityType {
        EntityType {
            code: code.to_string(),
            description: None,
            validation_plugin: None,
            modification_date: None,
            details: EntityTypeDetails::Object {
                listable: true,
                show_container: false,
                show_parents: true,
                show_parent_metadata: false,
                subcode_unique: false,
                auto_generated_code: false,
                generated_code_prefix: Some("S".into()),
            },
            assignments: Vec::new(),
        }
    }

    fn property_type(code: &str) -> PropertyType {
        PropertyType {
            code: code.to_string(),
            label: Some(code.to_lowercase()),
            data_type: DataType::Varchar,
            description: None,
            managed_internally: false,
            vocabulary: None,
            material_type: None,
            registrator: None,
            modification_date: None,
        }
    }

    fn assignment(code: &str, ordinal: i64) -> PropertyAssignment {
        PropertyAssignment {
            property_type: code.to_string(),
            mandatory: false,
            section: None,
            ordinal,
            show_in_edit: true,
            plugin: None,
            plugin_kind: None,
            modification_date: None,
        }
    }

    #[test]
    fn assignment_requires_registered_property_type() {
        let mut md = MasterData::default();
        md.apply(&MasterDataOp::RegisterEntityType(object_type("CELL")))
            .unwrap();
        let op = MasterDataOp::AssignProperty {
            kind: EntityKind::Object,
            entity_type: "CELL".into(),
            assignment: assignment("NAME", 0),
        };
        assert!(matches!(md.apply(&op), Err(SyncError::NotFound(_))));

        md.apply(&MasterDataOp::RegisterPropertyType(property_type("NAME")))
            .unwrap();
        md.apply(&op).unwrap();
        assert_eq!(md.object_types["CELL"].assignments.len(), 1);
    }

    #[test]
    fn entity_type_update_keeps_assignments() {
        let mut md = MasterData::default();
        md.apply(&MasterDataOp::RegisterPropertyType(property_type("B")))
            .unwrap();
        md.apply(&MasterDataOp::RegisterPropertyType(property_type("A")))
            .unwrap();
        md.apply(&MasterDataOp::RegisterEntityType(object_type("CELL")))
            .unwrap();
        for (code, ordinal) in [("B", 2), ("A", 1)] {
            md.apply(&MasterDataOp::AssignProperty {
                kind: EntityKind::Object,
                entity_type: "CELL".into(),
                assignment: assignment(code, ordinal),
            })
            .unwrap();
        }

        let mut updated = object_type("CELL");
        updated.description = Some("cells".into());
        md.apply(&MasterDataOp::UpdateEntityType(updated, Diff::new("CELL")))
            .unwrap();

        let cell = &md.object_types["CELL"];
        assert_eq!(cell.description.as_deref(), Some("cells"));
        let order: Vec<_> = cell.assignments.iter().map(|a| a.property_type.as_str()).collect();
        assert_eq!(order, vec!["A", "B"]);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut md = MasterData::default();
        let op = MasterDataOp::RegisterPropertyType(property_type("NAME"));
        md.apply(&op).unwrap();
        assert!(md.apply(&op).is_err());
    }
}
