use roxmltree::Node;
use std::collections::HashMap;

use crate::errors::{Result, SyncError};
use crate::master_data::{
    DataType, EntityType, EntityTypeDetails, ExternalDms, FileFormatType, MasterData, PluginKind,
    PropertyAssignment, PropertyType, ValidationPlugin, Vocabulary, VocabularyTerm,
};
use crate::models::EntityKind;
use crate::translate::NameTranslator;
use crate::xml::{attr, bool_attr, children, required_attr, timestamp_attr, unique_child};

/// Remembers which incoming codes belong to internally managed items, which keep their name.
#[derive(Default)]
struct NameMapper {
    internal: HashMap<String, bool>,
}

impl NameMapper {
    fn register(&mut self, code: &str, managed_internally: bool) {
        self.internal.insert(code.to_string(), managed_internally);
    }

    fn is_internal(&self, code: &str) -> bool {
        self.internal.get(code).copied().unwrap_or(false)
    }

    fn local_name(&self, translator: &NameTranslator, code: &str) -> String {
        if self.is_internal(code) {
            code.to_string()
        } else {
            translator.translate(code)
        }
    }
}

/// Reads the `masterData` element of a resource list.
pub struct MasterDataParser<'a> {
    translator: &'a NameTranslator,
    vocabularies: NameMapper,
    property_types: NameMapper,
}

impl<'a> MasterDataParser<'a> {
    pub fn new(translator: &'a NameTranslator) -> Self {
        Self {
            translator,
            vocabularies: NameMapper::default(),
            property_types: NameMapper::default(),
        }
    }

    pub fn parse(mut self, element: Node) -> Result<MasterData> {
        let mut md = MasterData::default();

        if let Some(group) = unique_child(element, "fileFormatTypes")? {
            for node in children(group, "fileFormatType") {
                let code = required_attr(node, "code")?;
                md.file_format_types.insert(
                    code.clone(),
                    FileFormatType {
                        code,
                        description: attr(node, "description"),
                    },
                );
            }
        }
        if let Some(group) = unique_child(element, "validationPlugins")? {
            for node in children(group, "validationPlugin") {
                let plugin = self.parse_plugin(node)?;
                md.validation_plugins.insert(plugin.name.clone(), plugin);
            }
        }
        if let Some(group) = unique_child(element, "controlledVocabularies")? {
            for node in children(group, "controlledVocabulary") {
                let vocabulary = self.parse_vocabulary(node)?;
                md.vocabularies.insert(vocabulary.code.clone(), vocabulary);
            }
        }
        if let Some(group) = unique_child(element, "propertyTypes")? {
            for node in children(group, "propertyType") {
                let property_type = self.parse_property_type(node)?;
                md.property_types
                    .insert(property_type.code.clone(), property_type);
            }
        }
        let type_groups = [
            ("materialTypes", "materialType", EntityKind::Material),
            ("objectTypes", "objectType", EntityKind::Object),
            ("dataSetTypes", "dataSetType", EntityKind::DataSet),
            ("collectionTypes", "collectionType", EntityKind::Collection),
        ];
        for (group_name, item_name, kind) in type_groups {
            if let Some(group) = unique_child(element, group_name)? {
                for node in children(group, item_name) {
                    let entity_type = self.parse_entity_type(node, kind)?;
                    let types = match kind {
                        EntityKind::Material => &mut md.material_types,
                        EntityKind::Object => &mut md.object_types,
                        EntityKind::DataSet => &mut md.data_set_types,
                        _ => &mut md.collection_types,
                    };
                    types.insert(entity_type.code.clone(), entity_type);
                }
            }
        }
        if let Some(group) = unique_child(element, "externalDataManagementSystems")? {
            for node in children(group, "externalDataManagementSystem") {
                let code = self.translator.translate(&required_attr(node, "code")?);
                md.external_dms.insert(
                    code.clone(),
                    ExternalDms {
                        code,
                        label: attr(node, "label"),
                        address_type: attr(node, "addressType")
                            .unwrap_or_else(|| "OPENBIS".to_string()),
                        address: attr(node, "address"),
                    },
                );
            }
        }
        Ok(md)
    }

    fn parse_plugin(&self, node: Node) -> Result<ValidationPlugin> {
        let entity_kinds = match attr(node, "entityKind") {
            None => Vec::new(),
            Some(kinds) if kinds == "All" => Vec::new(),
            Some(kinds) => kinds
                .split(',')
                .map(|k| k.trim().parse::<EntityKind>())
                .collect::<Result<Vec<_>>>()?,
        };
        Ok(ValidationPlugin {
            name: self.translator.translate(&required_attr(node, "name")?),
            description: attr(node, "description"),
            entity_kinds,
            script_type: required_attr(node, "type")?.parse()?,
            script: node.text().unwrap_or_default().to_string(),
            registration_date: timestamp_attr(node, "registration-timestamp"),
            modification_date: timestamp_attr(node, "modification-timestamp"),
        })
    }

    fn parse_vocabulary(&mut self, node: Node) -> Result<Vocabulary> {
        let raw_code = required_attr(node, "code")?;
        let managed_internally = bool_attr(node, "managedInternally");
        self.vocabularies.register(&raw_code, managed_internally);
        let code = self.vocabularies.local_name(self.translator, &raw_code);

        let mut terms = Vec::new();
        for term in children(node, "term") {
            let raw_term = required_attr(term, "code")?;
            let registration_date = timestamp_attr(term, "registration-timestamp");
            terms.push(VocabularyTerm {
                code: if managed_internally {
                    raw_term
                } else {
                    self.translator.translate(&raw_term)
                },
                label: attr(term, "label"),
                description: attr(term, "description"),
                ordinal: parse_ordinal(term)?,
                url: attr(term, "url"),
                registration_date,
                modification_date: timestamp_attr(term, "modification-timestamp")
                    .or(registration_date),
            });
        }
        terms.sort_by_key(|t| t.ordinal);

        Ok(Vocabulary {
            code,
            description: attr(node, "description"),
            url_template: attr(node, "urlTemplate"),
            managed_internally,
            chosen_from_list: bool_attr(node, "chosenFromList"),
            registrator: attr(node, "registrator"),
            registration_date: timestamp_attr(node, "registration-timestamp"),
            modification_date: timestamp_attr(node, "modification-timestamp"),
            terms,
        })
    }

    fn parse_property_type(&mut self, node: Node) -> Result<PropertyType> {
        let raw_code = required_attr(node, "code")?;
        let managed_internally = bool_attr(node, "managedInternally");
        self.property_types.register(&raw_code, managed_internally);
        let data_type: DataType = required_attr(node, "dataType")?.parse()?;

        let vocabulary = match data_type {
            DataType::Controlledvocabulary => {
                let raw = required_attr(node, "vocabulary")?;
                Some(self.vocabularies.local_name(self.translator, &raw))
            }
            _ => None,
        };
        let material_type = match data_type {
            DataType::Material => attr(node, "material").map(|m| self.translator.translate(&m)),
            _ => None,
        };

        Ok(PropertyType {
            code: self.property_types.local_name(self.translator, &raw_code),
            label: attr(node, "label"),
            data_type,
            description: attr(node, "description"),
            managed_internally,
            vocabulary,
            material_type,
            registrator: attr(node, "registrator"),
            modification_date: timestamp_attr(node, "modification-timestamp")
                .or_else(|| timestamp_attr(node, "registration-timestamp")),
        })
    }

    fn parse_entity_type(&self, node: Node, kind: EntityKind) -> Result<EntityType> {
        let details = match kind {
            EntityKind::Material => EntityTypeDetails::Material,
            EntityKind::Collection => EntityTypeDetails::Collection,
            EntityKind::Object => EntityTypeDetails::Object {
                listable: bool_attr(node, "listable"),
                show_container: bool_attr(node, "showContainer"),
                show_parents: bool_attr(node, "showParents"),
                show_parent_metadata: bool_attr(node, "showParentMetadata"),
                subcode_unique: bool_attr(node, "subcodeUnique"),
                auto_generated_code: bool_attr(node, "autoGeneratedCode"),
                generated_code_prefix: attr(node, "generatedCodePrefix"),
            },
            EntityKind::DataSet => EntityTypeDetails::DataSet {
                main_data_set_pattern: attr(node, "mainDataSetPattern"),
                main_data_set_path: attr(node, "mainDataSetPath"),
                deletion_disallowed: bool_attr(node, "deletionDisallowed"),
            },
            other => {
                return Err(SyncError::parse(format!("{other} has no entity types")));
            }
        };

        let mut assignments = Vec::new();
        if let Some(group) = unique_child(node, "propertyAssignments")? {
            for assignment in children(group, "propertyAssignment") {
                assignments.push(self.parse_assignment(assignment)?);
            }
        }
        assignments.sort_by_key(|a| a.ordinal);

        Ok(EntityType {
            code: self.translator.translate(&required_attr(node, "code")?),
            description: attr(node, "description"),
            validation_plugin: attr(node, "validationPlugin").map(|p| self.translator.translate(&p)),
            modification_date: timestamp_attr(node, "modification-timestamp"),
            details,
            assignments,
        })
    }

    fn parse_assignment(&self, node: Node) -> Result<PropertyAssignment> {
        let raw_code = required_attr(node, "propertyTypeCode")?;
        let plugin = attr(node, "plugin").map(|p| self.translator.translate(&p));
        let plugin_kind = match attr(node, "pluginType").as_deref() {
            Some("DYNAMIC_PROPERTY") if plugin.is_some() => Some(PluginKind::DynamicProperty),
            Some("MANAGED_PROPERTY") if plugin.is_some() => Some(PluginKind::ManagedProperty),
            _ => None,
        };
        Ok(PropertyAssignment {
            property_type: self.property_types.local_name(self.translator, &raw_code),
            mandatory: bool_attr(node, "mandatory"),
            section: attr(node, "section"),
            // the source store reports ordinals one higher than it accepts them
            ordinal: parse_ordinal(node)? - 1,
            show_in_edit: bool_attr(node, "showInEdit"),
            plugin,
            plugin_kind,
            modification_date: timestamp_attr(node, "registration-timestamp"),
        })
    }
}

fn parse_ordinal(node: Node) -> Result<i64> {
    let raw = required_attr(node, "ordinal")?;
    raw.parse::<i64>().map_err(|_| {
        SyncError::parse(format!(
            "<{}> has a non-numeric ordinal '{raw}'",
            node.tag_name().name()
        ))
    })
}
