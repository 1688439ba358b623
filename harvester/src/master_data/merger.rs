use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::apply::{Applier, Operation};
use crate::diff::Diff;
use crate::errors::{Result, SyncError};
use crate::master_data::{
    EntityType, EntityTypeDetails, ExternalDms, FileFormatType, MasterData, MasterDataKind,
    MasterDataOp, PropertyAssignment, PropertyType, ValidationPlugin, Vocabulary, VocabularyTerm,
};
use crate::models::EntityKind;
use crate::summary::ChangeCounts;

#[derive(Debug, Clone, Copy)]
pub struct MergeOptions {
    pub update_allowed: bool,
    pub unassignment_allowed: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            update_allowed: true,
            unassignment_allowed: false,
        }
    }
}

/// Reconciles incoming master data with the local catalog, one category at a time.
pub struct MasterDataMerger<'a> {
    applier: &'a dyn Applier,
    options: MergeOptions,
    errors: Vec<String>,
    counts: BTreeMap<MasterDataKind, ChangeCounts>,
}

/// Strictly newer, or undecidable because one side carries no timestamp.
fn newer(incoming: Option<DateTime<Utc>>, existing: Option<DateTime<Utc>>) -> bool {
    match (incoming, existing) {
        (Some(i), Some(e)) => i > e,
        _ => true,
    }
}

impl<'a> MasterDataMerger<'a> {
    pub fn new(applier: &'a dyn Applier, options: MergeOptions) -> Self {
        Self {
            applier,
            options,
            errors: Vec::new(),
            counts: BTreeMap::new(),
        }
    }

    /// Runs every step in dependency order and fails at the end if any step reported errors.
    pub async fn merge(
        mut self,
        incoming: &MasterData,
        existing: &MasterData,
    ) -> Result<BTreeMap<MasterDataKind, ChangeCounts>> {
        log::info!("Synchronizing master data");
        self.file_format_types(incoming, existing).await?;
        self.validation_plugins(incoming, existing).await?;
        self.vocabularies(incoming, existing).await?;

        let deferred = self
            .entity_types(EntityKind::Material, incoming, existing, false)
            .await?;
        self.property_types(incoming, existing).await?;
        for kind in [EntityKind::Object, EntityKind::DataSet, EntityKind::Collection] {
            self.entity_types(kind, incoming, existing, true).await?;
        }
        for (incoming_type, existing_type) in deferred {
            self.assignments(&incoming_type, existing_type.as_ref()).await?;
        }
        self.external_dms(incoming, existing).await?;

        if self.errors.is_empty() {
            Ok(self.counts)
        } else {
            for error in &self.errors {
                log::error!("{error}");
            }
            Err(SyncError::MasterData(self.errors))
        }
    }

    async fn submit(&mut self, op: MasterDataOp, updated: bool) -> Result<()> {
        let counts = self.counts.entry(op.category()).or_default();
        if updated {
            counts.updated += 1;
        } else {
            counts.added += 1;
        }
        self.applier.apply(Operation::MasterData(op)).await?;
        Ok(())
    }

    async fn file_format_types(&mut self, incoming: &MasterData, existing: &MasterData) -> Result<()> {
        for t in incoming.file_format_types.values() {
            match existing.file_format_types.get(&t.code) {
                Some(current) => {
                    let diff = diff_file_format(current, t);
                    if !diff.is_empty() && self.options.update_allowed {
                        self.submit(MasterDataOp::UpdateFileFormatType(t.clone(), diff), true)
                            .await?;
                    }
                }
                None => {
                    self.submit(MasterDataOp::RegisterFileFormatType(t.clone()), false)
                        .await?
                }
            }
        }
        Ok(())
    }

    async fn validation_plugins(&mut self, incoming: &MasterData, existing: &MasterData) -> Result<()> {
        for plugin in incoming.validation_plugins.values() {
            match existing.validation_plugins.get(&plugin.name) {
                Some(current) => {
                    let diff = diff_plugin(current, plugin);
                    if !diff.is_empty()
                        && self.options.update_allowed
                        && newer(plugin.modification_date, current.modification_date)
                    {
                        self.submit(MasterDataOp::UpdatePlugin(plugin.clone(), diff), true)
                            .await?;
                    }
                }
                None => {
                    self.submit(MasterDataOp::RegisterPlugin(plugin.clone()), false)
                        .await?
                }
            }
        }
        Ok(())
    }

    async fn vocabularies(&mut self, incoming: &MasterData, existing: &MasterData) -> Result<()> {
        for vocabulary in incoming.vocabularies.values() {
            match existing.vocabularies.get(&vocabulary.code) {
                Some(current) => {
                    let diff = diff_vocabulary(current, vocabulary);
                    if !diff.is_empty()
                        && self.options.update_allowed
                        && !current.managed_internally
                        && newer(vocabulary.modification_date, current.modification_date)
                    {
                        self.submit(
                            MasterDataOp::UpdateVocabulary(vocabulary.clone(), diff),
                            true,
                        )
                        .await?;
                    }
                    self.terms(vocabulary, current).await?;
                }
                None if vocabulary.managed_internally => {
                    self.errors.push(format!(
                        "There is no internal vocabulary {}.",
                        vocabulary.code
                    ));
                }
                None => {
                    self.submit(MasterDataOp::RegisterVocabulary(vocabulary.clone()), false)
                        .await?
                }
            }
        }
        Ok(())
    }

    async fn terms(&mut self, incoming: &Vocabulary, existing: &Vocabulary) -> Result<()> {
        for term in &incoming.terms {
            match existing.term(&term.code) {
                Some(current) => {
                    let diff = diff_term(&incoming.code, current, term);
                    if !diff.is_empty()
                        && self.options.update_allowed
                        && newer(term.modification_date, current.modification_date)
                    {
                        self.submit(
                            MasterDataOp::UpdateTerm {
                                vocabulary: incoming.code.clone(),
                                term: term.clone(),
                                diff,
                            },
                            true,
                        )
                        .await?;
                    }
                }
                None => {
                    self.submit(
                        MasterDataOp::AddTerm {
                            vocabulary: incoming.code.clone(),
                            term: term.clone(),
                        },
                        false,
                    )
                    .await?
                }
            }
        }
        Ok(())
    }

    async fn property_types(&mut self, incoming: &MasterData, existing: &MasterData) -> Result<()> {
        for property_type in incoming.property_types.values() {
            if let Some(vocabulary) = &property_type.vocabulary {
                let known = existing.vocabularies.contains_key(vocabulary)
                    || incoming.vocabularies.contains_key(vocabulary);
                if !known {
                    self.errors.push(format!(
                        "Property type {} refers to unknown vocabulary {vocabulary}.",
                        property_type.code
                    ));
                    continue;
                }
            }
            match existing.property_types.get(&property_type.code) {
                Some(current) => {
                    let diff = diff_property_type(current, property_type);
                    if !diff.is_empty()
                        && self.options.update_allowed
                        && newer(property_type.modification_date, current.modification_date)
                    {
                        self.submit(
                            MasterDataOp::UpdatePropertyType(property_type.clone(), diff),
                            true,
                        )
                        .await?;
                    }
                }
                None if property_type.managed_internally => {
                    self.errors.push(format!(
                        "There is no internal property type {}.",
                        property_type.code
                    ));
                }
                None => {
                    self.submit(
                        MasterDataOp::RegisterPropertyType(property_type.clone()),
                        false,
                    )
                    .await?
                }
            }
        }
        Ok(())
    }

    /// Registers or updates the types of one kind. Returns the pairs whose assignments
    /// still need processing when `assign_now` is false.
    async fn entity_types(
        &mut self,
        kind: EntityKind,
        incoming: &MasterData,
        existing: &MasterData,
        assign_now: bool,
    ) -> Result<Vec<(EntityType, Option<EntityType>)>> {
        let mut deferred = Vec::new();
        let Some(types) = incoming.entity_types(kind) else {
            return Ok(deferred);
        };
        for entity_type in types.values() {
            let current = existing.entity_type(kind, &entity_type.code);
            match current {
                Some(current) => {
                    let diff = diff_entity_type(current, entity_type);
                    if !diff.is_empty() && self.options.update_allowed {
                        self.submit(
                            MasterDataOp::UpdateEntityType(entity_type.without_assignments(), diff),
                            true,
                        )
                        .await?;
                    }
                }
                None => {
                    self.submit(
                        MasterDataOp::RegisterEntityType(entity_type.without_assignments()),
                        false,
                    )
                    .await?
                }
            }
            if assign_now {
                self.assignments(entity_type, current).await?;
            } else {
                deferred.push((entity_type.clone(), current.cloned()));
            }
        }
        Ok(deferred)
    }

    async fn assignments(&mut self, incoming: &EntityType, existing: Option<&EntityType>) -> Result<()> {
        let kind = incoming.kind();
        for assignment in &incoming.assignments {
            match existing.and_then(|t| t.assignment(&assignment.property_type)) {
                Some(current) => {
                    let diff = diff_assignment(&incoming.code, current, assignment);
                    if !diff.is_empty() && self.options.update_allowed {
                        self.submit(
                            MasterDataOp::UpdateAssignment {
                                kind,
                                entity_type: incoming.code.clone(),
                                assignment: assignment.clone(),
                                diff,
                            },
                            true,
                        )
                        .await?;
                    }
                }
                None => {
                    self.submit(
                        MasterDataOp::AssignProperty {
                            kind,
                            entity_type: incoming.code.clone(),
                            assignment: assignment.clone(),
                        },
                        false,
                    )
                    .await?
                }
            }
        }

        if self.options.unassignment_allowed {
            if let Some(existing) = existing {
                for current in &existing.assignments {
                    if incoming.assignment(&current.property_type).is_none() {
                        self.counts
                            .entry(MasterDataKind::PropertyAssignment)
                            .or_default()
                            .removed += 1;
                        self.applier
                            .apply(Operation::MasterData(MasterDataOp::UnassignProperty {
                                kind,
                                entity_type: incoming.code.clone(),
                                property_type: current.property_type.clone(),
                            }))
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn external_dms(&mut self, incoming: &MasterData, existing: &MasterData) -> Result<()> {
        for dms in incoming.external_dms.values() {
            match existing.external_dms.get(&dms.code) {
                Some(current) => {
                    let diff = diff_external_dms(current, dms);
                    if !diff.is_empty() && self.options.update_allowed {
                        self.submit(MasterDataOp::UpdateExternalDms(dms.clone(), diff), true)
                            .await?;
                    }
                }
                None => {
                    self.submit(MasterDataOp::RegisterExternalDms(dms.clone()), false)
                        .await?
                }
            }
        }
        Ok(())
    }
}

fn diff_file_format(existing: &FileFormatType, incoming: &FileFormatType) -> Diff {
    Diff::new(&incoming.code).text(
        "description",
        existing.description.as_deref(),
        incoming.description.as_deref(),
    )
}

fn diff_plugin(existing: &ValidationPlugin, incoming: &ValidationPlugin) -> Diff {
    Diff::new(&incoming.name)
        .text(
            "description",
            existing.description.as_deref(),
            incoming.description.as_deref(),
        )
        .script("script", &existing.script, &incoming.script)
}

fn diff_vocabulary(existing: &Vocabulary, incoming: &Vocabulary) -> Diff {
    Diff::new(&incoming.code)
        .text(
            "description",
            existing.description.as_deref(),
            incoming.description.as_deref(),
        )
        .text(
            "urlTemplate",
            existing.url_template.as_deref(),
            incoming.url_template.as_deref(),
        )
        .value(
            "managedInternally",
            existing.managed_internally,
            incoming.managed_internally,
        )
        .value(
            "chosenFromList",
            existing.chosen_from_list,
            incoming.chosen_from_list,
        )
}

fn diff_term(vocabulary: &str, existing: &VocabularyTerm, incoming: &VocabularyTerm) -> Diff {
    Diff::new(format!("{vocabulary}.{}", incoming.code))
        .text("label", existing.label.as_deref(), incoming.label.as_deref())
        .text(
            "description",
            existing.description.as_deref(),
            incoming.description.as_deref(),
        )
        .text("url", existing.url.as_deref(), incoming.url.as_deref())
}

fn diff_property_type(existing: &PropertyType, incoming: &PropertyType) -> Diff {
    Diff::new(&incoming.code)
        .text("label", existing.label.as_deref(), incoming.label.as_deref())
        .value("dataType", existing.data_type, incoming.data_type)
        .text(
            "description",
            existing.description.as_deref(),
            incoming.description.as_deref(),
        )
        .value(
            "managedInternally",
            existing.managed_internally,
            incoming.managed_internally,
        )
        .text(
            "vocabulary",
            existing.vocabulary.as_deref(),
            incoming.vocabulary.as_deref(),
        )
        .text(
            "material",
            existing.material_type.as_deref(),
            incoming.material_type.as_deref(),
        )
}

fn diff_entity_type(existing: &EntityType, incoming: &EntityType) -> Diff {
    let mut diff = Diff::new(format!("{} type {}", incoming.kind().as_str(), incoming.code))
        .text(
            "description",
            existing.description.as_deref(),
            incoming.description.as_deref(),
        )
        .text(
            "validationPlugin",
            existing.validation_plugin.as_deref(),
            incoming.validation_plugin.as_deref(),
        );
    match (&existing.details, &incoming.details) {
        (
            EntityTypeDetails::Object {
                listable: l1,
                show_container: c1,
                show_parents: p1,
                show_parent_metadata: m1,
                subcode_unique: u1,
                auto_generated_code: a1,
                generated_code_prefix: g1,
            },
            EntityTypeDetails::Object {
                listable: l2,
                show_container: c2,
                show_parents: p2,
                show_parent_metadata: m2,
                subcode_unique: u2,
                auto_generated_code: a2,
                generated_code_prefix: g2,
            },
        ) => {
            diff = diff
                .value("listable", l1, l2)
                .value("showContainer", c1, c2)
                .value("showParents", p1, p2)
                .value("showParentMetadata", m1, m2)
                .value("subcodeUnique", u1, u2)
                .value("autoGeneratedCode", a1, a2)
                .text("generatedCodePrefix", g1.as_deref(), g2.as_deref());
        }
        (
            EntityTypeDetails::DataSet {
                main_data_set_pattern: pat1,
                main_data_set_path: path1,
                deletion_disallowed: d1,
            },
            EntityTypeDetails::DataSet {
                main_data_set_pattern: pat2,
                main_data_set_path: path2,
                deletion_disallowed: d2,
            },
        ) => {
            diff = diff
                .text("mainDataSetPattern", pat1.as_deref(), pat2.as_deref())
                .text("mainDataSetPath", path1.as_deref(), path2.as_deref())
                .value("deletionDisallowed", d1, d2);
        }
        _ => {}
    }
    diff
}

fn diff_assignment(
    entity_type: &str,
    existing: &PropertyAssignment,
    incoming: &PropertyAssignment,
) -> Diff {
    let plugin_kind = |a: &PropertyAssignment| a.plugin_kind.map(|k| k.to_string());
    Diff::new(format!("{entity_type}.{}", incoming.property_type))
        .value("mandatory", existing.mandatory, incoming.mandatory)
        .text(
            "section",
            existing.section.as_deref(),
            incoming.section.as_deref(),
        )
        .value("ordinal", existing.ordinal, incoming.ordinal)
        .value("showInEdit", existing.show_in_edit, incoming.show_in_edit)
        .text("plugin", existing.plugin.as_deref(), incoming.plugin.as_deref())
        .text(
            "pluginType",
            plugin_kind(existing).as_deref(),
            plugin_kind(incoming).as_deref(),
        )
}

fn diff_external_dms(existing: &ExternalDms, incoming: &ExternalDms) -> Diff {
    Diff::new(&incoming.code)
        .text("label", existing.label.as_deref(), incoming.label.as_deref())
        .text(
            "addressType",
            Some(existing.address_type.as_str()),
            Some(incoming.address_type.as_str()),
        )
        .text(
            "address",
            existing.address.as_deref(),
            incoming.address.as_deref(),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::Outcome;
    use crate::master_data::DataType;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingApplier {
        ops: Mutex<Vec<MasterDataOp>>,
    }

    impl RecordingApplier {
        fn ops(&self) -> Vec<MasterDataOp> {
            self.ops.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Applier for RecordingApplier {
        async fn apply(&self, op: Operation) -> Result<Outcome> {
            if let Operation::MasterData(op) = op {
                self.ops.lock().unwrap().push(op);
            }
            Ok(Outcome::Applied)
        }
    }

    fn vocabulary(code: &str, terms: &[&str]) -> Vocabulary {
        Vocabulary {
            code: code.into(),
            description: None,
            url_template: None,
            managed_internally: false,
            chosen_from_list: true,
            registrator: None,
            registration_date: None,
            modification_date: None,
            terms: terms
                .iter()
                .enumerate()
                .map(|(i, t)| VocabularyTerm {
                    code: t.to_string(),
                    label: None,
                    description: None,
                    ordinal: i as i64,
                    url: None,
                    registration_date: None,
                    modification_date: None,
                })
                .collect(),
        }
    }

    fn property_type(code: &str, data_type: DataType, vocabulary: Option<&str>) -> PropertyType {
        PropertyType {
            code: code.into(),
            label: None,
            data_type,
            description: None,
            managed_internally: false,
            vocabulary: vocabulary.map(str::to_string),
            material_type: None,
            registrator: None,
            modification_date: None,
        }
    }

    fn entity_type(code: &str, details: EntityTypeDetails, props: &[&str]) -> EntityType {
        EntityType {
            code: code.into(),
            description: None,
            validation_plugin: None,
            modification_date: None,
            details,
            assignments: props
                .iter()
                .enumerate()
                .map(|(i, p)| PropertyAssignment {
                    property_type: p.to_string(),
                    mandatory: false,
                    section: None,
                    ordinal: i as i64,
                    show_in_edit: true,
                    plugin: None,
                    plugin_kind: None,
                    modification_date: None,
                })
                .collect(),
        }
    }

    fn position(ops: &[MasterDataOp], pred: impl Fn(&MasterDataOp) -> bool) -> usize {
        ops.iter().position(pred).expect("operation not found")
    }

    #[tokio::test]
    async fn merge_follows_dependency_order() {
        let mut incoming = MasterData::default();
        incoming
            .vocabularies
            .insert("COLOR".into(), vocabulary("COLOR", &["RED"]));
        incoming.property_types.insert(
            "TINT".into(),
            property_type("TINT", DataType::Controlledvocabulary, Some("COLOR")),
        );
        incoming.property_types.insert(
            "GENE".into(),
            property_type("GENE", DataType::Material, None),
        );
        incoming.material_types.insert(
            "GENE_TYPE".into(),
            entity_type("GENE_TYPE", EntityTypeDetails::Material, &["GENE"]),
        );
        incoming.collection_types.insert(
            "RUN".into(),
            entity_type("RUN", EntityTypeDetails::Collection, &["TINT"]),
        );

        let applier = RecordingApplier::default();
        let counts = MasterDataMerger::new(&applier, MergeOptions::default())
            .merge(&incoming, &MasterData::default())
            .await
            .unwrap();
        let ops = applier.ops();

        let vocab = position(&ops, |op| matches!(op, MasterDataOp::RegisterVocabulary(_)));
        let material_type = position(&ops, |op| {
            matches!(op, MasterDataOp::RegisterEntityType(t) if t.code == "GENE_TYPE")
        });
        let tint = position(&ops, |op| {
            matches!(op, MasterDataOp::RegisterPropertyType(p) if p.code == "TINT")
        });
        let run_assign = position(&ops, |op| {
            matches!(op, MasterDataOp::AssignProperty { entity_type, .. } if entity_type == "RUN")
        });
        let gene_assign = position(&ops, |op| {
            matches!(op, MasterDataOp::AssignProperty { entity_type, .. } if entity_type == "GENE_TYPE")
        });

        assert!(vocab < tint);
        assert!(material_type < tint);
        assert!(tint < run_assign);
        assert!(run_assign < gene_assign, "material assignments are deferred");
        assert_eq!(counts[&MasterDataKind::PropertyAssignment].added, 2);
    }

    #[tokio::test]
    async fn missing_internal_items_accumulate_errors() {
        let mut internal_vocab = vocabulary("$STORAGE", &[]);
        internal_vocab.managed_internally = true;
        let mut internal_prop = property_type("$NAME", DataType::Varchar, None);
        internal_prop.managed_internally = true;

        let mut incoming = MasterData::default();
        incoming.vocabularies.insert("$STORAGE".into(), internal_vocab);
        incoming.property_types.insert("$NAME".into(), internal_prop);
        incoming.file_format_types.insert(
            "TIFF".into(),
            FileFormatType {
                code: "TIFF".into(),
                description: None,
            },
        );

        let applier = RecordingApplier::default();
        let err = MasterDataMerger::new(&applier, MergeOptions::default())
            .merge(&incoming, &MasterData::default())
            .await
            .unwrap_err();
        match err {
            SyncError::MasterData(errors) => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].contains("internal vocabulary $STORAGE"));
                assert!(errors[1].contains("internal property type $NAME"));
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(applier.ops().len(), 1, "non-failing steps still ran");
    }

    #[tokio::test]
    async fn unchanged_master_data_produces_no_operations() {
        let mut md = MasterData::default();
        md.vocabularies
            .insert("COLOR".into(), vocabulary("COLOR", &["RED", "BLUE"]));
        md.property_types.insert(
            "TINT".into(),
            property_type("TINT", DataType::Controlledvocabulary, Some("COLOR")),
        );
        md.object_types.insert(
            "CELL".into(),
            entity_type(
                "CELL",
                EntityTypeDetails::Object {
                    listable: true,
                    show_container: false,
                    show_parents: true,
                    show_parent_metadata: false,
                    subcode_unique: false,
                    auto_generated_code: false,
                    generated_code_prefix: None,
                },
                &["TINT"],
            ),
        );

        let applier = RecordingApplier::default();
        MasterDataMerger::new(&applier, MergeOptions::default())
            .merge(&md, &md)
            .await
            .unwrap();
        assert!(applier.ops().is_empty());
    }

    #[tokio::test]
    async fn updates_respect_switches_and_timestamps() {
        let older = Utc::now() - chrono::Duration::days(1);
        let newer_ts = Utc::now();

        let mut existing = MasterData::default();
        let mut current = vocabulary("COLOR", &["RED"]);
        current.description = Some("old".into());
        current.modification_date = Some(newer_ts);
        existing.vocabularies.insert("COLOR".into(), current);
        existing.object_types.insert(
            "CELL".into(),
            entity_type("CELL", EntityTypeDetails::Collection, &["A", "B"]),
        );

        let mut incoming = MasterData::default();
        let mut stale = vocabulary("COLOR", &["RED", "GREEN"]);
        stale.description = Some("new".into());
        stale.modification_date = Some(older);
        incoming.vocabularies.insert("COLOR".into(), stale);
        incoming.object_types.insert(
            "CELL".into(),
            entity_type("CELL", EntityTypeDetails::Collection, &["A"]),
        );

        let applier = RecordingApplier::default();
        MasterDataMerger::new(
            &applier,
            MergeOptions {
                update_allowed: true,
                unassignment_allowed: true,
            },
        )
        .merge(&incoming, &existing)
        .await
        .unwrap();
        let ops = applier.ops();

        assert!(!ops
            .iter()
            .any(|op| matches!(op, MasterDataOp::UpdateVocabulary(..))));
        assert!(ops.iter().any(
            |op| matches!(op, MasterDataOp::AddTerm { term, .. } if term.code == "GREEN")
        ));
        assert!(ops.iter().any(|op| matches!(
            op,
            MasterDataOp::UnassignProperty { property_type, .. } if property_type == "B"
        )));
    }
}
