//! Compares the incoming graph with the local one and decides what a run does.
//!
//! Nothing here writes. The resulting [`Plan`] is handed to the executor, which
//! runs it through an applier.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

use crate::attachments::AttachmentHolder;
use crate::config::HarvesterConfig;
use crate::diff::Diff;
use crate::document::{IncomingEntity, ResourceList};
use crate::errors::Result;
use crate::graph::EntityGraph;
use crate::models::{DataSetKind, EntityDetails, EntityKind, EntityNode, FileManifest, FrozenFlags, PermId};
use crate::store::{ContentStore, EntityUpdate, MetadataBatch, RelationshipUpdate};

/// Kinds in the order their deletions run: dependents first.
pub const DELETION_ORDER: [EntityKind; 5] = [
    EntityKind::DataSet,
    EntityKind::Object,
    EntityKind::Collection,
    EntityKind::Project,
    EntityKind::Material,
];

const PLANNED_KINDS: [EntityKind; 5] = [
    EntityKind::Project,
    EntityKind::Collection,
    EntityKind::Object,
    EntityKind::DataSet,
    EntityKind::Material,
];

/// Per-kind classification of every entity seen on either side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KindDecisions {
    pub create: BTreeSet<PermId>,
    pub update: BTreeSet<PermId>,
    pub delete: BTreeSet<PermId>,
    pub unchanged: BTreeSet<PermId>,
}

/// A batch of deletions of one kind, proposed and confirmed together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionGroup {
    pub kind: EntityKind,
    pub perm_ids: Vec<PermId>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub node: EntityNode,
    pub manifest: FileManifest,
}

#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub missing_spaces: Vec<EntityNode>,
    pub decisions: BTreeMap<EntityKind, KindDecisions>,
    /// Deletions that make room for a recreation under the same permId.
    pub replacements: Vec<DeletionGroup>,
    pub metadata: MetadataBatch,
    pub registrations: Vec<Registration>,
    pub relationships: Vec<RelationshipUpdate>,
    /// Projects, collections and objects whose attachment lists are compared.
    pub attachments: Vec<AttachmentHolder>,
    /// Entities gone from the data source.
    pub deletions: Vec<DeletionGroup>,
    /// Blacklisted data sets that were left alone.
    pub skipped: BTreeSet<PermId>,
}

impl Plan {
    pub fn decisions(&self, kind: EntityKind) -> KindDecisions {
        self.decisions.get(&kind).cloned().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.missing_spaces.is_empty()
            && self.replacements.is_empty()
            && self.metadata.is_empty()
            && self.registrations.is_empty()
            && self.relationships.is_empty()
            && self.attachments.is_empty()
            && self.deletions.is_empty()
    }
}

/// Everything the planner compares.
pub struct PlanInput<'a> {
    pub list: &'a ResourceList,
    pub incoming: &'a EntityGraph,
    pub local: &'a EntityGraph,
    pub local_spaces: &'a BTreeSet<String>,
    /// Spaces whose local content is mirrored; deletions stay inside them.
    pub harvester_spaces: &'a BTreeSet<String>,
    /// Last successful run; `None` on a first run.
    pub boundary: Option<DateTime<Utc>>,
    pub retry: &'a BTreeSet<PermId>,
    /// Attachment holders whose last attachment sync failed.
    pub attachment_retry: &'a BTreeMap<PermId, EntityKind>,
    pub blacklist: &'a BTreeSet<PermId>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub keep_original_timestamps_and_users: bool,
    pub keep_original_frozen_flags: bool,
    pub harvester_user: String,
}

impl PlanOptions {
    pub fn from_config(config: &HarvesterConfig) -> Self {
        Self {
            keep_original_timestamps_and_users: config.keep_original_timestamps_and_users,
            keep_original_frozen_flags: config.keep_original_frozen_flags,
            harvester_user: config.harvester_user.clone(),
        }
    }
}

pub struct Planner<'a> {
    options: PlanOptions,
    remote_content: &'a dyn ContentStore,
    local_content: &'a dyn ContentStore,
}

enum Comparison {
    Missing,
    Replaced,
    Present,
}

impl<'a> Planner<'a> {
    pub fn new(
        options: PlanOptions,
        remote_content: &'a dyn ContentStore,
        local_content: &'a dyn ContentStore,
    ) -> Self {
        Self {
            options,
            remote_content,
            local_content,
        }
    }

    pub async fn plan(&self, input: &PlanInput<'_>) -> Result<Plan> {
        let mut plan = Plan::default();
        let mut replaced: BTreeMap<EntityKind, Vec<PermId>> = BTreeMap::new();

        for kind in PLANNED_KINDS {
            let mut decisions = KindDecisions::default();
            for record in input.list.of_kind(kind) {
                let incoming = &record.node;
                let id = &incoming.perm_id;

                let local = input.local.node(id);
                let comparison = match local {
                    None => Comparison::Missing,
                    Some(local) if !same_entity(local, incoming) => {
                        log::info!(
                            "{} {} changed its type from {:?} to {:?}; it will be recreated",
                            kind,
                            id,
                            local.type_code,
                            incoming.type_code
                        );
                        Comparison::Replaced
                    }
                    Some(local) if incoming.is_physical_data_set() && local.is_physical_data_set() => {
                        if self.content_differs(id, input.blacklist).await {
                            Comparison::Replaced
                        } else {
                            Comparison::Present
                        }
                    }
                    Some(_) => Comparison::Present,
                };

                match (comparison, local) {
                    (Comparison::Present, Some(local)) => {
                        if self.needs_update(incoming, input) {
                            decisions.update.insert(id.clone());
                            plan.metadata.updates.push(self.update(local, incoming));
                        } else {
                            decisions.unchanged.insert(id.clone());
                        }
                    }
                    (comparison, _) => {
                        if matches!(comparison, Comparison::Replaced) {
                            decisions.delete.insert(id.clone());
                            replaced.entry(kind).or_default().push(id.clone());
                        }
                        if incoming.is_physical_data_set() && input.blacklist.contains(id) {
                            log::info!("Data set {id} is blacklisted; not registering it");
                            plan.skipped.insert(id.clone());
                            continue;
                        }
                        decisions.create.insert(id.clone());
                        let node = self.creation(incoming, input.now);
                        match node.manifest() {
                            Some(manifest) => plan.registrations.push(Registration { node, manifest }),
                            None => plan.metadata.creations.push(node),
                        }
                    }
                }

                if kind.holds_attachments()
                    && attachments_due(record, decisions.create.contains(id), input)
                {
                    plan.attachments.push(AttachmentHolder::from(record));
                }
            }

            let mut gone: Vec<PermId> = input
                .local
                .nodes_of_kind(kind)
                .filter(|local| !input.list.contains(kind, &local.perm_id))
                .filter(|local| in_scope(local, input.harvester_spaces))
                .map(|local| local.perm_id.clone())
                .collect();
            gone.sort();
            decisions.delete.extend(gone.iter().cloned());
            if !gone.is_empty() {
                log::info!("{} {} are no longer published", gone.len(), kind.plural());
                plan.deletions.push(DeletionGroup {
                    kind,
                    perm_ids: gone,
                    reason: "absent from the data source".to_string(),
                });
            }
            plan.decisions.insert(kind, decisions);
        }

        plan.deletions
            .sort_by_key(|group| DELETION_ORDER.iter().position(|k| *k == group.kind));
        for kind in DELETION_ORDER {
            if let Some(perm_ids) = replaced.remove(&kind) {
                plan.replacements.push(DeletionGroup {
                    kind,
                    perm_ids,
                    reason: "replaced by a new version from the data source".to_string(),
                });
            }
        }

        plan.missing_spaces = self.missing_spaces(input);
        plan.relationships = relationships(&plan, input);
        Ok(plan)
    }

    /// Whether an incoming entity present on both sides should be rewritten.
    fn needs_update(&self, incoming: &EntityNode, input: &PlanInput<'_>) -> bool {
        if modified_since(incoming, input.boundary) || input.retry.contains(&incoming.perm_id) {
            return true;
        }
        incoming.kind().has_lineage()
            && input
                .incoming
                .parents(&incoming.perm_id)
                .iter()
                .any(|parent| input.retry.contains(&parent.perm_id))
    }

    /// Compares the file manifests of a physical data set on both sides.
    ///
    /// A listing failure on either side leaves the data set alone for this run.
    async fn content_differs(&self, perm_id: &PermId, blacklist: &BTreeSet<PermId>) -> bool {
        if blacklist.contains(perm_id) {
            return false;
        }
        let remote = self.remote_content.list_files(perm_id).await;
        let local = self.local_content.list_files(perm_id).await;
        match (remote, local) {
            (Ok(remote), Ok(local)) => {
                let differs = remote.digest() != local.digest();
                if differs {
                    log::info!("Content of data set {perm_id} changed; it will be registered again");
                }
                differs
            }
            (Err(err), _) | (_, Err(err)) => {
                log::warn!("Cannot compare content of data set {perm_id}, assuming unchanged: {err}");
                false
            }
        }
    }

    fn creation(&self, incoming: &EntityNode, now: DateTime<Utc>) -> EntityNode {
        let mut node = incoming.clone();
        if !self.options.keep_original_timestamps_and_users {
            node.registrator = Some(self.options.harvester_user.clone());
            node.modifier = Some(self.options.harvester_user.clone());
            node.registration_date = Some(now);
        }
        if !self.options.keep_original_frozen_flags {
            node.frozen = FrozenFlags::default();
        }
        node
    }

    fn update(&self, local: &EntityNode, incoming: &EntityNode) -> EntityUpdate {
        let diff = entity_diff(local, incoming);
        let mut node = incoming.clone();
        for code in local.properties.keys() {
            node.properties.entry(code.clone()).or_default();
        }
        if !self.options.keep_original_timestamps_and_users {
            node.registrator = local.registrator.clone();
            node.registration_date = local.registration_date;
            node.modifier = Some(self.options.harvester_user.clone());
        }
        if !self.options.keep_original_frozen_flags {
            node.frozen = local.frozen;
        }
        EntityUpdate { node, diff }
    }

    fn missing_spaces(&self, input: &PlanInput<'_>) -> Vec<EntityNode> {
        let mut needed: BTreeSet<&str> = input.list.spaces.iter().map(String::as_str).collect();
        needed.extend(input.harvester_spaces.iter().map(String::as_str));
        needed
            .into_iter()
            .filter(|space| !input.local_spaces.contains(*space))
            .map(|space| {
                let mut node = EntityNode::space(space, input.now);
                node.registrator = Some(self.options.harvester_user.clone());
                node
            })
            .collect()
    }
}

fn modified_since(node: &EntityNode, boundary: Option<DateTime<Utc>>) -> bool {
    boundary.map_or(true, |boundary| node.last_modified > boundary)
}

/// Whether the attachment list of a holder is compared this run.
///
/// New holders only need it when they publish attachments. Existing ones are compared when
/// they changed since the last run or their previous attachment sync failed.
fn attachments_due(record: &IncomingEntity, created: bool, input: &PlanInput<'_>) -> bool {
    if created {
        return !record.attachments.is_empty();
    }
    modified_since(&record.node, input.boundary)
        || input.attachment_retry.contains_key(&record.node.perm_id)
}

/// Same kind, same type; anything else cannot be mutated in place.
fn same_entity(local: &EntityNode, incoming: &EntityNode) -> bool {
    let same_data_set_kind = match (local.data_set(), incoming.data_set()) {
        (Some(l), Some(i)) => l.kind == i.kind,
        _ => true,
    };
    local.kind() == incoming.kind() && local.type_code == incoming.type_code && same_data_set_kind
}

/// Whether a local entity belongs to the mirrored spaces.
///
/// Entities without a space of their own (shared objects, materials) always do.
fn in_scope(node: &EntityNode, spaces: &BTreeSet<String>) -> bool {
    let space = match &node.details {
        EntityDetails::DataSet(ds) => ds
            .object
            .as_deref()
            .or(ds.collection.as_deref())
            .and_then(|owner| owner.trim_start_matches('/').split('/').next())
            .map(str::to_string),
        _ => node.space_code().map(str::to_string),
    };
    space.map_or(true, |space| spaces.contains(&space))
}

fn entity_diff(local: &EntityNode, incoming: &EntityNode) -> Diff {
    let mut diff = Diff::new(&incoming.identifier)
        .text(
            "identifier",
            Some(local.identifier.as_str()),
            Some(incoming.identifier.as_str()),
        )
        .text(
            "description",
            local.description.as_deref(),
            incoming.description.as_deref(),
        );
    let codes: BTreeSet<&String> = local
        .properties
        .keys()
        .chain(incoming.properties.keys())
        .collect();
    for code in codes {
        diff = diff.text(
            code,
            local.properties.get(code).map(String::as_str),
            incoming.properties.get(code).map(String::as_str),
        );
    }
    if let (Some(l), Some(i)) = (local.data_set(), incoming.data_set()) {
        diff = diff.value("content copies", l.content_copies.len(), i.content_copies.len());
        if l.kind == DataSetKind::Link || l.kind == DataSetKind::Container {
            diff = diff.text("collection", l.collection.as_deref(), i.collection.as_deref());
        }
        diff = diff.text("object", l.object.as_deref(), i.object.as_deref());
    }
    if local.frozen != incoming.frozen {
        diff = diff.value(
            "frozen",
            local.frozen.is_empty(),
            incoming.frozen.is_empty(),
        );
    }
    diff
}

/// Parent and contained sets for every scheduled lineage entity, from incoming edges.
///
/// Unchanged neighbours of a replaced entity are relinked too, since deleting the old
/// version drops their edges.
fn relationships(plan: &Plan, input: &PlanInput<'_>) -> Vec<RelationshipUpdate> {
    let scheduled = |kind: EntityKind| -> BTreeSet<PermId> {
        let decisions = plan.decisions(kind);
        let mut ids: BTreeSet<PermId> = decisions
            .create
            .iter()
            .chain(&decisions.update)
            .cloned()
            .collect();
        for replaced in decisions.create.intersection(&decisions.delete) {
            let neighbours = input
                .incoming
                .children(replaced)
                .into_iter()
                .chain(input.incoming.containers(replaced));
            ids.extend(
                neighbours
                    .filter(|n| n.kind() == kind && decisions.unchanged.contains(&n.perm_id))
                    .map(|n| n.perm_id.clone()),
            );
        }
        ids
    };
    let usable = |id: &PermId| !plan.skipped.contains(id);

    let mut updates = Vec::new();
    for kind in [EntityKind::Object, EntityKind::DataSet] {
        for perm_id in scheduled(kind) {
            let parents = input
                .incoming
                .parents(&perm_id)
                .into_iter()
                .filter(|p| p.kind() == kind)
                .map(|p| p.perm_id.clone())
                .filter(usable)
                .collect();
            let contained = input
                .incoming
                .components(&perm_id)
                .into_iter()
                .filter(|c| c.kind() == kind)
                .map(|c| c.perm_id.clone())
                .filter(usable)
                .collect();
            updates.push(RelationshipUpdate {
                kind,
                perm_id,
                parents,
                contained,
            });
        }
    }
    updates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::IncomingEntity;
    use crate::memory::MemoryCatalog;
    use crate::models::{DataSetDetails, FileEntry};
    use chrono::Duration;

    fn options() -> PlanOptions {
        PlanOptions {
            keep_original_timestamps_and_users: true,
            keep_original_frozen_flags: true,
            harvester_user: "harvester".into(),
        }
    }

    fn physical(code: &str, crc32: u32, ts: DateTime<Utc>) -> EntityNode {
        EntityNode::new(
            code,
            code,
            code,
            EntityDetails::DataSet(DataSetDetails {
                kind: DataSetKind::Physical,
                collection: Some("/LAB/PRJ1/EXP1".into()),
                object: None,
                files: vec![FileEntry {
                    path: "data.csv".into(),
                    length: 10,
                    crc32,
                    checksum: None,
                }],
                content_copies: Vec::new(),
            }),
            ts,
        )
        .with_type("RAW")
    }

    fn list_of(nodes: Vec<EntityNode>) -> ResourceList {
        let mut list = ResourceList::default();
        list.spaces.insert("LAB".into());
        for node in nodes {
            list.entities
                .entry(node.kind())
                .or_default()
                .insert(node.perm_id.clone(), IncomingEntity {
                    node,
                    connections: Vec::new(),
                    attachments: Vec::new(),
                });
        }
        list
    }

    #[tokio::test]
    async fn failing_content_listing_keeps_data_set() {
        let boundary = Utc::now();
        let old = boundary - Duration::hours(1);
        let list = list_of(vec![physical("DS1", 1, old)]);
        let mut incoming = EntityGraph::new();
        incoming.add_node(physical("DS1", 1, old));
        let mut local = EntityGraph::new();
        local.add_node(physical("DS1", 9, old));

        let remote = crate::remote::DocumentContentStore::new(&list);
        let local_content = MemoryCatalog::new();
        local_content
            .break_listing_of(&PermId::from("DS1"))
            .unwrap();

        let spaces = BTreeSet::from(["LAB".to_string()]);
        let empty = BTreeSet::new();
        let input = PlanInput {
            list: &list,
            incoming: &incoming,
            local: &local,
            local_spaces: &spaces,
            harvester_spaces: &spaces,
            boundary: Some(boundary),
            retry: &empty,
            attachment_retry: &BTreeMap::new(),
            blacklist: &empty,
            now: Utc::now(),
        };
        let plan = Planner::new(options(), &remote, &local_content)
            .plan(&input)
            .await
            .unwrap();
        assert!(plan.is_empty());
        assert!(plan.decisions(EntityKind::DataSet).unchanged.contains(&PermId::from("DS1")));
    }

    #[tokio::test]
    async fn blacklisted_data_set_is_not_registered() {
        let list = list_of(vec![physical("DS9", 1, Utc::now())]);
        let mut incoming = EntityGraph::new();
        incoming.add_node(physical("DS9", 1, Utc::now()));
        let local = EntityGraph::new();
        let remote = crate::remote::DocumentContentStore::new(&list);
        let local_content = MemoryCatalog::new();

        let spaces = BTreeSet::from(["LAB".to_string()]);
        let blacklist = BTreeSet::from([PermId::from("DS9")]);
        let empty = BTreeSet::new();
        let input = PlanInput {
            list: &list,
            incoming: &incoming,
            local: &local,
            local_spaces: &spaces,
            harvester_spaces: &spaces,
            boundary: None,
            retry: &empty,
            attachment_retry: &BTreeMap::new(),
            blacklist: &blacklist,
            now: Utc::now(),
        };
        let plan = Planner::new(options(), &remote, &local_content)
            .plan(&input)
            .await
            .unwrap();
        assert!(plan.registrations.is_empty());
        assert!(plan.skipped.contains(&PermId::from("DS9")));
    }

    #[test]
    fn data_sets_take_the_space_of_their_owner() {
        let spaces = BTreeSet::from(["LAB".to_string()]);
        assert!(in_scope(&physical("DS1", 1, Utc::now()), &spaces));
        let other = BTreeSet::from(["OTHER".to_string()]);
        assert!(!in_scope(&physical("DS1", 1, Utc::now()), &other));
    }
}
