use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::document::ResourceList;
use crate::errors::Result;
use crate::graph::EntityGraph;
use crate::models::{EdgeKind, EntityDetails, EntityKind, EntityNode, PermId};
use crate::store::{CatalogStore, FetchOptions, SearchCriteria};

/// Answers the questions a graph traversal asks about one side of a run.
#[async_trait]
pub trait EntitySource: Send + Sync {
    /// Top-level entities of a space: its projects and its objects outside any collection.
    async fn space(&self, code: &str) -> Result<Vec<EntityNode>>;

    /// Entities owned through connection edges.
    async fn owned(&self, node: &EntityNode) -> Result<Vec<EntityNode>>;

    async fn children(&self, node: &EntityNode) -> Result<Vec<EntityNode>>;

    async fn components(&self, node: &EntityNode) -> Result<Vec<EntityNode>>;

    /// Objects that belong to no space.
    async fn shared_objects(&self) -> Result<Vec<EntityNode>>;

    async fn materials(&self) -> Result<Vec<EntityNode>>;
}

/// Fills an [`EntityGraph`] by walking an [`EntitySource`].
///
/// The walk uses an explicit worklist. Lineage nodes are expanded as parents and as
/// containers at most once each, guarded by the graph's visit marks.
pub struct GraphBuilder<'a> {
    source: &'a dyn EntitySource,
    graph: EntityGraph,
    owned_expanded: HashSet<PermId>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(source: &'a dyn EntitySource) -> Self {
        Self {
            source,
            graph: EntityGraph::new(),
            owned_expanded: HashSet::new(),
        }
    }

    pub fn contains(&self, perm_id: &PermId) -> bool {
        self.graph.contains(perm_id)
    }

    pub async fn add_space(&mut self, code: &str) -> Result<()> {
        log::debug!("Walking space {code}");
        let roots = self.source.space(code).await?;
        self.expand(roots).await
    }

    pub async fn add_shared_objects(&mut self) -> Result<()> {
        let shared = self.source.shared_objects().await?;
        log::debug!("Walking {} shared objects", shared.len());
        self.expand(shared).await
    }

    pub async fn add_materials(&mut self) -> Result<()> {
        for material in self.source.materials().await? {
            self.graph.add_node(material);
        }
        Ok(())
    }

    pub async fn expand(&mut self, roots: Vec<EntityNode>) -> Result<()> {
        let mut pending: Vec<EntityNode> = Vec::with_capacity(roots.len());
        for root in roots {
            self.graph.add_node(root.clone());
            pending.push(root);
        }

        while let Some(node) = pending.pop() {
            let id = node.perm_id.clone();

            if self.owned_expanded.insert(id.clone()) {
                for owned in self.source.owned(&node).await? {
                    self.graph
                        .add_edge(node.clone(), owned.clone(), EdgeKind::Connection);
                    pending.push(owned);
                }
            }

            if !node.kind().has_lineage() {
                continue;
            }
            if self.graph.mark_visited_as_parent(&id) {
                for child in self.source.children(&node).await? {
                    self.graph.add_edge(node.clone(), child.clone(), EdgeKind::Child);
                    pending.push(child);
                }
            }
            if self.graph.mark_visited_as_container(&id) {
                for component in self.source.components(&node).await? {
                    self.graph
                        .add_edge(node.clone(), component.clone(), EdgeKind::Component);
                    pending.push(component);
                }
            }
        }
        Ok(())
    }

    pub fn finish(self) -> EntityGraph {
        self.graph
    }
}

/// Builds the graph of the local catalog for the given spaces, plus all shared objects
/// and materials.
pub async fn local_graph(
    catalog: Arc<dyn CatalogStore>,
    spaces: &BTreeSet<String>,
) -> Result<EntityGraph> {
    let source = StoreEntitySource::new(catalog);
    let mut builder = GraphBuilder::new(&source);
    for space in spaces {
        builder.add_space(space).await?;
    }
    builder.add_shared_objects().await?;
    builder.add_materials().await?;
    let graph = builder.finish();
    log::info!("Local catalog graph has {} entities", graph.len());
    Ok(graph)
}

/// Builds the graph of everything a resource list declares.
///
/// Records not reachable from a space or from a shared object are swept in after the
/// walk so that every record has a node.
pub async fn incoming_graph(list: &ResourceList) -> Result<EntityGraph> {
    let source = DocumentEntitySource::new(list);
    let mut builder = GraphBuilder::new(&source);
    for space in &list.spaces {
        builder.add_space(space).await?;
    }
    builder.add_shared_objects().await?;
    builder.add_materials().await?;
    let unreached: Vec<EntityNode> = list
        .entities
        .values()
        .flat_map(|records| records.values())
        .filter(|record| !builder.contains(&record.node.perm_id))
        .map(|record| record.node.clone())
        .collect();
    if !unreached.is_empty() {
        log::debug!("{} records are not reachable from a space", unreached.len());
    }
    builder.expand(unreached).await?;
    Ok(builder.finish())
}

/// Walks the local catalog through its search interface.
pub struct StoreEntitySource {
    catalog: Arc<dyn CatalogStore>,
}

impl StoreEntitySource {
    pub fn new(catalog: Arc<dyn CatalogStore>) -> Self {
        Self { catalog }
    }

    async fn search(&self, criteria: SearchCriteria) -> Result<Vec<EntityNode>> {
        self.catalog.search(&criteria, FetchOptions::metadata()).await
    }
}

#[async_trait]
impl EntitySource for StoreEntitySource {
    async fn space(&self, code: &str) -> Result<Vec<EntityNode>> {
        let mut roots = self
            .search(SearchCriteria::ProjectsInSpace(code.to_string()))
            .await?;
        roots.extend(
            self.search(SearchCriteria::ObjectsInSpace(code.to_string()))
                .await?,
        );
        Ok(roots)
    }

    async fn owned(&self, node: &EntityNode) -> Result<Vec<EntityNode>> {
        let id = node.identifier.clone();
        match &node.details {
            EntityDetails::Project { .. } => {
                self.search(SearchCriteria::CollectionsInProject(id)).await
            }
            EntityDetails::Collection { .. } => {
                let mut owned = self
                    .search(SearchCriteria::ObjectsInCollection(id.clone()))
                    .await?;
                owned.extend(self.search(SearchCriteria::DataSetsInCollection(id)).await?);
                Ok(owned)
            }
            EntityDetails::Object { .. } => self.search(SearchCriteria::DataSetsOfObject(id)).await,
            EntityDetails::Space | EntityDetails::DataSet(_) | EntityDetails::Material => {
                Ok(Vec::new())
            }
        }
    }

    async fn children(&self, node: &EntityNode) -> Result<Vec<EntityNode>> {
        self.search(SearchCriteria::ChildrenOf(node.kind(), node.perm_id.clone()))
            .await
    }

    async fn components(&self, node: &EntityNode) -> Result<Vec<EntityNode>> {
        self.search(SearchCriteria::ComponentsOf(node.kind(), node.perm_id.clone()))
            .await
    }

    async fn shared_objects(&self) -> Result<Vec<EntityNode>> {
        self.search(SearchCriteria::SharedObjects).await
    }

    async fn materials(&self) -> Result<Vec<EntityNode>> {
        self.search(SearchCriteria::AllOfKind(EntityKind::Material))
            .await
    }
}

/// Walks a parsed resource list using the connections each record declares.
pub struct DocumentEntitySource<'a> {
    list: &'a ResourceList,
    connections: HashMap<&'a PermId, Vec<(&'a PermId, EdgeKind)>>,
}

impl<'a> DocumentEntitySource<'a> {
    pub fn new(list: &'a ResourceList) -> Self {
        let mut connections: HashMap<&PermId, Vec<(&PermId, EdgeKind)>> = HashMap::new();
        for record in list.entities.values().flat_map(|records| records.values()) {
            let targets = connections.entry(&record.node.perm_id).or_default();
            for connection in &record.connections {
                targets.push((&connection.to, connection.kind));
            }
        }
        Self { list, connections }
    }

    fn targets(&self, node: &EntityNode, kind: EdgeKind) -> Vec<EntityNode> {
        let Some(targets) = self.connections.get(&node.perm_id) else {
            return Vec::new();
        };
        targets
            .iter()
            .filter(|(_, edge)| *edge == kind)
            .filter_map(|(to, _)| match self.list.get(to) {
                Some(record) => Some(record.node.clone()),
                None => {
                    log::warn!(
                        "{} {} declares a connection to {to}, which is not in the resource list; ignoring it",
                        node.kind(),
                        node.perm_id
                    );
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl<'a> EntitySource for DocumentEntitySource<'a> {
    async fn space(&self, code: &str) -> Result<Vec<EntityNode>> {
        let projects = self
            .list
            .of_kind(EntityKind::Project)
            .filter(|record| record.node.space_code() == Some(code));
        let loose_objects = self.list.of_kind(EntityKind::Object).filter(|record| {
            matches!(
                &record.node.details,
                EntityDetails::Object { space: Some(space), collection: None, .. } if space == code
            )
        });
        Ok(projects
            .chain(loose_objects)
            .map(|record| record.node.clone())
            .collect())
    }

    async fn owned(&self, node: &EntityNode) -> Result<Vec<EntityNode>> {
        Ok(self.targets(node, EdgeKind::Connection))
    }

    async fn children(&self, node: &EntityNode) -> Result<Vec<EntityNode>> {
        Ok(self.targets(node, EdgeKind::Child))
    }

    async fn components(&self, node: &EntityNode) -> Result<Vec<EntityNode>> {
        Ok(self.targets(node, EdgeKind::Component))
    }

    async fn shared_objects(&self) -> Result<Vec<EntityNode>> {
        Ok(self
            .list
            .of_kind(EntityKind::Object)
            .filter(|record| record.node.space_code().is_none())
            .map(|record| record.node.clone())
            .collect())
    }

    async fn materials(&self) -> Result<Vec<EntityNode>> {
        Ok(self
            .list
            .of_kind(EntityKind::Material)
            .map(|record| record.node.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Connection, IncomingEntity};
    use chrono::Utc;

    fn record(node: EntityNode, connections: &[(&str, EdgeKind)]) -> IncomingEntity {
        IncomingEntity {
            node,
            connections: connections
                .iter()
                .map(|(to, kind)| Connection {
                    to: PermId::from(*to),
                    kind: *kind,
                })
                .collect(),
            attachments: Vec::new(),
        }
    }

    fn project(id: &str) -> EntityNode {
        EntityNode::new(
            id,
            id,
            format!("/LAB/{id}"),
            EntityDetails::Project {
                space: "LAB".into(),
            },
            Utc::now(),
        )
    }

    fn object(id: &str, space: Option<&str>) -> EntityNode {
        EntityNode::new(
            id,
            id,
            format!("/{id}"),
            EntityDetails::Object {
                space: space.map(str::to_string),
                project: None,
                collection: None,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn incoming_graph_drops_dangling_connections_and_sweeps_shared_objects() {
        let mut list = ResourceList::default();
        list.spaces.insert("LAB".into());
        for entity in [
            record(project("P"), &[("GONE", EdgeKind::Connection)]),
            record(object("A", Some("LAB")), &[("SHARED", EdgeKind::Child)]),
            record(object("SHARED", None), &[]),
            record(object("LONER", None), &[("SHARED", EdgeKind::Component)]),
        ] {
            list.entities
                .entry(entity.node.kind())
                .or_default()
                .insert(entity.node.perm_id.clone(), entity);
        }

        let graph = incoming_graph(&list).await.unwrap();
        assert_eq!(graph.len(), 4);
        assert!(!graph.contains(&PermId::from("GONE")));
        let shared = PermId::from("SHARED");
        assert_eq!(graph.parents(&shared).len(), 1);
        assert_eq!(graph.containers(&shared).len(), 1);
    }
}
