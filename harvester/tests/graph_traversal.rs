mod common;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use common::pid;
use harvester::{
    attachments::AttachmentUpdate,
    document::ResourceListReader,
    master_data::{MasterData, MasterDataOp},
    memory::MemoryCatalog,
    models::{Attachment, EntityDetails, EntityKind, EntityNode, PermId},
    retriever::{incoming_graph, local_graph},
    store::{
        CatalogStore, DeletionId, FetchOptions, MetadataBatch, RelationshipUpdate, SearchCriteria,
    },
    translate::NameTranslator,
};

/// Counts the lineage queries a traversal issues, per entity.
struct CountingCatalog {
    inner: MemoryCatalog,
    lineage_queries: Mutex<HashMap<String, usize>>,
}

impl CountingCatalog {
    fn queries(&self) -> HashMap<String, usize> {
        self.lineage_queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl CatalogStore for CountingCatalog {
    async fn search(
        &self,
        criteria: &SearchCriteria,
        options: FetchOptions,
    ) -> harvester::Result<Vec<EntityNode>> {
        let key = match criteria {
            SearchCriteria::ChildrenOf(_, id) => Some(format!("children:{id}")),
            SearchCriteria::ComponentsOf(_, id) => Some(format!("components:{id}")),
            _ => None,
        };
        if let Some(key) = key {
            *self.lineage_queries.lock().unwrap().entry(key).or_default() += 1;
        }
        self.inner.search(criteria, options).await
    }

    async fn get(
        &self,
        kind: EntityKind,
        perm_ids: &[PermId],
        options: FetchOptions,
    ) -> harvester::Result<Vec<EntityNode>> {
        self.inner.get(kind, perm_ids, options).await
    }

    async fn master_data(&self) -> harvester::Result<MasterData> {
        self.inner.master_data().await
    }

    async fn apply_master_data(&self, op: &MasterDataOp) -> harvester::Result<()> {
        self.inner.apply_master_data(op).await
    }

    async fn create_spaces(&self, spaces: &[EntityNode]) -> harvester::Result<()> {
        self.inner.create_spaces(spaces).await
    }

    async fn apply_batch(&self, batch: &MetadataBatch) -> harvester::Result<()> {
        self.inner.apply_batch(batch).await
    }

    async fn apply_relationships(&self, updates: &[RelationshipUpdate]) -> harvester::Result<()> {
        self.inner.apply_relationships(updates).await
    }

    async fn attachments(&self, perm_id: &PermId) -> harvester::Result<Vec<Attachment>> {
        self.inner.attachments(perm_id).await
    }

    async fn update_attachments(&self, update: &AttachmentUpdate) -> harvester::Result<()> {
        self.inner.update_attachments(update).await
    }

    async fn propose_deletion(
        &self,
        kind: EntityKind,
        perm_ids: &[PermId],
        reason: &str,
    ) -> harvester::Result<DeletionId> {
        self.inner.propose_deletion(kind, perm_ids, reason).await
    }

    async fn confirm_deletion(&self, id: &DeletionId) -> harvester::Result<()> {
        self.inner.confirm_deletion(id).await
    }
}

fn loose_object(perm_id: &str, code: &str) -> EntityNode {
    EntityNode::new(
        perm_id,
        code,
        format!("/LAB/{code}"),
        EntityDetails::Object {
            space: Some("LAB".into()),
            project: None,
            collection: None,
        },
        Utc::now(),
    )
    .with_type("CELL")
}

fn counting(inner: MemoryCatalog) -> Arc<CountingCatalog> {
    Arc::new(CountingCatalog {
        inner,
        lineage_queries: Mutex::new(HashMap::new()),
    })
}

/// A space with loose objects A, B, C and D.
fn diamond_catalog() -> anyhow::Result<(MemoryCatalog, [String; 4])> {
    let inner = MemoryCatalog::new();
    inner.insert(EntityNode::space("LAB", Utc::now()))?;
    let ids = [pid(1), pid(2), pid(3), pid(4)];
    for (id, code) in ids.iter().zip(["A", "B", "C", "D"]) {
        inner.insert(loose_object(id, code))?;
    }
    Ok((inner, ids))
}

#[tokio::test]
async fn diamond_lineage_is_walked_once_per_node() -> anyhow::Result<()> {
    let (inner, [a, b, c, d]) = diamond_catalog()?;
    inner.set_parents(&PermId::from(b.as_str()), &[a.as_str()])?;
    inner.set_parents(&PermId::from(c.as_str()), &[a.as_str()])?;
    inner.set_parents(&PermId::from(d.as_str()), &[b.as_str(), c.as_str()])?;
    let catalog = counting(inner);

    let graph = local_graph(catalog.clone(), &BTreeSet::from(["LAB".to_string()])).await?;

    assert_eq!(graph.len(), 4);
    assert_eq!(graph.edge_count(), 4);
    let d_parents: BTreeSet<&str> = graph
        .parents(&PermId::from(d.as_str()))
        .into_iter()
        .map(|node| node.code.as_str())
        .collect();
    assert_eq!(d_parents, BTreeSet::from(["B", "C"]));

    let queries = catalog.queries();
    assert_eq!(queries.len(), 8, "{queries:?}");
    assert!(queries.values().all(|count| *count == 1), "{queries:?}");
    Ok(())
}

#[tokio::test]
async fn diamond_containment_is_walked_once_per_node() -> anyhow::Result<()> {
    let (inner, [a, b, c, d]) = diamond_catalog()?;
    inner.set_components(&PermId::from(a.as_str()), &[b.as_str(), c.as_str()])?;
    inner.set_components(&PermId::from(b.as_str()), &[d.as_str()])?;
    inner.set_components(&PermId::from(c.as_str()), &[d.as_str()])?;
    let catalog = counting(inner);

    let graph = local_graph(catalog.clone(), &BTreeSet::from(["LAB".to_string()])).await?;

    assert_eq!(graph.len(), 4);
    assert_eq!(graph.edge_count(), 4);
    let d_containers: BTreeSet<&str> = graph
        .containers(&PermId::from(d.as_str()))
        .into_iter()
        .map(|node| node.code.as_str())
        .collect();
    assert_eq!(d_containers, BTreeSet::from(["B", "C"]));
    assert!(graph.parents(&PermId::from(d.as_str())).is_empty());

    let queries = catalog.queries();
    assert_eq!(queries.len(), 8, "{queries:?}");
    assert!(queries.values().all(|count| *count == 1), "{queries:?}");
    Ok(())
}

#[tokio::test]
async fn local_graph_includes_objects_without_a_space() -> anyhow::Result<()> {
    let inner = MemoryCatalog::new();
    inner.insert(EntityNode::space("LAB", Utc::now()))?;
    inner.insert(loose_object(&pid(1), "A"))?;
    let shared = EntityNode::new(
        pid(9),
        "SHARED",
        "/SHARED",
        EntityDetails::Object {
            space: None,
            project: None,
            collection: None,
        },
        Utc::now(),
    )
    .with_type("CELL");
    inner.insert(shared)?;
    inner.set_parents(&PermId::from(pid(1)), &[pid(9).as_str()])?;

    let graph = local_graph(counting(inner), &BTreeSet::from(["LAB".to_string()])).await?;

    assert_eq!(graph.len(), 2);
    let parents: Vec<&str> = graph
        .parents(&PermId::from(pid(1)))
        .into_iter()
        .map(|node| node.code.as_str())
        .collect();
    assert_eq!(parents, vec!["SHARED"]);
    Ok(())
}

#[tokio::test]
async fn incoming_graph_keeps_records_outside_any_space() -> anyhow::Result<()> {
    let shared = common::Entry::new_shared_object(&pid(9), "SHARED");
    let child = common::Entry::object(&pid(10), "S1", "LAB", "PRJ1", "EXP1", "2024-05-01T10:00:00Z");
    let document = common::resource_list(
        "2024-05-01T12:00:00Z",
        &[shared.connect(&pid(10), "Child"), child],
    );
    let list = ResourceListReader::new(NameTranslator::Identity).read(&document)?;

    let graph = incoming_graph(&list).await?;

    assert!(graph.contains(&PermId::from(pid(9))));
    let children: Vec<&str> = graph
        .children(&PermId::from(pid(9)))
        .into_iter()
        .map(|node| node.code.as_str())
        .collect();
    assert_eq!(children, vec!["S1"]);
    Ok(())
}
