use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::attachments::AttachmentUpdate;
use crate::config::StatePaths;
use crate::errors::{Result, SyncError};
use crate::master_data::{MasterData, MasterDataOp};
use crate::memory::{owner_identifier, without_blank_properties};
use crate::models::{Attachment, EntityKind, EntityNode, FileManifest, PermId};
use crate::store::{
    CatalogStore, ContentStore, DeletionId, FetchOptions, MetadataBatch, RelationshipUpdate,
    SearchCriteria,
};

const CHILD: &str = "CHILD";
const COMPONENT: &str = "COMPONENT";

/// Local catalog persisted in a SQLite database. Entities are stored as JSON bodies.
pub struct SqliteCatalog {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCatalog {
    pub fn new(paths: &StatePaths) -> Result<Self> {
        Self::open(&paths.catalog_path)
    }

    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let catalog = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        catalog.initialize_schema()?;
        Ok(catalog)
    }

    pub fn in_memory() -> Result<Self> {
        let catalog = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        catalog.initialize_schema()?;
        Ok(catalog)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::store("catalog connection lock poisoned"))
    }

    pub fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS entities (
                perm_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                identifier TEXT NOT NULL,
                body TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS entities_kind ON entities (kind);
            CREATE INDEX IF NOT EXISTS entities_identifier ON entities (identifier);
            CREATE TABLE IF NOT EXISTS relations (
                from_id TEXT NOT NULL,
                to_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                PRIMARY KEY (from_id, to_id, kind)
            );
            CREATE TABLE IF NOT EXISTS master_data (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                body TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS files (
                perm_id TEXT PRIMARY KEY,
                manifest TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS attachments (
                perm_id TEXT NOT NULL,
                file_name TEXT NOT NULL,
                version INTEGER NOT NULL,
                title TEXT,
                description TEXT,
                permlink TEXT,
                PRIMARY KEY (perm_id, file_name)
            );
            CREATE TABLE IF NOT EXISTS trash (
                deletion_id TEXT NOT NULL,
                perm_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                identifier TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (deletion_id, perm_id)
            );
            CREATE TABLE IF NOT EXISTS deletions (
                deletion_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                perm_ids TEXT NOT NULL,
                reason TEXT NOT NULL,
                proposed_at INTEGER NOT NULL,
                confirmed_at INTEGER
            );
            COMMIT;",
        )?;
        Ok(())
    }

    /// Number of live entities per kind.
    pub fn counts(&self) -> Result<Vec<(EntityKind, usize)>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT kind, COUNT(*) FROM entities GROUP BY kind ORDER BY kind")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut counts = Vec::new();
        for row in rows {
            let (kind, count) = row?;
            counts.push((kind.parse()?, count as usize));
        }
        Ok(counts)
    }

    /// Entities waiting in the trash for a confirmation.
    pub fn trashed(&self) -> Result<Vec<PermId>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT perm_id FROM trash ORDER BY perm_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(PermId::from)
            .collect())
    }
}

fn decode_nodes(bodies: Vec<String>, options: FetchOptions) -> Result<Vec<EntityNode>> {
    bodies
        .iter()
        .map(|body| Ok(options.shape(serde_json::from_str(body)?)))
        .collect()
}

fn query_bodies(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn live_kind(tx: &Transaction, perm_id: &PermId) -> Result<Option<EntityKind>> {
    let kind: Option<String> = tx
        .query_row(
            "SELECT kind FROM entities WHERE perm_id = ?1",
            params![perm_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    kind.map(|k| k.parse()).transpose()
}

fn load_master_data(conn: &Connection) -> Result<MasterData> {
    let body: Option<String> = conn
        .query_row("SELECT body FROM master_data WHERE id = 1", [], |row| row.get(0))
        .optional()?;
    match body {
        Some(body) => Ok(serde_json::from_str(&body)?),
        None => Ok(MasterData::default()),
    }
}

fn relation_kind(criteria: &SearchCriteria) -> Option<(&'static str, &PermId)> {
    match criteria {
        SearchCriteria::ChildrenOf(_, id) => Some((CHILD, id)),
        SearchCriteria::ComponentsOf(_, id) => Some((COMPONENT, id)),
        _ => None,
    }
}

fn searched_kind(criteria: &SearchCriteria) -> EntityKind {
    match criteria {
        SearchCriteria::ProjectsInSpace(_) => EntityKind::Project,
        SearchCriteria::CollectionsInProject(_) => EntityKind::Collection,
        SearchCriteria::ObjectsInCollection(_)
        | SearchCriteria::ObjectsInSpace(_)
        | SearchCriteria::SharedObjects => EntityKind::Object,
        SearchCriteria::DataSetsInCollection(_) | SearchCriteria::DataSetsOfObject(_) => {
            EntityKind::DataSet
        }
        SearchCriteria::ChildrenOf(kind, _)
        | SearchCriteria::ComponentsOf(kind, _)
        | SearchCriteria::AllOfKind(kind) => *kind,
    }
}

#[async_trait]
impl CatalogStore for SqliteCatalog {
    async fn search(
        &self,
        criteria: &SearchCriteria,
        options: FetchOptions,
    ) -> Result<Vec<EntityNode>> {
        let conn = self.lock()?;
        if let Some((relation, from)) = relation_kind(criteria) {
            let bodies = query_bodies(
                &conn,
                "SELECT e.body FROM relations r JOIN entities e ON e.perm_id = r.to_id
                 WHERE r.from_id = ?1 AND r.kind = ?2 ORDER BY e.perm_id",
                params![from.as_str(), relation],
            )?;
            return decode_nodes(bodies, options);
        }
        let bodies = query_bodies(
            &conn,
            "SELECT body FROM entities WHERE kind = ?1 ORDER BY perm_id",
            params![searched_kind(criteria).as_str()],
        )?;
        Ok(decode_nodes(bodies, FetchOptions::all())?
            .into_iter()
            .filter(|node| criteria.matches_owner(node))
            .map(|node| options.shape(node))
            .collect())
    }

    async fn get(
        &self,
        kind: EntityKind,
        perm_ids: &[PermId],
        options: FetchOptions,
    ) -> Result<Vec<EntityNode>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT body FROM entities WHERE perm_id = ?1 AND kind = ?2")?;
        let mut bodies = Vec::new();
        for perm_id in perm_ids {
            if let Some(body) = stmt
                .query_row(params![perm_id.as_str(), kind.as_str()], |row| {
                    row.get::<_, String>(0)
                })
                .optional()?
            {
                bodies.push(body);
            }
        }
        decode_nodes(bodies, options)
    }

    async fn master_data(&self) -> Result<MasterData> {
        load_master_data(&*self.lock()?)
    }

    async fn apply_master_data(&self, op: &MasterDataOp) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut master_data = load_master_data(&tx)?;
        master_data.apply(op)?;
        tx.execute(
            "INSERT INTO master_data (id, body) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET body = excluded.body",
            params![serde_json::to_string(&master_data)?],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn create_spaces(&self, spaces: &[EntityNode]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for space in spaces {
            tx.execute(
                "INSERT OR IGNORE INTO entities (perm_id, kind, identifier, body) VALUES (?1, ?2, ?3, ?4)",
                params![
                    space.perm_id.as_str(),
                    EntityKind::Space.as_str(),
                    space.identifier,
                    serde_json::to_string(space)?
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn apply_batch(&self, batch: &MetadataBatch) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        for node in &batch.creations {
            tx.execute(
                "INSERT INTO entities (perm_id, kind, identifier, body) VALUES (?1, ?2, ?3, ?4)",
                params![
                    node.perm_id.as_str(),
                    node.kind().as_str(),
                    node.identifier,
                    serde_json::to_string(&without_blank_properties(node.clone()))?
                ],
            )
            .map_err(|err| {
                SyncError::store(format!("cannot create {} {}: {err}", node.kind(), node.perm_id))
            })?;
        }
        for update in &batch.updates {
            let node = &update.node;
            if live_kind(&tx, &node.perm_id)? != Some(node.kind()) {
                return Err(SyncError::NotFound(format!("{} {}", node.kind(), node.perm_id)));
            }
            tx.execute(
                "UPDATE entities SET identifier = ?2, body = ?3 WHERE perm_id = ?1",
                params![
                    node.perm_id.as_str(),
                    node.identifier,
                    serde_json::to_string(&without_blank_properties(node.clone()))?
                ],
            )?;
        }
        for node in batch.creations.iter().chain(batch.updates.iter().map(|u| &u.node)) {
            if let Some(owner) = owner_identifier(node) {
                let found: Option<i64> = tx
                    .query_row(
                        "SELECT 1 FROM entities WHERE identifier = ?1",
                        params![owner],
                        |row| row.get(0),
                    )
                    .optional()?;
                if found.is_none() {
                    return Err(SyncError::store(format!(
                        "{} {} refers to missing owner {owner}",
                        node.kind(),
                        node.perm_id
                    )));
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn apply_relationships(&self, updates: &[RelationshipUpdate]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for update in updates {
            let endpoints = std::iter::once(&update.perm_id)
                .chain(&update.parents)
                .chain(&update.contained);
            for id in endpoints {
                if live_kind(&tx, id)?.is_none() {
                    return Err(SyncError::NotFound(format!("relationship endpoint {id}")));
                }
            }
            let id = update.perm_id.as_str();
            tx.execute(
                "DELETE FROM relations WHERE to_id = ?1 AND kind = ?2",
                params![id, CHILD],
            )?;
            for parent in &update.parents {
                tx.execute(
                    "INSERT INTO relations (from_id, to_id, kind) VALUES (?1, ?2, ?3)",
                    params![parent.as_str(), id, CHILD],
                )?;
            }
            tx.execute(
                "DELETE FROM relations WHERE from_id = ?1 AND kind = ?2",
                params![id, COMPONENT],
            )?;
            for component in &update.contained {
                tx.execute(
                    "INSERT INTO relations (from_id, to_id, kind) VALUES (?1, ?2, ?3)",
                    params![id, component.as_str(), COMPONENT],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn attachments(&self, perm_id: &PermId) -> Result<Vec<Attachment>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT file_name, version, title, description, permlink FROM attachments
             WHERE perm_id = ?1 ORDER BY file_name",
        )?;
        let rows = stmt.query_map(params![perm_id.as_str()], |row| {
            Ok(Attachment {
                file_name: row.get(0)?,
                version: row.get(1)?,
                title: row.get(2)?,
                description: row.get(3)?,
                permlink: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn update_attachments(&self, update: &AttachmentUpdate) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if live_kind(&tx, &update.perm_id)? != Some(update.kind) {
            return Err(SyncError::NotFound(format!(
                "attachment holder {} {}",
                update.kind, update.perm_id
            )));
        }
        let id = update.perm_id.as_str();
        for file_name in &update.removals {
            tx.execute(
                "DELETE FROM attachments WHERE perm_id = ?1 AND file_name = ?2",
                params![id, file_name],
            )?;
        }
        for attachment in &update.upserts {
            tx.execute(
                "INSERT INTO attachments (perm_id, file_name, version, title, description, permlink)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(perm_id, file_name) DO UPDATE SET version = excluded.version,
                 title = excluded.title, description = excluded.description,
                 permlink = excluded.permlink",
                params![
                    id,
                    attachment.file_name,
                    attachment.version,
                    attachment.title,
                    attachment.description,
                    attachment.permlink
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn propose_deletion(
        &self,
        kind: EntityKind,
        perm_ids: &[PermId],
        reason: &str,
    ) -> Result<DeletionId> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut missing = Vec::new();
        for perm_id in perm_ids {
            if live_kind(&tx, perm_id)? != Some(kind) {
                missing.push(perm_id.to_string());
            }
        }
        if !missing.is_empty() {
            return Err(SyncError::Deletion {
                perm_ids: missing,
                reason: format!("no such {}", kind.plural()),
            });
        }
        let id = DeletionId(Uuid::new_v4().to_string());
        for perm_id in perm_ids {
            tx.execute(
                "INSERT INTO trash (deletion_id, perm_id, kind, identifier, body)
                 SELECT ?1, perm_id, kind, identifier, body FROM entities WHERE perm_id = ?2",
                params![id.0, perm_id.as_str()],
            )?;
            tx.execute(
                "DELETE FROM entities WHERE perm_id = ?1",
                params![perm_id.as_str()],
            )?;
        }
        tx.execute(
            "INSERT INTO deletions (deletion_id, kind, perm_ids, reason, proposed_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.0,
                kind.as_str(),
                serde_json::to_string(perm_ids)?,
                reason,
                Utc::now().timestamp()
            ],
        )?;
        tx.commit()?;
        Ok(id)
    }

    async fn confirm_deletion(&self, id: &DeletionId) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let row: Option<(String, Option<i64>)> = tx
            .query_row(
                "SELECT perm_ids, confirmed_at FROM deletions WHERE deletion_id = ?1",
                params![id.0],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (perm_ids, confirmed_at) =
            row.ok_or_else(|| SyncError::NotFound(format!("deletion {id}")))?;
        let perm_ids: Vec<PermId> = serde_json::from_str(&perm_ids)?;
        if confirmed_at.is_some() {
            return Err(SyncError::Deletion {
                perm_ids: perm_ids.iter().map(PermId::to_string).collect(),
                reason: format!("deletion {id} is already confirmed"),
            });
        }
        for perm_id in &perm_ids {
            tx.execute(
                "DELETE FROM trash WHERE deletion_id = ?1 AND perm_id = ?2",
                params![id.0, perm_id.as_str()],
            )?;
            // a recreated entity under the same permId keeps its files, attachments and relations
            if live_kind(&tx, perm_id)?.is_some() {
                continue;
            }
            tx.execute("DELETE FROM files WHERE perm_id = ?1", params![perm_id.as_str()])?;
            tx.execute(
                "DELETE FROM attachments WHERE perm_id = ?1",
                params![perm_id.as_str()],
            )?;
            tx.execute(
                "DELETE FROM relations WHERE from_id = ?1 OR to_id = ?1",
                params![perm_id.as_str()],
            )?;
        }
        tx.execute(
            "UPDATE deletions SET confirmed_at = ?2 WHERE deletion_id = ?1",
            params![id.0, Utc::now().timestamp()],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[async_trait]
impl ContentStore for SqliteCatalog {
    async fn list_files(&self, perm_id: &PermId) -> Result<FileManifest> {
        let conn = self.lock()?;
        let manifest: Option<String> = conn
            .query_row(
                "SELECT manifest FROM files WHERE perm_id = ?1",
                params![perm_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match manifest {
            Some(manifest) => Ok(serde_json::from_str(&manifest)?),
            None => Err(SyncError::NotFound(format!("no files registered for {perm_id}"))),
        }
    }

    async fn register_physical_data(
        &self,
        node: &EntityNode,
        manifest: &FileManifest,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO files (perm_id, manifest) VALUES (?1, ?2)
             ON CONFLICT(perm_id) DO UPDATE SET manifest = excluded.manifest",
            params![node.perm_id.as_str(), serde_json::to_string(manifest)?],
        )?;
        Ok(())
    }
}
