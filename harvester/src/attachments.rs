//! Attachment lists of projects, collections and objects.
//!
//! Attachments are synchronized after the metadata batch, one holder at a time, by comparing
//! the published list with what the local catalog keeps for the same holder.

use std::collections::BTreeMap;

use crate::document::IncomingEntity;
use crate::models::{Attachment, EntityKind, PermId};
use crate::summary::ChangeCounts;

/// Attachments one holder publishes on the data source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentHolder {
    pub kind: EntityKind,
    pub perm_id: PermId,
    pub attachments: Vec<Attachment>,
}

impl From<&IncomingEntity> for AttachmentHolder {
    fn from(record: &IncomingEntity) -> Self {
        Self {
            kind: record.node.kind(),
            perm_id: record.node.perm_id.clone(),
            attachments: record.attachments.clone(),
        }
    }
}

/// Writes that bring the local attachment list of one holder in line with the data source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentUpdate {
    pub kind: EntityKind,
    pub perm_id: PermId,
    /// Stored under their file name, replacing any previous entry.
    pub upserts: Vec<Attachment>,
    /// File names to drop.
    pub removals: Vec<String>,
    pub counts: ChangeCounts,
}

impl AttachmentUpdate {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }
}

/// Compares a published attachment list with the local one.
///
/// A newer published version is an addition. An older one means the file was replaced on the
/// data source and counts as an update, as does a changed title or description at the same
/// version. Local files the data source no longer lists are removed.
pub fn attachment_update(holder: &AttachmentHolder, existing: &[Attachment]) -> AttachmentUpdate {
    let local: BTreeMap<&str, &Attachment> = existing
        .iter()
        .map(|attachment| (attachment.file_name.as_str(), attachment))
        .collect();
    let mut update = AttachmentUpdate {
        kind: holder.kind,
        perm_id: holder.perm_id.clone(),
        upserts: Vec::new(),
        removals: Vec::new(),
        counts: ChangeCounts::default(),
    };

    for published in &holder.attachments {
        match local.get(published.file_name.as_str()) {
            None => {
                update.counts.added += 1;
                update.upserts.push(published.clone());
            }
            Some(current) if published.version > current.version => {
                update.counts.added += 1;
                update.upserts.push(published.clone());
            }
            Some(current) if published.version < current.version => {
                update.counts.updated += 1;
                update.upserts.push(published.clone());
            }
            Some(current) => {
                if current.title != published.title || current.description != published.description {
                    update.counts.updated += 1;
                    update.upserts.push(published.clone());
                }
            }
        }
    }

    for file_name in local.keys() {
        if !holder
            .attachments
            .iter()
            .any(|published| published.file_name == *file_name)
        {
            update.counts.removed += 1;
            update.removals.push(file_name.to_string());
        }
    }
    update
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(name: &str, version: u32, title: Option<&str>) -> Attachment {
        Attachment {
            file_name: name.to_string(),
            version,
            title: title.map(str::to_string),
            description: None,
            permlink: None,
        }
    }

    fn holder(attachments: Vec<Attachment>) -> AttachmentHolder {
        AttachmentHolder {
            kind: EntityKind::Project,
            perm_id: PermId::from("P1"),
            attachments,
        }
    }

    #[test]
    fn versions_and_titles_decide_the_change() {
        let existing = vec![
            attachment("same.txt", 2, Some("a")),
            attachment("retitled.txt", 1, Some("old")),
            attachment("newer.txt", 1, None),
            attachment("older.txt", 4, None),
            attachment("gone.txt", 1, None),
        ];
        let published = holder(vec![
            attachment("same.txt", 2, Some("a")),
            attachment("retitled.txt", 1, Some("new")),
            attachment("newer.txt", 3, None),
            attachment("older.txt", 2, None),
            attachment("fresh.txt", 1, None),
        ]);

        let update = attachment_update(&published, &existing);

        let upserted: Vec<&str> = update.upserts.iter().map(|a| a.file_name.as_str()).collect();
        assert_eq!(upserted, vec!["retitled.txt", "newer.txt", "older.txt", "fresh.txt"]);
        assert_eq!(update.removals, vec!["gone.txt".to_string()]);
        assert_eq!(
            update.counts,
            ChangeCounts {
                added: 2,
                updated: 2,
                removed: 1
            }
        );
    }

    #[test]
    fn empty_list_clears_local_attachments() {
        let update = attachment_update(&holder(Vec::new()), &[attachment("a.txt", 1, None)]);
        assert!(update.upserts.is_empty());
        assert_eq!(update.removals, vec!["a.txt".to_string()]);

        let update = attachment_update(&holder(Vec::new()), &[]);
        assert!(update.is_empty());
    }
}
