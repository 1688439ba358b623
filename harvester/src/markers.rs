use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::StatePaths;
use crate::errors::Result;
use crate::models::{EntityKind, PermId};
use crate::xml::parse_timestamp;

const BLACKLIST_MARK: char = '#';

/// Entities left over from earlier runs, one `<KIND>-<permId>` line each.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotSynced {
    /// Failed data set registrations, attempted again on the next run.
    pub retry: BTreeSet<PermId>,
    /// Data sets excluded for good; only ever edited by hand.
    pub blacklist: BTreeSet<PermId>,
    /// Projects, collections and objects whose attachments failed to synchronize.
    pub attachment_retry: BTreeMap<PermId, EntityKind>,
}

impl NotSynced {
    fn parse(content: &str) -> Self {
        let mut not_synced = NotSynced::default();
        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (blacklisted, entry) = match line.strip_prefix(BLACKLIST_MARK) {
                Some(rest) => (true, rest.trim()),
                None => (false, line),
            };
            let parsed = entry
                .split_once('-')
                .filter(|(_, code)| !code.is_empty())
                .and_then(|(kind, code)| Some((kind.parse::<EntityKind>().ok()?, code)));
            match parsed {
                Some((EntityKind::DataSet, code)) if blacklisted => {
                    not_synced.blacklist.insert(PermId::new(code));
                }
                Some((EntityKind::DataSet, code)) => {
                    not_synced.retry.insert(PermId::new(code));
                }
                Some((kind, code)) if kind.holds_attachments() && !blacklisted => {
                    not_synced.attachment_retry.insert(PermId::new(code), kind);
                }
                _ => log::warn!("Ignoring unrecognised not-synced entry '{line}'"),
            }
        }
        not_synced
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for id in &self.retry {
            out.push_str(&format!("{}-{id}\n", EntityKind::DataSet));
        }
        for (id, kind) in &self.attachment_retry {
            out.push_str(&format!("{kind}-{id}\n"));
        }
        for id in &self.blacklist {
            out.push_str(&format!("{BLACKLIST_MARK}{}-{id}\n", EntityKind::DataSet));
        }
        out
    }
}

/// Reads and rewrites the small state files kept between runs.
pub struct MarkerFiles {
    paths: StatePaths,
}

impl MarkerFiles {
    pub fn new(paths: StatePaths) -> Self {
        Self { paths }
    }

    /// The boundary of the previous successful run; `None` before the first one.
    pub fn read_last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        match read_optional(&self.paths.last_sync_timestamp)? {
            Some(content) if !content.trim().is_empty() => Ok(Some(parse_timestamp(&content)?)),
            _ => Ok(None),
        }
    }

    pub fn write_last_sync(&self, timestamp: DateTime<Utc>) -> Result<()> {
        let line = format!("{}\n", timestamp.to_rfc3339_opts(SecondsFormat::Millis, true));
        replace_file(&self.paths.last_sync_timestamp, &line)
    }

    pub fn read_not_synced(&self) -> Result<NotSynced> {
        Ok(read_optional(&self.paths.not_synced_entities)?
            .map(|content| NotSynced::parse(&content))
            .unwrap_or_default())
    }

    pub fn write_not_synced(&self, not_synced: &NotSynced) -> Result<()> {
        replace_file(&self.paths.not_synced_entities, &not_synced.render())
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Backs up the current file to `.bk`, writes `.tmp`, then renames it into place.
fn replace_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if path.exists() {
        fs::copy(path, with_suffix(path, ".bk"))?;
    }
    let tmp = with_suffix(path, ".tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_files_mean_first_run() {
        let dir = tempdir().unwrap();
        let markers = MarkerFiles::new(StatePaths::new(dir.path()));
        assert_eq!(markers.read_last_sync().unwrap(), None);
        assert_eq!(markers.read_not_synced().unwrap(), NotSynced::default());
    }

    #[test]
    fn rewrites_keep_a_backup() {
        let dir = tempdir().unwrap();
        let paths = StatePaths::new(dir.path().join("state"));
        let markers = MarkerFiles::new(paths.clone());

        let first = parse_timestamp("2024-05-01T10:00:00Z").unwrap();
        let second = parse_timestamp("2024-05-02T10:00:00Z").unwrap();
        markers.write_last_sync(first).unwrap();
        markers.write_last_sync(second).unwrap();

        assert_eq!(markers.read_last_sync().unwrap(), Some(second));
        let backup = fs::read_to_string(with_suffix(&paths.last_sync_timestamp, ".bk")).unwrap();
        assert_eq!(parse_timestamp(&backup).unwrap(), first);
        assert!(!with_suffix(&paths.last_sync_timestamp, ".tmp").exists());
    }

    #[test]
    fn attachment_holders_are_kept_apart_from_data_sets() {
        let dir = tempdir().unwrap();
        let paths = StatePaths::new(dir.path());
        fs::write(
            &paths.not_synced_entities,
            "DATA_SET-DS2\nSAMPLE-20240501000000000-7\nPROJECT-20240501000000000-1\nDATA_SET-\n",
        )
        .unwrap();
        let markers = MarkerFiles::new(paths.clone());

        let not_synced = markers.read_not_synced().unwrap();
        assert_eq!(not_synced.retry, BTreeSet::from([PermId::from("DS2")]));
        assert_eq!(
            not_synced.attachment_retry,
            BTreeMap::from([
                (PermId::from("20240501000000000-7"), EntityKind::Object),
                (PermId::from("20240501000000000-1"), EntityKind::Project),
            ])
        );

        markers.write_not_synced(&not_synced).unwrap();
        let written = fs::read_to_string(&paths.not_synced_entities).unwrap();
        assert_eq!(
            written,
            "DATA_SET-DS2\nPROJECT-20240501000000000-1\nOBJECT-20240501000000000-7\n"
        );
        assert_eq!(markers.read_not_synced().unwrap(), not_synced);
    }

    #[test]
    fn blacklist_survives_a_rewrite() {
        let dir = tempdir().unwrap();
        let paths = StatePaths::new(dir.path());
        fs::write(
            &paths.not_synced_entities,
            "DATA_SET-DS2\n\n#DATA_SET-DS7\nVOCABULARY-X\n#SAMPLE-S1\n",
        )
        .unwrap();
        let markers = MarkerFiles::new(paths);

        let mut not_synced = markers.read_not_synced().unwrap();
        assert_eq!(not_synced.retry, BTreeSet::from([PermId::from("DS2")]));
        assert_eq!(not_synced.blacklist, BTreeSet::from([PermId::from("DS7")]));

        not_synced.retry.clear();
        markers.write_not_synced(&not_synced).unwrap();
        let reread = markers.read_not_synced().unwrap();
        assert!(reread.retry.is_empty());
        assert_eq!(reread.blacklist, BTreeSet::from([PermId::from("DS7")]));
    }
}
