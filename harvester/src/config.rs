use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::errors::{Result, SyncError};

/// Settings for one harvester instance, usually loaded from a JSON file.
#[derive(Deserialize, Debug, Clone)]
pub struct HarvesterConfig {
    #[serde(default)]
    pub data_source_url: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// When set, every incoming code is renamed to `<alias>_<code>`.
    #[serde(default)]
    pub data_source_alias: Option<String>,
    #[serde(default)]
    pub space_white_list: Vec<String>,
    #[serde(default)]
    pub space_black_list: Vec<String>,
    /// Local spaces owned by this harvester. Defaults to the spaces seen in the document.
    #[serde(default)]
    pub harvester_spaces: Vec<String>,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_harvester_user")]
    pub harvester_user: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "default_true")]
    pub master_data_update_allowed: bool,
    #[serde(default)]
    pub property_unassignment_allowed: bool,
    #[serde(default = "default_true")]
    pub keep_original_timestamps_and_users: bool,
    #[serde(default = "default_true")]
    pub keep_original_frozen_flags: bool,
    #[serde(default = "default_true")]
    pub deletion_confirmation: bool,
    #[serde(default = "default_parallel_fraction")]
    pub parallel_fraction: f64,
    #[serde(default)]
    pub max_parallel_registrations: Option<usize>,
}

fn default_true() -> bool {
    true
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("harvester-state")
}

fn default_harvester_user() -> String {
    "harvester".to_string()
}

fn default_parallel_fraction() -> f64 {
    0.5
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            data_source_url: None,
            user: None,
            password: None,
            data_source_alias: None,
            space_white_list: Vec::new(),
            space_black_list: Vec::new(),
            harvester_spaces: Vec::new(),
            state_dir: default_state_dir(),
            harvester_user: default_harvester_user(),
            dry_run: false,
            verbose: false,
            master_data_update_allowed: true,
            property_unassignment_allowed: false,
            keep_original_timestamps_and_users: true,
            keep_original_frozen_flags: true,
            deletion_confirmation: true,
            parallel_fraction: default_parallel_fraction(),
            max_parallel_registrations: None,
        }
    }
}

impl HarvesterConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: HarvesterConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.parallel_fraction > 0.0 && self.parallel_fraction <= 1.0) {
            return Err(SyncError::Config(format!(
                "parallel_fraction must be in (0, 1], got {}",
                self.parallel_fraction
            )));
        }
        if let Some(alias) = &self.data_source_alias {
            if alias.trim().is_empty() {
                return Err(SyncError::Config(
                    "data_source_alias must not be blank".to_string(),
                ));
            }
        }
        if let Some(max) = self.max_parallel_registrations {
            if max == 0 {
                return Err(SyncError::Config(
                    "max_parallel_registrations must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn state_paths(&self) -> StatePaths {
        StatePaths::new(&self.state_dir)
    }

    /// Worker pool size for physical data set registration.
    pub fn registration_pool_size(&self) -> usize {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let sized = ((available as f64) * self.parallel_fraction).floor() as usize;
        let sized = sized.max(1);
        match self.max_parallel_registrations {
            Some(cap) => sized.min(cap),
            None => sized,
        }
    }
}

/// Locations of the files a harvester keeps between runs.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub last_sync_timestamp: PathBuf,
    pub not_synced_entities: PathBuf,
    pub catalog_path: PathBuf,
}

impl StatePaths {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        Self {
            last_sync_timestamp: base_path.join("last-sync-timestamp"),
            not_synced_entities: base_path.join("not-synced-entities"),
            catalog_path: base_path.join("catalog.db"),
        }
    }
}
