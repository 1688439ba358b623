use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::apply::{Applier, DryRunApplier, LiveApplier};
use crate::config::HarvesterConfig;
use crate::document::{ResourceList, ResourceListReader};
use crate::errors::Result;
use crate::executor::BatchExecutor;
use crate::markers::{MarkerFiles, NotSynced};
use crate::master_data::merger::{MasterDataMerger, MergeOptions};
use crate::models::EntityKind;
use crate::planner::{PlanInput, PlanOptions, Planner};
use crate::remote::DocumentContentStore;
use crate::retriever::{incoming_graph, local_graph};
use crate::store::{CatalogStore, ContentStore, DocumentSource, FetchOptions, SearchCriteria};
use crate::summary::SyncSummary;
use crate::translate::NameTranslator;

/// One harvester instance: a data source, a local catalog and the state kept between runs.
pub struct Harvester {
    config: HarvesterConfig,
    source: Arc<dyn DocumentSource>,
    catalog: Arc<dyn CatalogStore>,
    content: Arc<dyn ContentStore>,
    markers: MarkerFiles,
}

impl Harvester {
    pub fn new(
        config: HarvesterConfig,
        source: Arc<dyn DocumentSource>,
        catalog: Arc<dyn CatalogStore>,
        content: Arc<dyn ContentStore>,
    ) -> Self {
        let markers = MarkerFiles::new(config.state_paths());
        Self {
            config,
            source,
            catalog,
            content,
            markers,
        }
    }

    pub fn config(&self) -> &HarvesterConfig {
        &self.config
    }

    /// Fetches and parses the current resource list.
    pub async fn fetch(&self) -> Result<ResourceList> {
        let document = self.source.fetch_resource_list().await?;
        let reader = ResourceListReader::new(NameTranslator::from_config(&self.config));
        let list = reader.read(&document)?;
        log::info!(
            "Resource list has {} spaces and {} entities",
            list.spaces.len(),
            EntityKind::ALL.iter().map(|k| list.count(*k)).sum::<usize>()
        );
        Ok(list)
    }

    /// Runs one synchronization.
    ///
    /// A dry run goes through the same steps with a recording applier and leaves the
    /// marker files untouched.
    pub async fn run(&self) -> Result<SyncSummary> {
        let started = Utc::now();
        let boundary = self.markers.read_last_sync()?;
        let not_synced = self.markers.read_not_synced()?;
        match boundary {
            Some(ts) => log::info!("Synchronizing changes since {ts}"),
            None => log::info!("No previous synchronization found, running a full sync"),
        }

        let list = self.fetch().await?;

        let recorder = self.config.dry_run.then(|| Arc::new(DryRunApplier::new()));
        let applier: Arc<dyn Applier> = match &recorder {
            Some(recorder) => recorder.clone(),
            None => Arc::new(LiveApplier::new(self.catalog.clone(), self.content.clone())),
        };

        let existing = self.catalog.master_data().await?;
        let merger = MasterDataMerger::new(
            applier.as_ref(),
            MergeOptions {
                update_allowed: self.config.master_data_update_allowed,
                unassignment_allowed: self.config.property_unassignment_allowed,
            },
        );
        let master_data = merger.merge(&list.master_data, &existing).await?;

        let harvester_spaces = self.harvester_spaces(&list);
        let incoming = incoming_graph(&list).await?;
        let local = local_graph(self.catalog.clone(), &harvester_spaces).await?;
        let local_spaces: BTreeSet<String> = self
            .catalog
            .search(
                &SearchCriteria::AllOfKind(EntityKind::Space),
                FetchOptions::minimal(),
            )
            .await?
            .into_iter()
            .map(|space| space.code)
            .collect();

        let remote_content = DocumentContentStore::new(&list);
        let planner = Planner::new(
            PlanOptions::from_config(&self.config),
            &remote_content,
            self.content.as_ref(),
        );
        let plan = planner
            .plan(&PlanInput {
                list: &list,
                incoming: &incoming,
                local: &local,
                local_spaces: &local_spaces,
                harvester_spaces: &harvester_spaces,
                boundary,
                retry: &not_synced.retry,
                attachment_retry: &not_synced.attachment_retry,
                blacklist: &not_synced.blacklist,
                now: started,
            })
            .await?;
        if !plan.skipped.is_empty() {
            log::info!("Skipping {} blacklisted data sets", plan.skipped.len());
        }

        let executor = BatchExecutor::new(
            applier,
            self.config.registration_pool_size(),
            self.config.deletion_confirmation,
        )
        .with_verbose_deletions(self.config.verbose);
        let report = executor.execute(&plan).await?;
        if !report.failed_deletions.is_empty() {
            log::warn!(
                "{} deletion groups failed and need manual attention",
                report.failed_deletions.len()
            );
        }

        let mut summary = SyncSummary::new(recorder.is_some(), master_data, &plan, &report);
        if self.config.verbose {
            summary = summary.with_deleted_ids(report.deleted_ids.clone());
        }
        if let Some(recorder) = recorder {
            return Ok(summary.with_changes(recorder.records()));
        }

        self.markers.write_not_synced(&NotSynced {
            retry: report.not_registered.clone(),
            blacklist: not_synced.blacklist,
            attachment_retry: report.attachments_not_synced.clone(),
        })?;
        self.markers
            .write_last_sync(list.timestamp.unwrap_or(started))?;
        log::info!("{}", summary.deletion_line());
        Ok(summary)
    }

    /// Configured harvester spaces, falling back to the spaces of the document.
    fn harvester_spaces(&self, list: &ResourceList) -> BTreeSet<String> {
        if self.config.harvester_spaces.is_empty() {
            list.spaces.clone()
        } else {
            self.config.harvester_spaces.iter().cloned().collect()
        }
    }
}
