use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use harvester::{
    catalog::SqliteCatalog,
    config::HarvesterConfig,
    document::{ResourceList, ResourceListReader},
    models::EntityKind,
    store::{DocumentSource, FileDocumentSource},
    translate::NameTranslator,
    Harvester, SyncSummary,
};
use serde_json::{json, Value as JsonValue};
use sourcefetcher::HttpDocumentSource;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Runs the command line interface of the harvester.
pub async fn run_cli() -> anyhow::Result<()> {
    init_tracing();
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(output) => {
            println!("{output}");
            Ok(())
        }
        Err(err) => {
            error!("{err:#}");
            Err(err)
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Synchronizes the local catalog with the data source
    Sync(SyncArgs),
    /// Shows what a synchronization would change without writing anything
    Plan(SyncArgs),
    /// Parses a resource list and prints what it contains
    Inspect(InspectArgs),
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Harvester configuration file (JSON)
    #[arg(long, env = "HARVESTER_CONFIG")]
    pub config: PathBuf,
    /// Record operations instead of applying them
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
    #[arg(long, default_value_t = false)]
    pub verbose: bool,
    /// Read the resource list from a file instead of the data source
    #[arg(long)]
    pub document: Option<PathBuf>,
    /// Overrides the state directory of the configuration
    #[arg(long, env = "HARVESTER_STATE_DIR")]
    pub state_dir: Option<PathBuf>,
    /// Overrides the data source password of the configuration
    #[arg(long, env = "HARVESTER_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    #[arg(long)]
    pub document: PathBuf,
    /// Prefix applied to incoming codes
    #[arg(long)]
    pub alias: Option<String>,
}

/// Executes one command and returns the text to print.
pub async fn run(cli: Cli) -> anyhow::Result<String> {
    match cli.command {
        Command::Sync(args) => Ok(sync(args, false).await?.to_string()),
        Command::Plan(args) => Ok(sync(args, true).await?.to_string()),
        Command::Inspect(args) => {
            let report = inspect(&args.document, args.alias).await?;
            Ok(serde_json::to_string_pretty(&report)?)
        }
    }
}

fn load_config(args: &SyncArgs, force_dry_run: bool) -> anyhow::Result<HarvesterConfig> {
    let mut config = HarvesterConfig::from_file(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    config.dry_run |= args.dry_run || force_dry_run;
    config.verbose |= args.verbose;
    if let Some(state_dir) = &args.state_dir {
        config.state_dir = state_dir.clone();
    }
    if let Some(password) = &args.password {
        config.password = Some(password.clone());
    }
    Ok(config)
}

async fn sync(args: SyncArgs, force_dry_run: bool) -> anyhow::Result<SyncSummary> {
    let config = load_config(&args, force_dry_run)?;
    let paths = config.state_paths();
    let catalog = Arc::new(
        SqliteCatalog::new(&paths)
            .with_context(|| format!("failed to open catalog {}", paths.catalog_path.display()))?,
    );
    let source: Arc<dyn DocumentSource> = match &args.document {
        Some(path) => Arc::new(FileDocumentSource::new(path)),
        None => Arc::new(
            HttpDocumentSource::from_config(&config).context("failed to set up the data source")?,
        ),
    };

    info!(
        dry_run = config.dry_run,
        state_dir = %config.state_dir.display(),
        "Starting synchronization"
    );
    let harvester = Harvester::new(config, source, catalog.clone(), catalog.clone());
    let summary = harvester.run().await.context("synchronization failed")?;
    if !summary.dry_run {
        for (kind, count) in catalog.counts()? {
            info!(kind = %kind, count, "Local catalog");
        }
    }
    Ok(summary)
}

async fn inspect(document: &Path, alias: Option<String>) -> anyhow::Result<JsonValue> {
    let xml = tokio::fs::read_to_string(document)
        .await
        .with_context(|| format!("failed to read {}", document.display()))?;
    let translator = match alias {
        Some(alias) => NameTranslator::Prefix(alias),
        None => NameTranslator::Identity,
    };
    let list = ResourceListReader::new(translator).read(&xml)?;
    Ok(describe(&list))
}

fn describe(list: &ResourceList) -> JsonValue {
    let entities: serde_json::Map<String, JsonValue> = EntityKind::ALL
        .iter()
        .filter(|kind| **kind != EntityKind::Space)
        .map(|kind| (kind.plural().to_string(), json!(list.count(*kind))))
        .collect();
    let md = &list.master_data;
    json!({
        "timestamp": list.timestamp.map(|ts| ts.to_rfc3339()),
        "spaces": list.spaces,
        "entities": entities,
        "master_data": {
            "file_format_types": md.file_format_types.len(),
            "validation_plugins": md.validation_plugins.len(),
            "vocabularies": md.vocabularies.len(),
            "property_types": md.property_types.len(),
            "material_types": md.material_types.len(),
            "collection_types": md.collection_types.len(),
            "object_types": md.object_types.len(),
            "data_set_types": md.data_set_types.len(),
            "external_dms": md.external_dms.len(),
        },
    })
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}
