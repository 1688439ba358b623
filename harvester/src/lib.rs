//! One-way harvesting of an openBIS-style catalog.
//!
//! A run reads the resource list published by a data source, merges its master data into
//! the local catalog, builds a graph of the incoming and of the local entities, plans the
//! creations, updates and deletions that bring the local side in line, and executes the
//! plan in dependency order.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use harvester::{catalog::SqliteCatalog, config::HarvesterConfig};
//! use harvester::store::FileDocumentSource;
//! use harvester::Harvester;
//!
//! #[tokio::main]
//! async fn main() -> harvester::Result<()> {
//!     let config = HarvesterConfig::from_file("harvester.json".as_ref())?;
//!     let catalog = Arc::new(SqliteCatalog::new(&config.state_paths())?);
//!     let source = Arc::new(FileDocumentSource::new("resource-list.xml"));
//!     let harvester = Harvester::new(config, source, catalog.clone(), catalog);
//!     println!("{}", harvester.run().await?);
//!     Ok(())
//! }
//! ```

pub mod apply;
pub mod attachments;
pub mod catalog;
pub mod config;
pub mod diff;
pub mod document;
pub mod errors;
pub mod executor;
pub mod graph;
pub mod markers;
pub mod master_data;
pub mod memory;
pub mod models;
pub mod planner;
pub mod remote;
pub mod retriever;
pub mod store;
pub mod summary;
pub mod sync;
pub mod translate;
pub mod xml;

pub use errors::{Result, SyncError};
pub use summary::SyncSummary;
pub use sync::Harvester;
