//! Fetches resource list documents from a remote data source over HTTP.

pub mod client;
pub mod error;

pub use client::{HttpDocumentSource, SourceOptions};
pub use error::{FetcherError, Result};
