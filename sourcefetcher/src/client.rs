use async_trait::async_trait;
use harvester::config::HarvesterConfig;
use harvester::store::DocumentSource;
use std::time::Duration;
use url::Url;

use crate::error::{FetcherError, Result};

const RESOURCE_LIST_VERB: &str = "resourcelist.xml";

/// Connection settings for one data source.
#[derive(Debug, Clone, Default)]
pub struct SourceOptions {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Only these spaces are requested when non-empty.
    pub space_white_list: Vec<String>,
    pub space_black_list: Vec<String>,
    pub timeout: Option<Duration>,
}

impl SourceOptions {
    pub fn from_config(config: &HarvesterConfig) -> Result<Self> {
        let url = config
            .data_source_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| FetcherError::InvalidParam("data_source_url is not set".to_string()))?;
        Ok(Self {
            url,
            user: config.user.clone(),
            password: config.password.clone(),
            space_white_list: config.space_white_list.clone(),
            space_black_list: config.space_black_list.clone(),
            timeout: None,
        })
    }
}

/// Downloads the resource list of a data source.
pub struct HttpDocumentSource {
    http_client: reqwest::Client,
    options: SourceOptions,
}

impl HttpDocumentSource {
    pub fn new(options: SourceOptions) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            http_client: builder.build()?,
            options,
        })
    }

    pub fn from_config(config: &HarvesterConfig) -> Result<Self> {
        Self::new(SourceOptions::from_config(config)?)
    }

    /// The request URL with the verb and the space filters.
    pub fn resource_list_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.options.url)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("verb", RESOURCE_LIST_VERB);
            if !self.options.space_white_list.is_empty() {
                query.append_pair("spaces", &self.options.space_white_list.join(","));
            }
            if !self.options.space_black_list.is_empty() {
                query.append_pair("black_list", &self.options.space_black_list.join(","));
            }
        }
        Ok(url)
    }

    pub async fn fetch(&self) -> Result<String> {
        let url = self.resource_list_url()?;
        log::info!("Fetching resource list from {url}");
        let mut request = self.http_client.get(url);
        if let Some(user) = &self.options.user {
            request = request.basic_auth(user, self.options.password.as_ref());
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetcherError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let document = response.text().await?;
        log::debug!("Received {} bytes", document.len());
        Ok(document)
    }
}

#[async_trait]
impl DocumentSource for HttpDocumentSource {
    async fn fetch_resource_list(&self) -> harvester::Result<String> {
        Ok(self.fetch().await?)
    }
}
