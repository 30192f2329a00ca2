//! Raw catalog sources
//!
//! A [`Repository`] only fetches bytes; parsing happens in
//! [`super::ServiceDirectory`] so every source is interpreted identically.

#![allow(async_fn_in_trait)]

use crate::core::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Default Consul catalog endpoint queried when no file is given.
pub const DEFAULT_CATALOG_URL: &str = "http://localhost:8500/v1/catalog/service/wireguard";

pub trait Repository {
    /// Fetches the raw catalog payload.
    async fn fetch(&self) -> Result<Vec<u8>>;

    /// Human-readable origin for logs.
    fn describe(&self) -> String;
}

/// Catalog stored in a local JSON file.
#[derive(Debug, Clone)]
pub struct FileRepository {
    path: PathBuf,
}

impl FileRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Repository for FileRepository {
    async fn fetch(&self) -> Result<Vec<u8>> {
        info!("Repository: loading file {}", self.path.display());
        tokio::fs::read(&self.path).await.map_err(|e| {
            Error::Lookup(format!("cannot read catalog {}: {e}", self.path.display()))
        })
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

/// Catalog served over HTTP (Consul `/v1/catalog/service/<name>`).
#[derive(Debug, Clone)]
pub struct HttpRepository {
    url: String,
    client: reqwest::Client,
}

impl HttpRepository {
    /// Repository fetching `url`, giving up on requests slower than `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lookup`] if the HTTP client cannot be initialised
    /// (e.g. the TLS backend fails to load).
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let url = url.into();
        info!("Creating http repository. URL: {url}");
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Lookup(format!("cannot build HTTP client for {url}: {e}")))?;
        Ok(Self { url, client })
    }
}

impl Repository for HttpRepository {
    async fn fetch(&self) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::Lookup(format!("GET {} failed: {e}", self.url)))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(Error::Lookup(format!(
                "GET {} returned unexpected status {status}",
                self.url
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Lookup(format!("reading body of {} failed: {e}", self.url)))?;
        Ok(body.to_vec())
    }

    fn describe(&self) -> String {
        format!("url {}", self.url)
    }
}

/// Either source, chosen at startup from configuration.
#[derive(Debug, Clone)]
pub enum CatalogSource {
    File(FileRepository),
    Http(HttpRepository),
}

impl Repository for CatalogSource {
    async fn fetch(&self) -> Result<Vec<u8>> {
        match self {
            CatalogSource::File(repo) => repo.fetch().await,
            CatalogSource::Http(repo) => repo.fetch().await,
        }
    }

    fn describe(&self) -> String {
        match self {
            CatalogSource::File(repo) => repo.describe(),
            CatalogSource::Http(repo) => repo.describe(),
        }
    }
}
