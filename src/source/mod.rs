//! Remote photo providers behind one paginated contract.

mod auth;
mod fixture;
mod google;
mod onedrive;

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{Error, Result};
use crate::media::{Album, MediaItem};

pub use auth::{RefreshingTokenProvider, StaticTokenProvider, TokenProvider};
pub use fixture::FixtureSource;
pub use google::GooglePhotosSource;
pub use onedrive::OneDriveSource;

#[async_trait]
pub trait PhotoSource: Send + Sync {
    /// Short provider label for logs.
    fn name(&self) -> &'static str;

    async fn list_albums(&self) -> Result<Vec<Album>>;

    /// `None` when the id no longer resolves to an album-like container.
    async fn verify_album_exists(&self, album_id: &str) -> Result<Option<Album>>;

    /// Every usable photo in the album, across all pages.
    async fn search_photos(&self, album_id: &str) -> Result<Vec<MediaItem>>;

    /// Usable photos on the first page only.
    async fn probe_usable_count_first_page(&self, album_id: &str) -> Result<usize>;

    async fn download_image_data(&self, item: &MediaItem) -> Result<Vec<u8>>;
}

/// One page of a cursor-paginated listing.
#[derive(Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor for the following page; absent on the last one.
    pub next: Option<String>,
}

/// Calls `fetch(None)`, then `fetch(Some(cursor))` until a page has no cursor.
pub async fn collect_pages<T, F, Fut>(mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>>>,
{
    let mut out = Vec::new();
    let mut cursor = None;
    let mut pages = 0usize;
    loop {
        let page = fetch(cursor.take()).await?;
        pages += 1;
        out.extend(page.items);
        match page.next.filter(|next| !next.is_empty()) {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    debug!(pages, items = out.len(), "pagination complete");
    Ok(out)
}

/// Maps a non-success status to [`Error::Network`], otherwise returns the body.
pub(crate) async fn read_body(response: reqwest::Response) -> Result<Vec<u8>> {
    let status = response.status();
    let bytes = response.bytes().await?;
    if !status.is_success() {
        return Err(Error::http(status.as_u16(), &String::from_utf8_lossy(&bytes)));
    }
    Ok(bytes.to_vec())
}

pub(crate) async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let body = read_body(response).await?;
    Ok(serde_json::from_slice(&body)?)
}

pub fn http_client(config: &ProviderConfig) -> AnyResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.request_timeout)
        .user_agent(concat!("album-wallpaper/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")
}

/// Builds the provider selected in configuration.
pub fn build_source(config: &ProviderConfig) -> AnyResult<Arc<dyn PhotoSource>> {
    if config.kind == ProviderKind::Fixture {
        return Ok(Arc::new(FixtureSource::default()));
    }

    let http = http_client(config)?;
    let tokens: Arc<dyn TokenProvider> = match (&config.refresh, &config.access_token) {
        (Some(refresh), _) => Arc::new(RefreshingTokenProvider::new(http.clone(), refresh)),
        (None, Some(token)) => Arc::new(StaticTokenProvider::new(token.clone())),
        (None, None) => anyhow::bail!("provider is not configured: no access token or refresh settings"),
    };
    let base_url = config.base_url().to_string();
    Ok(match config.kind {
        ProviderKind::Onedrive => Arc::new(OneDriveSource::new(http, base_url, tokens)),
        ProviderKind::GooglePhotos => Arc::new(GooglePhotosSource::new(http, base_url, tokens)),
        ProviderKind::Fixture => Arc::new(FixtureSource::default()),
    })
}
