//! Google Photos Library API client.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{Page, PhotoSource, TokenProvider, collect_pages, read_body, read_json};
use crate::error::{Error, Result};
use crate::media::{Album, MediaItem, PhotoHints, is_usable_photo};

const ALBUM_PAGE_SIZE: u32 = 50;
const MEDIA_PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleAlbum {
    id: String,
    title: Option<String>,
    product_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlbumsPage {
    #[serde(default)]
    albums: Vec<GoogleAlbum>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleMediaItem {
    id: String,
    base_url: Option<String>,
    mime_type: Option<String>,
    filename: Option<String>,
    media_metadata: Option<MediaMetadata>,
}

/// Dimensions arrive as decimal strings.
#[derive(Debug, Deserialize)]
struct MediaMetadata {
    width: Option<String>,
    height: Option<String>,
    photo: Option<serde_json::Value>,
    video: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaPage {
    #[serde(default)]
    media_items: Vec<GoogleMediaItem>,
    next_page_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest<'a> {
    album_id: &'a str,
    page_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_token: Option<String>,
}

impl From<GoogleAlbum> for Album {
    fn from(album: GoogleAlbum) -> Self {
        Album {
            id: album.id,
            display_name: album.title,
            web_url: album.product_url,
        }
    }
}

impl GoogleMediaItem {
    fn into_media_item(self) -> Option<MediaItem> {
        let meta = self.media_metadata.as_ref();
        if meta.is_some_and(|m| m.video.is_some()) {
            return None;
        }
        let usable = is_usable_photo(PhotoHints {
            mime_type: self.mime_type.as_deref(),
            name: self.filename.as_deref(),
            has_image_facet: false,
            has_photo_facet: meta.is_some_and(|m| m.photo.is_some()),
        });
        if !usable {
            return None;
        }
        let dim = |value: Option<&String>| value.and_then(|v| v.parse::<u32>().ok());
        Some(MediaItem {
            pixel_width: dim(meta.and_then(|m| m.width.as_ref())),
            pixel_height: dim(meta.and_then(|m| m.height.as_ref())),
            download_url: self.base_url.map(|base| format!("{base}=d")),
            id: self.id,
            display_name: self.filename,
            mime_type: self.mime_type,
            change_tag: None,
        })
    }
}

fn media_items(items: Vec<GoogleMediaItem>) -> Vec<MediaItem> {
    items
        .into_iter()
        .filter_map(GoogleMediaItem::into_media_item)
        .collect()
}

pub struct GooglePhotosSource {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl GooglePhotosSource {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    async fn search_page(&self, album_id: &str, page_token: Option<String>) -> Result<MediaPage> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .post(format!("{}/mediaItems:search", self.base_url))
            .bearer_auth(token)
            .json(&SearchRequest {
                album_id,
                page_size: MEDIA_PAGE_SIZE,
                page_token,
            })
            .send()
            .await?;
        read_json(response).await
    }
}

#[async_trait]
impl PhotoSource for GooglePhotosSource {
    fn name(&self) -> &'static str {
        "google-photos"
    }

    #[instrument(skip(self))]
    async fn list_albums(&self) -> Result<Vec<Album>> {
        collect_pages(|cursor: Option<String>| async move {
            let token = self.tokens.access_token().await?;
            let mut request = self
                .http
                .get(format!("{}/albums", self.base_url))
                .bearer_auth(token)
                .query(&[("pageSize", ALBUM_PAGE_SIZE.to_string())]);
            if let Some(cursor) = cursor {
                request = request.query(&[("pageToken", cursor)]);
            }
            let page: AlbumsPage = read_json(request.send().await?).await?;
            Ok(Page {
                items: page.albums.into_iter().map(Album::from).collect(),
                next: page.next_page_token,
            })
        })
        .await
    }

    async fn verify_album_exists(&self, album_id: &str) -> Result<Option<Album>> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .get(format!("{}/albums/{album_id}", self.base_url))
            .bearer_auth(token)
            .send()
            .await?;
        match read_json::<GoogleAlbum>(response).await {
            Ok(album) => Ok(Some(album.into())),
            Err(Error::Network { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self))]
    async fn search_photos(&self, album_id: &str) -> Result<Vec<MediaItem>> {
        collect_pages(|cursor: Option<String>| async move {
            let page = self.search_page(album_id, cursor).await?;
            Ok(Page {
                items: media_items(page.media_items),
                next: page.next_page_token,
            })
        })
        .await
    }

    async fn probe_usable_count_first_page(&self, album_id: &str) -> Result<usize> {
        let page = self.search_page(album_id, None).await?;
        Ok(media_items(page.media_items).len())
    }

    async fn download_image_data(&self, item: &MediaItem) -> Result<Vec<u8>> {
        let url = match &item.download_url {
            Some(url) => url.clone(),
            None => {
                debug!(item = %item.id, "no base URL cached; resolving media item");
                let token = self.tokens.access_token().await?;
                let response = self
                    .http
                    .get(format!("{}/mediaItems/{}", self.base_url, item.id))
                    .bearer_auth(token)
                    .send()
                    .await?;
                let fresh: GoogleMediaItem = read_json(response).await?;
                let base = fresh
                    .base_url
                    .ok_or_else(|| Error::http(410, "media item has no download URL"))?;
                format!("{base}=d")
            }
        };
        read_body(self.http.get(url).send().await?).await
    }
}
