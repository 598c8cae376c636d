//! Microsoft Graph (OneDrive Photos) client.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::{Page, PhotoSource, TokenProvider, collect_pages, read_body, read_json};
use crate::error::{Error, Result};
use crate::media::{Album, MediaItem, PhotoHints, is_usable_photo};

const ALBUMS_FILTERED_QUERY: &str = "$filter=bundle/album ne null&$select=id,name,webUrl,bundle";
const ALBUMS_QUERY: &str = "$select=id,name,webUrl,bundle";
const CONTAINER_QUERY: &str = "$select=id,name,webUrl,bundle,folder";
const CHILDREN_QUERY: &str =
    "$select=id&$expand=children($select=id,name,webUrl,file,image,photo,cTag)";
const PHOTOS_HOST: &str = "photos.onedrive.com";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    id: String,
    name: Option<String>,
    web_url: Option<String>,
    #[serde(rename = "cTag")]
    c_tag: Option<String>,
    file: Option<FileFacet>,
    image: Option<ImageFacet>,
    photo: Option<serde_json::Value>,
    folder: Option<serde_json::Value>,
    bundle: Option<BundleFacet>,
    #[serde(rename = "@microsoft.graph.downloadUrl")]
    download_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileFacet {
    mime_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ImageFacet {
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct BundleFacet {
    album: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Collection {
    #[serde(default)]
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExpandedChildren {
    #[serde(default)]
    children: Vec<DriveItem>,
    #[serde(rename = "children@odata.nextLink")]
    children_next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Drive {
    id: String,
}

impl DriveItem {
    /// Album facet, or a web link on the Photos host.
    fn is_album_strict(&self) -> bool {
        if self.bundle.as_ref().is_some_and(|b| b.album.is_some()) {
            return true;
        }
        self.web_url
            .as_deref()
            .and_then(|url| reqwest::Url::parse(url).ok())
            .is_some_and(|url| url.host_str() == Some(PHOTOS_HOST))
    }

    fn into_album(self) -> Album {
        Album {
            id: self.id,
            display_name: self.name,
            web_url: self.web_url,
        }
    }

    fn into_media_item(self) -> Option<MediaItem> {
        let usable = is_usable_photo(PhotoHints {
            mime_type: self.file.as_ref().and_then(|f| f.mime_type.as_deref()),
            name: self.name.as_deref(),
            has_image_facet: self.image.is_some(),
            has_photo_facet: self.photo.is_some(),
        });
        if !usable {
            return None;
        }
        Some(MediaItem {
            id: self.id,
            download_url: self.download_url,
            pixel_width: self.image.as_ref().and_then(|i| i.width),
            pixel_height: self.image.as_ref().and_then(|i| i.height),
            display_name: self.name,
            mime_type: self.file.and_then(|f| f.mime_type),
            change_tag: self.c_tag,
        })
    }
}

fn media_items(items: Vec<DriveItem>) -> Vec<MediaItem> {
    items
        .into_iter()
        .filter_map(DriveItem::into_media_item)
        .collect()
}

pub struct OneDriveSource {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl OneDriveSource {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Authenticated GET; the token is fetched right before the request.
    /// `query` is an OData query string, percent-encoded as needed.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: Option<&str>,
    ) -> Result<T> {
        let mut url = reqwest::Url::parse(url)
            .map_err(|err| Error::Configuration(format!("invalid URL {url}: {err}")))?;
        if let Some(query) = query {
            url.set_query(Some(query));
        }
        let token = self.tokens.access_token().await?;
        debug!(%url, "graph GET");
        let response = self.http.get(url).bearer_auth(token).send().await?;
        read_json(response).await
    }

    async fn current_drive_id(&self) -> Result<String> {
        let drive: Drive = self.get_json(&self.url("/me/drive"), Some("$select=id")).await?;
        Ok(drive.id)
    }

    async fn list_collection(&self, path: &str, filter_to_albums: bool) -> Result<Vec<DriveItem>> {
        let first = self.url(path);
        collect_pages(|cursor: Option<String>| {
            let first = first.clone();
            async move {
                let page: Collection = match cursor {
                    None if filter_to_albums => {
                        self.get_json(&first, Some(ALBUMS_FILTERED_QUERY)).await?
                    }
                    None => self.get_json(&first, Some(ALBUMS_QUERY)).await?,
                    Some(next) => self.get_json(&next, None).await?,
                };
                Ok(Page {
                    items: page.value,
                    next: page.next_link,
                })
            }
        })
        .await
    }

    /// Bundles from the first endpoint that returns any.
    ///
    /// A failing endpoint falls through to the next one; the last error is
    /// returned only when no endpoint answered at all.
    async fn list_bundles(&self, filter_to_albums: bool) -> Result<Vec<DriveItem>> {
        let mut endpoints = Vec::with_capacity(3);
        match self.current_drive_id().await {
            Ok(drive_id) => endpoints.push(format!("/drives/{drive_id}/bundles")),
            Err(err @ Error::Auth(_)) => return Err(err),
            Err(err) => debug!(error = %err, "drive id lookup failed; using default drive"),
        }
        endpoints.push("/drive/bundles".to_string());
        endpoints.push("/me/drive/bundles".to_string());

        let mut answered = false;
        let mut last_error = None;
        for endpoint in &endpoints {
            match self.list_collection(endpoint, filter_to_albums).await {
                Ok(items) if !items.is_empty() => return Ok(items),
                Ok(_) => answered = true,
                Err(err @ Error::Auth(_)) => return Err(err),
                Err(err) => {
                    debug!(%endpoint, error = %err, "bundle endpoint failed");
                    last_error = Some(err);
                }
            }
        }
        match last_error {
            Some(err) if !answered => Err(err),
            _ => Ok(Vec::new()),
        }
    }

    async fn expanded_children(&self, album_id: &str) -> Result<ExpandedChildren> {
        self.get_json(
            &self.url(&format!("/me/drive/items/{album_id}")),
            Some(CHILDREN_QUERY),
        )
        .await
    }
}

#[async_trait]
impl PhotoSource for OneDriveSource {
    fn name(&self) -> &'static str {
        "onedrive"
    }

    #[instrument(skip(self))]
    async fn list_albums(&self) -> Result<Vec<Album>> {
        let filtered = self.list_bundles(true).await?;
        let candidates = if filtered.is_empty() {
            info!("album filter returned nothing; retrying unfiltered");
            self.list_bundles(false).await?
        } else {
            filtered
        };
        Ok(candidates
            .into_iter()
            .filter(DriveItem::is_album_strict)
            .map(DriveItem::into_album)
            .collect())
    }

    #[instrument(skip(self))]
    async fn verify_album_exists(&self, album_id: &str) -> Result<Option<Album>> {
        let bundle: Result<DriveItem> = self
            .get_json(
                &self.url(&format!("/me/drive/bundles/{album_id}")),
                Some(ALBUMS_QUERY),
            )
            .await;
        match bundle {
            Ok(item) if item.bundle.is_some() || item.is_album_strict() => {
                return Ok(Some(item.into_album()));
            }
            Ok(_) => {}
            Err(err @ Error::Auth(_)) => return Err(err),
            Err(err) => debug!(error = %err, "bundle lookup failed; trying item lookup"),
        }

        let item: DriveItem = match self
            .get_json(
                &self.url(&format!("/me/drive/items/{album_id}")),
                Some(CONTAINER_QUERY),
            )
            .await
        {
            Ok(item) => item,
            Err(Error::Network { status: 404, .. }) => return Ok(None),
            Err(err) => return Err(err),
        };
        let is_container = item.bundle.is_some() || item.folder.is_some() || item.is_album_strict();
        Ok(is_container.then(|| item.into_album()))
    }

    #[instrument(skip(self))]
    async fn search_photos(&self, album_id: &str) -> Result<Vec<MediaItem>> {
        collect_pages(|cursor: Option<String>| async move {
            match cursor {
                None => {
                    let first = self.expanded_children(album_id).await?;
                    Ok(Page {
                        items: media_items(first.children),
                        next: first.children_next_link,
                    })
                }
                Some(next) => {
                    let page: Collection = self.get_json(&next, None).await?;
                    Ok(Page {
                        items: media_items(page.value),
                        next: page.next_link,
                    })
                }
            }
        })
        .await
    }

    async fn probe_usable_count_first_page(&self, album_id: &str) -> Result<usize> {
        let first = self.expanded_children(album_id).await?;
        Ok(media_items(first.children).len())
    }

    async fn download_image_data(&self, item: &MediaItem) -> Result<Vec<u8>> {
        let response = match item.download_url.as_deref() {
            Some(url) => self.http.get(url).send().await?,
            None => {
                let token = self.tokens.access_token().await?;
                self.http
                    .get(self.url(&format!("/me/drive/items/{}/content", item.id)))
                    .bearer_auth(token)
                    .send()
                    .await?
            }
        };
        let bytes = read_body(response).await?;
        if bytes.is_empty() {
            warn!(item = %item.id, "download returned no data");
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(json: serde_json::Value) -> DriveItem {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn strict_album_check() {
        assert!(item(serde_json::json!({"id": "a", "bundle": {"album": {}}})).is_album_strict());
        assert!(item(serde_json::json!({
            "id": "b",
            "webUrl": "https://photos.onedrive.com/album/b"
        }))
        .is_album_strict());
        assert!(!item(serde_json::json!({"id": "c", "bundle": {}})).is_album_strict());
        assert!(!item(serde_json::json!({
            "id": "d",
            "webUrl": "https://onedrive.live.com/?id=d"
        }))
        .is_album_strict());
    }

    #[test]
    fn maps_children_and_skips_non_photos() {
        let items = media_items(vec![
            item(serde_json::json!({
                "id": "p1",
                "name": "beach.jpg",
                "cTag": "tag-1",
                "file": {"mimeType": "image/jpeg"},
                "image": {"width": 4000, "height": 3000}
            })),
            item(serde_json::json!({
                "id": "v1",
                "name": "clip.mp4",
                "file": {"mimeType": "video/mp4"}
            })),
        ]);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "p1");
        assert_eq!(items[0].pixel_width, Some(4000));
        assert_eq!(items[0].change_tag.as_deref(), Some("tag-1"));
    }
}
