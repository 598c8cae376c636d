use std::io::Cursor;

use async_trait::async_trait;
use image::{ImageFormat, Rgba, RgbaImage};

use super::PhotoSource;
use crate::error::{Error, Result};
use crate::media::{Album, MediaItem};

/// Deterministic provider with canned albums and photos.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    albums: Vec<Album>,
    items: Vec<MediaItem>,
}

fn fixture_item(id: &str, width: u32, height: u32, change_tag: &str) -> MediaItem {
    MediaItem {
        pixel_width: Some(width),
        pixel_height: Some(height),
        display_name: Some(format!("{id}.png")),
        mime_type: Some("image/png".into()),
        change_tag: Some(change_tag.into()),
        ..MediaItem::new(id)
    }
}

impl Default for FixtureSource {
    fn default() -> Self {
        let album = |n: u32| Album {
            id: format!("uitest-album-{n}"),
            display_name: Some(format!("UI Test Album {n}")),
            web_url: Some(format!("https://photos.onedrive.com/album/uitest-album-{n}")),
        };
        Self {
            albums: vec![album(1), album(2)],
            items: vec![
                fixture_item("uitest-item-1", 4000, 3000, "c1"),
                fixture_item("uitest-item-2", 5120, 2880, "c2"),
            ],
        }
    }
}

impl FixtureSource {
    /// Replaces the canned photo list.
    pub fn with_items(mut self, items: Vec<MediaItem>) -> Self {
        self.items = items;
        self
    }

    fn knows(&self, album_id: &str) -> bool {
        self.albums.iter().any(|album| album.id == album_id)
    }
}

fn one_pixel_png() -> Result<Vec<u8>> {
    let pixel = RgbaImage::from_pixel(1, 1, Rgba([32, 96, 160, 255]));
    let mut out = Cursor::new(Vec::new());
    pixel
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|err| Error::Configuration(format!("fixture image: {err}")))?;
    Ok(out.into_inner())
}

#[async_trait]
impl PhotoSource for FixtureSource {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn list_albums(&self) -> Result<Vec<Album>> {
        Ok(self.albums.clone())
    }

    async fn verify_album_exists(&self, album_id: &str) -> Result<Option<Album>> {
        Ok(self.albums.iter().find(|album| album.id == album_id).cloned())
    }

    async fn search_photos(&self, album_id: &str) -> Result<Vec<MediaItem>> {
        if !self.knows(album_id) {
            return Err(Error::http(404, "itemNotFound"));
        }
        Ok(self.items.clone())
    }

    async fn probe_usable_count_first_page(&self, album_id: &str) -> Result<usize> {
        Ok(self.search_photos(album_id).await?.len())
    }

    async fn download_image_data(&self, item: &MediaItem) -> Result<Vec<u8>> {
        if !self.items.iter().any(|known| known.id == item.id) {
            return Err(Error::http(404, "itemNotFound"));
        }
        one_pixel_png()
    }
}
