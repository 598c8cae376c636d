//! Provider-neutral descriptors for albums and photos.

use std::path::Path;

use crate::processing::{RAW_EXTENSIONS, raw_decoding_available};

/// Extensions decodable without the RAW capability.
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "tif", "tiff", "bmp", "heic",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Album {
    pub id: String,
    pub display_name: Option<String>,
    pub web_url: Option<String>,
}

impl Album {
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

/// A remote photo as seen by one search call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaItem {
    pub id: String,
    /// Direct URL that can be fetched without the provider's API.
    pub download_url: Option<String>,
    pub pixel_width: Option<u32>,
    pub pixel_height: Option<u32>,
    pub display_name: Option<String>,
    pub mime_type: Option<String>,
    /// Provider version stamp; changes whenever the content does.
    pub change_tag: Option<String>,
}

impl MediaItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }

    pub fn is_landscape(&self) -> Option<bool> {
        match (self.pixel_width, self.pixel_height) {
            (Some(w), Some(h)) => Some(w >= h),
            _ => None,
        }
    }
}

/// One entry of an attempt list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub item: MediaItem,
    /// Position in the pool; only set when picking sequentially.
    pub sequential_index: Option<usize>,
}

/// Type hints gathered from a provider payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhotoHints<'a> {
    pub mime_type: Option<&'a str>,
    pub name: Option<&'a str>,
    pub has_image_facet: bool,
    pub has_photo_facet: bool,
}

/// Whether a remote item is a displayable photo rather than a video or document.
pub fn is_usable_photo(hints: PhotoHints<'_>) -> bool {
    let ext = hints.name.and_then(extension_of);
    if let Some(ext) = &ext {
        if RAW_EXTENSIONS.contains(&ext.as_str()) {
            return raw_decoding_available();
        }
    }
    if hints
        .mime_type
        .is_some_and(|mime| mime.to_ascii_lowercase().starts_with("image/"))
    {
        return true;
    }
    if hints.has_image_facet || hints.has_photo_facet {
        return true;
    }
    ext.is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

pub(crate) fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

/// Applies the minimum-width and horizontal-only filters; unknown dimensions pass.
pub fn filter_pool(
    items: Vec<MediaItem>,
    minimum_width: Option<u32>,
    horizontal_only: bool,
) -> Vec<MediaItem> {
    items
        .into_iter()
        .filter(|item| match (minimum_width, item.pixel_width) {
            (Some(min), Some(width)) if min > 0 => width >= min,
            _ => true,
        })
        .filter(|item| !horizontal_only || item.is_landscape().unwrap_or(true))
        .collect()
}
