//! Content-addressed store of normalized wallpaper JPEGs.

use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use crate::media::MediaItem;

pub const FILE_PREFIX: &str = "wallpaper-";
pub const FILE_SUFFIX: &str = ".jpg";
/// Single fixed file written by older versions.
pub const LEGACY_FILE_NAME: &str = "wallpaper.jpg";
pub const DEFAULT_KEEP: usize = 50;

/// First 32 lower-case hex chars of `SHA-256("{id}|{change_tag}")`.
pub fn cache_key(id: &str, change_tag: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(b"|");
    hasher.update(change_tag.unwrap_or_default().as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..32].to_string()
}

#[derive(Debug, Clone)]
pub struct WallpaperStore {
    dir: PathBuf,
}

impl WallpaperStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, item: &MediaItem) -> PathBuf {
        let key = cache_key(&item.id, item.change_tag.as_deref());
        self.dir.join(format!("{FILE_PREFIX}{key}{FILE_SUFFIX}"))
    }

    /// Present, a regular file and non-empty.
    pub fn is_valid(&self, path: &Path) -> bool {
        fs::metadata(path)
            .map(|meta| meta.is_file() && meta.len() > 0)
            .unwrap_or(false)
    }

    /// Whether `path` is one of this store's files.
    pub fn owns(&self, path: &Path) -> bool {
        path.parent() == Some(self.dir.as_path())
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(is_store_file_name)
    }

    /// Writes via a temp file in the same directory, then renames into place.
    pub fn write_atomic(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".partial-")
            .tempfile_in(&self.dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|err| err.error)?;
        debug!(path = %path.display(), bytes = bytes.len(), "store: wrote wallpaper");
        Ok(())
    }

    /// Marks a reused file as the newest so eviction keeps it.
    pub fn touch(&self, path: &Path) -> io::Result<()> {
        fs::File::options()
            .write(true)
            .open(path)?
            .set_modified(SystemTime::now())
    }

    pub fn remove(&self, path: &Path) -> io::Result<()> {
        delete_if_exists(path)
    }

    /// Deletes all but the `keep` most recently modified store files.
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    pub fn evict(&self, keep: usize) -> io::Result<usize> {
        let mut files = self.list()?;
        if files.len() <= keep {
            return Ok(0);
        }
        files.sort_by(|a, b| b.1.cmp(&a.1));
        let mut removed = 0;
        for (path, _) in files.into_iter().skip(keep) {
            delete_if_exists(&path)?;
            removed += 1;
        }
        info!(removed, keep, "store: evicted old wallpapers");
        Ok(removed)
    }

    /// Removes every store file plus the legacy file.
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    pub fn clear(&self) -> io::Result<usize> {
        let mut removed = 0;
        for (path, _) in self.list()? {
            delete_if_exists(&path)?;
            removed += 1;
        }
        let legacy = self.dir.join(LEGACY_FILE_NAME);
        if legacy.is_file() {
            delete_if_exists(&legacy)?;
            removed += 1;
        }
        info!(removed, "store: cleared");
        Ok(removed)
    }

    fn list(&self) -> io::Result<Vec<(PathBuf, SystemTime)>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if !is_store_file_name(name) {
                continue;
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|meta| meta.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            out.push((entry.into_path(), modified));
        }
        Ok(out)
    }
}

fn is_store_file_name(name: &str) -> bool {
    name.len() > FILE_PREFIX.len() + FILE_SUFFIX.len()
        && name.starts_with(FILE_PREFIX)
        && name.ends_with(FILE_SUFFIX)
}

fn delete_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "store: removed");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable_and_tag_sensitive() {
        let a = cache_key("item-1", Some("c1"));
        assert_eq!(a, cache_key("item-1", Some("c1")));
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, cache_key("item-1", Some("c2")));
        assert_ne!(a, cache_key("item-2", Some("c1")));
        assert_ne!(cache_key("item-1", None), a);
        assert_eq!(cache_key("item-1", None), cache_key("item-1", Some("")));
    }

    #[test]
    fn key_matches_known_digest() {
        // Missing tag hashes as an empty suffix.
        let full = format!("{:x}", Sha256::digest(b"x|"));
        assert_eq!(cache_key("x", None), full[..32]);
    }

    #[test]
    fn store_file_names() {
        assert!(is_store_file_name("wallpaper-0123456789abcdef0123456789abcdef.jpg"));
        assert!(!is_store_file_name("wallpaper.jpg"));
        assert!(!is_store_file_name("wallpaper-.jpg"));
        assert!(!is_store_file_name("photo-abc.jpg"));
    }

    #[test]
    fn owns_only_files_in_its_directory() {
        let store = WallpaperStore::new("/cache");
        let item = MediaItem::new("a");
        assert!(store.owns(&store.path_for(&item)));
        assert!(!store.owns(Path::new("/other/wallpaper-abc.jpg")));
        assert!(!store.owns(Path::new("/cache/wallpaper.jpg")));
    }
}
