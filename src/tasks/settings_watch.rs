//! Re-arms the updater whenever the settings file changes on disk.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecursiveMode, Watcher, recommended_watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::updater::UpdaterHandle;

#[instrument(skip(updater, cancel), fields(path = %path.display()))]
pub async fn run(path: PathBuf, updater: UpdaterHandle, cancel: CancellationToken) -> Result<()> {
    let file_name = path
        .file_name()
        .map(ToOwned::to_owned)
        .with_context(|| format!("settings path {} has no file name", path.display()))?;
    // Saves replace the file by rename, so watch the directory rather than the inode.
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create settings directory {}", dir.display()))?;

    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Result<Event>>(64);
    let mut watcher = recommended_watcher(move |res| {
        let _ = watch_tx.blocking_send(res);
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!(watching = %dir.display(), "settings watcher initialized");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("cancel received; exiting settings watcher");
                break;
            }
            received = watch_rx.recv() => {
                let Some(res) = received else { break };
                match res {
                    Ok(event) if touches(&event, &file_name) => {
                        // One save arrives as several events.
                        while watch_rx.try_recv().is_ok() {}
                        debug!(kind = ?event.kind, "settings changed on disk");
                        if updater.refresh_schedule().is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "settings watch error"),
                }
            }
        }
    }
    Ok(())
}

fn touches(event: &Event, file_name: &OsString) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event
        .paths
        .iter()
        .any(|p| p.file_name() == Some(file_name.as_os_str()))
}
