//! One end-to-end wallpaper update.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use settings_model::{FillMode, Settings};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::events::UpdateStage;
use crate::media::{Candidate, MediaItem, filter_pool};
use crate::platform::display_surface::DisplaySurface;
use crate::processing::{NormalizeRequest, NormalizeWorker};
use crate::selection::{PickMode, select_candidates};
use crate::source::PhotoSource;
use crate::store::WallpaperStore;

/// Knobs that stay fixed for the life of the updater.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub standard_attempts: usize,
    pub extended_attempts: usize,
    pub jpeg_quality: f32,
    pub max_dimension: Option<u32>,
    pub fallback_max_dimension: u32,
    pub cache_keep: usize,
}

impl From<&Configuration> for RunOptions {
    fn from(config: &Configuration) -> Self {
        Self {
            standard_attempts: config.scheduling.standard_attempts,
            extended_attempts: config.scheduling.extended_attempts,
            jpeg_quality: config.jpeg_quality,
            max_dimension: config.max_dimension,
            fallback_max_dimension: config.fallback_max_dimension,
            cache_keep: config.cache_keep,
        }
    }
}

/// Collaborators shared by every run.
#[derive(Clone)]
pub struct RunContext {
    pub source: Arc<dyn PhotoSource>,
    pub display: Arc<dyn DisplaySurface>,
    pub store: WallpaperStore,
    pub worker: NormalizeWorker,
    pub options: RunOptions,
}

/// The settings a run reads, captured when it starts.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub album_id: Option<String>,
    pub minimum_width: Option<u32>,
    pub horizontal_only: bool,
    pub pick_mode: PickMode,
    pub last_picked_index: Option<usize>,
    pub last_set_item_id: Option<String>,
    pub fill_mode: FillMode,
}

impl From<&Settings> for RunRequest {
    fn from(settings: &Settings) -> Self {
        Self {
            album_id: settings.album_id().map(str::to_string),
            minimum_width: settings.minimum_picture_width,
            horizontal_only: settings.horizontal_only,
            pick_mode: PickMode::from_pick_randomly(settings.pick_randomly),
            last_picked_index: settings.last_picked_index,
            last_set_item_id: settings.last_set_item_id.clone(),
            fill_mode: settings.fill_mode,
        }
    }
}

/// Progress reported while a run executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Stage(UpdateStage),
    /// Usable photos left after filtering.
    PoolScanned(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedWallpaper {
    pub item_id: String,
    pub item_name: String,
    pub sequential_index: Option<usize>,
    pub path: PathBuf,
    pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Applied(AppliedWallpaper),
    /// Nothing passed the filters; the wallpaper was left alone.
    NoPhotos,
}

/// Races `fut` against `cancel`.
async fn cancellable<T>(cancel: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        out = fut => out,
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Runs a display operation off the async workers.
async fn on_display<T, F>(display: &Arc<dyn DisplaySurface>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn DisplaySurface) -> anyhow::Result<T> + Send + 'static,
{
    let display = Arc::clone(display);
    tokio::task::spawn_blocking(move || op(display.as_ref()))
        .await
        .map_err(|err| Error::Display(err.to_string()))?
        .map_err(|err| Error::Display(format!("{err:#}")))
}

/// Executes one update run.
///
/// Rules:
/// - Candidate failures that are recoverable move on to the next candidate.
/// - Authentication and configuration failures end the run at once.
/// - Nothing is written or applied once `cancel` has fired.
#[instrument(skip_all, fields(album = request.album_id.as_deref().unwrap_or("-")))]
pub async fn execute<R>(
    ctx: &RunContext,
    request: RunRequest,
    cancel: CancellationToken,
    report: R,
) -> Result<RunOutcome>
where
    R: Fn(RunEvent) + Send + Sync,
{
    let stage = |stage: UpdateStage| {
        debug!(%stage, "stage");
        report(RunEvent::Stage(stage));
    };

    stage(UpdateStage::FetchingItems);
    let album_id = request.album_id.as_deref().ok_or(Error::NoAlbumSelected)?;
    let items = cancellable(&cancel, ctx.source.search_photos(album_id)).await?;

    stage(UpdateStage::Filtering);
    let pool = filter_pool(items, request.minimum_width, request.horizontal_only);
    report(RunEvent::PoolScanned(pool.len()));
    if pool.is_empty() {
        info!("no photos left after filtering");
        return Ok(RunOutcome::NoPhotos);
    }

    let active = on_display(&ctx.display, |d| Ok(d.active_wallpapers())).await?;
    let showing_ours = active.iter().any(|path| ctx.store.owns(path));
    let budget = if showing_ours {
        ctx.options.extended_attempts
    } else {
        ctx.options.standard_attempts
    };
    let max_attempts = budget.min(pool.len());

    let candidates = {
        let mut rng = rand::rng();
        select_candidates(
            &pool,
            max_attempts,
            request.pick_mode,
            request.last_picked_index,
            request.last_set_item_id.as_deref(),
            &mut rng,
        )
    };
    debug!(pool = pool.len(), candidates = candidates.len(), showing_ours, "candidates selected");

    let max_dimension = match ctx.options.max_dimension {
        Some(max) => max,
        None => on_display(&ctx.display, |d| Ok(d.recommended_max_dimension()))
            .await
            .ok()
            .flatten()
            .unwrap_or(ctx.options.fallback_max_dimension),
    };

    let total = candidates.len();
    let mut failures = Vec::new();
    for (idx, candidate) in candidates.into_iter().enumerate() {
        ensure_live(&cancel)?;
        let attempt = idx + 1;
        let path = ctx.store.path_for(&candidate.item);
        let repeats_current = request.last_set_item_id.as_deref() == Some(candidate.item.id.as_str())
            || active.contains(&path);
        if pool.len() > 1 && repeats_current {
            debug!(item = %candidate.item.id, "skipping candidate already on screen");
            continue;
        }

        let name = candidate.item.label().to_string();
        stage(UpdateStage::SelectingCandidate {
            attempt,
            total,
            name: name.clone(),
        });

        let result = try_candidate(
            ctx,
            &candidate,
            &path,
            Attempt {
                attempt,
                total,
                max_dimension,
                quality: ctx.options.jpeg_quality,
                fill_mode: request.fill_mode,
            },
            &cancel,
            &stage,
        )
        .await;

        match result {
            Ok(from_cache) => {
                if let Err(err) = ctx.store.evict(ctx.options.cache_keep) {
                    warn!(error = %err, "failed to evict old wallpapers");
                }
                info!(item = %candidate.item.id, %name, from_cache, "wallpaper updated");
                return Ok(RunOutcome::Applied(AppliedWallpaper {
                    item_id: candidate.item.id,
                    item_name: name,
                    sequential_index: candidate.sequential_index,
                    path,
                    from_cache,
                }));
            }
            Err(err) if err.is_cancelled() => return Err(Error::Cancelled),
            Err(err) if err.is_recoverable() => {
                warn!(item = %candidate.item.id, attempt, error = %err, "candidate failed");
                if let Err(remove_err) = ctx.store.remove(&path) {
                    debug!(error = %remove_err, "could not remove partial wallpaper");
                }
                failures.push(err.to_string());
            }
            Err(err) => return Err(err),
        }
    }

    ensure_live(&cancel)?;
    // A single-photo pool never skips, so it always ends in a success or a failure.
    if failures.is_empty() {
        Err(Error::NoFreshCandidate)
    } else {
        Err(Error::AllCandidatesFailed(failures))
    }
}

#[derive(Debug, Clone, Copy)]
struct Attempt {
    attempt: usize,
    total: usize,
    max_dimension: u32,
    quality: f32,
    fill_mode: FillMode,
}

/// Applies one candidate, from the store when possible. Returns whether the store hit.
async fn try_candidate(
    ctx: &RunContext,
    candidate: &Candidate,
    path: &Path,
    attempt: Attempt,
    cancel: &CancellationToken,
    stage: &(dyn Fn(UpdateStage) + Send + Sync),
) -> Result<bool> {
    let item = &candidate.item;
    let name = item.label().to_string();

    if ctx.store.is_valid(path) {
        stage(UpdateStage::UsingCachedFile(name));
        apply(ctx, path, attempt.fill_mode, cancel, stage).await?;
        if let Err(err) = ctx.store.touch(path) {
            debug!(error = %err, "could not refresh wallpaper timestamp");
        }
        return Ok(true);
    }

    stage(UpdateStage::Downloading {
        name: name.clone(),
        attempt: attempt.attempt,
        total: attempt.total,
    });
    let bytes = cancellable(cancel, ctx.source.download_image_data(item)).await?;
    if bytes.is_empty() {
        return Err(Error::http(204, "download returned no data"));
    }

    stage(UpdateStage::Decoding(name.clone()));
    let jpeg = ctx
        .worker
        .normalize(normalize_request(item, bytes, attempt), cancel.clone())
        .await?;

    ensure_live(cancel)?;
    stage(UpdateStage::WritingFile(name));
    ctx.store.write_atomic(path, &jpeg)?;

    apply(ctx, path, attempt.fill_mode, cancel, stage).await?;
    Ok(false)
}

fn normalize_request(item: &MediaItem, bytes: Vec<u8>, attempt: Attempt) -> NormalizeRequest {
    NormalizeRequest {
        bytes,
        max_dimension: attempt.max_dimension,
        filename_hint: item.display_name.clone(),
        quality: attempt.quality,
    }
}

async fn apply(
    ctx: &RunContext,
    path: &Path,
    mode: FillMode,
    cancel: &CancellationToken,
    stage: &(dyn Fn(UpdateStage) + Send + Sync),
) -> Result<()> {
    let count = on_display(&ctx.display, |d| Ok(d.displays().map(|v| v.len()).unwrap_or(0)))
        .await?
        .max(1);
    ensure_live(cancel)?;
    stage(UpdateStage::ApplyingToDisplays(count));
    let path = path.to_path_buf();
    on_display(&ctx.display, move |d| d.apply(&path, mode)).await?;
    Ok(())
}
