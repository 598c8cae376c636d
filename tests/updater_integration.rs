use album_wallpaper::Error;
use album_wallpaper::events::{Trigger, UpdateStage};
use album_wallpaper::media::{Album, MediaItem};
use album_wallpaper::platform::display_surface::{DisplayInfo, DisplaySurface};
use album_wallpaper::processing::NormalizeWorker;
use album_wallpaper::schedule::{SchedulePolicy, Scheduler};
use album_wallpaper::source::{FixtureSource, PhotoSource};
use album_wallpaper::store::{LEGACY_FILE_NAME, WallpaperStore};
use album_wallpaper::tasks::run::{RunContext, RunOptions, RunOutcome};
use album_wallpaper::tasks::settings_watch;
use album_wallpaper::tasks::updater::{Updater, UpdaterHandle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use settings_model::{
    FillMode, MemorySettingsStore, Settings, SettingsStore, YamlSettingsStore,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct StubDisplay {
    applied: Mutex<Vec<PathBuf>>,
    /// Wallpapers already on screen before the test starts.
    showing: Vec<PathBuf>,
    fail: bool,
}

impl DisplaySurface for StubDisplay {
    fn displays(&self) -> anyhow::Result<Vec<DisplayInfo>> {
        Ok(vec![DisplayInfo {
            name: "TEST-1".into(),
            width: Some(64),
            height: Some(48),
        }])
    }

    fn apply(&self, path: &Path, _mode: FillMode) -> anyhow::Result<usize> {
        if self.fail {
            anyhow::bail!("output TEST-1 is gone");
        }
        self.applied.lock().unwrap().push(path.to_path_buf());
        Ok(1)
    }

    fn active_wallpapers(&self) -> Vec<PathBuf> {
        let latest = self.applied.lock().unwrap().last().cloned();
        self.showing.iter().cloned().chain(latest).collect()
    }
}

/// Never fires; the tests drive updates by hand.
#[derive(Default)]
struct IdleScheduler {
    armed: Mutex<Vec<DateTime<Utc>>>,
}

impl Scheduler for IdleScheduler {
    fn schedule_at(&self, due: DateTime<Utc>, _fire: Box<dyn FnOnce() + Send>) -> CancellationToken {
        self.armed.lock().unwrap().push(due);
        CancellationToken::new()
    }
}

/// Fixture source whose first search blocks until released.
struct GatedSource {
    inner: FixtureSource,
    gate: Notify,
    searches: AtomicUsize,
}

#[async_trait]
impl PhotoSource for GatedSource {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn list_albums(&self) -> album_wallpaper::Result<Vec<Album>> {
        self.inner.list_albums().await
    }

    async fn verify_album_exists(&self, album_id: &str) -> album_wallpaper::Result<Option<Album>> {
        self.inner.verify_album_exists(album_id).await
    }

    async fn search_photos(&self, album_id: &str) -> album_wallpaper::Result<Vec<MediaItem>> {
        if self.searches.fetch_add(1, Ordering::SeqCst) == 0 {
            self.gate.notified().await;
        }
        self.inner.search_photos(album_id).await
    }

    async fn probe_usable_count_first_page(&self, album_id: &str) -> album_wallpaper::Result<usize> {
        self.inner.probe_usable_count_first_page(album_id).await
    }

    async fn download_image_data(&self, item: &MediaItem) -> album_wallpaper::Result<Vec<u8>> {
        self.inner.download_image_data(item).await
    }
}

/// Fixture source whose downloads always fail.
struct BrokenDownloads(FixtureSource);

#[async_trait]
impl PhotoSource for BrokenDownloads {
    fn name(&self) -> &'static str {
        "broken-downloads"
    }

    async fn list_albums(&self) -> album_wallpaper::Result<Vec<Album>> {
        self.0.list_albums().await
    }

    async fn verify_album_exists(&self, album_id: &str) -> album_wallpaper::Result<Option<Album>> {
        self.0.verify_album_exists(album_id).await
    }

    async fn search_photos(&self, album_id: &str) -> album_wallpaper::Result<Vec<MediaItem>> {
        self.0.search_photos(album_id).await
    }

    async fn probe_usable_count_first_page(&self, album_id: &str) -> album_wallpaper::Result<usize> {
        self.0.probe_usable_count_first_page(album_id).await
    }

    async fn download_image_data(&self, _item: &MediaItem) -> album_wallpaper::Result<Vec<u8>> {
        Err(Error::http(503, "service unavailable"))
    }
}

fn gated_fixture() -> Arc<GatedSource> {
    Arc::new(GatedSource {
        inner: FixtureSource::default(),
        gate: Notify::new(),
        searches: AtomicUsize::new(0),
    })
}

fn photo_items(count: usize) -> Vec<MediaItem> {
    (1..=count)
        .map(|n| MediaItem {
            pixel_width: Some(4000),
            pixel_height: Some(3000),
            display_name: Some(format!("photo-{n}.png")),
            mime_type: Some("image/png".into()),
            ..MediaItem::new(format!("photo-{n}"))
        })
        .collect()
}

struct Harness {
    handle: UpdaterHandle,
    settings: Arc<MemorySettingsStore>,
    display: Arc<StubDisplay>,
    store: WallpaperStore,
    scheduler: Arc<IdleScheduler>,
    _dir: TempDir,
}

fn sequential_settings() -> Settings {
    let mut settings = Settings {
        pick_randomly: false,
        ..Settings::default()
    };
    settings.select_album("uitest-album-1".into(), None, None);
    settings
}

fn run_context(source: Arc<dyn PhotoSource>, display: Arc<StubDisplay>, store: &WallpaperStore) -> RunContext {
    RunContext {
        source,
        display,
        store: store.clone(),
        worker: NormalizeWorker::spawn().unwrap(),
        options: RunOptions {
            standard_attempts: 3,
            extended_attempts: 5,
            jpeg_quality: 0.9,
            max_dimension: Some(64),
            fallback_max_dimension: 1920,
            cache_keep: 50,
        },
    }
}

fn harness(source: Arc<dyn PhotoSource>, settings: Settings, fail_display: bool) -> Harness {
    harness_with(source, settings, fail_display, |_| Vec::new())
}

fn harness_with(
    source: Arc<dyn PhotoSource>,
    settings: Settings,
    fail_display: bool,
    showing: impl FnOnce(&WallpaperStore) -> Vec<PathBuf>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = WallpaperStore::new(dir.path().join("cache"));
    let settings = Arc::new(MemorySettingsStore::new(settings));
    let display = Arc::new(StubDisplay {
        applied: Mutex::new(Vec::new()),
        showing: showing(&store),
        fail: fail_display,
    });
    let scheduler = Arc::new(IdleScheduler::default());
    let handle = Updater {
        run: run_context(source, display.clone(), &store),
        settings: settings.clone(),
        scheduler: scheduler.clone(),
        policy: SchedulePolicy::default(),
    }
    .spawn()
    .unwrap();
    Harness {
        handle,
        settings,
        display,
        store,
        scheduler,
        _dir: dir,
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn applied(outcome: RunOutcome) -> album_wallpaper::tasks::run::AppliedWallpaper {
    match outcome {
        RunOutcome::Applied(applied) => applied,
        other => panic!("expected an applied wallpaper, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_update_applies_and_records_success() {
    let h = harness(Arc::new(FixtureSource::default()), sequential_settings(), false);

    let first = applied(h.handle.run_now().await.unwrap());
    assert_eq!(first.item_id, "uitest-item-1");
    assert_eq!(first.sequential_index, Some(0));
    assert!(!first.from_cache);
    assert!(h.store.is_valid(&first.path));
    assert_eq!(*h.display.applied.lock().unwrap(), vec![first.path.clone()]);

    let saved = h.settings.snapshot();
    assert_eq!(saved.last_set_item_id.as_deref(), Some("uitest-item-1"));
    assert_eq!(saved.last_picked_index, Some(0));
    assert_eq!(saved.album_picture_count, 2);
    assert!(!saved.no_pictures_found);
    assert!(saved.last_successful_update.is_some());

    let status = h.handle.status().borrow().clone();
    assert_eq!(status.stage, UpdateStage::Done("uitest-item-1.png".into()));
    assert!(!status.is_updating);
    assert_eq!(status.last_error, None);
    assert!(status.next_due.is_some());
    assert!(!h.scheduler.armed.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sequential_runs_advance_and_reuse_the_cache() {
    let h = harness(Arc::new(FixtureSource::default()), sequential_settings(), false);

    let first = applied(h.handle.run_now().await.unwrap());
    let second = applied(h.handle.run_now().await.unwrap());
    assert_eq!(second.item_id, "uitest-item-2");
    assert_eq!(second.sequential_index, Some(1));
    assert_ne!(first.path, second.path);

    let third = applied(h.handle.run_now().await.unwrap());
    assert_eq!(third.item_id, "uitest-item-1");
    assert!(third.from_cache);
    assert_eq!(third.path, first.path);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn random_mode_never_repeats_the_last_item() {
    let mut settings = sequential_settings();
    settings.pick_randomly = true;
    let h = harness(Arc::new(FixtureSource::default()), settings, false);

    let mut last = applied(h.handle.run_now().await.unwrap()).item_id;
    for _ in 0..4 {
        let next = applied(h.handle.run_now().await.unwrap()).item_id;
        assert_ne!(next, last);
        last = next;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_photo_may_repeat() {
    let only = FixtureSource::default()
        .search_photos("uitest-album-1")
        .await
        .unwrap()
        .remove(0);
    let source = FixtureSource::default().with_items(vec![only.clone()]);
    let mut settings = sequential_settings();
    settings.last_set_item_id = Some(only.id.clone());
    let h = harness(Arc::new(source), settings, false);

    let again = applied(h.handle.run_now().await.unwrap());
    assert_eq!(again.item_id, only.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_request_supersedes_running_update() {
    let source = gated_fixture();
    let h = harness(source.clone(), sequential_settings(), false);

    let first = tokio::spawn({
        let handle = h.handle.clone();
        async move { handle.run_now().await }
    });
    wait_until(|| source.searches.load(Ordering::SeqCst) == 1).await;
    assert!(h.handle.status().borrow().is_updating);

    let second = applied(h.handle.run_now().await.unwrap());
    assert_eq!(second.item_id, "uitest-item-1");
    assert!(matches!(first.await.unwrap(), Err(Error::Cancelled)));
    assert_eq!(h.display.applied.lock().unwrap().len(), 1);
    assert_eq!(h.handle.status().borrow().last_error, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timer_trigger_never_preempts() {
    let source = gated_fixture();
    let h = harness(source.clone(), sequential_settings(), false);

    let first = tokio::spawn({
        let handle = h.handle.clone();
        async move { handle.run_now().await }
    });
    wait_until(|| source.searches.load(Ordering::SeqCst) == 1).await;

    h.handle.request_update(Trigger::Timer).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(source.searches.load(Ordering::SeqCst), 1);

    source.gate.notify_one();
    let done = applied(first.await.unwrap().unwrap());
    assert_eq!(done.item_id, "uitest-item-1");
    assert_eq!(source.searches.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_display_reports_every_attempt() {
    let h = harness(Arc::new(FixtureSource::default()), sequential_settings(), true);

    let err = h.handle.run_now().await.unwrap_err();
    match &err {
        Error::AllCandidatesFailed(messages) => assert_eq!(messages.len(), 2),
        other => panic!("unexpected error: {other:?}"),
    }
    let status = h.handle.status().borrow().clone();
    let message = status.last_error.unwrap();
    assert!(message.starts_with("Couldn't decode/convert any of the last 2 photos."));
    assert_eq!(status.stage, UpdateStage::Idle);

    assert_eq!(h.settings.snapshot().last_set_item_id, None);
    let cached = std::fs::read_dir(h.store.dir()).map(|d| d.count()).unwrap_or(0);
    assert_eq!(cached, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn filters_that_empty_the_pool_raise_the_warning_flag() {
    let mut settings = sequential_settings();
    settings.minimum_picture_width = Some(10_000);
    let h = harness(Arc::new(FixtureSource::default()), settings, false);

    assert_eq!(h.handle.run_now().await.unwrap(), RunOutcome::NoPhotos);
    let saved = h.settings.snapshot();
    assert!(saved.no_pictures_found);
    assert_eq!(saved.album_picture_count, 0);
    assert!(h.handle.status().borrow().no_pictures_found);
    assert!(h.display.applied.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_album_is_surfaced_and_not_scheduled() {
    let h = harness(Arc::new(FixtureSource::default()), Settings::default(), false);

    let err = h.handle.run_now().await.unwrap_err();
    assert!(matches!(err, Error::NoAlbumSelected));
    let status = h.handle.status().borrow().clone();
    assert_eq!(status.last_error.as_deref(), Some("No album selected."));
    assert_eq!(status.next_due, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clear_cache_removes_files_and_forgets_last_item() {
    let h = harness(Arc::new(FixtureSource::default()), sequential_settings(), false);
    let first = applied(h.handle.run_now().await.unwrap());
    std::fs::write(h.store.dir().join(LEGACY_FILE_NAME), b"old").unwrap();

    assert_eq!(h.handle.clear_cache().await.unwrap(), 2);
    assert!(!first.path.exists());
    assert!(!h.store.dir().join(LEGACY_FILE_NAME).exists());
    let saved = h.settings.snapshot();
    assert_eq!(saved.last_set_item_id, None);
    assert_eq!(saved.last_set_item_name, None);

    h.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn settings_changed_during_a_run_are_kept() {
    let source = gated_fixture();
    let h = harness(source.clone(), sequential_settings(), false);

    let running = tokio::spawn({
        let handle = h.handle.clone();
        async move { handle.run_now().await }
    });
    wait_until(|| source.searches.load(Ordering::SeqCst) == 1).await;

    let mut edited = h.settings.load().unwrap();
    edited.paused = true;
    edited.select_album("uitest-album-2".into(), Some("UI Test Album 2".into()), None);
    h.settings.save(&edited).unwrap();
    source.gate.notify_one();

    let done = applied(running.await.unwrap().unwrap());
    assert_eq!(done.item_id, "uitest-item-1");

    let saved = h.settings.snapshot();
    assert!(saved.paused);
    assert_eq!(saved.album_id(), Some("uitest-album-2"));
    assert_eq!(saved.selected_album_name.as_deref(), Some("UI Test Album 2"));
    assert_eq!(saved.last_set_item_id.as_deref(), Some("uitest-item-1"));
    assert!(saved.last_successful_update.is_some());
    assert_eq!(saved.last_picked_index, None);
    assert_eq!(saved.album_picture_count, 0);
    assert_eq!(h.handle.status().borrow().next_due, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_run_keeps_the_previous_error() {
    let source = gated_fixture();
    let h = harness(source.clone(), Settings::default(), false);

    assert!(matches!(h.handle.run_now().await, Err(Error::NoAlbumSelected)));
    let recorded = h.handle.status().borrow().last_error.clone();
    assert_eq!(recorded.as_deref(), Some("No album selected."));

    h.settings.save(&sequential_settings()).unwrap();
    let running = tokio::spawn({
        let handle = h.handle.clone();
        async move { handle.run_now().await }
    });
    wait_until(|| source.searches.load(Ordering::SeqCst) == 1).await;

    h.handle.clear_cache().await.unwrap();
    assert!(matches!(running.await.unwrap(), Err(Error::Cancelled)));
    source.gate.notify_one();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = h.handle.status().borrow().clone();
    assert_eq!(status.last_error, recorded);
    assert!(!status.is_updating);
    assert_eq!(status.stage, UpdateStage::Idle);
    assert!(h.display.applied.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn attempt_budget_grows_while_our_wallpaper_is_on_screen() {
    let broken = || Arc::new(BrokenDownloads(FixtureSource::default().with_items(photo_items(6))));

    let ours = harness_with(broken(), sequential_settings(), false, |store| {
        vec![store.path_for(&MediaItem::new("shown-earlier"))]
    });
    match ours.handle.run_now().await.unwrap_err() {
        Error::AllCandidatesFailed(messages) => assert_eq!(messages.len(), 5),
        other => panic!("unexpected error: {other:?}"),
    }

    let foreign = harness_with(broken(), sequential_settings(), false, |_| {
        vec![PathBuf::from("/usr/share/backgrounds/default.jpg")]
    });
    match foreign.handle.run_now().await.unwrap_err() {
        Error::AllCandidatesFailed(messages) => {
            assert_eq!(messages.len(), 3);
            assert!(messages.iter().all(|m| m.starts_with("HTTP 503")));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn candidate_already_on_screen_is_skipped_without_failing() {
    let first = FixtureSource::default()
        .search_photos("uitest-album-1")
        .await
        .unwrap()
        .remove(0);
    let h = harness_with(Arc::new(FixtureSource::default()), sequential_settings(), false, |store| {
        vec![store.path_for(&first)]
    });

    let outcome = applied(h.handle.run_now().await.unwrap());
    assert_eq!(outcome.item_id, "uitest-item-2");
    assert_eq!(outcome.sequential_index, Some(1));
    assert_eq!(*h.display.applied.lock().unwrap(), vec![outcome.path.clone()]);
    assert_eq!(h.handle.status().borrow().last_error, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_candidate_on_screen_yields_no_fresh_candidate() {
    let items = FixtureSource::default()
        .search_photos("uitest-album-1")
        .await
        .unwrap();
    let h = harness_with(Arc::new(FixtureSource::default()), sequential_settings(), false, |store| {
        items.iter().map(|item| store.path_for(item)).collect()
    });

    let err = h.handle.run_now().await.unwrap_err();
    assert!(matches!(err, Error::NoFreshCandidate), "{err:?}");
    assert!(h.display.applied.lock().unwrap().is_empty());
    assert_eq!(
        h.handle.status().borrow().last_error.as_deref(),
        Some("Couldn't pick a different photo to avoid repeating the last wallpaper.")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn settings_file_edits_rearm_the_timer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.yaml");
    let settings = Arc::new(YamlSettingsStore::new(&path));
    let store = WallpaperStore::new(dir.path().join("cache"));
    let display = Arc::new(StubDisplay {
        applied: Mutex::new(Vec::new()),
        showing: Vec::new(),
        fail: false,
    });
    let handle = Updater {
        run: run_context(Arc::new(FixtureSource::default()), display, &store),
        settings: settings.clone(),
        scheduler: Arc::new(IdleScheduler::default()),
        policy: SchedulePolicy::default(),
    }
    .spawn()
    .unwrap();
    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(settings_watch::run(path.clone(), handle.clone(), cancel.clone()));

    let status = handle.status();
    assert_eq!(status.borrow().next_due, None);

    let mut selected = Settings::default();
    selected.select_album("uitest-album-1".into(), None, None);
    let mut armed = false;
    for _ in 0..50 {
        settings.save(&selected).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        if status.borrow().next_due.is_some() {
            armed = true;
            break;
        }
    }
    assert!(armed, "selecting an album on disk never armed the timer");

    selected.paused = true;
    settings.save(&selected).unwrap();
    wait_until(|| status.borrow().next_due.is_none()).await;

    cancel.cancel();
    watcher.await.unwrap().unwrap();
    handle.shutdown().await;
}
