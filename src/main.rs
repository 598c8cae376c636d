//! Binary entrypoint for album-wallpaper.

use std::path::PathBuf;
use std::sync::Arc;

use album_wallpaper::config::{APP_DIR_NAME, Configuration, ProviderKind};
use album_wallpaper::events::Trigger;
use album_wallpaper::platform::display_surface::CommandDisplaySurface;
use album_wallpaper::processing::NormalizeWorker;
use album_wallpaper::schedule::{DueInputs, SchedulePolicy, TokioScheduler, compute_next_due};
use album_wallpaper::source::{PhotoSource, build_source};
use album_wallpaper::store::WallpaperStore;
use album_wallpaper::tasks::run::{RunContext, RunOptions, RunOutcome};
use album_wallpaper::tasks::settings_watch;
use album_wallpaper::tasks::updater::{Updater, UpdaterHandle};
use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand};
use settings_model::{MemorySettingsStore, Settings, SettingsStore, YamlSettingsStore};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

#[derive(Debug, Parser)]
#[command(
    name = "album-wallpaper",
    version,
    about = "Rotates the desktop wallpaper through a cloud photo album"
)]
struct Args {
    /// Path to YAML config (default: <config dir>/album-wallpaper/config.yaml when present)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Keep the wallpaper rotating; SIGUSR1 forces an update, SIGHUP reloads settings
    Run,
    /// Update the wallpaper once and exit
    Update,
    /// List albums on the configured provider
    Albums,
    /// Check that an album still exists
    Verify { album_id: String },
    /// Count usable photos on the first page of an album
    Probe { album_id: String },
    /// Verify an album and make it the rotation source
    Select { album_id: String },
    /// Delete cached wallpapers
    ClearCache,
    /// Print when the next automatic update is due
    NextDue,
}

fn init_tracing(verbosity: u8) -> Result<()> {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let directive: Directive = format!("album_wallpaper={level}")
        .parse()
        .context("invalid log directive")?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive(directive);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<Configuration> {
    let path = path.or_else(|| {
        let default = dirs::config_dir()?.join(APP_DIR_NAME).join("config.yaml");
        default.is_file().then_some(default)
    });
    let cfg = match &path {
        Some(path) => Configuration::from_yaml_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Configuration::default(),
    };
    cfg.validated().context("invalid configuration values")
}

/// Opens the settings store and returns the file backing it, if any.
///
/// Fixture runs without a settings file keep everything in memory.
fn open_settings(cfg: &Configuration) -> (Arc<dyn SettingsStore>, Option<PathBuf>) {
    if cfg.provider.kind == ProviderKind::Fixture && cfg.settings_file.is_none() {
        let mut settings = Settings::default();
        settings.select_album("uitest-album-1".into(), Some("UI Test Album 1".into()), None);
        return (Arc::new(MemorySettingsStore::new(settings)), None);
    }
    let store = YamlSettingsStore::new(cfg.settings_file());
    let path = store.path().to_path_buf();
    (Arc::new(store), Some(path))
}

fn spawn_updater(
    cfg: &Configuration,
    source: Arc<dyn PhotoSource>,
    settings: Arc<dyn SettingsStore>,
) -> Result<UpdaterHandle> {
    let display = CommandDisplaySurface::new(&cfg.display).context("invalid display settings")?;
    let updater = Updater {
        run: RunContext {
            source,
            display: Arc::new(display),
            store: WallpaperStore::new(cfg.cache_dir()),
            worker: NormalizeWorker::spawn()?,
            options: RunOptions::from(cfg),
        },
        settings,
        scheduler: Arc::new(TokioScheduler),
        policy: SchedulePolicy::from(&cfg.scheduling),
    };
    updater.spawn()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose)?;

    let cfg = load_config(args.config)?;
    let (settings, settings_path) = open_settings(&cfg);
    let source = build_source(&cfg.provider).context("failed to set up photo provider")?;
    info!(provider = source.name(), cache = %cfg.cache_dir().display(), "configured");

    match args.command {
        Command::Run => run_daemon(&cfg, source, settings, settings_path).await,
        Command::Update => {
            let handle = spawn_updater(&cfg, source, settings)?;
            let result = handle.run_now().await;
            handle.shutdown().await;
            match result? {
                RunOutcome::Applied(applied) => {
                    println!("Wallpaper set to {} ({})", applied.item_name, applied.path.display());
                }
                RunOutcome::NoPhotos => println!("No photos in the album pass the current filters."),
            }
            Ok(())
        }
        Command::Albums => {
            for album in source.list_albums().await? {
                println!(
                    "{}\t{}\t{}",
                    album.id,
                    album.label(),
                    album.web_url.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        Command::Verify { album_id } => match source.verify_album_exists(&album_id).await? {
            Some(album) => {
                println!("{}\t{}", album.id, album.label());
                Ok(())
            }
            None => bail!("album {album_id} was not found"),
        },
        Command::Probe { album_id } => {
            let count = source.probe_usable_count_first_page(&album_id).await?;
            println!("{count}");
            Ok(())
        }
        Command::Select { album_id } => {
            let Some(album) = source.verify_album_exists(&album_id).await? else {
                bail!("album {album_id} was not found");
            };
            let mut current = settings.load()?;
            current.select_album(album.id.clone(), album.display_name.clone(), album.web_url.clone());
            settings.save(&current)?;
            println!("Selected {}", album.label());
            Ok(())
        }
        Command::ClearCache => {
            let handle = spawn_updater(&cfg, source, settings)?;
            let removed = handle.clear_cache().await;
            handle.shutdown().await;
            println!("Removed {} cached wallpaper(s)", removed?);
            Ok(())
        }
        Command::NextDue => {
            let current = settings.load()?;
            let now = Utc::now();
            let due = compute_next_due(
                DueInputs {
                    now,
                    last_success: current.last_successful_update,
                    interval: current.change_frequency.interval(),
                    has_album: current.has_album(),
                    paused: current.paused,
                    last_attempt: None,
                },
                SchedulePolicy::from(&cfg.scheduling),
            );
            match due {
                Some(due) => {
                    let wait = (due - now).to_std().unwrap_or_default();
                    println!(
                        "{} (in {})",
                        due.to_rfc3339(),
                        humantime::format_duration(std::time::Duration::from_secs(wait.as_secs()))
                    );
                }
                None => println!("not scheduled ({})", current.change_frequency.as_str()),
            }
            Ok(())
        }
    }
}

async fn run_daemon(
    cfg: &Configuration,
    source: Arc<dyn PhotoSource>,
    settings: Arc<dyn SettingsStore>,
    settings_path: Option<PathBuf>,
) -> Result<()> {
    let handle = spawn_updater(cfg, source, settings)?;
    let cancel = CancellationToken::new();

    if let Some(path) = settings_path {
        let cancel = cancel.clone();
        let control = handle.clone();
        tokio::spawn(async move {
            if let Err(err) = settings_watch::run(path, control, cancel).await {
                warn!(error = %format!("{err:#}"), "settings watcher stopped; send SIGHUP after editing settings");
            }
        });
    }

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("ctrl-c handler failed: {err}");
                return;
            }
            info!("ctrl-c received; initiating shutdown");
            cancel.cancel();
        });
    }

    #[cfg(unix)]
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    if sigterm.recv().await.is_some() {
                        info!("SIGTERM received; initiating shutdown");
                        cancel.cancel();
                    }
                }
                Err(err) => warn!("failed to register SIGTERM handler: {err}"),
            }
        });
    }

    #[cfg(unix)]
    {
        let cancel = cancel.clone();
        let control = handle.clone();
        tokio::spawn(async move {
            match signal(SignalKind::user_defined1()) {
                Ok(mut sigusr1) => loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        received = sigusr1.recv() => {
                            if received.is_none() {
                                break;
                            }
                            info!("SIGUSR1 received; updating wallpaper");
                            if let Err(err) = control.request_update(Trigger::Manual) {
                                warn!("failed to forward update request: {err}");
                                break;
                            }
                        }
                    }
                },
                Err(err) => warn!("failed to register SIGUSR1 handler: {err}"),
            }
        });
    }

    #[cfg(unix)]
    {
        let cancel = cancel.clone();
        let control = handle.clone();
        tokio::spawn(async move {
            match signal(SignalKind::hangup()) {
                Ok(mut sighup) => loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        received = sighup.recv() => {
                            if received.is_none() {
                                break;
                            }
                            info!("SIGHUP received; reloading settings");
                            if control.refresh_schedule().is_err() {
                                break;
                            }
                        }
                    }
                },
                Err(err) => warn!("failed to register SIGHUP handler: {err}"),
            }
        });
    }

    let mut status = handle.status();
    let mut last_error = None;
    let mut warned_empty = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status.borrow_and_update().clone();
                if snapshot.last_error != last_error {
                    if let Some(message) = &snapshot.last_error {
                        warn!(%message, "wallpaper update failed");
                    }
                    last_error = snapshot.last_error;
                }
                if snapshot.no_pictures_found && !warned_empty {
                    warn!("no usable photos in the selected album");
                }
                warned_empty = snapshot.no_pictures_found;
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}
