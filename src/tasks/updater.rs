//! Coordinator that owns every piece of mutable updater state.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use settings_model::{Settings, SettingsStore};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::run::{self, RunContext, RunEvent, RunOutcome, RunRequest};
use crate::error::{Error, Result};
use crate::events::{Trigger, UpdateStage, UpdateStatus};
use crate::schedule::{DueInputs, SchedulePolicy, Scheduler, TimerSlot, compute_next_due};

type RunReply = oneshot::Sender<Result<RunOutcome>>;

enum Command {
    Request {
        trigger: Trigger,
        done: Option<RunReply>,
    },
    ClearCache(oneshot::Sender<Result<usize>>),
    RefreshSchedule,
    Shutdown(oneshot::Sender<()>),
    Progress {
        run: u64,
        event: RunEvent,
    },
    Finished {
        run: u64,
        result: Result<RunOutcome>,
    },
}

/// Everything the coordinator needs; consumed by [`Updater::spawn`].
pub struct Updater {
    pub run: RunContext,
    pub settings: Arc<dyn SettingsStore>,
    pub scheduler: Arc<dyn Scheduler>,
    pub policy: SchedulePolicy,
}

impl Updater {
    /// Starts the coordinator on the current runtime and arms the first timer.
    pub fn spawn(self) -> anyhow::Result<UpdaterHandle> {
        let settings = self.settings.load().context("failed to load settings")?;
        let (commands, queue) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(UpdateStatus {
            last_successful_update: settings.last_successful_update,
            album_picture_count: settings.album_picture_count,
            no_pictures_found: settings.no_pictures_found,
            ..UpdateStatus::default()
        });

        let coordinator = Coordinator {
            timer: TimerSlot::new(Arc::clone(&self.scheduler)),
            deps: self,
            settings,
            commands: commands.downgrade(),
            status: status_tx,
            current: None,
            next_run_id: 0,
            last_attempt: None,
        };
        tokio::spawn(coordinator.serve(queue));
        Ok(UpdaterHandle { commands, status })
    }
}

/// Cheap, cloneable front door to a running coordinator.
#[derive(Clone)]
pub struct UpdaterHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<UpdateStatus>,
}

impl UpdaterHandle {
    fn send(&self, command: Command) -> anyhow::Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow::anyhow!("updater has stopped"))
    }

    pub fn request_update(&self, trigger: Trigger) -> anyhow::Result<()> {
        self.send(Command::Request {
            trigger,
            done: None,
        })
    }

    /// Manual update that resolves when its run ends; superseded runs report `Cancelled`.
    pub async fn run_now(&self) -> Result<RunOutcome> {
        let (done, result) = oneshot::channel();
        self.send(Command::Request {
            trigger: Trigger::Manual,
            done: Some(done),
        })
        .map_err(|_| Error::Cancelled)?;
        result.await.unwrap_or(Err(Error::Cancelled))
    }

    /// Cancels any run, empties the store and forgets the last applied item.
    pub async fn clear_cache(&self) -> anyhow::Result<usize> {
        let (reply, removed) = oneshot::channel();
        self.send(Command::ClearCache(reply))?;
        let removed = removed.await.context("updater stopped while clearing the cache")?;
        Ok(removed?)
    }

    /// Re-reads settings and re-arms the timer.
    pub fn refresh_schedule(&self) -> anyhow::Result<()> {
        self.send(Command::RefreshSchedule)
    }

    pub fn status(&self) -> watch::Receiver<UpdateStatus> {
        self.status.clone()
    }

    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.send(Command::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

struct CurrentRun {
    id: u64,
    trigger: Trigger,
    /// Album the run was started for.
    album_id: Option<String>,
    cancel: CancellationToken,
    done: Option<RunReply>,
}

struct Coordinator {
    deps: Updater,
    settings: Settings,
    commands: mpsc::WeakUnboundedSender<Command>,
    status: watch::Sender<UpdateStatus>,
    timer: TimerSlot,
    current: Option<CurrentRun>,
    next_run_id: u64,
    last_attempt: Option<DateTime<Utc>>,
}

impl Coordinator {
    async fn serve(mut self, mut queue: mpsc::UnboundedReceiver<Command>) {
        self.reschedule();
        while let Some(command) = queue.recv().await {
            match command {
                Command::Request { trigger, done } => self.request(trigger, done),
                Command::ClearCache(reply) => {
                    let result = self.clear_cache();
                    let _ = reply.send(result);
                }
                Command::RefreshSchedule => {
                    self.reload_settings();
                    self.reschedule();
                }
                Command::Progress { run, event } => self.progress(run, event),
                Command::Finished { run, result } => self.finished(run, result),
                Command::Shutdown(ack) => {
                    self.supersede();
                    self.timer.disarm();
                    let _ = ack.send(());
                    info!("updater stopped");
                    return;
                }
            }
        }
        self.supersede();
        debug!("all updater handles dropped");
    }

    fn request(&mut self, trigger: Trigger, done: Option<RunReply>) {
        if trigger == Trigger::Manual {
            self.timer.disarm();
            self.status.send_modify(|s| s.next_due = None);
        }
        if let Some(current) = &self.current {
            if trigger == Trigger::Timer {
                debug!(running = ?current.trigger, "update in flight; timer trigger ignored");
                return;
            }
            info!(superseded = current.id, "manual update supersedes running update");
            self.supersede();
        }
        self.start(trigger, done);
    }

    fn start(&mut self, trigger: Trigger, done: Option<RunReply>) {
        self.reload_settings();
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        self.next_run_id += 1;
        let id = self.next_run_id;
        let cancel = CancellationToken::new();
        self.last_attempt = Some(Utc::now());
        self.current = Some(CurrentRun {
            id,
            trigger,
            album_id: self.settings.album_id().map(str::to_string),
            cancel: cancel.clone(),
            done,
        });
        self.status.send_modify(|s| {
            s.is_updating = true;
            s.stage = UpdateStage::Idle;
        });
        info!(run = id, ?trigger, "starting update");

        let ctx = self.deps.run.clone();
        let request = RunRequest::from(&self.settings);
        tokio::spawn(async move {
            let progress = commands.clone();
            let report = move |event| {
                let _ = progress.send(Command::Progress { run: id, event });
            };
            let result = run::execute(&ctx, request, cancel, report).await;
            let _ = commands.send(Command::Finished { run: id, result });
        });
    }

    /// Cancels and clears the current run slot.
    fn supersede(&mut self) {
        let Some(current) = self.current.take() else {
            return;
        };
        current.cancel.cancel();
        if let Some(done) = current.done {
            let _ = done.send(Err(Error::Cancelled));
        }
        self.status.send_modify(|s| {
            s.is_updating = false;
            s.stage = UpdateStage::Idle;
        });
    }

    fn is_current(&self, run: u64) -> bool {
        self.current.as_ref().is_some_and(|c| c.id == run)
    }

    fn progress(&mut self, run: u64, event: RunEvent) {
        if !self.is_current(run) {
            return;
        }
        match event {
            RunEvent::Stage(stage) => self.status.send_modify(|s| s.stage = stage),
            RunEvent::PoolScanned(count) => {
                let album = self.current.as_ref().and_then(|c| c.album_id.clone());
                self.record(|s| {
                    if s.album_id() == album.as_deref() {
                        s.album_picture_count = count;
                        s.no_pictures_found = count == 0;
                    }
                });
                let (count, empty) = (self.settings.album_picture_count, self.settings.no_pictures_found);
                self.status.send_modify(|s| {
                    s.album_picture_count = count;
                    s.no_pictures_found = empty;
                });
            }
        }
    }

    fn finished(&mut self, run: u64, result: Result<RunOutcome>) {
        let Some(current) = self.current.take_if(|c| c.id == run) else {
            debug!(run, "discarding result of superseded run");
            return;
        };
        self.reload_settings();

        let reschedule = match &result {
            Ok(RunOutcome::Applied(applied)) => {
                let now = Utc::now();
                let album = current.album_id.as_deref();
                self.record(|s| {
                    // The sequential position belongs to the album the run walked.
                    if s.album_id() == album {
                        if let Some(index) = applied.sequential_index {
                            s.last_picked_index = Some(index);
                        }
                    }
                    s.last_set_item_id = Some(applied.item_id.clone());
                    s.last_set_item_name = Some(applied.item_name.clone());
                    s.last_successful_update = Some(now);
                });
                self.status.send_modify(|s| {
                    s.last_error = None;
                    s.last_successful_update = Some(now);
                    s.stage = UpdateStage::Done(applied.item_name.clone());
                });
                true
            }
            Ok(RunOutcome::NoPhotos) => {
                self.status.send_modify(|s| s.stage = UpdateStage::Idle);
                true
            }
            Err(err) if err.is_cancelled() => {
                debug!(run, "update cancelled");
                self.status.send_modify(|s| s.stage = UpdateStage::Idle);
                false
            }
            Err(err) => {
                warn!(run, error = %err, "update failed");
                let message = err.to_string();
                self.status.send_modify(|s| {
                    s.last_error = Some(message);
                    s.stage = UpdateStage::Idle;
                });
                true
            }
        };
        self.status.send_modify(|s| s.is_updating = false);
        if reschedule {
            self.reschedule();
        }
        if let Some(done) = current.done {
            let _ = done.send(result);
        }
    }

    fn clear_cache(&mut self) -> Result<usize> {
        self.supersede();
        let removed = self.deps.run.store.clear()?;
        self.record(Settings::forget_last_set_item);
        self.reschedule();
        Ok(removed)
    }

    fn reschedule(&mut self) {
        let inputs = DueInputs {
            now: Utc::now(),
            last_success: self.settings.last_successful_update,
            interval: self.settings.change_frequency.interval(),
            has_album: self.settings.has_album(),
            paused: self.settings.paused,
            last_attempt: self.last_attempt,
        };
        match compute_next_due(inputs, self.deps.policy) {
            Some(due) => {
                let commands = self.commands.clone();
                self.timer.arm(
                    due,
                    Box::new(move || {
                        if let Some(commands) = commands.upgrade() {
                            let _ = commands.send(Command::Request {
                                trigger: Trigger::Timer,
                                done: None,
                            });
                        }
                    }),
                );
                info!(%due, "next update scheduled");
            }
            None => {
                self.timer.disarm();
                debug!("automatic updates are off");
            }
        }
        let due = self.timer.due();
        self.status.send_modify(|s| s.next_due = due);
    }

    fn reload_settings(&mut self) {
        match self.deps.settings.load() {
            Ok(settings) => self.settings = settings,
            Err(err) => warn!(error = %format!("{err:#}"), "keeping previous settings"),
        }
    }

    /// Writes updater-owned fields over the stored settings, keeping every
    /// other field as its last writer left it.
    fn record(&mut self, mut change: impl FnMut(&mut Settings)) {
        match self.deps.settings.update(&mut change) {
            Ok(settings) => self.settings = settings,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to persist settings");
                change(&mut self.settings);
            }
        }
    }
}
