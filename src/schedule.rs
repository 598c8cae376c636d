use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::SchedulingOptions;

/// Floors applied to every computed due date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePolicy {
    pub minimum_lead_time: Duration,
    pub minimum_retry_delay: Duration,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            minimum_lead_time: Duration::from_secs(60),
            minimum_retry_delay: Duration::from_secs(300),
        }
    }
}

impl From<&SchedulingOptions> for SchedulePolicy {
    fn from(options: &SchedulingOptions) -> Self {
        Self {
            minimum_lead_time: options.minimum_lead_time,
            minimum_retry_delay: options.minimum_retry_delay,
        }
    }
}

/// Everything the due-date computation looks at.
#[derive(Debug, Clone, Copy)]
pub struct DueInputs {
    pub now: DateTime<Utc>,
    pub last_success: Option<DateTime<Utc>>,
    pub interval: Option<Duration>,
    pub has_album: bool,
    pub paused: bool,
    pub last_attempt: Option<DateTime<Utc>>,
}

/// When the next timer-triggered update should run, if at all.
///
/// Rules:
/// - Nothing is scheduled while paused, without an album, or with no interval.
/// - The raw due date is `last_success + interval`, or `now + interval` with no prior success.
/// - The result is never before `now + minimum_lead_time`.
/// - With a recorded attempt it is never before `last_attempt + minimum_retry_delay`.
pub fn compute_next_due(inputs: DueInputs, policy: SchedulePolicy) -> Option<DateTime<Utc>> {
    if inputs.paused || !inputs.has_album {
        return None;
    }
    let interval = to_chrono(inputs.interval?);

    let base = inputs.last_success.unwrap_or(inputs.now);
    let mut due = base + interval;

    let lead_floor = inputs.now + to_chrono(policy.minimum_lead_time);
    if due < lead_floor {
        due = lead_floor;
    }
    if let Some(attempt) = inputs.last_attempt {
        let retry_floor = attempt + to_chrono(policy.minimum_retry_delay);
        if due < retry_floor {
            due = retry_floor;
        }
    }
    Some(due)
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::MAX)
}

/// One-shot timers. The returned token cancels a timer that has not fired yet.
pub trait Scheduler: Send + Sync {
    fn schedule_at(&self, due: DateTime<Utc>, fire: Box<dyn FnOnce() + Send>) -> CancellationToken;
}

/// Tokio-backed scheduler; must be called from within a runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule_at(&self, due: DateTime<Utc>, fire: Box<dyn FnOnce() + Send>) -> CancellationToken {
        let token = CancellationToken::new();
        let cancel = token.clone();
        let delay = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(%due, "scheduled update cancelled");
                }
                _ = sleep(delay) => {
                    if !cancel.is_cancelled() {
                        fire();
                    }
                }
            }
        });
        token
    }
}

/// Holds at most one armed timer.
pub struct TimerSlot {
    scheduler: Arc<dyn Scheduler>,
    armed: Option<(DateTime<Utc>, CancellationToken)>,
}

impl TimerSlot {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            armed: None,
        }
    }

    /// Replaces any armed timer; the previous one is cancelled first.
    pub fn arm(&mut self, due: DateTime<Utc>, fire: Box<dyn FnOnce() + Send>) {
        self.disarm();
        let token = self.scheduler.schedule_at(due, fire);
        self.armed = Some((due, token));
    }

    pub fn disarm(&mut self) {
        if let Some((_, token)) = self.armed.take() {
            token.cancel();
        }
    }

    pub fn due(&self) -> Option<DateTime<Utc>> {
        self.armed.as_ref().map(|(due, _)| *due)
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.disarm();
    }
}
