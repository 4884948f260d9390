//! Time and timer abstractions injected into the upload queue.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        *self.now.lock() += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Work run on every tick of a repeating task
pub type TickFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle to a repeating task; cancelling (or dropping) it stops the task
pub struct ScheduledTask {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    fn new(token: CancellationToken, handle: Option<JoinHandle<()>>) -> Self {
        Self { token, handle }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel and wait for an in-flight tick to finish
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Runs a tick function periodically
pub trait Scheduler: Send + Sync {
    /// Start running `tick` every `period`. The first run happens one
    /// period from now.
    fn schedule_repeating(&self, period: Duration, tick: TickFn) -> ScheduledTask;
}

/// Scheduler backed by a tokio interval
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule_repeating(&self, period: Duration, tick: TickFn) -> ScheduledTask {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            // A slow tick pushes the next one back instead of bursting
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }

            debug!("Repeating task stopped");
        });

        ScheduledTask::new(token, Some(handle))
    }
}

/// Scheduler whose ticks are fired explicitly, for deterministic tests and
/// hosts that own their own event loop
#[derive(Default)]
pub struct ManualScheduler {
    registered: Mutex<Option<(CancellationToken, TickFn)>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a non-cancelled task is registered
    pub fn is_active(&self) -> bool {
        self.registered
            .lock()
            .as_ref()
            .is_some_and(|(token, _)| !token.is_cancelled())
    }

    /// Run one tick of the registered task. Returns false if none is active.
    pub async fn fire(&self) -> bool {
        let tick = match self.registered.lock().as_ref() {
            Some((token, tick)) if !token.is_cancelled() => tick.clone(),
            _ => return false,
        };

        tick().await;
        true
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_repeating(&self, _period: Duration, tick: TickFn) -> ScheduledTask {
        let token = CancellationToken::new();
        *self.registered.lock() = Some((token.clone(), tick));
        ScheduledTask::new(token, None)
    }
}
