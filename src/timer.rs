use std::fmt::{Display, Formatter};
use std::ops::Add;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::{self, Instant};

use crate::callback::Callback;

/// A point in time, measured in microseconds since the epoch of the [Timer] that produced it.
///  Timestamps from different timers are not comparable.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Timestamp(u64);

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}us", self.0)
    }
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_micros(micros: u64) -> Timestamp {
        Timestamp(micros)
    }

    pub fn from_duration(since_epoch: Duration) -> Timestamp {
        Timestamp(since_epoch.as_micros().try_into().unwrap_or(u64::MAX))
    }

    pub fn as_micros(&self) -> u64 {
        self.0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_micros(self.0)
    }

    /// the time elapsed from `earlier` to `self`, zero if `earlier` is later
    pub fn saturating_duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        let micros: u64 = rhs.as_micros().try_into().unwrap_or(u64::MAX);
        Timestamp(self.0.saturating_add(micros))
    }
}

/// A callback that was handed to a [Timer], shared between the timer (which fires it) and the
///  [TimerHandle] (which may cancel it). Whichever comes first wins, the other is a no-op.
#[derive(Clone, Debug)]
pub struct ScheduledCallback(Arc<Mutex<Option<Callback<()>>>>);

impl ScheduledCallback {
    pub fn new(callback: Callback<()>) -> ScheduledCallback {
        ScheduledCallback(Arc::new(Mutex::new(Some(callback))))
    }

    fn take(&self) -> Option<Callback<()>> {
        match self.0.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    pub fn fire(&self) {
        if let Some(callback) = self.take() {
            callback.call(());
        }
    }

    /// returns `true` if the callback was still pending
    pub fn cancel(&self) -> bool {
        match self.take() {
            Some(callback) => {
                callback.forget();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        match self.0.lock() {
            Ok(slot) => slot.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }
}

/// Allows cancelling a callback scheduled with [Timer::schedule_at]. Dropping the handle does
///  *not* cancel the callback.
#[derive(Debug)]
pub struct TimerHandle {
    scheduled: ScheduledCallback,
    abort_handle: Option<AbortHandle>,
}

impl TimerHandle {
    pub fn new(scheduled: ScheduledCallback, abort_handle: Option<AbortHandle>) -> TimerHandle {
        TimerHandle {
            scheduled,
            abort_handle,
        }
    }

    /// Cancels the callback if it has not fired yet. A cancelled callback is dropped without
    ///  being invoked. Returns `true` if this call cancelled it.
    pub fn cancel(&self) -> bool {
        let cancelled = self.scheduled.cancel();
        if let Some(abort_handle) = &self.abort_handle {
            abort_handle.abort();
        }
        cancelled
    }

    pub fn is_pending(&self) -> bool {
        self.scheduled.is_pending()
    }
}

/// Monotonic time source with the ability to schedule wake-ups. All periodic and delayed work
///  (retransmission, route metric refresh, reorder and linger timeouts) goes through this.
///
/// Callbacks are invoked from within the tokio runtime that drives the timer, so they may spawn
///  tasks.
pub trait Timer: Send + Sync + 'static {
    fn now(&self) -> Timestamp;

    fn schedule_at(&self, at: Timestamp, callback: Callback<()>) -> TimerHandle;
}

/// Waits until `at` on any [Timer] implementation.
pub async fn sleep_until(timer: &dyn Timer, at: Timestamp) {
    let (callback, recv) = Callback::channel();
    let _handle = timer.schedule_at(at, callback);
    let _ = recv.await;
}

/// [Timer] on top of `tokio::time`. In a runtime with a paused clock (`start_paused`, as in
///  tests) this is a virtual clock: it only moves when the runtime is idle or when
///  `tokio::time::advance` is called, which makes timing behaviour deterministic.
#[derive(Debug)]
pub struct TokioTimer {
    epoch: Instant,
}

impl TokioTimer {
    pub fn new() -> TokioTimer {
        TokioTimer {
            epoch: Instant::now(),
        }
    }
}

impl Default for TokioTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for TokioTimer {
    fn now(&self) -> Timestamp {
        Timestamp::from_duration(self.epoch.elapsed())
    }

    fn schedule_at(&self, at: Timestamp, callback: Callback<()>) -> TimerHandle {
        let scheduled = ScheduledCallback::new(callback);
        let deadline = self.epoch + at.as_duration();

        let to_fire = scheduled.clone();
        let join_handle = tokio::spawn(async move {
            time::sleep_until(deadline).await;
            to_fire.fire();
        });

        TimerHandle::new(scheduled, Some(join_handle.abort_handle()))
    }
}
