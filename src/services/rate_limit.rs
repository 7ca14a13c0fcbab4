use crate::core::clock::Clock;
use crate::core::config::RateLimits;
use crate::core::error::PersistenceError;
use crate::services::history::HistoryStore;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

fn minute() -> chrono::Duration {
    chrono::Duration::seconds(60)
}

fn day() -> chrono::Duration {
    chrono::Duration::hours(24)
}

/// A fixed window that restarts every `len` from its own start time rather
/// than on calendar boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCounter {
    pub count: u32,
    pub window_start: DateTime<Utc>,
}

impl WindowCounter {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }

    /// Resets an expired window. Returns whether anything changed.
    fn roll_over(&mut self, now: DateTime<Utc>, len: chrono::Duration) -> bool {
        let elapsed = now - self.window_start;
        if elapsed < chrono::Duration::zero() {
            // Wall clock went backwards; restart the window here but keep the count.
            self.window_start = now;
            return true;
        }
        if elapsed < len {
            return false;
        }
        let periods = elapsed.num_milliseconds() / len.num_milliseconds();
        self.window_start += chrono::Duration::milliseconds(periods * len.num_milliseconds());
        self.count = 0;
        true
    }

    fn remaining(&self, now: DateTime<Utc>, len: chrono::Duration) -> Duration {
        (self.window_start + len - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    fn is_expired(&self, now: DateTime<Utc>, len: chrono::Duration) -> bool {
        now - self.window_start >= len
    }
}

/// Persisted quota counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub minute: WindowCounter,
    pub day: WindowCounter,
}

impl QuotaState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            minute: WindowCounter::fresh(now),
            day: WindowCounter::fresh(now),
        }
    }

    fn roll_over(&mut self, now: DateTime<Utc>) -> bool {
        let minute_rolled = self.minute.roll_over(now, minute());
        let day_rolled = self.day.roll_over(now, day());
        minute_rolled || day_rolled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub per_minute_remaining: u32,
    pub per_day_remaining: u32,
}

/// Owner of the per-minute and per-day request budgets. Counters are only
/// reachable through the admission protocol and are persisted after every change.
pub struct RateLimiter {
    limits: RateLimits,
    state: Mutex<QuotaState>,
    store: Arc<HistoryStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Loads persisted counters and immediately resets any window that expired
    /// while the process was down. A corrupt state file is an error, not zero.
    pub async fn open(
        limits: RateLimits,
        store: Arc<HistoryStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PersistenceError> {
        let now = clock.now();
        let state = match store.load_quota_state().await? {
            Some(mut state) => {
                if state.roll_over(now) {
                    debug!("Quota windows expired while idle, resetting");
                    store.save_quota_state(&state).await?;
                }
                state
            }
            None => {
                let state = QuotaState::new(now);
                store.save_quota_state(&state).await?;
                state
            }
        };

        info!(
            "Rate limiter ready: {}/{} this minute, {}/{} today",
            state.minute.count, limits.per_minute, state.day.count, limits.per_day
        );

        Ok(Self {
            limits,
            state: Mutex::new(state),
            store,
            clock,
        })
    }

    pub fn limits(&self) -> RateLimits {
        self.limits
    }

    /// Checks whether a call may be made now without consuming anything.
    pub async fn try_admit(&self) -> Result<Admission, PersistenceError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        if state.roll_over(now) {
            self.store.save_quota_state(&state).await?;
        }
        Ok(self.check(&state, now))
    }

    /// Counts one call against both windows. Call this right before the
    /// provider request goes out: the attempt consumes quota, not the result.
    pub async fn record_usage(&self) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        state.roll_over(now);
        Self::bump(&mut state);
        self.store.save_quota_state(&state).await
    }

    /// Admission and usage recording as one critical section, so two callers
    /// can never both take the last free slot.
    pub async fn acquire(&self) -> Result<Admission, PersistenceError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let rolled = state.roll_over(now);

        let admission = self.check(&state, now);
        if admission.is_admitted() {
            Self::bump(&mut state);
        }
        if rolled || admission.is_admitted() {
            self.store.save_quota_state(&state).await?;
        }
        Ok(admission)
    }

    pub async fn current_budget(&self) -> Budget {
        let state = self.state.lock().await;
        let now = self.clock.now();
        let used = |w: &WindowCounter, len| if w.is_expired(now, len) { 0 } else { w.count };
        Budget {
            per_minute_remaining: self
                .limits
                .per_minute
                .saturating_sub(used(&state.minute, minute())),
            per_day_remaining: self.limits.per_day.saturating_sub(used(&state.day, day())),
        }
    }

    /// Zeroes both counters and starts fresh windows.
    pub async fn reset(&self) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        *state = QuotaState::new(self.clock.now());
        warn!("Quota counters reset");
        self.store.save_quota_state(&state).await
    }

    fn check(&self, state: &QuotaState, now: DateTime<Utc>) -> Admission {
        if state.day.count >= self.limits.per_day {
            return Admission::Denied {
                retry_after: state.day.remaining(now, day()),
            };
        }
        if state.minute.count >= self.limits.per_minute {
            return Admission::Denied {
                retry_after: state.minute.remaining(now, minute()),
            };
        }
        Admission::Admitted
    }

    fn bump(state: &mut QuotaState) {
        state.minute.count = state.minute.count.saturating_add(1);
        state.day.count = state.day.count.saturating_add(1);
    }
}
