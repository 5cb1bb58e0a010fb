use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::backend::{Backend, Category, FetchError, Quota};
use crate::config::ThrottleConfig;
use crate::credentials::{Credential, CredentialPool};
use crate::error::CrawlError;

#[allow(async_fn_in_trait)]
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// A clock that only moves when slept on or advanced, for dry runs and tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration)
    }
}

/// Lifecycle of one (credential, category) rate limit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Fresh,
    Active,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    /// The local estimate is missing, stale or due for reconciliation
    Refresh,
    /// Short wait for the window to reset
    Wait(Duration),
    /// Long wait ahead, another credential should be tried first
    Rotate(Duration),
}

#[derive(Debug, Clone, Copy)]
struct CallState {
    remaining: u32,
    limit: u32,
    reset: DateTime<Utc>,
    unsynced: u32,
}

/// Local bookkeeping of remaining calls per credential and category.
///
/// Counts are decremented optimistically after each call and reconciled
/// against the API every `sync_every` calls or once a window has reset.
/// Status checks are themselves rate limited and tracked separately.
#[derive(Debug)]
pub struct RateGovernor {
    config: ThrottleConfig,
    states: HashMap<(String, Category), CallState>,
    status_calls: HashMap<String, VecDeque<DateTime<Utc>>>,
}

impl RateGovernor {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
            status_calls: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    pub fn window(&self, credential: &str, category: Category, now: DateTime<Utc>) -> Window {
        match self.state(credential, category) {
            None => Window::Fresh,
            Some(state) if state.reset <= now => Window::Fresh,
            Some(state) if state.remaining >= self.config.headroom => Window::Active,
            Some(_) => Window::Exhausted,
        }
    }

    pub fn remaining(&self, credential: &str, category: Category) -> Option<u32> {
        self.state(credential, category).map(|s| s.remaining)
    }

    pub fn before_call(
        &self,
        credential: &str,
        category: Category,
        now: DateTime<Utc>,
    ) -> Decision {
        let state = match self.state(credential, category) {
            Some(state) if state.reset > now => state,
            _ => return Decision::Refresh,
        };

        if state.remaining >= self.config.headroom {
            let due = self.config.sync_every > 0 && state.unsynced >= self.config.sync_every;
            if due && self.status_budget_left(credential, now) {
                return Decision::Refresh;
            }
            return Decision::Proceed;
        }

        let pause = until(now, state.reset) + self.config.grace();
        if pause <= self.config.short_pause() {
            Decision::Wait(pause)
        } else {
            Decision::Rotate(pause)
        }
    }

    pub fn after_call(&mut self, credential: &str, category: Category) {
        if let Some(state) = self.state_mut(credential, category) {
            state.remaining = state.remaining.saturating_sub(1);
            state.unsynced += 1;
        }
    }

    /// Stores an authoritative reading. A reset time already in the past
    /// means the remote window rolled over since the reading was taken.
    pub fn record(
        &mut self,
        credential: &str,
        category: Category,
        quota: Quota,
        now: DateTime<Utc>,
    ) {
        let state = if quota.reset <= now {
            CallState {
                remaining: quota.limit,
                limit: quota.limit,
                reset: now + self.window_len(),
                unsynced: 0,
            }
        } else {
            CallState {
                remaining: quota.remaining,
                limit: quota.limit,
                reset: quota.reset,
                unsynced: 0,
            }
        };
        self.states.insert((credential.to_string(), category), state);
    }

    /// Starts a new window from the last known ceiling without asking the
    /// API. Returns `false` when nothing is known about this window yet.
    pub fn roll_over(&mut self, credential: &str, category: Category, now: DateTime<Utc>) -> bool {
        let reset = now + self.window_len();
        match self.state_mut(credential, category) {
            Some(state) => {
                state.remaining = state.limit;
                state.reset = reset;
                state.unsynced = 0;
                true
            }
            None => false,
        }
    }

    pub fn assume_exhausted(&mut self, credential: &str, category: Category, now: DateTime<Utc>) {
        let reset = now + self.window_len();
        self.exhaust(credential, category, reset);
    }

    /// The API refused a call: nothing is left until `retry_after` elapses.
    pub fn rate_limited(
        &mut self,
        credential: &str,
        category: Category,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) {
        let reset = match retry_after {
            Some(after) => now + to_chrono(after),
            None => now + self.window_len(),
        };
        self.exhaust(credential, category, reset);
    }

    pub fn status_budget_left(&self, credential: &str, now: DateTime<Utc>) -> bool {
        let since = now - self.window_len();
        let used = self
            .status_calls
            .get(credential)
            .map_or(0, |calls| calls.iter().filter(|&&t| t > since).count());
        used < self.config.status_calls_per_window as usize
    }

    pub fn note_status_call(&mut self, credential: &str, now: DateTime<Utc>) {
        let since = now - self.window_len();
        let calls = self.status_calls.entry(credential.to_string()).or_default();
        while calls.front().map_or(false, |&t| t <= since) {
            calls.pop_front();
        }
        calls.push_back(now);
    }

    fn exhaust(&mut self, credential: &str, category: Category, reset: DateTime<Utc>) {
        let state = self
            .states
            .entry((credential.to_string(), category))
            .or_insert(CallState {
                remaining: 0,
                limit: 0,
                reset,
                unsynced: 0,
            });
        state.remaining = 0;
        state.reset = reset;
        state.unsynced = 0;
    }

    fn state(&self, credential: &str, category: Category) -> Option<&CallState> {
        self.states.get(&(credential.to_string(), category))
    }

    fn state_mut(&mut self, credential: &str, category: Category) -> Option<&mut CallState> {
        self.states.get_mut(&(credential.to_string(), category))
    }

    fn window_len(&self) -> chrono::Duration {
        to_chrono(self.config.window())
    }
}

fn until(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (then - now).to_std().unwrap_or(Duration::ZERO)
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Resolves every governor decision before an outbound call: refreshes
/// counts, sleeps through short waits and rotates credentials on long ones.
/// A rate limit never surfaces as an error, only a rejected credential does.
#[derive(Debug)]
pub struct Pacer<C> {
    governor: RateGovernor,
    pool: CredentialPool,
    clock: C,
}

impl<C: Clock> Pacer<C> {
    pub fn new(config: ThrottleConfig, pool: CredentialPool, clock: C) -> Self {
        Self {
            governor: RateGovernor::new(config),
            pool,
            clock,
        }
    }

    pub fn governor(&self) -> &RateGovernor {
        &self.governor
    }

    pub fn active(&self) -> &Credential {
        self.pool.active()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn sleep(&self, duration: Duration) {
        self.clock.sleep(duration).await
    }

    /// Returns the credential the next `category` call must use.
    pub async fn before_call<B: Backend>(
        &mut self,
        backend: &mut B,
        category: Category,
    ) -> Result<Credential, CrawlError> {
        loop {
            let now = self.clock.now();
            let name = self.pool.active().name.clone();
            match self.governor.before_call(&name, category, now) {
                Decision::Proceed => return Ok(self.pool.active().clone()),
                Decision::Refresh => self.refresh(backend, category, now).await?,
                Decision::Wait(pause) => {
                    log::info!(
                        "No {category} calls left on credential {name}, pausing {}s",
                        pause.as_secs()
                    );
                    self.clock.sleep(pause).await;
                }
                Decision::Rotate(pause) => {
                    let candidate = self
                        .pool
                        .best_candidate(backend, &mut self.governor, category, now)
                        .await;
                    match candidate {
                        Some(idx) => {
                            let next = self.pool.activate(idx);
                            log::info!("Switching from credential {name} to {}", next.name);
                        }
                        None => {
                            log::info!(
                                "Every credential is exhausted for {category} calls, pausing {} min",
                                (pause.as_secs() + 59) / 60
                            );
                            self.clock.sleep(pause).await;
                        }
                    }
                }
            }
        }
    }

    pub fn after_call(&mut self, category: Category) {
        let name = &self.pool.active().name;
        self.governor.after_call(name, category);
    }

    pub fn rate_limited(&mut self, category: Category, retry_after: Option<Duration>) {
        let now = self.clock.now();
        let name = &self.pool.active().name;
        log::warn!("Credential {name} hit the {category} rate limit");
        self.governor.rate_limited(name, category, retry_after, now);
    }

    async fn refresh<B: Backend>(
        &mut self,
        backend: &mut B,
        category: Category,
        now: DateTime<Utc>,
    ) -> Result<(), CrawlError> {
        let credential = self.pool.active().clone();
        if !self.governor.status_budget_left(&credential.name, now) {
            log::debug!("Status budget spent for credential {}", credential.name);
            if !self.governor.roll_over(&credential.name, category, now) {
                self.governor.assume_exhausted(&credential.name, category, now);
            }
            return Ok(());
        }

        self.governor.note_status_call(&credential.name, now);
        match backend.authoritative_quota(&credential, category).await {
            Ok(quota) => {
                log::debug!(
                    "Credential {} has {}/{} {category} calls left",
                    credential.name,
                    quota.remaining,
                    quota.limit
                );
                self.governor.record(&credential.name, category, quota, now);
            }
            Err(FetchError::Unauthorized(message)) => {
                return Err(CrawlError::Unauthorized {
                    credential: credential.name,
                    message,
                })
            }
            Err(e) => {
                log::warn!(
                    "Couldn't read {category} quota of credential {}: {e}",
                    credential.name
                );
                self.governor
                    .assume_exhausted(&credential.name, category, now);
            }
        }
        Ok(())
    }
}
