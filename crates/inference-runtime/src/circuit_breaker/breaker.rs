//! Per-model circuit breaker.
//!
//! - **Closed**: requests flow; failures inside the rolling window are counted
//! - **Open**: requests are rejected until `retry_after`
//! - **HalfOpen**: a bounded number of trial requests probe recovery
//!
//! Access is mediated by [`BreakerPermit`]s. Only trial permits issued in the
//! current half-open episode can close or re-open the breaker; outcomes of
//! permits issued while closed never move a half-open or open breaker.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::store::{BreakerRecord, BreakerStore};
use crate::error::CircuitOpenError;
use crate::plugin::ModelKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        })
    }
}

impl FromStr for BreakerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(BreakerState::Closed),
            "open" => Ok(BreakerState::Open),
            "half_open" => Ok(BreakerState::HalfOpen),
            other => Err(format!("unknown breaker state '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Failures within `window` that open the breaker.
    pub failure_threshold: u32,
    pub window: Duration,
    /// Initial open period; doubles after each failed trial.
    pub cooldown: Duration,
    pub max_cooldown: Duration,
    /// Concurrent trial requests allowed while half-open.
    pub half_open_trials: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(600),
            half_open_trials: 1,
        }
    }
}

/// Reported view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: usize,
    pub open_since: Option<DateTime<Utc>>,
    pub retry_after: Option<DateTime<Utc>>,
    pub cooldown_ms: u64,
}

struct Inner {
    state: BreakerState,
    failures: VecDeque<DateTime<Utc>>,
    open_since: Option<DateTime<Utc>>,
    retry_after: Option<DateTime<Utc>>,
    cooldown: Duration,
    trials_in_flight: u32,
    /// Incremented on every entry into half-open.
    episode: u64,
}

pub struct CircuitBreaker {
    key: ModelKey,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    store: Option<Arc<dyn BreakerStore>>,
    pub rejections_total: AtomicU64,
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

impl CircuitBreaker {
    pub fn new(key: ModelKey, config: BreakerConfig, store: Option<Arc<dyn BreakerStore>>) -> Self {
        let cooldown = config.cooldown;
        Self {
            key,
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                open_since: None,
                retry_after: None,
                cooldown,
                trials_in_flight: 0,
                episode: 0,
            }),
            store,
            rejections_total: AtomicU64::new(0),
        }
    }

    /// Rebuild a breaker from a persisted record. A breaker persisted while
    /// half-open comes back open; its trial outcome was never recorded.
    pub fn restore(
        record: &BreakerRecord,
        config: BreakerConfig,
        store: Option<Arc<dyn BreakerStore>>,
    ) -> anyhow::Result<Self> {
        let breaker = Self::new(record.key()?, config, store);
        {
            let mut inner = breaker.lock();
            let cooldown = Duration::from_millis(record.cooldown_ms)
                .clamp(breaker.config.cooldown, breaker.config.max_cooldown);
            inner.cooldown = cooldown;
            if record.state != BreakerState::Closed {
                let now = Utc::now();
                inner.state = BreakerState::Open;
                inner.open_since = Some(record.open_since.unwrap_or(now));
                inner.retry_after = Some(record.retry_after.unwrap_or(now));
            }
        }
        Ok(breaker)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn key(&self) -> &ModelKey {
        &self.key
    }

    /// Ask for permission to run one request.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, CircuitOpenError> {
        let now = Utc::now();
        let mut inner = self.lock();
        let mut transitioned = false;

        if inner.state == BreakerState::Open {
            match inner.retry_after {
                Some(at) if now < at => {
                    drop(inner);
                    self.rejections_total.fetch_add(1, Ordering::Relaxed);
                    return Err(CircuitOpenError {
                        key: self.key.clone(),
                        retry_after: Some(at),
                    });
                }
                _ => {
                    inner.state = BreakerState::HalfOpen;
                    inner.trials_in_flight = 0;
                    inner.episode += 1;
                    transitioned = true;
                }
            }
        }

        let result = match inner.state {
            BreakerState::Closed => Ok(None),
            BreakerState::HalfOpen if inner.trials_in_flight < self.config.half_open_trials => {
                inner.trials_in_flight += 1;
                Ok(Some(inner.episode))
            }
            _ => Err(CircuitOpenError {
                key: self.key.clone(),
                retry_after: None,
            }),
        };

        let record = transitioned.then(|| self.record_of(&inner));
        drop(inner);
        if let Some(record) = record {
            self.on_transition(record);
        }

        match result {
            Ok(trial) => Ok(BreakerPermit {
                breaker: Arc::clone(self),
                trial,
                settled: false,
            }),
            Err(e) => {
                self.rejections_total.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.lock();
        self.prune(&mut inner, Utc::now());
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failures.len(),
            open_since: inner.open_since,
            retry_after: inner.retry_after,
            cooldown_ms: inner.cooldown.as_millis() as u64,
        }
    }

    pub fn record(&self) -> BreakerRecord {
        self.record_of(&self.lock())
    }

    fn record_of(&self, inner: &Inner) -> BreakerRecord {
        BreakerRecord {
            model_id: self.key.model_id.clone(),
            version: self.key.version.to_string(),
            state: inner.state,
            failure_count: inner.failures.len() as u32,
            open_since: inner.open_since,
            retry_after: inner.retry_after,
            cooldown_ms: inner.cooldown.as_millis() as u64,
        }
    }

    fn prune(&self, inner: &mut Inner, now: DateTime<Utc>) {
        let cutoff = now - chrono_duration(self.config.window);
        while inner.failures.front().map_or(false, |t| *t < cutoff) {
            inner.failures.pop_front();
        }
    }

    fn open(&self, inner: &mut Inner, now: DateTime<Utc>) {
        inner.state = BreakerState::Open;
        inner.failures.clear();
        inner.trials_in_flight = 0;
        inner.open_since = Some(now);
        inner.retry_after = Some(now + chrono_duration(inner.cooldown));
    }

    fn settle(&self, trial: Option<u64>, succeeded: bool) -> Option<BreakerState> {
        let now = Utc::now();
        let mut inner = self.lock();
        let current_trial = trial.is_some()
            && inner.state == BreakerState::HalfOpen
            && trial == Some(inner.episode);

        let transition = match (inner.state, succeeded) {
            (BreakerState::HalfOpen, true) if current_trial => {
                inner.state = BreakerState::Closed;
                inner.failures.clear();
                inner.trials_in_flight = 0;
                inner.open_since = None;
                inner.retry_after = None;
                inner.cooldown = self.config.cooldown;
                Some(BreakerState::Closed)
            }
            (BreakerState::HalfOpen, false) if current_trial => {
                inner.cooldown = (inner.cooldown * 2).min(self.config.max_cooldown);
                self.open(&mut inner, now);
                Some(BreakerState::Open)
            }
            (BreakerState::Closed, true) if trial.is_none() => {
                inner.failures.clear();
                None
            }
            (BreakerState::Closed, false) if trial.is_none() => {
                inner.failures.push_back(now);
                self.prune(&mut inner, now);
                if inner.failures.len() >= self.config.failure_threshold as usize {
                    self.open(&mut inner, now);
                    Some(BreakerState::Open)
                } else {
                    None
                }
            }
            _ => None,
        };

        let record = transition.map(|_| self.record_of(&inner));
        drop(inner);
        if let Some(record) = record {
            self.on_transition(record);
        }
        transition
    }

    fn abandon(&self, trial: Option<u64>) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen && trial == Some(inner.episode) {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
    }

    fn on_transition(&self, record: BreakerRecord) {
        match record.state {
            BreakerState::Open => warn!(
                model_id = %record.model_id,
                version = %record.version,
                "Circuit opened; retry after {:?} (cooldown {}ms)",
                record.retry_after,
                record.cooldown_ms
            ),
            state => info!(
                model_id = %record.model_id,
                version = %record.version,
                "Circuit {}",
                state
            ),
        }
        crate::metrics::inc_breaker_transition(&self.key.to_string(), &record.state.to_string());

        if let Some(store) = &self.store {
            if let Err(e) = store.save(&record) {
                error!(model_id = %record.model_id, version = %record.version, "Failed to persist breaker state: {}", e);
            }
        }
    }
}

/// Permission to run one request. Report the outcome with
/// [`success`](Self::success) or [`failure`](Self::failure); dropping it
/// unsettled frees a trial slot without recording anything.
#[must_use = "report the outcome or drop the permit"]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: Option<u64>,
    settled: bool,
}

impl BreakerPermit {
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }

    /// Returns the state the breaker moved to, if any.
    pub fn success(mut self) -> Option<BreakerState> {
        self.settled = true;
        self.breaker.settle(self.trial, true)
    }

    pub fn failure(mut self) -> Option<BreakerState> {
        self.settled = true;
        self.breaker.settle(self.trial, false)
    }
}

impl fmt::Debug for BreakerPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerPermit")
            .field("key", &self.breaker.key)
            .field("trial", &self.trial)
            .field("settled", &self.settled)
            .finish()
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.abandon(self.trial);
        }
    }
}
