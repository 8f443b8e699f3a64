//! Client-side usage quotas.
//!
//! The service enforces per-account limits on some expensive operations
//! (generated audio, reports) and fails them late and opaquely. The tracker
//! mirrors those limits locally so a call that would exceed one fails before
//! any network traffic. Counters are in memory and start from zero on every
//! process start.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Datelike, Months, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RpcError, RpcResult};

/// When a quota counter resets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaWindow {
    /// Resets at midnight UTC.
    Daily,
    /// Resets on the first day of each month, UTC.
    Monthly,
    /// Counts uses within the trailing duration.
    Rolling(#[serde(with = "duration_secs")] Duration),
    /// Never resets.
    #[default]
    Unbounded,
}

/// A limit on one kind of call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRule {
    pub kind: String,
    pub limit: u64,
    #[serde(default)]
    pub window: QuotaWindow,
}

impl QuotaRule {
    pub fn new(kind: impl Into<String>, limit: u64, window: QuotaWindow) -> Self {
        Self {
            kind: kind.into(),
            limit,
            window,
        }
    }
}

/// Snapshot of one counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaUsage {
    pub kind: String,
    pub used: u64,
    pub limit: u64,
    pub resets_at: Option<DateTime<Utc>>,
}

impl QuotaUsage {
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }
}

#[derive(Debug)]
struct Counter {
    limit: u64,
    window: QuotaWindow,
    count: u64,
    period_start: Option<DateTime<Utc>>,
    events: VecDeque<DateTime<Utc>>,
}

impl Counter {
    fn new(rule: &QuotaRule) -> Self {
        Self {
            limit: rule.limit,
            window: rule.window,
            count: 0,
            period_start: None,
            events: VecDeque::new(),
        }
    }

    /// Drops usage that fell out of the window as of `now`.
    fn roll(&mut self, now: DateTime<Utc>) {
        match self.window {
            QuotaWindow::Daily => {
                if self.period_start.is_some_and(|start| start.date_naive() != now.date_naive()) {
                    self.count = 0;
                    self.period_start = None;
                }
            }
            QuotaWindow::Monthly => {
                if self
                    .period_start
                    .is_some_and(|start| (start.year(), start.month()) != (now.year(), now.month()))
                {
                    self.count = 0;
                    self.period_start = None;
                }
            }
            QuotaWindow::Rolling(span) => {
                let span = chrono::Duration::from_std(span).unwrap_or(chrono::Duration::MAX);
                while self.events.front().is_some_and(|at| now - *at >= span) {
                    self.events.pop_front();
                }
            }
            QuotaWindow::Unbounded => {}
        }
    }

    fn used(&self) -> u64 {
        match self.window {
            QuotaWindow::Rolling(_) => self.events.len() as u64,
            _ => self.count,
        }
    }

    fn record(&mut self, now: DateTime<Utc>) {
        match self.window {
            QuotaWindow::Rolling(_) => self.events.push_back(now),
            _ => {
                self.count += 1;
                self.period_start.get_or_insert(now);
            }
        }
    }

    fn resets_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.window {
            QuotaWindow::Daily => now
                .date_naive()
                .succ_opt()
                .map(|day| day.and_time(NaiveTime::MIN).and_utc()),
            QuotaWindow::Monthly => now
                .date_naive()
                .with_day(1)
                .and_then(|first| first.checked_add_months(Months::new(1)))
                .map(|day| day.and_time(NaiveTime::MIN).and_utc()),
            QuotaWindow::Rolling(span) => {
                let oldest = self.events.front()?;
                Some(*oldest + chrono::Duration::from_std(span).ok()?)
            }
            QuotaWindow::Unbounded => None,
        }
    }

    fn reset(&mut self) {
        self.count = 0;
        self.period_start = None;
        self.events.clear();
    }
}

/// Per-kind usage counters.
///
/// Kinds without a rule are unlimited and not counted.
#[derive(Debug, Default)]
pub struct QuotaTracker {
    counters: Mutex<HashMap<String, Counter>>,
}

impl QuotaTracker {
    /// Creates a tracker enforcing `rules`. A later rule for the same kind
    /// replaces an earlier one.
    pub fn new(rules: &[QuotaRule]) -> Self {
        let counters = rules
            .iter()
            .map(|rule| (rule.kind.clone(), Counter::new(rule)))
            .collect();
        Self {
            counters: Mutex::new(counters),
        }
    }

    /// Fails if `kind` has no remaining quota.
    pub fn check(&self, kind: &str) -> RpcResult<()> {
        self.check_at(kind, Utc::now())
    }

    /// Counts one use of `kind`.
    pub fn record(&self, kind: &str) {
        self.record_at(kind, Utc::now());
    }

    /// Checks and counts in one step, so concurrent callers cannot both take
    /// the last unit.
    pub fn acquire(&self, kind: &str) -> RpcResult<()> {
        let now = Utc::now();
        let mut counters = self.lock();
        let Some(counter) = counters.get_mut(kind) else {
            return Ok(());
        };
        Self::ensure_available(kind, counter, now)?;
        counter.record(now);
        Ok(())
    }

    /// Current usage of `kind`, if it has a rule.
    pub fn usage(&self, kind: &str) -> Option<QuotaUsage> {
        self.usage_at(kind, Utc::now())
    }

    /// Clears the counter of `kind`.
    pub fn reset(&self, kind: &str) {
        if let Some(counter) = self.lock().get_mut(kind) {
            counter.reset();
        }
    }

    fn check_at(&self, kind: &str, now: DateTime<Utc>) -> RpcResult<()> {
        let mut counters = self.lock();
        match counters.get_mut(kind) {
            Some(counter) => Self::ensure_available(kind, counter, now),
            None => Ok(()),
        }
    }

    fn record_at(&self, kind: &str, now: DateTime<Utc>) {
        let mut counters = self.lock();
        match counters.get_mut(kind) {
            Some(counter) => {
                counter.roll(now);
                counter.record(now);
                debug!(kind, used = counter.used(), limit = counter.limit, "quota usage recorded");
            }
            None => debug!(kind, "no quota rule, not counting"),
        }
    }

    fn usage_at(&self, kind: &str, now: DateTime<Utc>) -> Option<QuotaUsage> {
        let mut counters = self.lock();
        let counter = counters.get_mut(kind)?;
        counter.roll(now);
        Some(QuotaUsage {
            kind: kind.to_string(),
            used: counter.used(),
            limit: counter.limit,
            resets_at: counter.resets_at(now),
        })
    }

    fn ensure_available(kind: &str, counter: &mut Counter, now: DateTime<Utc>) -> RpcResult<()> {
        counter.roll(now);
        if counter.used() >= counter.limit {
            return Err(RpcError::QuotaExceeded {
                kind: kind.to_string(),
                limit: counter.limit,
                resets_at: counter.resets_at(now),
            });
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Counter>> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
