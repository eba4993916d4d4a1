//! Usage ledger: consumption counters bucketed by period.
//!
//! One series per (entity, dimension), each holding HOURLY/DAILY/WEEKLY/MONTHLY
//! buckets keyed by period start. Every consumption event bumps all four.
//! The series live in a sharded map and each sits behind its own mutex: that
//! mutex is the per-(entity, dimension) critical section the enforcement gate
//! holds across check-then-increment.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::quota::{PeriodType, ResourceDimension};
use crate::types::{EngineConfig, EntityId, Error, Result, RetentionConfig};

type SeriesKey = (EntityId, ResourceDimension);

/// One bucket as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageBucket {
    pub period: PeriodType,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub consumed: u64,
    /// The period has ended; the counter will not change again.
    pub closed: bool,
}

/// Persisted form of one (entity, dimension, period) bucket set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub entity: EntityId,
    pub dimension: ResourceDimension,
    pub period: PeriodType,
    /// Bucket start → consumed.
    pub buckets: BTreeMap<DateTime<Utc>, u64>,
}

/// Counters for one (entity, dimension).
#[derive(Debug, Default)]
pub(crate) struct UsageSeries {
    periods: BTreeMap<PeriodType, BTreeMap<DateTime<Utc>, u64>>,
}

impl UsageSeries {
    /// Counter of the bucket containing `ts`, zero if never touched.
    pub(crate) fn counter(&self, period: PeriodType, ts: DateTime<Utc>) -> u64 {
        self.periods
            .get(&period)
            .and_then(|buckets| buckets.get(&period.bucket_start(ts)))
            .copied()
            .unwrap_or(0)
    }

    /// Add `amount` to all four buckets covering `ts`. Either every bucket
    /// moves or none does.
    pub(crate) fn record(&mut self, amount: u64, ts: DateTime<Utc>) -> Result<()> {
        for period in PeriodType::ALL {
            if self.counter(period, ts).checked_add(amount).is_none() {
                return Err(Error::invalid_amount(format!(
                    "{amount} would overflow the {period} counter"
                )));
            }
        }
        for period in PeriodType::ALL {
            *self
                .periods
                .entry(period)
                .or_default()
                .entry(period.bucket_start(ts))
                .or_insert(0) += amount;
        }
        Ok(())
    }

    fn history(
        &self,
        period: PeriodType,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<UsageBucket> {
        let Some(buckets) = self.periods.get(&period) else {
            return Vec::new();
        };
        // A bucket starting before `from` can still overlap it.
        buckets
            .range(period.bucket_start(from)..=to)
            .map(|(start, consumed)| {
                let end = period.bucket_end(*start);
                UsageBucket {
                    period,
                    start: *start,
                    end,
                    consumed: *consumed,
                    closed: end <= now,
                }
            })
            .filter(|bucket| bucket.end > from)
            .collect()
    }

    /// Drop closed buckets that ended at or before `cutoff(period)`.
    fn prune(&mut self, cutoff: impl Fn(PeriodType) -> DateTime<Utc>) -> usize {
        let mut pruned = 0;
        for (period, buckets) in self.periods.iter_mut() {
            let cutoff = cutoff(*period);
            let before = buckets.len();
            buckets.retain(|start, _| period.bucket_end(*start) > cutoff);
            pruned += before - buckets.len();
        }
        self.periods.retain(|_, buckets| !buckets.is_empty());
        pruned
    }

    fn is_empty(&self) -> bool {
        self.periods.is_empty()
    }
}

/// Usage ledger: sole owner of usage records.
#[derive(Debug)]
pub struct UsageLedger {
    series: DashMap<SeriesKey, Arc<Mutex<UsageSeries>>>,
    config: EngineConfig,
}

impl UsageLedger {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            series: DashMap::new(),
            config,
        }
    }

    /// Period checked by enforcement.
    pub fn enforcement_period(&self) -> PeriodType {
        self.config.enforcement_period
    }

    /// Run `f` inside the (entity, dimension) critical section.
    pub(crate) fn with_series<R>(
        &self,
        entity: &EntityId,
        dimension: ResourceDimension,
        f: impl FnOnce(&mut UsageSeries) -> R,
    ) -> R {
        let key = (entity.clone(), dimension);
        // Clone the Arc so the shard lock is released before the series lock.
        let series = match self.series.get(&key) {
            Some(series) => Arc::clone(series.value()),
            None => Arc::clone(self.series.entry(key).or_default().value()),
        };
        let mut guard = series.lock();
        f(&mut guard)
    }

    /// Record one real consumption event. Never deduplicated.
    ///
    /// Returns the updated counter of the enforcement-period bucket.
    pub fn record_consumption(
        &self,
        entity: &EntityId,
        dimension: ResourceDimension,
        amount: i64,
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let amount = positive_amount(amount)?;
        self.check_timestamp(timestamp, now)?;

        let period = self.config.enforcement_period;
        self.with_series(entity, dimension, |series| {
            series.record(amount, timestamp)?;
            Ok(series.counter(period, timestamp))
        })
    }

    /// Closed buckets are immutable, and the future is off limits beyond the
    /// configured skew.
    fn check_timestamp(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        let skew = Duration::from_std(self.config.max_clock_skew).unwrap_or(Duration::zero());
        if timestamp > now + skew {
            return Err(Error::validation(format!(
                "consumption timestamp {timestamp} is in the future"
            )));
        }
        // HOURLY is the finest period, so it closes first.
        if PeriodType::Hourly.bucket_end(timestamp) <= now {
            return Err(Error::validation(format!(
                "consumption timestamp {timestamp} falls in a closed period"
            )));
        }
        Ok(())
    }

    /// Counter of the open enforcement-period bucket.
    pub fn current_usage(
        &self,
        entity: &EntityId,
        dimension: ResourceDimension,
        now: DateTime<Utc>,
    ) -> u64 {
        let key = (entity.clone(), dimension);
        let Some(series) = self.series.get(&key).map(|s| Arc::clone(s.value())) else {
            return 0;
        };
        let guard = series.lock();
        guard.counter(self.config.enforcement_period, now)
    }

    /// Buckets of `period` intersecting `[from, to]`, oldest first.
    ///
    /// Without a range, covers the last `history_window` buckets up to `now`.
    /// Only buckets that have seen consumption are returned.
    pub fn usage_history(
        &self,
        entity: &EntityId,
        dimension: ResourceDimension,
        period: PeriodType,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
        now: DateTime<Utc>,
    ) -> Result<Vec<UsageBucket>> {
        let (from, to) = match range {
            Some((from, to)) if from > to => {
                return Err(Error::validation(format!(
                    "history range start {from} is after end {to}"
                )));
            }
            Some(range) => range,
            None => (self.default_window_start(period, now), now),
        };

        let key = (entity.clone(), dimension);
        let Some(series) = self.series.get(&key).map(|s| Arc::clone(s.value())) else {
            return Ok(Vec::new());
        };
        let guard = series.lock();
        Ok(guard.history(period, from, to, now))
    }

    fn default_window_start(&self, period: PeriodType, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut start = period.bucket_start(now);
        for _ in 1..self.config.history_window.max(1) {
            start = period.previous_start(start);
        }
        start
    }

    /// Prune closed buckets past retention; drop series left empty.
    ///
    /// Returns `(buckets_pruned, series_dropped)`.
    pub fn prune(&self, retention: &RetentionConfig, now: DateTime<Utc>) -> (usize, usize) {
        let cutoff = |period: PeriodType| {
            Duration::from_std(retention.for_period(period))
                .ok()
                .and_then(|keep| now.checked_sub_signed(keep))
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        };

        let mut pruned = 0;
        for entry in self.series.iter() {
            pruned += entry.value().lock().prune(&cutoff);
        }

        // An Arc held elsewhere means a caller is inside the critical section.
        let before = self.series.len();
        self.series.retain(|_, series| {
            Arc::strong_count(series) > 1 || series.try_lock().map_or(true, |s| !s.is_empty())
        });
        (pruned, before.saturating_sub(self.series.len()))
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    /// Flatten into persisted records, sorted for stable output.
    pub fn export(&self) -> Vec<UsageRecord> {
        let mut records = Vec::new();
        for entry in self.series.iter() {
            let (entity, dimension) = entry.key();
            let guard = entry.value().lock();
            for (period, buckets) in &guard.periods {
                records.push(UsageRecord {
                    entity: entity.clone(),
                    dimension: *dimension,
                    period: *period,
                    buckets: buckets.clone(),
                });
            }
        }
        records.sort_by(|a, b| {
            (&a.entity, a.dimension, a.period).cmp(&(&b.entity, b.dimension, b.period))
        });
        records
    }

    /// Replace all series from persisted records.
    pub(crate) fn replace(&self, records: Vec<UsageRecord>) -> Result<()> {
        let mut staged: BTreeMap<SeriesKey, UsageSeries> = BTreeMap::new();
        for record in records {
            for start in record.buckets.keys() {
                if record.period.bucket_start(*start) != *start {
                    return Err(Error::validation(format!(
                        "{} bucket for '{}' starts off-boundary at {start}",
                        record.period, record.entity
                    )));
                }
            }
            staged
                .entry((record.entity, record.dimension))
                .or_default()
                .periods
                .insert(record.period, record.buckets);
        }

        self.series.clear();
        for (key, series) in staged {
            self.series.insert(key, Arc::new(Mutex::new(series)));
        }
        Ok(())
    }
}

/// Consumption amounts must be strictly positive.
pub(crate) fn positive_amount(amount: i64) -> Result<u64> {
    if amount <= 0 {
        return Err(Error::invalid_amount(format!(
            "amount must be a positive integer, got {amount}"
        )));
    }
    Ok(amount as u64)
}
