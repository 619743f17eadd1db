//! Calendar-aware recurrence rules.
//!
//! A practical subset of RFC 5545 `RRULE`: a frequency with a step, an
//! optional start, end and occurrence count, and `BY*` filters. Rules are
//! evaluated in UTC.

use crate::error::{Result, TaskManagerError};
use chrono::{DateTime, Datelike, Days, Duration, Months, NaiveDate, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Search horizon for daily, weekly and monthly rules, in periods.
const MAX_PERIODS: u32 = 100_000;

/// Search horizon for hourly and minutely rules, in days (400 years).
const MAX_DAYS: u32 = 146_097;

/// Base frequency of a recurrence rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Monthly,
    Weekly,
    Daily,
    Hourly,
    Minutely,
}

/// A recurrence rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub freq: Frequency,
    /// Step between periods, in units of `freq`.
    #[serde(default = "default_interval")]
    pub interval: u32,
    /// Time zone id. Only UTC is supported.
    #[serde(default = "default_tzid")]
    pub tzid: String,
    /// Anchor of the series; the run's reference time when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtstart: Option<DateTime<Utc>>,
    /// Last instant an occurrence may fall on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
    /// Total occurrences counted from `dtstart`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub byweekday: Vec<Weekday>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub byhour: Vec<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub byminute: Vec<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bymonthday: Vec<u32>,
}

fn default_interval() -> u32 {
    1
}

fn default_tzid() -> String {
    "UTC".to_string()
}

impl RecurrenceRule {
    pub fn new(freq: Frequency) -> Self {
        Self {
            freq,
            interval: default_interval(),
            tzid: default_tzid(),
            dtstart: None,
            until: None,
            count: None,
            byweekday: Vec::new(),
            byhour: Vec::new(),
            byminute: Vec::new(),
            bymonthday: Vec::new(),
        }
    }

    pub fn with_interval(mut self, interval: u32) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_dtstart(mut self, dtstart: DateTime<Utc>) -> Self {
        self.dtstart = Some(dtstart);
        self
    }

    pub fn with_until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_byweekday(mut self, days: impl IntoIterator<Item = Weekday>) -> Self {
        self.byweekday = days.into_iter().collect();
        self
    }

    pub fn with_byhour(mut self, hours: impl IntoIterator<Item = u32>) -> Self {
        self.byhour = hours.into_iter().collect();
        self
    }

    pub fn with_byminute(mut self, minutes: impl IntoIterator<Item = u32>) -> Self {
        self.byminute = minutes.into_iter().collect();
        self
    }

    pub fn with_bymonthday(mut self, days: impl IntoIterator<Item = u32>) -> Self {
        self.bymonthday = days.into_iter().collect();
        self
    }

    /// Check the rule for structural errors.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(TaskManagerError::InvalidSchedule(msg));

        if !matches!(self.tzid.as_str(), "UTC" | "Etc/UTC") {
            return invalid(format!("unsupported tzid '{}'", self.tzid));
        }
        if self.interval == 0 {
            return invalid("rrule interval must be at least 1".into());
        }
        if self.count == Some(0) {
            return invalid("rrule count must be at least 1".into());
        }
        if let (Some(start), Some(until)) = (self.dtstart, self.until) {
            if until < start {
                return invalid(format!("rrule until {} is before dtstart {}", until, start));
            }
        }
        if let Some(hour) = self.byhour.iter().find(|h| **h > 23) {
            return invalid(format!("byhour {} out of range", hour));
        }
        if let Some(minute) = self.byminute.iter().find(|m| **m > 59) {
            return invalid(format!("byminute {} out of range", minute));
        }
        if let Some(day) = self.bymonthday.iter().find(|d| !(1..=31).contains(*d)) {
            return invalid(format!("bymonthday {} out of range", day));
        }
        Ok(())
    }

    /// First occurrence strictly after `reference` and at or after `now`.
    ///
    /// `None` means the series is exhausted by `until` or `count`. A rule
    /// with no occurrence inside the search horizon is an `InvalidSchedule`
    /// error.
    pub fn next_occurrence(
        &self,
        reference: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        self.validate()?;

        let anchor = truncate_to_second(self.dtstart.unwrap_or(reference));
        match self.freq {
            Frequency::Hourly | Frequency::Minutely => self.next_by_day(anchor, reference, now),
            Frequency::Daily | Frequency::Weekly | Frequency::Monthly => {
                self.next_by_period(anchor, reference, now)
            }
        }
    }

    fn next_by_period(
        &self,
        anchor: DateTime<Utc>,
        reference: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let skip = self.periods_before(anchor, reference.max(now));
        let mut emitted: u64 = 0;
        let mut period = match self.count {
            None => skip,
            Some(_) => match self.uniform_period_len(anchor) {
                // Period 0 may start before the anchor, so it is counted on its own.
                Some(len) if skip > 1 => {
                    emitted = self
                        .expand(anchor, 0)
                        .map_or(0, |first| count_from(&first, anchor));
                    emitted += u64::from(skip - 1) * len;
                    skip
                }
                _ => 0,
            },
        };

        for _ in 0..MAX_PERIODS {
            let Some(candidates) = self.expand(anchor, period) else {
                return Ok(None);
            };
            match self.accept(&candidates, anchor, reference, now, &mut emitted) {
                Walk::Found(at) => return Ok(Some(at)),
                Walk::Exhausted => return Ok(None),
                Walk::Continue => {}
            }
            period = period.saturating_add(1);
        }

        Err(beyond_horizon())
    }

    /// Hourly and minutely rules are walked a day at a time so days the
    /// date filters reject cost a single check.
    fn next_by_day(
        &self,
        anchor: DateTime<Utc>,
        reference: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let target_day = reference.max(now).date_naive();
        let mut day = match self.count {
            Some(_) => anchor.date_naive(),
            None => target_day.max(anchor.date_naive()),
        };
        let mut emitted: u64 = 0;

        for _ in 0..MAX_DAYS {
            if self.matches_date_filters(day) {
                if day < target_day {
                    // Days before the target only add to the count.
                    let Some(len) = self.day_len(anchor, day) else {
                        return Ok(None);
                    };
                    emitted += len;
                    if self.count.is_some_and(|count| emitted >= u64::from(count)) {
                        return Ok(None);
                    }
                } else {
                    let Some(candidates) = self.day_occurrences(anchor, day) else {
                        return Ok(None);
                    };
                    match self.accept(&candidates, anchor, reference, now, &mut emitted) {
                        Walk::Found(at) => return Ok(Some(at)),
                        Walk::Exhausted => return Ok(None),
                        Walk::Continue => {}
                    }
                }
            }
            let Some(next) = day.succ_opt() else {
                return Ok(None);
            };
            day = next;
        }

        Err(beyond_horizon())
    }

    /// Check sorted `candidates` in order, counting each one at or after the anchor.
    fn accept(
        &self,
        candidates: &[DateTime<Utc>],
        anchor: DateTime<Utc>,
        reference: DateTime<Utc>,
        now: DateTime<Utc>,
        emitted: &mut u64,
    ) -> Walk {
        for candidate in candidates.iter().copied() {
            if candidate < anchor {
                continue;
            }
            if self.until.is_some_and(|until| candidate > until) {
                return Walk::Exhausted;
            }
            *emitted += 1;
            if self.count.is_some_and(|count| *emitted > u64::from(count)) {
                return Walk::Exhausted;
            }
            if candidate > reference && candidate >= now {
                return Walk::Found(candidate);
            }
        }
        Walk::Continue
    }

    /// Occurrences in every period after the first, when that number is fixed.
    fn uniform_period_len(&self, anchor: DateTime<Utc>) -> Option<u64> {
        let uniform = match self.freq {
            Frequency::Daily => self.byweekday.is_empty() && self.bymonthday.is_empty(),
            Frequency::Weekly => self.bymonthday.is_empty(),
            _ => false,
        };
        if !uniform {
            return None;
        }
        self.expand(anchor, 1).map(|second| second.len() as u64)
    }

    /// Whole periods that can be skipped before `target` without missing an occurrence.
    fn periods_before(&self, anchor: DateTime<Utc>, target: DateTime<Utc>) -> u32 {
        let step = i64::from(self.interval);
        let elapsed = match self.freq {
            Frequency::Monthly => {
                let months = (target.year() as i64 * 12 + target.month0() as i64)
                    - (anchor.year() as i64 * 12 + anchor.month0() as i64);
                months / step
            }
            Frequency::Weekly => {
                (target.date_naive() - week_start(anchor.date_naive())).num_days() / 7 / step
            }
            Frequency::Daily => (target.date_naive() - anchor.date_naive()).num_days() / step,
            Frequency::Hourly | Frequency::Minutely => 0,
        };
        u32::try_from((elapsed - 1).max(0)).unwrap_or(u32::MAX)
    }

    /// Sorted occurrences on `day` for hourly and minutely rules, before the
    /// date filters and including any that precede the anchor.
    fn day_occurrences(&self, anchor: DateTime<Utc>, day: NaiveDate) -> Option<Vec<DateTime<Utc>>> {
        let second = Duration::seconds(i64::from(anchor.second()));
        let (base, span) = self.sub_daily_base(anchor);
        let (first, end) = periods_on_day(base, span, day)?;
        let minutes = non_empty_or(&self.byminute, anchor.minute());

        let mut out = Vec::new();
        for j in first..end {
            let start = base.checked_add_signed(Duration::minutes(j.checked_mul(span)?))?;
            if self.freq == Frequency::Minutely {
                let candidate = start + second;
                if self.matches_time_filters(candidate) {
                    out.push(candidate);
                }
            } else if self.byhour.is_empty() || self.byhour.contains(&start.hour()) {
                for minute in &minutes {
                    out.push(start + Duration::minutes(i64::from(*minute)) + second);
                }
            }
        }

        out.sort();
        out.dedup();
        Some(out)
    }

    /// Number of occurrences at or after the anchor on `day`.
    fn day_len(&self, anchor: DateTime<Utc>, day: NaiveDate) -> Option<u64> {
        if self.freq == Frequency::Minutely && self.byhour.is_empty() && self.byminute.is_empty() {
            let (base, span) = self.sub_daily_base(anchor);
            let (first, end) = periods_on_day(base, span, day)?;
            return Some(u64::try_from(end - first).unwrap_or(0));
        }
        self.day_occurrences(anchor, day)
            .map(|occurrences| count_from(&occurrences, anchor))
    }

    /// Start of period 0 and the period length in minutes.
    fn sub_daily_base(&self, anchor: DateTime<Utc>) -> (DateTime<Utc>, i64) {
        let step = i64::from(self.interval);
        match self.freq {
            Frequency::Minutely => (truncate_to_minute(anchor), step),
            _ => (truncate_to_hour(anchor), step * 60),
        }
    }

    /// Sorted occurrences inside the `period`-th period after `anchor`, for
    /// daily and coarser rules.
    ///
    /// `None` when the period lies outside the representable calendar.
    fn expand(&self, anchor: DateTime<Utc>, period: u32) -> Option<Vec<DateTime<Utc>>> {
        let steps = u64::from(period) * u64::from(self.interval);
        let second = anchor.second();
        let hours = non_empty_or(&self.byhour, anchor.hour());
        let minutes = non_empty_or(&self.byminute, anchor.minute());

        let mut out = Vec::new();
        match self.freq {
            // Walked by day.
            Frequency::Minutely | Frequency::Hourly => return None,
            Frequency::Daily => {
                let day = anchor.date_naive().checked_add_days(Days::new(steps))?;
                if self.matches_date_filters(day) {
                    push_times(&mut out, day, &hours, &minutes, second);
                }
            }
            Frequency::Weekly => {
                let monday = week_start(anchor.date_naive())
                    .checked_add_days(Days::new(steps.checked_mul(7)?))?;
                let weekdays = if self.byweekday.is_empty() {
                    vec![anchor.weekday()]
                } else {
                    self.byweekday.clone()
                };
                for weekday in weekdays {
                    let day = monday + Days::new(u64::from(weekday.num_days_from_monday()));
                    if self.bymonthday.is_empty() || self.bymonthday.contains(&day.day()) {
                        push_times(&mut out, day, &hours, &minutes, second);
                    }
                }
            }
            Frequency::Monthly => {
                let first = anchor
                    .date_naive()
                    .with_day(1)?
                    .checked_add_months(Months::new(u32::try_from(steps).ok()?))?;
                for day in self.month_days(first, anchor.day()) {
                    push_times(&mut out, day, &hours, &minutes, second);
                }
            }
        }

        out.sort();
        out.dedup();
        Some(out)
    }

    /// Days of the month starting at `first` that the rule selects.
    fn month_days(&self, first: NaiveDate, anchor_day: u32) -> Vec<NaiveDate> {
        let in_month = |day: u32| first.with_day(day);
        if !self.bymonthday.is_empty() {
            return self
                .bymonthday
                .iter()
                .filter_map(|d| in_month(*d))
                .filter(|d| self.byweekday.is_empty() || self.byweekday.contains(&d.weekday()))
                .collect();
        }
        if !self.byweekday.is_empty() {
            return (1..=31)
                .filter_map(in_month)
                .filter(|d| self.byweekday.contains(&d.weekday()))
                .collect();
        }
        in_month(anchor_day).into_iter().collect()
    }

    fn matches_time_filters(&self, at: DateTime<Utc>) -> bool {
        (self.byhour.is_empty() || self.byhour.contains(&at.hour()))
            && (self.byminute.is_empty() || self.byminute.contains(&at.minute()))
    }

    fn matches_date_filters(&self, day: NaiveDate) -> bool {
        (self.byweekday.is_empty() || self.byweekday.contains(&day.weekday()))
            && (self.bymonthday.is_empty() || self.bymonthday.contains(&day.day()))
    }
}

enum Walk {
    Found(DateTime<Utc>),
    Exhausted,
    Continue,
}

fn beyond_horizon() -> TaskManagerError {
    TaskManagerError::InvalidSchedule("no occurrence within search horizon".into())
}

fn count_from(occurrences: &[DateTime<Utc>], anchor: DateTime<Utc>) -> u64 {
    occurrences.iter().filter(|at| **at >= anchor).count() as u64
}

/// Range of `j` whose period `base + j * span` minutes starts on `day`.
fn periods_on_day(base: DateTime<Utc>, span: i64, day: NaiveDate) -> Option<(i64, i64)> {
    let day_start = day.and_hms_opt(0, 0, 0)?.and_utc();
    let from = (day_start - base).num_minutes();
    let to = from + 24 * 60;
    let ceil = |minutes: i64| {
        if minutes <= 0 {
            0
        } else {
            (minutes + span - 1) / span
        }
    };
    Some((ceil(from), ceil(to)))
}

fn non_empty_or(values: &[u32], fallback: u32) -> Vec<u32> {
    if values.is_empty() {
        vec![fallback]
    } else {
        values.to_vec()
    }
}

fn push_times(
    out: &mut Vec<DateTime<Utc>>,
    day: NaiveDate,
    hours: &[u32],
    minutes: &[u32],
    second: u32,
) {
    for hour in hours {
        for minute in minutes {
            if let Some(at) = day.and_hms_opt(*hour, *minute, second) {
                out.push(at.and_utc());
            }
        }
    }
}

fn week_start(day: NaiveDate) -> NaiveDate {
    day - Days::new(u64::from(day.weekday().num_days_from_monday()))
}

fn truncate_to_second(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_nanosecond(0).unwrap_or(at)
}

fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    let at = truncate_to_second(at);
    at.with_second(0).unwrap_or(at)
}

fn truncate_to_hour(at: DateTime<Utc>) -> DateTime<Utc> {
    let at = truncate_to_minute(at);
    at.with_minute(0).unwrap_or(at)
}
