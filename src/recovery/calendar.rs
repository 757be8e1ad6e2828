//! Business-window scheduling.
//!
//! Retries flagged business-hours-only may only be dispatched Monday to Friday
//! inside the configured window, in the job's own timezone. Holiday dates and
//! restricted periods come from an injected [`BusinessCalendar`].

use std::collections::HashSet;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Upper bound on days scanned when looking for the next open window.
const MAX_SCAN_DAYS: usize = 400;

/// Daily working window in local hours, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessWindow {
    #[serde(default = "default_start_hour")]
    pub start_hour: u32,
    #[serde(default = "default_end_hour")]
    pub end_hour: u32,
    /// Shortened window applied during restricted periods.
    #[serde(default = "default_reduced_start_hour")]
    pub reduced_start_hour: u32,
    #[serde(default = "default_reduced_end_hour")]
    pub reduced_end_hour: u32,
}

impl Default for BusinessWindow {
    fn default() -> Self {
        Self {
            start_hour: default_start_hour(),
            end_hour: default_end_hour(),
            reduced_start_hour: default_reduced_start_hour(),
            reduced_end_hour: default_reduced_end_hour(),
        }
    }
}

fn default_start_hour() -> u32 {
    9
}

fn default_end_hour() -> u32 {
    17
}

fn default_reduced_start_hour() -> u32 {
    10
}

fn default_reduced_end_hour() -> u32 {
    15
}

/// Calendar-derived scheduling constraints of one job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleConstraints {
    pub business_hours_only: bool,
    pub holiday_sensitive: bool,
    pub ramadan_sensitive: bool,
    pub timezone: Tz,
}

impl ScheduleConstraints {
    /// No constraints at all.
    pub fn unconstrained() -> Self {
        Self {
            business_hours_only: false,
            holiday_sensitive: false,
            ramadan_sensitive: false,
            timezone: Tz::UTC,
        }
    }

    fn is_constrained(&self) -> bool {
        self.business_hours_only || self.holiday_sensitive
    }
}

/// Holiday and restricted-period predicate.
pub trait BusinessCalendar: Send + Sync {
    /// True if `date` is a non-working holiday.
    fn is_holiday(&self, date: NaiveDate) -> bool;

    /// True if `date` falls in a restricted period with reduced working hours.
    fn is_restricted_period(&self, date: NaiveDate) -> bool;
}

/// An inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Calendar built from fixed holiday dates and restricted periods.
#[derive(Debug, Clone, Default)]
pub struct StaticCalendar {
    holidays: HashSet<NaiveDate>,
    restricted: Vec<DateRange>,
}

impl StaticCalendar {
    pub fn new(holidays: impl IntoIterator<Item = NaiveDate>, restricted: Vec<DateRange>) -> Self {
        Self {
            holidays: holidays.into_iter().collect(),
            restricted,
        }
    }
}

impl BusinessCalendar for StaticCalendar {
    fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.contains(&date)
    }

    fn is_restricted_period(&self, date: NaiveDate) -> bool {
        self.restricted.iter().any(|r| r.contains(date))
    }
}

/// Returns the earliest instant at or after `candidate` that satisfies the
/// constraints. Unconstrained jobs get `candidate` back unchanged.
pub fn clamp_to_window(
    candidate: DateTime<Utc>,
    constraints: &ScheduleConstraints,
    window: &BusinessWindow,
    calendar: &dyn BusinessCalendar,
) -> DateTime<Utc> {
    if !constraints.is_constrained() {
        return candidate;
    }

    let tz = constraints.timezone;
    let mut local = candidate.with_timezone(&tz).naive_local();
    let mut moved = false;

    for _ in 0..MAX_SCAN_DAYS {
        let date = local.date();

        if !is_open_day(date, constraints, calendar) {
            local = start_of_next_day(date);
            moved = true;
            continue;
        }

        if !constraints.business_hours_only {
            break;
        }

        let (open, close) = hours_for(date, constraints, window, calendar);
        if local.time() < open {
            local = date.and_time(open);
            moved = true;
            break;
        }
        if local.time() >= close {
            local = start_of_next_day(date);
            moved = true;
            continue;
        }
        break;
    }

    if !moved {
        return candidate;
    }

    resolve_local(&tz, local).max(candidate)
}

/// True if dispatching at `at` is allowed for these constraints.
pub fn is_within_window(
    at: DateTime<Utc>,
    constraints: &ScheduleConstraints,
    window: &BusinessWindow,
    calendar: &dyn BusinessCalendar,
) -> bool {
    clamp_to_window(at, constraints, window, calendar) == at
}

/// True if `at`, in `tz`, falls on a weekday inside the regular window.
pub fn is_business_time(at: DateTime<Utc>, tz: Tz, window: &BusinessWindow) -> bool {
    let local = at.with_timezone(&tz);
    if is_weekend(local.weekday()) {
        return false;
    }
    let time = local.time();
    time >= hour_time(window.start_hour) && time < hour_time(window.end_hour)
}

fn is_open_day(
    date: NaiveDate,
    constraints: &ScheduleConstraints,
    calendar: &dyn BusinessCalendar,
) -> bool {
    if constraints.business_hours_only && is_weekend(date.weekday()) {
        return false;
    }
    !(constraints.holiday_sensitive && calendar.is_holiday(date))
}

fn hours_for(
    date: NaiveDate,
    constraints: &ScheduleConstraints,
    window: &BusinessWindow,
    calendar: &dyn BusinessCalendar,
) -> (NaiveTime, NaiveTime) {
    if constraints.ramadan_sensitive && calendar.is_restricted_period(date) {
        (
            hour_time(window.reduced_start_hour),
            hour_time(window.reduced_end_hour),
        )
    } else {
        (hour_time(window.start_hour), hour_time(window.end_hour))
    }
}

fn is_weekend(day: Weekday) -> bool {
    matches!(day, Weekday::Sat | Weekday::Sun)
}

fn hour_time(hour: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, 0, 0)
        .or_else(|| NaiveTime::from_hms_milli_opt(23, 59, 59, 999))
        .unwrap_or(NaiveTime::MIN)
}

fn start_of_next_day(date: NaiveDate) -> NaiveDateTime {
    date.succ_opt().unwrap_or(date).and_time(NaiveTime::MIN)
}

/// Converts a local wall-clock time to UTC, stepping over DST gaps.
fn resolve_local(tz: &Tz, local: NaiveDateTime) -> DateTime<Utc> {
    let mut candidate = local;
    for _ in 0..4 {
        if let Some(dt) = tz.from_local_datetime(&candidate).earliest() {
            return dt.with_timezone(&Utc);
        }
        candidate += chrono::Duration::minutes(30);
    }
    Utc.from_utc_datetime(&local)
}
