//! Business hours and the slot grid.
//!
//! Each weekday has its own list of valid slot starts on a 30-minute grid
//! and a fixed capacity: the number of appointments that may overlap any
//! single slot (staff or rooms on duty). A session covers one or more
//! consecutive slots.

use chrono::{Datelike, NaiveDate, Weekday};

use crate::config::ConfigError;
use crate::model::*;

pub const SLOT_MINUTES: Min = 30;

/// Duration used when a booking references no package.
pub const DEFAULT_SESSION_MINUTES: Min = 60;

const WEEKDAYS: [(&str, Weekday); 7] = [
    ("mon", Weekday::Mon),
    ("tue", Weekday::Tue),
    ("wed", Weekday::Wed),
    ("thu", Weekday::Thu),
    ("fri", Weekday::Fri),
    ("sat", Weekday::Sat),
    ("sun", Weekday::Sun),
];

/// The 30-minute grid windows that overlap `span`.
pub fn sub_slots(span: Span) -> impl Iterator<Item = Span> {
    let first = span.start.div_euclid(SLOT_MINUTES) * SLOT_MINUTES;
    (first..span.end)
        .step_by(SLOT_MINUTES as usize)
        .map(|s| Span::new(s, s + SLOT_MINUTES))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayHours {
    slots: Vec<Min>,
    capacity: u32,
}

impl DayHours {
    pub fn new(mut slots: Vec<Min>, capacity: u32) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::Invalid("capacity must be at least 1".into()));
        }
        if let Some(bad) = slots
            .iter()
            .find(|s| **s % SLOT_MINUTES != 0 || !(0..MINUTES_PER_DAY).contains(*s))
        {
            return Err(ConfigError::Invalid(format!("slot {} is not on the 30-minute grid", format_hhmm(*bad))));
        }
        slots.sort_unstable();
        slots.dedup();
        Ok(Self { slots, capacity })
    }

    /// Build the slot list from opening ranges, e.g. 09:00–13:00 and 14:00–18:00.
    pub fn from_ranges(ranges: &[Span], capacity: u32) -> Result<Self, ConfigError> {
        let mut slots = Vec::new();
        for r in ranges {
            if r.start % SLOT_MINUTES != 0 || r.end % SLOT_MINUTES != 0 {
                return Err(ConfigError::Invalid(format!(
                    "range {}-{} is not on the 30-minute grid",
                    format_hhmm(r.start),
                    format_hhmm(r.end)
                )));
            }
            slots.extend((r.start..r.end).step_by(SLOT_MINUTES as usize));
        }
        Self::new(slots, capacity)
    }

    pub fn slots(&self) -> &[Min] {
        &self.slots
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn is_slot_start(&self, m: Min) -> bool {
        self.slots.binary_search(&m).is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoursError {
    Closed(Weekday),
    NotASlot(Min),
    PastClosing(Min),
    BadDuration(Min),
}

impl std::fmt::Display for HoursError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HoursError::Closed(day) => write!(f, "closed on {day}"),
            HoursError::NotASlot(m) => write!(f, "{} is not a bookable slot", format_hhmm(*m)),
            HoursError::PastClosing(m) => {
                write!(f, "session runs into {} which is outside business hours", format_hhmm(*m))
            }
            HoursError::BadDuration(d) => write!(f, "invalid session duration: {d} minutes"),
        }
    }
}

impl std::error::Error for HoursError {}

/// Per-weekday opening hours and slot capacity. Injected per tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessHours {
    week: [Option<DayHours>; 7],
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self::parse("mon-fri 09:00-13:00 14:00-18:00 x2; sat 09:00-14:00 x2")
            .unwrap_or_else(|_| Self::closed())
    }
}

impl BusinessHours {
    pub fn closed() -> Self {
        Self {
            week: Default::default(),
        }
    }

    pub fn with_day(mut self, weekday: Weekday, hours: DayHours) -> Self {
        self.week[weekday.num_days_from_monday() as usize] = Some(hours);
        self
    }

    pub fn for_date(&self, date: NaiveDate) -> Option<&DayHours> {
        self.week[date.weekday().num_days_from_monday() as usize].as_ref()
    }

    /// Capacity of every slot on `date`; 0 when closed.
    pub fn capacity_on(&self, date: NaiveDate) -> u32 {
        self.for_date(date).map_or(0, DayHours::capacity)
    }

    pub fn max_capacity(&self) -> u32 {
        self.week
            .iter()
            .flatten()
            .map(DayHours::capacity)
            .max()
            .unwrap_or(0)
    }

    /// Resolve a requested start and duration into a session span, checking
    /// that it starts on a slot and every slot it covers is open.
    pub fn session_span(&self, date: NaiveDate, start: Min, duration: Min) -> Result<Span, HoursError> {
        if duration <= 0 || start + duration > MINUTES_PER_DAY {
            return Err(HoursError::BadDuration(duration));
        }
        let hours = self.for_date(date).ok_or(HoursError::Closed(date.weekday()))?;
        if !hours.is_slot_start(start) {
            return Err(HoursError::NotASlot(start));
        }
        let span = Span::new(start, start + duration);
        for slot in sub_slots(span) {
            if !hours.is_slot_start(slot.start) {
                return Err(HoursError::PastClosing(slot.start));
            }
        }
        Ok(span)
    }

    /// Parse `"mon-fri 09:00-13:00 14:00-18:00 x2; sat 10:00-14:00 x1"`.
    /// Days are a name, a range (`mon-fri`) or a comma list (`mon,wed`);
    /// capacity defaults to 1.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut hours = Self::closed();
        for entry in text.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let mut tokens = entry.split_whitespace();
            let days = parse_days(tokens.next().unwrap_or_default())?;
            let mut ranges = Vec::new();
            let mut capacity = 1;
            for token in tokens {
                if let Some(cap) = token.strip_prefix('x') {
                    capacity = cap
                        .parse()
                        .map_err(|_| ConfigError::Invalid(format!("bad capacity: {token}")))?;
                } else {
                    ranges.push(parse_range(token)?);
                }
            }
            if ranges.is_empty() {
                return Err(ConfigError::Invalid(format!("no opening ranges in '{entry}'")));
            }
            let day_hours = DayHours::from_ranges(&ranges, capacity)?;
            for day in days {
                hours = hours.with_day(day, day_hours.clone());
            }
        }
        Ok(hours)
    }
}

fn weekday(name: &str) -> Result<usize, ConfigError> {
    let lower = name.to_ascii_lowercase();
    WEEKDAYS
        .iter()
        .position(|(n, _)| *n == lower)
        .ok_or_else(|| ConfigError::Invalid(format!("unknown weekday: {name}")))
}

fn parse_days(token: &str) -> Result<Vec<Weekday>, ConfigError> {
    let mut days = Vec::new();
    for part in token.split(',') {
        if let Some((a, b)) = part.split_once('-') {
            let (a, b) = (weekday(a)?, weekday(b)?);
            if a > b {
                return Err(ConfigError::Invalid(format!("backwards day range: {part}")));
            }
            days.extend(WEEKDAYS[a..=b].iter().map(|(_, d)| *d));
        } else {
            days.push(WEEKDAYS[weekday(part)?].1);
        }
    }
    Ok(days)
}

fn parse_range(token: &str) -> Result<Span, ConfigError> {
    let bad = || ConfigError::Invalid(format!("bad time range: {token}"));
    let (a, b) = token.split_once('-').ok_or_else(bad)?;
    let (start, end) = (parse_hhmm(a).ok_or_else(bad)?, parse_hhmm(b).ok_or_else(bad)?);
    if start >= end {
        return Err(bad());
    }
    Ok(Span::new(start, end))
}
