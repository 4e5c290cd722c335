use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

/// Unix milliseconds. Only used for audit timestamps.
pub type Ms = i64;

// ── Hours ────────────────────────────────────────────────────────

/// Weekly hours as fixed-point hundredths, so sums of allocations are exact.
///
/// `Hours::parse("12.5")` is `1250` hundredths. Serialized as a JSON number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hours(i64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoursParseError {
    Empty,
    Invalid,
    TooPrecise,
    TooLarge,
}

impl fmt::Display for HoursParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HoursParseError::Empty => write!(f, "empty value"),
            HoursParseError::Invalid => write!(f, "not a decimal number"),
            HoursParseError::TooPrecise => write!(f, "more than 2 decimal places"),
            HoursParseError::TooLarge => write!(f, "value too large"),
        }
    }
}

impl std::error::Error for HoursParseError {}

impl Hours {
    pub const ZERO: Hours = Hours(0);

    pub const fn from_hundredths(hundredths: i64) -> Self {
        Self(hundredths)
    }

    pub const fn whole(hours: i64) -> Self {
        Self(hours * 100)
    }

    pub fn hundredths(self) -> i64 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Exact conversion from a JSON number. Anything finer than a hundredth
    /// is refused, the same as `parse`.
    pub fn from_f64(value: f64) -> Result<Self, HoursParseError> {
        if !value.is_finite() {
            return Err(HoursParseError::Invalid);
        }
        let scaled = value * 100.0;
        if scaled.abs() >= 1e14 {
            return Err(HoursParseError::TooLarge);
        }
        let rounded = scaled.round();
        if (scaled - rounded).abs() > 1e-6 {
            return Err(HoursParseError::TooPrecise);
        }
        Ok(Self(rounded as i64))
    }

    /// Parse a plain decimal such as `40`, `12.5`, `0.25` or `-3`.
    pub fn parse(s: &str) -> Result<Self, HoursParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(HoursParseError::Empty);
        }
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(HoursParseError::Invalid);
        }
        if !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
        {
            return Err(HoursParseError::Invalid);
        }
        if frac_part.len() > 2 {
            return Err(HoursParseError::TooPrecise);
        }
        if int_part.len() > 12 {
            return Err(HoursParseError::TooLarge);
        }
        let whole: i64 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| HoursParseError::Invalid)?
        };
        let frac: i64 = match frac_part.len() {
            0 => 0,
            1 => frac_part.parse::<i64>().map_err(|_| HoursParseError::Invalid)? * 10,
            _ => frac_part.parse().map_err(|_| HoursParseError::Invalid)?,
        };
        let value = whole * 100 + frac;
        Ok(Self(if negative { -value } else { value }))
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// `self × pct / 100`, rounded down to the hundredth.
    pub fn scale_percent(self, pct: u8) -> Hours {
        Hours(self.0 * i64::from(pct) / 100)
    }

    /// `self × weeks`.
    pub fn times(self, weeks: i64) -> Hours {
        Hours(self.0.saturating_mul(weeks))
    }

    /// `self / of × 100`, or 0 when `of` is not positive.
    pub fn percent_of(self, of: Hours) -> f64 {
        if of.0 <= 0 {
            return 0.0;
        }
        self.0 as f64 / of.0 as f64 * 100.0
    }
}

impl fmt::Display for Hours {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl Add for Hours {
    type Output = Hours;
    fn add(self, rhs: Hours) -> Hours {
        Hours(self.0 + rhs.0)
    }
}

impl Sub for Hours {
    type Output = Hours;
    fn sub(self, rhs: Hours) -> Hours {
        Hours(self.0 - rhs.0)
    }
}

impl AddAssign for Hours {
    fn add_assign(&mut self, rhs: Hours) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Hours {
    fn sub_assign(&mut self, rhs: Hours) {
        self.0 -= rhs.0;
    }
}

impl Sum for Hours {
    fn sum<I: Iterator<Item = Hours>>(iter: I) -> Hours {
        iter.fold(Hours::ZERO, |acc, h| acc + h)
    }
}

impl Serialize for Hours {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for Hours {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Hours::from_f64(value).map_err(|e| serde::de::Error::custom(format!("hours: {e}")))
    }
}

/// Round a percentage to 2 decimal places for reporting.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ── DateRange ────────────────────────────────────────────────────

/// Inclusive calendar range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Unchecked; ordering is a validation concern, see `is_ordered`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn is_ordered(&self) -> bool {
        self.end >= self.start
    }

    /// Two inclusive ranges overlap iff they share at least one calendar day.
    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    pub fn contains_day(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }

    /// Number of calendar days covered, inclusive of both ends.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Whole weeks between start and end, never less than one.
    pub fn duration_weeks(&self) -> i64 {
        ((self.end - self.start).num_days() / 7).max(1)
    }

    /// The part of `self` inside `window`, if any.
    pub fn clamp_to(&self, window: &DateRange) -> Option<DateRange> {
        if !self.overlaps(window) {
            return None;
        }
        Some(DateRange::new(
            self.start.max(window.start),
            self.end.min(window.end),
        ))
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

// ── Allocation / Resource / Project ──────────────────────────────

/// A resource committed to a project for `hours_per_week` over `range`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub project_id: Ulid,
    pub range: DateRange,
    pub hours_per_week: Hours,
    pub is_active: bool,
    pub notes: String,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Allocation {
    pub fn duration_weeks(&self) -> i64 {
        self.range.duration_weeks()
    }

    pub fn total_hours_allocated(&self) -> Hours {
        self.hours_per_week.times(self.duration_weeks())
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: Option<String>,
    /// Nominal weekly hours, already resolved against the configured default.
    pub capacity_weekly: Hours,
    /// 0–100; scales the effective capacity.
    pub availability_percentage: u8,
    pub is_active: bool,
    /// All allocations (active and retired), sorted by `range.start`.
    pub allocations: Vec<Allocation>,
}

impl ResourceState {
    pub fn new(
        id: Ulid,
        name: Option<String>,
        capacity_weekly: Hours,
        availability_percentage: u8,
    ) -> Self {
        Self {
            id,
            name,
            capacity_weekly,
            availability_percentage,
            is_active: true,
            allocations: Vec::new(),
        }
    }

    /// Insert allocation maintaining sort order by `range.start`.
    pub fn insert_allocation(&mut self, allocation: Allocation) {
        let pos = self
            .allocations
            .partition_point(|a| a.range.start <= allocation.range.start);
        self.allocations.insert(pos, allocation);
    }

    pub fn remove_allocation(&mut self, id: Ulid) -> Option<Allocation> {
        let pos = self.allocations.iter().position(|a| a.id == id)?;
        Some(self.allocations.remove(pos))
    }

    pub fn get_allocation(&self, id: &Ulid) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.id == *id)
    }

    pub fn get_allocation_mut(&mut self, id: &Ulid) -> Option<&mut Allocation> {
        self.allocations.iter_mut().find(|a| a.id == *id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub id: Ulid,
    pub name: Option<String>,
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: Option<String>,
        capacity_weekly: Hours,
        availability_percentage: u8,
    },
    ResourceUpdated {
        id: Ulid,
        name: Option<String>,
        capacity_weekly: Hours,
        availability_percentage: u8,
        is_active: bool,
    },
    ResourceDeleted {
        id: Ulid,
    },
    ProjectCreated {
        id: Ulid,
        name: Option<String>,
    },
    ProjectDeleted {
        id: Ulid,
    },
    AllocationCreated {
        id: Ulid,
        resource_id: Ulid,
        project_id: Ulid,
        range: DateRange,
        hours_per_week: Hours,
        notes: String,
        at: Ms,
    },
    AllocationUpdated {
        id: Ulid,
        resource_id: Ulid,
        range: DateRange,
        hours_per_week: Hours,
        notes: String,
        at: Ms,
    },
    AllocationActiveSet {
        id: Ulid,
        resource_id: Ulid,
        is_active: bool,
        at: Ms,
    },
    AllocationRemoved {
        id: Ulid,
        resource_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub capacity_weekly: Hours,
    pub availability_percentage: u8,
    pub is_active: bool,
}

/// An allocation plus the values derived from it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationInfo {
    #[serde(flatten)]
    pub allocation: Allocation,
    pub duration_weeks: i64,
    pub total_hours_allocated: Hours,
    /// Other active allocations of the same resource overlapping this one.
    pub overlaps_with_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectSummary {
    pub project_id: Ulid,
    pub allocation_count: usize,
    pub active_on_day: usize,
    pub total_allocated_hours: Hours,
}
