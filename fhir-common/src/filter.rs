use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use tracing::{trace, warn};

use crate::bundle::{Bundle, Period, TemporalValue, PATIENT_RESOURCE_TYPE};

/// Enumeration of errors related to building a `TemporalFilter` from configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FilterConfigError {
    #[error("{0} is not a valid date comparator")]
    InvalidComparator(String),
    #[error("{0} is not a valid filter timezone")]
    InvalidTimezone(String),
    #[error("midnight of {date} does not exist in timezone {timezone}")]
    NonexistentThreshold { date: NaiveDate, timezone: Tz },
}

/// How the resource date must relate to the configured threshold date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Comparator {
    /// Same calendar day as the threshold.
    #[default]
    Eq,
    /// Strictly after the threshold.
    Gt,
    Gte,
    /// Strictly before the threshold.
    Lt,
    Lte,
}

impl FromStr for Comparator {
    type Err = FilterConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_ref() {
            "=" | "==" | "eq" => Ok(Comparator::Eq),
            ">" | "gt" => Ok(Comparator::Gt),
            ">=" | "gte" => Ok(Comparator::Gte),
            "<" | "lt" => Ok(Comparator::Lt),
            "<=" | "lte" => Ok(Comparator::Lte),
            invalid => Err(FilterConfigError::InvalidComparator(invalid.to_owned())),
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Comparator::Eq => write!(f, "="),
            Comparator::Gt => write!(f, ">"),
            Comparator::Gte => write!(f, ">="),
            Comparator::Lt => write!(f, "<"),
            Comparator::Lte => write!(f, "<="),
        }
    }
}

/// Timezone the threshold date is anchored in, parsed from an IANA name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterTimezone(pub Tz);

impl Default for FilterTimezone {
    fn default() -> Self {
        FilterTimezone(chrono_tz::Europe::Berlin)
    }
}

impl FromStr for FilterTimezone {
    type Err = FilterConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<Tz>()
            .map(FilterTimezone)
            .map_err(|_| FilterConfigError::InvalidTimezone(s.to_owned()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateFilterConfig {
    /// The calendar date resources are compared against.
    pub threshold: NaiveDate,
    pub comparator: Comparator,
    /// Also admit resources dated on the threshold day, whatever the comparator.
    pub inclusive: bool,
    pub timezone: FilterTimezone,
}

impl DateFilterConfig {
    pub fn new(threshold: NaiveDate, comparator: Comparator) -> Self {
        Self {
            threshold,
            comparator,
            inclusive: false,
            timezone: FilterTimezone::default(),
        }
    }

    pub fn inclusive(mut self, inclusive: bool) -> Self {
        self.inclusive = inclusive;
        self
    }

    pub fn timezone(mut self, timezone: FilterTimezone) -> Self {
        self.timezone = timezone;
        self
    }

    /// `EQ` only ever matches the threshold day, so it is inclusive by definition.
    pub fn is_inclusive(&self) -> bool {
        self.inclusive || self.comparator == Comparator::Eq
    }
}

/// Decides whether a bundle should be forwarded, based on the dates of its resources.
///
/// The decision is a pure function of the bundle and the configuration the filter was
/// built with. Entries are evaluated in bundle order:
///   - a `Patient` resource admits the whole bundle;
///   - a resource without any date rejects the whole bundle;
///   - a matching date (or either bound of a matching period) admits the whole bundle;
///   - otherwise evaluation continues with the next entry.
///
/// A bundle whose entries are exhausted without a decision is rejected.
#[derive(Debug, Clone)]
pub struct TemporalFilter {
    date: NaiveDate,
    instant: DateTime<Utc>,
    comparator: Comparator,
    inclusive: bool,
}

impl TemporalFilter {
    pub fn new(config: &DateFilterConfig) -> Result<Self, FilterConfigError> {
        let FilterTimezone(timezone) = config.timezone;
        let midnight = config.threshold.and_time(chrono::NaiveTime::MIN);
        let instant = timezone
            .from_local_datetime(&midnight)
            .earliest()
            .ok_or(FilterConfigError::NonexistentThreshold {
                date: config.threshold,
                timezone,
            })?
            .with_timezone(&Utc);

        Ok(Self {
            date: config.threshold,
            instant,
            comparator: config.comparator,
            inclusive: config.is_inclusive(),
        })
    }

    /// Parse a bundle out of a raw payload and apply the filter to it.
    /// Payloads that do not deserialize into a bundle never pass, even when a resource
    /// type field earlier in the bundle would have admitted it.
    pub fn accepts(&self, payload: &[u8]) -> bool {
        match Bundle::from_slice(payload) {
            Ok(bundle) => self.apply(&bundle),
            Err(error) => {
                warn!(
                    %error,
                    line = error.line(),
                    column = error.column(),
                    "bundle skipped because it failed to deserialize"
                );
                false
            }
        }
    }

    pub fn apply(&self, bundle: &Bundle) -> bool {
        for entry in &bundle.entries {
            if entry.resource_type() == Some(PATIENT_RESOURCE_TYPE) {
                return true;
            }

            let passed = match entry.temporal_value() {
                None => {
                    trace!(
                        resource_type = entry.resource_type(),
                        "resource has no date, rejecting bundle"
                    );
                    return false;
                }
                Some(TemporalValue::DateTime(value)) => self.matches_date_time(value),
                Some(TemporalValue::Period(period)) => self.matches_period(period),
            };

            if passed {
                return true;
            }
        }

        false
    }

    fn matches_period(&self, period: &Period) -> bool {
        [period.start.as_deref(), period.end.as_deref()]
            .into_iter()
            .flatten()
            .any(|value| self.matches_date_time(value))
    }

    fn matches_date_time(&self, value: &str) -> bool {
        match DateTime::parse_from_rfc3339(value) {
            Ok(date_time) => self.matches(&date_time),
            Err(error) => {
                warn!(value, %error, "failed to parse resource date");
                false
            }
        }
    }

    fn matches(&self, date_time: &DateTime<FixedOffset>) -> bool {
        let same_day = date_time.date_naive() == self.date;
        if self.inclusive && same_day {
            return true;
        }

        match self.comparator {
            Comparator::Eq => same_day,
            Comparator::Gt => *date_time > self.instant,
            Comparator::Gte => *date_time >= self.instant,
            Comparator::Lt => *date_time < self.instant,
            Comparator::Lte => *date_time <= self.instant,
        }
    }
}
