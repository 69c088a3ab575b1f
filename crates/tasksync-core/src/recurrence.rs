//! Recurrence patterns and calendar-aware due-date arithmetic.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The rule governing when the next occurrence of a repeating task is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recurrence {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Recurrence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recurrence::Daily => "daily",
            Recurrence::Weekly => "weekly",
            Recurrence::Monthly => "monthly",
            Recurrence::Yearly => "yearly",
        }
    }

    /// Compute the due date of the next occurrence.
    ///
    /// Daily/weekly are fixed offsets. Monthly/yearly clamp to the last valid
    /// day of the target month (Jan 31 + monthly → Feb 28/29), preserving the
    /// time of day.
    pub fn advance(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Recurrence::Daily => from + Duration::days(1),
            Recurrence::Weekly => from + Duration::days(7),
            Recurrence::Monthly => add_months(from, 1),
            Recurrence::Yearly => add_months(from, 12),
        }
    }
}

impl std::str::FromStr for Recurrence {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "daily" => Ok(Recurrence::Daily),
            "weekly" => Ok(Recurrence::Weekly),
            "monthly" => Ok(Recurrence::Monthly),
            "yearly" => Ok(Recurrence::Yearly),
            other => Err(Error::InvalidInput(format!(
                "unknown recurrence pattern: {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for Recurrence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Add whole months, clamping the day-of-month to the target month's length.
fn add_months(dt: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    let date = dt.date_naive();
    let time = dt.time();

    let total = date.year() * 12 + date.month0() as i32 + months as i32;
    let year = total.div_euclid(12);
    let month = total.rem_euclid(12) as u32 + 1;
    let day = date.day().min(days_in_month(year, month));

    // day is clamped into [1, days_in_month], so construction cannot fail;
    // the fallback only guards arithmetic at the edges of the chrono range.
    let next = NaiveDate::from_ymd_opt(year, month, day).unwrap_or(date);
    Utc.from_utc_datetime(&next.and_time(time))
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}
