//! Core domain model and business rules for TradeBoost.

use chrono::{DateTime, Datelike, Duration, LocalResult, Months, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

pub const CRATE_NAME: &str = "tradeboost-core";

/// Fixed-point monetary amount in micro-units: 1,000,000 micros = 1 major
/// currency unit. All spend arithmetic inside the system stays in micros;
/// conversion to major units happens once, at the dashboard boundary.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Micros(pub i64);

impl Micros {
    pub const PER_MAJOR_UNIT: i64 = 1_000_000;

    pub fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn to_major_units(self) -> f64 {
        self.0 as f64 / Self::PER_MAJOR_UNIT as f64
    }
}

impl std::iter::Sum for Micros {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Self(iter.map(|m| m.0).sum())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QualificationStatus {
    Qualified,
    Unqualified,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QualificationReason {
    NotAnswered,
    ShortDuration,
    RulesSatisfied,
}

/// Business policy for counting an inbound call as a sales lead. The
/// 30-second minimum ships as a configurable default rather than a
/// constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualificationPolicy {
    pub min_duration_seconds: u32,
}

impl Default for QualificationPolicy {
    fn default() -> Self {
        Self {
            min_duration_seconds: 30,
        }
    }
}

impl QualificationPolicy {
    /// Reason precedence: unanswered beats short duration; the duration
    /// boundary is inclusive.
    pub fn evaluate(
        &self,
        answered: bool,
        duration_seconds: u32,
    ) -> (QualificationStatus, QualificationReason) {
        if !answered {
            (QualificationStatus::Unqualified, QualificationReason::NotAnswered)
        } else if duration_seconds < self.min_duration_seconds {
            (QualificationStatus::Unqualified, QualificationReason::ShortDuration)
        } else {
            (QualificationStatus::Qualified, QualificationReason::RulesSatisfied)
        }
    }
}

/// One inbound call as delivered by the call-tracking provider's webhook,
/// validated at the boundary. `(provider, external_call_id)` is the natural
/// key for idempotent ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEvent {
    pub user_id: String,
    pub provider: String,
    pub external_call_id: String,
    pub from_number: Option<String>,
    pub to_number: Option<String>,
    pub tracking_number: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: u32,
    pub answered: bool,
}

/// Current reporting month in a given timezone. `month_start`/`month_end`
/// bound the half-open instant interval `[start, end)`; `first_of_month`
/// and `today` bound the inclusive snapshot date range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthPeriod {
    pub month_key: String,
    pub month_start: DateTime<Utc>,
    pub month_end: DateTime<Utc>,
    pub first_of_month: NaiveDate,
    pub today: NaiveDate,
}

impl MonthPeriod {
    /// Resolve the reporting month containing `now`, as seen from `tz`.
    /// `now` is an explicit parameter so callers within one logical request
    /// agree on boundaries and tests can pin arbitrary instants.
    pub fn resolve(tz: Tz, now: DateTime<Utc>) -> Self {
        let today = now.with_timezone(&tz).date_naive();
        let first_of_month = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)
            .expect("the first of a resolved month is a valid date");
        let first_of_next = first_of_month
            .checked_add_months(Months::new(1))
            .expect("month rollover stays in chrono's date range");

        Self {
            month_key: format!("{:04}-{:02}", today.year(), today.month()),
            month_start: local_midnight_utc(tz, first_of_month),
            month_end: local_midnight_utc(tz, first_of_next),
            first_of_month,
            today,
        }
    }
}

/// Wall-clock midnight of `date` in `tz` as a UTC instant. Ambiguous
/// midnights (DST fall-back) resolve to the earlier instant; skipped
/// midnights (DST spring-forward) resolve to the first valid instant after.
fn local_midnight_utc(tz: Tz, date: NaiveDate) -> DateTime<Utc> {
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid wall-clock time");
    match tz.from_local_datetime(&midnight) {
        LocalResult::Single(instant) => instant.with_timezone(&Utc),
        LocalResult::Ambiguous(earlier, _) => earlier.with_timezone(&Utc),
        LocalResult::None => tz
            .from_local_datetime(&(midnight + Duration::hours(1)))
            .earliest()
            .expect("an instant exists within an hour of any local midnight")
            .with_timezone(&Utc),
    }
}

/// Month-to-date spend in major currency units, ready for rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendTotal {
    pub amount: f64,
    pub currency_code: String,
}

/// Current-month dashboard aggregate. Recomputed on every read, never
/// cached. `cost_per_lead` is `None` (rendered "N/A") rather than zero or
/// infinity when no calls qualified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardMetrics {
    pub month_key: String,
    pub qualified_calls: u64,
    pub ad_spend: SpendTotal,
    pub cost_per_lead: Option<f64>,
    pub estimated_revenue: f64,
    pub estimated_roi: f64,
    pub has_real_data: bool,
}

impl DashboardMetrics {
    pub fn derive(
        month_key: String,
        qualified_calls: u64,
        spend: Micros,
        currency_code: String,
        average_revenue_per_job: f64,
    ) -> Self {
        let amount = spend.to_major_units();
        let cost_per_lead = if qualified_calls > 0 {
            Some(amount / qualified_calls as f64)
        } else {
            None
        };
        let estimated_revenue = qualified_calls as f64 * average_revenue_per_job;

        Self {
            month_key,
            qualified_calls,
            cost_per_lead,
            estimated_revenue,
            estimated_roi: estimated_revenue - amount,
            has_real_data: qualified_calls > 0 || spend.0 > 0,
            ad_spend: SpendTotal {
                amount,
                currency_code,
            },
        }
    }
}
