use chrono::{Datelike, Days, NaiveDate};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

pub fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let next_month = if month == 12 { 1 } else { month + 1 };
    let next_year = if month == 12 { year + 1 } else { year };

    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.checked_sub_days(Days::new(1))
}

/// Steps a period end forward by whole months, snapping to the month end.
///
/// `2024-03-31 + 3 = 2024-06-30`, `2024-02-29 + 12 = 2025-02-28`.
pub fn add_months_month_end(date: NaiveDate, months: u32) -> Option<NaiveDate> {
    let zero_based = date.month0() + months;
    let year = date.year() + (zero_based / 12) as i32;
    let month = zero_based % 12 + 1;
    last_day_of_month(year, month)
}

pub fn months_between(start: NaiveDate, end: NaiveDate) -> i32 {
    let year_diff = end.year() - start.year();
    let month_diff = end.month() as i32 - start.month() as i32;
    year_diff * 12 + month_diff
}

/// Reporting length of a duration fact, bucketed the way filings report them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodLength {
    Quarter,
    HalfYear,
    NineMonths,
    Annual,
    Other,
}

impl PeriodLength {
    pub fn classify(start: NaiveDate, end: NaiveDate) -> Self {
        match (end - start).num_days() {
            80..=100 => Self::Quarter,
            170..=190 => Self::HalfYear,
            260..=280 => Self::NineMonths,
            350..=380 => Self::Annual,
            _ => Self::Other,
        }
    }

    /// Months between consecutive period ends of this length.
    pub fn months(&self) -> Option<u32> {
        match self {
            Self::Quarter => Some(3),
            Self::HalfYear => Some(6),
            Self::NineMonths => None,
            Self::Annual => Some(12),
            Self::Other => None,
        }
    }
}

/// Largest power of ten a `Decimal` scale can express.
pub const MAX_DECIMAL_EXPONENT: i32 = 28;

/// `10^exp` as a decimal, `None` if it cannot be represented.
pub fn pow10(exp: i32) -> Option<Decimal> {
    if exp.unsigned_abs() > MAX_DECIMAL_EXPONENT.unsigned_abs() {
        return None;
    }
    let mut result = Decimal::ONE;
    for _ in 0..exp.unsigned_abs() {
        result = if exp >= 0 {
            result.checked_mul(Decimal::TEN)?
        } else {
            result.checked_div(Decimal::TEN)?
        };
    }
    Some(result)
}

/// Rounds to XBRL `decimals` precision. Negative precision rounds to tens,
/// thousands, millions...
pub fn round_to_decimals(value: Decimal, decimals: i32) -> Option<Decimal> {
    if decimals >= 0 {
        return Some(
            value.round_dp_with_strategy(decimals as u32, RoundingStrategy::MidpointAwayFromZero),
        );
    }
    let factor = pow10(decimals.checked_neg()?)?;
    let shrunk = value
        .checked_div(factor)?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    shrunk.checked_mul(factor)
}

/// `numerator / denominator`, `None` when the denominator is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Option<Decimal> {
    if denominator.is_zero() {
        return None;
    }
    numerator.checked_div(denominator)
}

/// Compound growth rate from `first` to `last` over `steps` periods.
///
/// Undefined (None) unless both endpoints are positive.
pub fn compound_growth(first: Decimal, last: Decimal, steps: u32) -> Option<Decimal> {
    if steps == 0 || first <= Decimal::ZERO || last <= Decimal::ZERO {
        return None;
    }
    let ratio = last.checked_div(first)?;
    if steps == 1 {
        return Some(ratio - Decimal::ONE);
    }
    let root = ratio.to_f64()?.powf(1.0 / steps as f64);
    let growth = Decimal::from_f64(root)? - Decimal::ONE;
    Some(growth.round_dp(8))
}

pub fn mean(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let total: Decimal = values.iter().sum();
    total.checked_div(Decimal::from(values.len()))
}

pub fn clamp(value: Decimal, min: Decimal, max: Decimal) -> Decimal {
    value.max(min).min(max)
}
