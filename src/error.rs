use chrono::NaiveDate;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::schema::{LineItem, PeriodType, Statement, Unit};

/// Pipeline-level failures. Only these ever reach a caller as `Err`.
#[derive(Error, Debug)]
pub enum CanonicalError {
    #[error("No canonical facts could be resolved for ticker {ticker} ({dropped} facts dropped)")]
    NoCanonicalFacts { ticker: String, dropped: usize },

    #[error("Tie violation on {period_end}: assets - (liabilities + equity) = {bs_tie} exceeds tolerance {tolerance}")]
    TieViolation {
        period_end: NaiveDate,
        bs_tie: Decimal,
        tolerance: Decimal,
    },

    #[error("Cannot forecast from {period_end}: baseline {line_item} is missing")]
    MissingForecastBase {
        period_end: NaiveDate,
        line_item: LineItem,
    },

    #[error("Forecast overflowed the decimal range at projected period {period_index}")]
    ForecastOverflow { period_index: u32 },

    #[error("No canonical history available for ticker {0}")]
    EmptyHistory(String),

    #[error("Unknown ticker: {0}")]
    UnknownTicker(String),

    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Date calculation error: {0}")]
    DateError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CanonicalError>;

/// Why a single parsed fact did not become a canonical row.
///
/// These are recovered locally by the normalizer and surface as drop counts,
/// never as a failed batch.
#[derive(Error, Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FactRejection {
    #[error("tag {tag} has no canonical mapping")]
    Unmapped { tag: String },

    #[error("segment axis {axis} is not allowed")]
    DisallowedSegment { axis: String },

    #[error("{statement} requires {expected} periods, fact is {found}")]
    DisallowedPeriodType {
        statement: Statement,
        expected: PeriodType,
        found: PeriodType,
    },

    #[error("unit {0} is not recognised")]
    UnparseableUnit(String),

    #[error("{line_item} must be reported in {expected}, fact is {found}")]
    UnitMismatch {
        line_item: LineItem,
        expected: Unit,
        found: Unit,
    },

    #[error("scale {0} is not an integer power of ten")]
    UnparseableScale(String),

    #[error("decimals {0} is neither an integer nor INF")]
    UnparseableDecimals(String),

    #[error("value overflowed while applying scale {0}")]
    ValueOverflow(i32),

    #[error("duration fact ends {period_end} before it starts {period_start}")]
    InvertedPeriod {
        period_start: NaiveDate,
        period_end: NaiveDate,
    },

    #[error("lost slot {line_item} @ {period_end} to fact {winner}")]
    LostTieBreak {
        line_item: LineItem,
        period_end: NaiveDate,
        winner: u64,
    },
}
