use crate::config::CoreConfig;
use crate::error::{CanonicalError, Result};
use crate::history::CanonicalHistory;
use crate::residuals::{formula_for, PeriodRows};
use crate::schema::LineItem;
use chrono::{Days, NaiveDate};
use log::{debug, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieStatus {
    Ok,
    Warn,
    Fail,
}

/// A subtotal whose directly tagged inputs disagree with its tagged value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResidualBreak {
    pub line_item: LineItem,
    pub formula: String,
    pub reported: Decimal,
    pub computed: Decimal,
    pub difference: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TieReport {
    pub period_end: NaiveDate,
    /// `assets - (liabilities + equity)`, `None` when an input is missing.
    pub bs_tie: Option<Decimal>,
    /// `(cfo + cfi + cff [+ fx]) - change in cash`, `None` when not computable.
    pub cf_tie: Option<Decimal>,
    pub status: TieStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub residual_breaks: Vec<ResidualBreak>,
}

/// Subtotals cross-checked when all their inputs were tagged directly.
const CHECKED_IDENTITIES: [LineItem; 4] = [
    LineItem::GrossProfit,
    LineItem::OperatingIncome,
    LineItem::TotalExpenses,
    LineItem::LiabilitiesEquity,
];

pub struct TieValidator<'a> {
    config: &'a CoreConfig,
}

impl<'a> TieValidator<'a> {
    pub fn new(config: &'a CoreConfig) -> Self {
        Self { config }
    }

    /// One report per period in the history, ascending.
    pub fn validate_history(&self, history: &CanonicalHistory) -> Vec<TieReport> {
        history
            .periods()
            .map(|(period_end, rows)| {
                let opening_cash = opening_cash(history, rows);
                self.validate_period(period_end, rows, opening_cash)
            })
            .collect()
    }

    pub fn validate_period(
        &self,
        period_end: NaiveDate,
        rows: &PeriodRows,
        opening_cash: Option<Decimal>,
    ) -> TieReport {
        let value = |item: LineItem| rows.get(&item).map(|f| f.value);

        let bs_tie = match (
            value(LineItem::Assets),
            value(LineItem::Liabilities),
            value(LineItem::Equity),
        ) {
            (Some(assets), Some(liabilities), Some(equity)) => Some(assets - (liabilities + equity)),
            _ => None,
        };

        let cf_tie = match (
            value(LineItem::Cfo),
            value(LineItem::Cfi),
            value(LineItem::Cff),
        ) {
            (Some(cfo), Some(cfi), Some(cff)) => {
                let flows = cfo + cfi + cff + value(LineItem::FxOnCash).unwrap_or_default();
                cash_delta(rows, opening_cash).map(|delta| flows - delta)
            }
            _ => None,
        };

        let tolerance = self.config.tie_tolerance;
        let status = if bs_tie.is_some_and(|t| t.abs() > tolerance) {
            TieStatus::Fail
        } else if cf_tie.is_some_and(|t| t.abs() > tolerance) {
            TieStatus::Warn
        } else {
            TieStatus::Ok
        };

        let residual_breaks = self.residual_breaks(rows);
        if !residual_breaks.is_empty() {
            debug!(
                "{}: {} subtotal(s) disagree with their tagged inputs",
                period_end,
                residual_breaks.len()
            );
        }

        TieReport {
            period_end,
            bs_tie,
            cf_tie,
            status,
            residual_breaks,
        }
    }

    fn residual_breaks(&self, rows: &PeriodRows) -> Vec<ResidualBreak> {
        let mut breaks = Vec::new();
        for target in CHECKED_IDENTITIES {
            let Some(reported) = rows.get(&target).filter(|f| !f.is_derived()) else {
                continue;
            };
            let Some(formula) = formula_for(target) else {
                continue;
            };
            let all_tagged = formula
                .required
                .iter()
                .all(|term| rows.get(&term.line_item).is_some_and(|f| !f.is_derived()));
            if !all_tagged {
                continue;
            }
            let Some(evaluation) = formula.evaluate(rows) else {
                continue;
            };

            let difference = reported.value - evaluation.value;
            if difference.abs() > self.config.residual_tolerance {
                breaks.push(ResidualBreak {
                    line_item: target,
                    formula: formula.name.to_string(),
                    reported: reported.value,
                    computed: evaluation.value,
                    difference,
                });
            }
        }
        breaks
    }

    /// Under `hard_fail_ties`, the first failing period aborts materialization.
    pub fn enforce(&self, reports: &[TieReport]) -> Result<()> {
        for report in reports.iter().filter(|r| r.status == TieStatus::Fail) {
            let bs_tie = report.bs_tie.unwrap_or_default();
            if self.config.hard_fail_ties {
                return Err(CanonicalError::TieViolation {
                    period_end: report.period_end,
                    bs_tie,
                    tolerance: self.config.tie_tolerance,
                });
            }
            warn!(
                "Balance sheet does not tie on {}: off by {}",
                report.period_end, bs_tie
            );
        }
        Ok(())
    }
}

/// Cash at the day before the flows' period starts, if reported.
fn opening_cash(history: &CanonicalHistory, rows: &PeriodRows) -> Option<Decimal> {
    let start = rows.get(&LineItem::Cfo)?.period_start?;
    let opening_date = start.checked_sub_days(Days::new(1))?;
    history.value(opening_date, LineItem::Cash)
}

/// Balance sheet cash movement when both ends are known, else a directly
/// tagged change in cash.
fn cash_delta(rows: &PeriodRows, opening_cash: Option<Decimal>) -> Option<Decimal> {
    let closing = rows.get(&LineItem::Cash).map(|f| f.value);
    if let (Some(open), Some(close)) = (opening_cash, closing) {
        return Some(close - open);
    }
    rows.get(&LineItem::ChangeInCash)
        .filter(|f| !f.is_derived())
        .map(|f| f.value)
}
