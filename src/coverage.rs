//! Per-period completeness of the canonical rows.
//!
//! Every line item in the allowed row table is expected once per period; a
//! period's coverage counts how many of those slots hold a canonical value,
//! tagged or derived.

use crate::history::CanonicalHistory;
use crate::residuals::PeriodRows;
use crate::schema::{allowed_rows, LineItem, Statement};
use crate::utils::safe_div;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementCoverage {
    pub found: usize,
    pub expected: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    pub period_end: NaiveDate,
    pub by_statement: BTreeMap<Statement, StatementCoverage>,
    /// Expected line items with no canonical row, in table order.
    pub missing: BTreeMap<Statement, Vec<LineItem>>,
    pub total_found: usize,
    pub total_expected: usize,
}

impl Coverage {
    pub fn of_period(period_end: NaiveDate, rows: &PeriodRows) -> Self {
        let mut by_statement: BTreeMap<Statement, StatementCoverage> = Statement::ALL
            .iter()
            .map(|s| (*s, StatementCoverage::default()))
            .collect();
        let mut missing: BTreeMap<Statement, Vec<LineItem>> =
            Statement::ALL.iter().map(|s| (*s, Vec::new())).collect();

        for (statement, line_item, _, _) in allowed_rows() {
            let counts = by_statement.entry(statement).or_default();
            counts.expected += 1;
            if rows.contains_key(&line_item) {
                counts.found += 1;
            } else {
                missing.entry(statement).or_default().push(line_item);
            }
        }

        Self {
            period_end,
            total_found: by_statement.values().map(|c| c.found).sum(),
            total_expected: by_statement.values().map(|c| c.expected).sum(),
            by_statement,
            missing,
        }
    }

    /// `found / expected` across all statements.
    pub fn ratio(&self) -> Option<Decimal> {
        safe_div(
            Decimal::from(self.total_found),
            Decimal::from(self.total_expected),
        )
        .map(|r| r.round_dp(4))
    }

    pub fn statement(&self, statement: Statement) -> StatementCoverage {
        self.by_statement.get(&statement).copied().unwrap_or_default()
    }
}

/// One entry per period in the history, ascending.
pub fn coverage_by_period(history: &CanonicalHistory) -> Vec<Coverage> {
    history
        .periods()
        .map(|(period_end, rows)| Coverage::of_period(period_end, rows))
        .collect()
}
