//! Arithmetic residuals for canonical rows that were not tagged directly.
//!
//! Formulas run to a fixed point per period, so a derived row can feed a later
//! formula (liabilities derived from liabilities_equity feeding the balance
//! sheet tie, for example). A directly tagged row is never overwritten.

use crate::schema::{CanonicalFact, LineItem, PeriodType, Provenance};
use chrono::NaiveDate;
use log::debug;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

pub type PeriodRows = BTreeMap<LineItem, CanonicalFact>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Term {
    pub line_item: LineItem,
    pub coefficient: i8,
}

const fn plus(line_item: LineItem) -> Term {
    Term {
        line_item,
        coefficient: 1,
    }
}

const fn minus(line_item: LineItem) -> Term {
    Term {
        line_item,
        coefficient: -1,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Formula {
    pub name: &'static str,
    pub target: LineItem,
    pub required: &'static [Term],
    /// Included when present for the same period and duration.
    pub optional: &'static [Term],
}

/// Result of evaluating a formula over one period's rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub value: Decimal,
    pub period_start: Option<NaiveDate>,
    pub inputs: Vec<LineItem>,
}

pub static FORMULAS: &[Formula] = &[
    Formula {
        name: "gross_profit = revenue - cogs",
        target: LineItem::GrossProfit,
        required: &[plus(LineItem::Revenue), minus(LineItem::Cogs)],
        optional: &[],
    },
    Formula {
        name: "cogs = revenue - gross_profit",
        target: LineItem::Cogs,
        required: &[plus(LineItem::Revenue), minus(LineItem::GrossProfit)],
        optional: &[],
    },
    Formula {
        name: "operating_income = gross_profit - operating_expenses",
        target: LineItem::OperatingIncome,
        required: &[plus(LineItem::GrossProfit), minus(LineItem::OperatingExpenses)],
        optional: &[],
    },
    Formula {
        name: "operating_expenses = gross_profit - operating_income",
        target: LineItem::OperatingExpenses,
        required: &[plus(LineItem::GrossProfit), minus(LineItem::OperatingIncome)],
        optional: &[],
    },
    Formula {
        name: "total_expenses = cogs + operating_expenses",
        target: LineItem::TotalExpenses,
        required: &[plus(LineItem::Cogs), plus(LineItem::OperatingExpenses)],
        optional: &[],
    },
    Formula {
        name: "ebitda = operating_income + depreciation_amortization",
        target: LineItem::Ebitda,
        required: &[
            plus(LineItem::OperatingIncome),
            plus(LineItem::DepreciationAmortization),
        ],
        optional: &[],
    },
    Formula {
        name: "liabilities = liabilities_equity - equity",
        target: LineItem::Liabilities,
        required: &[plus(LineItem::LiabilitiesEquity), minus(LineItem::Equity)],
        optional: &[],
    },
    Formula {
        name: "equity = liabilities_equity - liabilities",
        target: LineItem::Equity,
        required: &[plus(LineItem::LiabilitiesEquity), minus(LineItem::Liabilities)],
        optional: &[],
    },
    Formula {
        name: "liabilities_equity = liabilities + equity",
        target: LineItem::LiabilitiesEquity,
        required: &[plus(LineItem::Liabilities), plus(LineItem::Equity)],
        optional: &[],
    },
    Formula {
        name: "other_assets_current = assets_current - cash - short_term_investments - accounts_receivable - inventory",
        target: LineItem::OtherAssetsCurrent,
        required: &[plus(LineItem::AssetsCurrent), minus(LineItem::Cash)],
        optional: &[
            minus(LineItem::ShortTermInvestments),
            minus(LineItem::AccountsReceivable),
            minus(LineItem::Inventory),
        ],
    },
    Formula {
        name: "change_in_cash = cfo + cfi + cff + fx_on_cash",
        target: LineItem::ChangeInCash,
        required: &[plus(LineItem::Cfo), plus(LineItem::Cfi), plus(LineItem::Cff)],
        optional: &[plus(LineItem::FxOnCash)],
    },
    Formula {
        name: "fcf = cfo + capex",
        target: LineItem::Fcf,
        required: &[plus(LineItem::Cfo), plus(LineItem::Capex)],
        optional: &[],
    },
];

/// First formula that produces `target`.
pub fn formula_for(target: LineItem) -> Option<&'static Formula> {
    FORMULAS.iter().find(|f| f.target == target)
}

impl Formula {
    /// Evaluates over `rows` when every required input is present and all
    /// duration inputs cover the same span.
    pub fn evaluate(&self, rows: &PeriodRows) -> Option<Evaluation> {
        let mut span: Option<Option<NaiveDate>> = None;
        let mut value = Decimal::ZERO;
        let mut inputs = Vec::with_capacity(self.required.len() + self.optional.len());

        for term in self.required {
            let fact = rows.get(&term.line_item)?;
            if !same_span(&mut span, fact) {
                return None;
            }
            value += Decimal::from(term.coefficient) * fact.value;
            inputs.push(term.line_item);
        }

        for term in self.optional {
            if let Some(fact) = rows.get(&term.line_item) {
                if same_span(&mut span, fact) {
                    value += Decimal::from(term.coefficient) * fact.value;
                    inputs.push(term.line_item);
                }
            }
        }

        Some(Evaluation {
            value,
            period_start: span.flatten(),
            inputs,
        })
    }
}

/// Instant rows fit any span; duration rows must all start on the same day.
fn same_span(span: &mut Option<Option<NaiveDate>>, fact: &CanonicalFact) -> bool {
    if fact.period_type == PeriodType::Instant {
        return true;
    }
    match span {
        None => {
            *span = Some(fact.period_start);
            true
        }
        Some(start) => *start == fact.period_start,
    }
}

pub struct ResidualDeriver;

impl ResidualDeriver {
    /// Fills gaps in every period. Returns the input rows plus derived rows,
    /// ordered by `(period_end, statement, line_item)`.
    pub fn derive(facts: Vec<CanonicalFact>) -> Vec<CanonicalFact> {
        let mut periods: BTreeMap<NaiveDate, PeriodRows> = BTreeMap::new();
        for fact in facts {
            periods
                .entry(fact.period_end)
                .or_default()
                .insert(fact.line_item, fact);
        }

        let mut derived_count = 0;
        for rows in periods.values_mut() {
            derived_count += Self::derive_period(rows);
        }
        if derived_count > 0 {
            debug!("derived {} residual rows", derived_count);
        }

        let mut out: Vec<CanonicalFact> = periods
            .into_values()
            .flat_map(|rows| rows.into_values())
            .collect();
        out.sort_by_key(|f| (f.period_end, f.statement, f.line_item));
        out
    }

    /// Applies formulas until nothing new can be derived. Returns the number
    /// of rows added.
    pub fn derive_period(rows: &mut PeriodRows) -> usize {
        let mut added = 0;
        loop {
            let mut progressed = false;
            for formula in FORMULAS {
                if rows.contains_key(&formula.target) {
                    continue;
                }
                let Some(evaluation) = formula.evaluate(rows) else {
                    continue;
                };
                let fact = derived_fact(formula, &evaluation, rows);
                rows.insert(formula.target, fact);
                progressed = true;
                added += 1;
            }
            if !progressed {
                return added;
            }
        }
    }
}

fn derived_fact(formula: &Formula, evaluation: &Evaluation, rows: &PeriodRows) -> CanonicalFact {
    let inputs: Vec<&CanonicalFact> = evaluation
        .inputs
        .iter()
        .filter_map(|item| rows.get(item))
        .collect();

    let mut input_fact_ids: Vec<u64> = inputs.iter().flat_map(|f| f.source_fact_ids()).collect();
    input_fact_ids.sort_unstable();
    input_fact_ids.dedup();

    // Inputs are non-empty: every formula has required terms.
    let first = inputs[0];
    let available_at = inputs
        .iter()
        .map(|f| f.available_at)
        .max()
        .unwrap_or(first.available_at);

    let target = formula.target;
    CanonicalFact {
        ticker: first.ticker.clone(),
        statement: target.statement(),
        line_item: target,
        period_type: target.period_type(),
        period_start: match target.period_type() {
            PeriodType::Instant => None,
            PeriodType::Duration => evaluation.period_start,
        },
        period_end: first.period_end,
        value: evaluation.value,
        unit: target.unit(),
        available_at,
        provenance: Provenance::Derived {
            formula: formula.name.to_string(),
            input_fact_ids,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Statement;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn row(item: LineItem, value: Decimal, id: u64, filed: NaiveDate) -> CanonicalFact {
        let period_start = match item.period_type() {
            PeriodType::Instant => None,
            PeriodType::Duration => Some(date(2024, 1, 1)),
        };
        CanonicalFact {
            ticker: "ACME".to_string(),
            statement: item.statement(),
            line_item: item,
            period_type: item.period_type(),
            period_start,
            period_end: date(2024, 3, 31),
            value,
            unit: item.unit(),
            available_at: filed,
            provenance: Provenance::Source {
                source_path: "q1.htm".to_string(),
                tag: item.as_str().to_string(),
                context_ref: "c1".to_string(),
                unit_ref: None,
                source_fact_id: id,
                accession: None,
            },
        }
    }

    #[test]
    fn test_gross_profit_from_revenue_and_cogs() {
        let filed = date(2024, 5, 1);
        let out = ResidualDeriver::derive(vec![
            row(LineItem::Revenue, dec!(1000), 1, filed),
            row(LineItem::Cogs, dec!(600), 2, date(2024, 5, 3)),
        ]);

        let gp = out.iter().find(|f| f.line_item == LineItem::GrossProfit).unwrap();
        assert_eq!(gp.value, dec!(400));
        assert!(gp.is_derived());
        assert_eq!(gp.source_fact_ids(), vec![1, 2]);
        assert_eq!(gp.available_at, date(2024, 5, 3));
        assert_eq!(gp.period_start, Some(date(2024, 1, 1)));
        match &gp.provenance {
            Provenance::Derived { formula, .. } => assert!(formula.starts_with("gross_profit")),
            other => panic!("unexpected provenance {:?}", other),
        }
    }

    #[test]
    fn test_never_overwrites_tagged_value() {
        let filed = date(2024, 5, 1);
        let out = ResidualDeriver::derive(vec![
            row(LineItem::Revenue, dec!(1000), 1, filed),
            row(LineItem::Cogs, dec!(600), 2, filed),
            row(LineItem::GrossProfit, dec!(395), 3, filed),
        ]);
        let gp = out.iter().find(|f| f.line_item == LineItem::GrossProfit).unwrap();
        assert_eq!(gp.value, dec!(395));
        assert!(!gp.is_derived());
    }

    #[test]
    fn test_chained_derivation_reaches_fixed_point() {
        let filed = date(2024, 5, 1);
        let out = ResidualDeriver::derive(vec![
            row(LineItem::Revenue, dec!(1000), 1, filed),
            row(LineItem::Cogs, dec!(600), 2, filed),
            row(LineItem::OperatingExpenses, dec!(250), 3, filed),
            row(LineItem::DepreciationAmortization, dec!(40), 4, filed),
        ]);
        let value = |item| out.iter().find(|f| f.line_item == item).map(|f| f.value);
        assert_eq!(value(LineItem::GrossProfit), Some(dec!(400)));
        assert_eq!(value(LineItem::OperatingIncome), Some(dec!(150)));
        assert_eq!(value(LineItem::Ebitda), Some(dec!(190)));
        assert_eq!(value(LineItem::TotalExpenses), Some(dec!(850)));
    }

    #[test]
    fn test_balance_sheet_residuals() {
        let filed = date(2024, 5, 1);
        let out = ResidualDeriver::derive(vec![
            row(LineItem::LiabilitiesEquity, dec!(1000), 1, filed),
            row(LineItem::Equity, dec!(400), 2, filed),
            row(LineItem::AssetsCurrent, dec!(300), 3, filed),
            row(LineItem::Cash, dec!(100), 4, filed),
            row(LineItem::AccountsReceivable, dec!(50), 5, filed),
        ]);
        let liabilities = out.iter().find(|f| f.line_item == LineItem::Liabilities).unwrap();
        assert_eq!(liabilities.value, dec!(600));
        assert_eq!(liabilities.statement, Statement::BalanceSheet);
        assert_eq!(liabilities.period_start, None);

        let other = out
            .iter()
            .find(|f| f.line_item == LineItem::OtherAssetsCurrent)
            .unwrap();
        assert_eq!(other.value, dec!(150));
        assert_eq!(other.source_fact_ids(), vec![3, 4, 5]);
    }

    #[test]
    fn test_change_in_cash_includes_fx_when_present() {
        let filed = date(2024, 5, 1);
        let out = ResidualDeriver::derive(vec![
            row(LineItem::Cfo, dec!(120), 1, filed),
            row(LineItem::Cfi, dec!(-40), 2, filed),
            row(LineItem::Cff, dec!(-30), 3, filed),
            row(LineItem::FxOnCash, dec!(-5), 4, filed),
            row(LineItem::Capex, dec!(-25), 5, filed),
        ]);
        let value = |item| out.iter().find(|f| f.line_item == item).map(|f| f.value);
        assert_eq!(value(LineItem::ChangeInCash), Some(dec!(45)));
        assert_eq!(value(LineItem::Fcf), Some(dec!(95)));
    }

    #[test]
    fn test_mismatched_spans_are_not_combined() {
        let filed = date(2024, 5, 1);
        let mut cogs_ytd = row(LineItem::Cogs, dec!(1800), 2, filed);
        cogs_ytd.period_start = Some(date(2023, 10, 1));
        let out = ResidualDeriver::derive(vec![row(LineItem::Revenue, dec!(1000), 1, filed), cogs_ytd]);
        assert!(out.iter().all(|f| f.line_item != LineItem::GrossProfit));
    }

    #[test]
    fn test_missing_input_derives_nothing() {
        let out = ResidualDeriver::derive(vec![row(LineItem::Revenue, dec!(1000), 1, date(2024, 5, 1))]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let filed = date(2024, 5, 1);
        let input = vec![
            row(LineItem::Cogs, dec!(600), 2, filed),
            row(LineItem::Revenue, dec!(1000), 1, filed),
        ];
        let mut reversed = input.clone();
        reversed.reverse();
        assert_eq!(ResidualDeriver::derive(input), ResidualDeriver::derive(reversed));
    }
}
